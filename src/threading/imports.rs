// Named import injection for tasks

use super::error::ThreadingError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Function a module exposes to tasks
pub type ImportFn = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// Requested imports of a task: module name -> item names
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImportSpec(BTreeMap<String, BTreeSet<String>>);

impl ImportSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I, S>(&mut self, module: impl Into<String>, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.0
            .entry(module.into())
            .or_default()
            .extend(names.into_iter().map(Into::into));
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    /// `(module, name)` pairs in deterministic order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(module, names)| {
            names
                .iter()
                .map(move |name| (module.as_str(), name.as_str()))
        })
    }
}

/// Modules tasks may import from, registered on the root context
#[derive(Default)]
pub struct ModuleTable {
    modules: RwLock<HashMap<String, HashMap<String, ImportFn>>>,
}

impl ModuleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, module: impl Into<String>, name: impl Into<String>, f: F)
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.modules
            .write()
            .entry(module.into())
            .or_default()
            .insert(name.into(), Arc::new(f));
    }

    pub fn contains(&self, module: &str, name: &str) -> bool {
        self.modules
            .read()
            .get(module)
            .is_some_and(|items| items.contains_key(name))
    }

    /// Copy the requested items into a flat name -> function map
    pub fn resolve(&self, spec: &ImportSpec) -> Result<Imports, ThreadingError> {
        let modules = self.modules.read();
        let mut resolved = HashMap::new();

        for (module, name) in spec.iter() {
            let item = modules
                .get(module)
                .and_then(|items| items.get(name))
                .ok_or_else(|| ThreadingError::ImportNotFound {
                    module: module.to_string(),
                    name: name.to_string(),
                })?;

            if resolved.insert(name.to_string(), Arc::clone(item)).is_some() {
                tracing::debug!(module, name, "Import shadows an earlier module's item");
            }
        }

        Ok(Imports(resolved))
    }
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let modules = self.modules.read();
        let mut names: Vec<_> = modules.keys().collect();
        names.sort();
        f.debug_struct("ModuleTable").field("modules", &names).finish()
    }
}

/// Imports injected into a running task, keyed by item name
#[derive(Clone, Default)]
pub struct Imports(HashMap<String, ImportFn>);

impl Imports {
    pub fn get(&self, name: &str) -> Option<&ImportFn> {
        self.0.get(name)
    }

    /// Call an imported function
    pub fn call(&self, name: &str, args: Value) -> anyhow::Result<Value> {
        let f = self
            .0
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("import '{name}' was not requested by this task"))?;
        f(args)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Imports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.0.keys().collect();
        names.sort();
        f.debug_tuple("Imports").field(&names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn math_table() -> ModuleTable {
        let table = ModuleTable::new();
        table.register("math", "add", |args| {
            let a = args[0].as_i64().unwrap_or(0);
            let b = args[1].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        });
        table.register("math", "neg", |args| Ok(json!(-args.as_i64().unwrap_or(0))));
        table
    }

    #[test]
    fn resolves_requested_items_only() {
        let table = math_table();
        let mut spec = ImportSpec::new();
        spec.add("math", ["add"]);

        let imports = table.resolve(&spec).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports.call("add", json!([2, 3])).unwrap(), json!(5));
        assert!(imports.call("neg", json!(1)).is_err());
    }

    #[test]
    fn missing_import_is_reported() {
        let table = math_table();
        let mut spec = ImportSpec::new();
        spec.add("strings", ["upper"]);

        let err = table.resolve(&spec).unwrap_err();
        assert!(matches!(
            err,
            ThreadingError::ImportNotFound { ref module, ref name }
                if module == "strings" && name == "upper"
        ));
    }

    #[test]
    fn requested_imports_iterate_in_order() {
        let mut spec = ImportSpec::new();
        spec.add("b", ["y", "x"]);
        spec.add("a", ["z"]);

        let pairs: Vec<_> = spec.iter().collect();
        assert_eq!(pairs, vec![("a", "z"), ("b", "x"), ("b", "y")]);
    }

    #[test]
    fn empty_request_resolves_to_nothing() {
        let imports = math_table().resolve(&ImportSpec::new()).unwrap();
        assert!(imports.is_empty());
        assert!(ImportSpec::new().is_empty());
    }
}
