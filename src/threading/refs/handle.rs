// Ref<T> handles - copyable pointers into a context's shared registry

use crate::threading::error::RefError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

/// Identifier of a shared reference, stable across every context
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefId(pub Uuid);

impl RefId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RefId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RefId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Token replaced on every applied mutation; used to drop duplicate broadcasts
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationToken(pub Uuid);

impl OperationToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Key under which a handle appears inside a serialized shared snapshot
pub const REF_MARKER: &str = "$ref";

/// Read/write access to the local copy of shared references
///
/// Implemented by the root context and by the `Features` handed to a running
/// task. Reads never wait for remote writes; writes are broadcast to every
/// context connected to this one.
pub trait RefAccess {
    /// Current local content of the cell
    fn read(&self, id: RefId) -> Result<Value, RefError>;

    /// Replace the local content and broadcast the change
    fn write(&self, id: RefId, value: Value) -> Result<OperationToken, RefError>;

    /// Read-modify-write while the cell is marked locked
    fn modify(
        &self,
        id: RefId,
        f: &mut dyn FnMut(Value) -> Result<Value, RefError>,
    ) -> Result<OperationToken, RefError>;
}

/// Typed handle to a shared reference
///
/// A `Ref` owns nothing: it is an id that can be copied freely, stored in a
/// task's shared snapshot, and resolved against whichever context it is used
/// in. There is no read-after-write guarantee across contexts.
pub struct Ref<T> {
    id: RefId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    pub(crate) fn from_id(id: RefId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> RefId {
        self.id
    }
}

impl<T> Ref<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Read the local copy
    pub fn get(&self, access: &impl RefAccess) -> Result<T, RefError> {
        let value = access.read(self.id)?;
        serde_json::from_value(value).map_err(|e| RefError::Decode(e.to_string()))
    }

    /// Write a new value and broadcast it
    pub fn set(&self, access: &impl RefAccess, value: T) -> Result<OperationToken, RefError> {
        let value = serde_json::to_value(value).map_err(|e| RefError::Decode(e.to_string()))?;
        access.write(self.id, value)
    }

    /// Derive the new value from the current local one; no other mutation of
    /// this cell can apply locally while `f` runs
    pub fn update<F>(&self, access: &impl RefAccess, f: F) -> Result<OperationToken, RefError>
    where
        F: FnOnce(T) -> T,
    {
        let mut f = Some(f);
        access.modify(self.id, &mut |current| {
            let f = f
                .take()
                .ok_or_else(|| RefError::Decode("update closure called twice".to_string()))?;
            let current: T =
                serde_json::from_value(current).map_err(|e| RefError::Decode(e.to_string()))?;
            serde_json::to_value(f(current)).map_err(|e| RefError::Decode(e.to_string()))
        })
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Ref<T> {}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Ref<T> {}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Ref").field(&self.id).finish()
    }
}

#[derive(Serialize, Deserialize)]
struct RefRepr {
    #[serde(rename = "$ref")]
    id: RefId,
}

impl<T> Serialize for Ref<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        RefRepr { id: self.id }.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Ref<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RefRepr::deserialize(deserializer).map(|repr| Ref::from_id(repr.id))
    }
}

/// Collect every ref handle embedded anywhere in a JSON value
pub fn collect_ref_ids(value: &Value, out: &mut Vec<RefId>) {
    match value {
        Value::Object(map) => {
            if map.len() == 1 {
                if let Some(Value::String(raw)) = map.get(REF_MARKER) {
                    if let Ok(uuid) = Uuid::parse_str(raw) {
                        let id = RefId(uuid);
                        if !out.contains(&id) {
                            out.push(id);
                        }
                        return;
                    }
                }
            }
            for nested in map.values() {
                collect_ref_ids(nested, out);
            }
        }
        Value::Array(items) => {
            for nested in items {
                collect_ref_ids(nested, out);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_serializes_as_marker_object() {
        let handle: Ref<String> = Ref::from_id(RefId::new());
        let json = serde_json::to_value(handle).unwrap();
        assert_eq!(json[REF_MARKER], handle.id().to_string());

        let back: Ref<String> = serde_json::from_value(json).unwrap();
        assert_eq!(back, handle);
    }

    #[test]
    fn ref_is_copy_without_t_bounds() {
        struct NotClone;
        let handle: Ref<NotClone> = Ref::from_id(RefId::new());
        let copy = handle;
        assert_eq!(copy.id(), handle.id());
    }

    #[test]
    fn collects_nested_handles_once() {
        let a = RefId::new();
        let b = RefId::new();
        let value = serde_json::json!({
            "first": { "$ref": a.to_string() },
            "list": [ { "$ref": b.to_string() }, { "$ref": a.to_string() } ],
            "plain": { "$ref": "not-a-uuid" },
            "other": 3
        });

        let mut ids = Vec::new();
        collect_ref_ids(&value, &mut ids);
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a));
        assert!(ids.contains(&b));
    }

    #[test]
    fn objects_with_extra_keys_are_not_handles() {
        let value = serde_json::json!({ "$ref": RefId::new().to_string(), "x": 1 });
        let mut ids = Vec::new();
        collect_ref_ids(&value, &mut ids);
        assert!(ids.is_empty());
    }
}
