// CLI commands for the demo binary

use crate::threading::{config::RuntimeConfig, root::RootContext, task::Task};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::stream::{FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Instant;

/// Run closures in isolated worker threads
#[derive(Parser, Debug)]
#[command(name = "isothread", version, about)]
pub struct Cli {
    /// Configuration file (default: platform config dir, isothread/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the completion-order scenario and a shared counter on a pool
    Demo {
        /// Number of execution contexts (overrides the config file)
        #[arg(long)]
        size: Option<usize>,

        /// Length of one "second" of task sleep, in milliseconds
        #[arg(long, default_value = "1000")]
        scale_ms: u64,
    },

    /// Print the JSON schema of the configuration file
    ConfigSchema,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::ConfigSchema => {
                println!("{}", serde_json::to_string_pretty(&RuntimeConfig::json_schema())?);
                Ok(())
            }
            Commands::Demo { size, scale_ms } => {
                let mut config = RuntimeConfig::load_or_default(self.config.as_deref())
                    .context("loading configuration")?;
                if let Some(size) = size {
                    config.pool.size = size;
                }
                config.validate()?;
                demo(config, scale_ms).await
            }
        }
    }
}

fn sleeper(label: &str, sleep_ms: u64) -> Result<Task<String>> {
    let task = Task::new(|shared, _, features| {
        features.sleep_ms(shared.get("sleep_ms")?)?;
        Ok(shared.get::<String>("label")?)
    })
    .with_shared("label", label)?
    .with_shared("sleep_ms", sleep_ms)?;
    Ok(task)
}

async fn demo(config: RuntimeConfig, scale_ms: u64) -> Result<()> {
    let root = RootContext::new(config);
    let pool = root.pool()?;
    println!("Pool of {} context(s)", pool.size());

    // Submitted as [no sleep, 1, 3, 2]; resolved in completion order.
    let started = Instant::now();
    let mut pending = FuturesUnordered::new();
    for (label, units) in [("no-sleep", 0), ("1s", 1), ("3s", 3), ("2s", 2)] {
        let task = sleeper(label, units * scale_ms)?;
        pending.push(pool.run(task));
    }
    while let Some(outcome) = pending.next().await {
        let outcome = outcome?;
        let elapsed = started.elapsed().as_millis();
        match outcome.into_result() {
            Ok(label) => println!("  {label:<9} done at {elapsed} ms"),
            Err(failure) => println!("  task failed at {elapsed} ms: {failure}"),
        }
    }

    root.register_import("math", "square", |args: Value| {
        let n = args.as_i64().context("square expects an integer")?;
        Ok(json!(n * n))
    });
    let counter = root.create_ref(0i64)?;
    for _ in 0..pool.size() * 2 {
        let task = Task::new(|shared, imports, features| {
            let counter = shared.get_ref::<i64>("counter")?;
            let token = counter.update(features, |n| n + 1)?;
            let squared = imports.call("square", json!(counter.get(features)?))?;
            tracing::debug!(%token, %squared, "Counter bumped");
            Ok(())
        })
        .with_shared("counter", counter)?
        .with_import("math", ["square"]);
        pool.run(task).await?.into_result()?;
    }
    println!("Shared counter after {} runs: {}", pool.size() * 2, root.get(&counter)?);

    pool.shutdown();
    Ok(())
}
