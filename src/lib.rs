//! compat-suite: host-side harness for compatibility test suites.
//!
//! The suite discovers test modules from their config files, instantiates
//! each once per target ABI, shards them across the attached devices and
//! aggregates every device's results into one versioned XML report.
//!
//! # Architecture
//!
//! - **Repository** ([`repo`]): loads, filters and shards [`module`]s, with
//!   token affinity for modules that need special devices
//! - **Executor** ([`executor`]): one task per device running its shard
//! - **Gating** ([`capability`], [`gating`]): hides tests whose required
//!   device features are missing
//! - **Results** ([`result`], [`report`]): the invocation result tree, the
//!   listeners that build it and the XML/zip report writer
//! - **Front-end** ([`console`], [`config`]): TOML config, CLI and console
//!
//! # Example
//!
//! ```no_run
//! use compat_suite::config::load_config;
//! use compat_suite::console::{RunArgs, run_plan};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("compat.toml"))?;
//!     let args = RunArgs {
//!         plan: "cts".to_string(),
//!         ..Default::default()
//!     };
//!     let outcome = run_plan(&config, &args, false).await?;
//!     println!("{} failed", outcome.summary.failed);
//!     Ok(())
//! }
//! ```

pub mod abi;
pub mod capability;
pub mod config;
pub mod console;
pub mod executor;
pub mod filter;
pub mod gating;
pub mod module;
pub mod repo;
pub mod report;
pub mod result;
pub mod shell;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use executor::{InvocationOutcome, ShardExecutor};
pub use module::ModuleDef;
pub use repo::{ModuleRepo, RepoError};
pub use report::{InvocationListener, ResultReporter};
pub use result::{InvocationResult, ModuleResult, TestResult, TestStatus};
