//! Configuration loading for compat-suite.
//!
//! The suite reads a single TOML file, `compat.toml` by default. See
//! [`schema::Config`] for its layout.

pub mod schema;

pub use schema::*;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::abi::Abi;
use crate::capability::{CapabilitySource, CommandCapabilitySource, StaticCapabilitySource};
use crate::executor::RunnerOptions;
use crate::report::ResultReporterOptions;

/// Build info key holding the suite's own build number.
pub const SUITE_BUILD_KEY: &str = "suite_build";

/// Loads configuration from a TOML file.
///
/// `~` in paths is expanded and relative paths are resolved against the
/// directory containing `path`.
///
/// # Example
///
/// ```no_run
/// use compat_suite::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("compat.toml"))?;
/// println!("Suite: {}", config.suite.full_name);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    config.resolve_paths(base);
    Ok(config)
}

/// Loads configuration from a string. Paths are only tilde-expanded.
///
/// ```
/// use compat_suite::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [devices]
///     serials = ["abc", "def"]
/// "#)?;
/// assert_eq!(config.devices.serials.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.resolve_paths(Path::new(""));
    Ok(config)
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    let expanded = PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned());
    if expanded.is_absolute() || base.as_os_str().is_empty() {
        expanded
    } else {
        base.join(expanded)
    }
}

impl Config {
    fn resolve_paths(&mut self, base: &Path) {
        self.paths.tests_dir = resolve(base, &self.paths.tests_dir);
        self.paths.results_dir = resolve(base, &self.paths.results_dir);
        self.paths.logs_dir = resolve(base, &self.paths.logs_dir);
    }

    /// Name of the plan that runs every module.
    pub fn default_plan_name(&self) -> String {
        self.suite.name.to_lowercase()
    }

    /// Looks up a plan by name.
    pub fn plan(&self, name: &str) -> Option<PlanConfig> {
        match self.plans.get(name) {
            Some(plan) => Some(plan.clone()),
            None if name == self.default_plan_name() => Some(PlanConfig {
                description: Some(format!("Run every {} module", self.suite.name)),
                ..Default::default()
            }),
            None => None,
        }
    }

    /// Every plan name, including the default plan.
    pub fn plan_names(&self) -> BTreeSet<String> {
        let mut names: BTreeSet<String> = self.plans.keys().cloned().collect();
        names.insert(self.default_plan_name());
        names
    }

    /// The configured ABIs. Unknown names are an error.
    pub fn abis(&self) -> Result<BTreeSet<Abi>> {
        self.devices
            .abis
            .iter()
            .map(|name| match Abi::from_name(name) {
                Some(abi) => Ok(abi),
                None => bail!("Unsupported ABI in config: {}", name),
            })
            .collect()
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            shell: self.runner.shell.clone(),
            default_timeout: Duration::from_secs(self.runner.test_timeout_secs),
            working_dir: Some(self.paths.tests_dir.clone()),
        }
    }

    /// Where device features come from: the feature command if one is
    /// configured, the static lists otherwise.
    pub fn capability_source(&self) -> Arc<dyn CapabilitySource> {
        match &self.runner.feature_command {
            Some(command) => Arc::new(CommandCapabilitySource::new(
                self.runner.shell.clone(),
                command.clone(),
                Duration::from_secs(self.runner.feature_timeout_secs),
            )),
            None => Arc::new(StaticCapabilitySource::new(self.devices.features.clone())),
        }
    }

    pub fn reporter_options(&self, plan: &str) -> ResultReporterOptions {
        let mut build_info = self.suite.build_info.clone();
        if let Some(build) = &self.suite.build_number {
            build_info.insert(SUITE_BUILD_KEY.to_string(), build.clone());
        }
        ResultReporterOptions {
            suite_name: self.suite.name.clone(),
            suite_version: self.suite.version.clone(),
            plan: plan.to_string(),
            results_dir: self.paths.results_dir.clone(),
            logs_dir: self.paths.logs_dir.clone(),
            build_info,
        }
    }
}
