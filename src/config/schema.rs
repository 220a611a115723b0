//! Configuration schema definitions for compat-suite.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SuiteConfig     - Suite identity written into every report
//! ├── PathsConfig     - Where module configs live and where output goes
//! ├── DevicesConfig   - Device serials, tokens, ABIs and static features
//! ├── RunnerConfig    - How host commands run
//! └── plans           - Named include/exclude filter sets
//! ```
//!
//! Every section is optional; an empty file is a valid configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
///
/// # TOML Structure
///
/// ```toml
/// [suite]
/// name = "CTS"
/// full_name = "Compatibility Test Suite"
/// version = "7.0"
///
/// [paths]
/// tests_dir = "~/cts/testcases"
/// results_dir = "~/cts/results"
/// logs_dir = "~/cts/logs"
///
/// [devices]
/// serials = ["emulator-5554", "emulator-5556"]
/// tokens = ["emulator-5556:sim-card"]
/// abis = ["arm64-v8a"]
///
/// [devices.features]
/// "emulator-5554" = ["android.hardware.wifi"]
///
/// [runner]
/// shell = "/bin/bash"
/// test_timeout_secs = 300
///
/// [plans.cts-camera]
/// includes = ["CtsCameraTestCases"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub suite: SuiteConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub devices: DevicesConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    /// Named test plans. A plan called like the lowercased suite name is
    /// always available and runs every module.
    #[serde(default)]
    pub plans: BTreeMap<String, PlanConfig>,
}

/// Suite identity.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `name` | `"CTS"` |
/// | `full_name` | `"Compatibility Test Suite"` |
/// | `version` | `"1.0"` |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SuiteConfig {
    /// Short name, used for the console prompt and the default plan.
    #[serde(default = "default_suite_name")]
    pub name: String,

    #[serde(default = "default_full_name")]
    pub full_name: String,

    #[serde(default = "default_version")]
    pub version: String,

    /// Build number of the suite itself; recorded in the report.
    pub build_number: Option<String>,

    /// Extra key/value pairs written into the report's `Build` element.
    #[serde(default)]
    pub build_info: BTreeMap<String, String>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            name: default_suite_name(),
            full_name: default_full_name(),
            version: default_version(),
            build_number: None,
            build_info: BTreeMap::new(),
        }
    }
}

fn default_suite_name() -> String {
    "CTS".to_string()
}

fn default_full_name() -> String {
    "Compatibility Test Suite".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Filesystem layout. `~` is expanded when the config is loaded, and
/// relative paths are resolved against the config file's directory.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PathsConfig {
    /// Directory holding `*.config` module files.
    #[serde(default = "default_tests_dir")]
    pub tests_dir: PathBuf,

    /// Parent of the per-invocation result directories.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            tests_dir: default_tests_dir(),
            results_dir: default_results_dir(),
            logs_dir: default_logs_dir(),
        }
    }
}

fn default_tests_dir() -> PathBuf {
    PathBuf::from("testcases")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

/// Devices available to the suite.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DevicesConfig {
    /// Device serials; one shard runs on each.
    #[serde(default)]
    pub serials: Vec<String>,

    /// `serial:token` entries describing special device capabilities.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// ABIs to instantiate every module for.
    ///
    /// Default: `["arm64-v8a"]`
    #[serde(default = "default_abis")]
    pub abis: Vec<String>,

    /// Static feature lists per serial, used when no
    /// `runner.feature_command` is configured.
    #[serde(default)]
    pub features: BTreeMap<String, BTreeSet<String>>,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            serials: Vec::new(),
            tokens: Vec::new(),
            abis: default_abis(),
            features: BTreeMap::new(),
        }
    }
}

fn default_abis() -> Vec<String> {
    vec!["arm64-v8a".to_string()]
}

/// Host command execution.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `shell` | `"/bin/sh"` |
/// | `feature_command` | None (use `devices.features`) |
/// | `test_timeout_secs` | 600 |
/// | `feature_timeout_secs` | 60 |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RunnerConfig {
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Prints a device's `feature:<name>` listing. `ANDROID_SERIAL` holds
    /// the device serial, e.g.
    /// `adb -s "$ANDROID_SERIAL" shell pm list features`.
    pub feature_command: Option<String>,

    /// Timeout for tests and preparer steps without their own.
    #[serde(default = "default_test_timeout")]
    pub test_timeout_secs: u64,

    #[serde(default = "default_feature_timeout")]
    pub feature_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            feature_command: None,
            test_timeout_secs: default_test_timeout(),
            feature_timeout_secs: default_feature_timeout(),
        }
    }
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_test_timeout() -> u64 {
    600
}

fn default_feature_timeout() -> u64 {
    60
}

/// A named set of filters.
///
/// Filters use the `[abi] module [test]` form, e.g.
/// `"arm64-v8a CtsFooTestCases android.foo.FooTest#testBar"`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct PlanConfig {
    pub description: Option<String>,

    #[serde(default)]
    pub includes: Vec<String>,

    #[serde(default)]
    pub excludes: Vec<String>,
}
