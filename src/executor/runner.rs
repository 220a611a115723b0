//! Runs one shard's modules on one device.
//!
//! The runner never touches the result tree. Everything it learns is sent as
//! [`ShardEvent`]s; the pump owns the tree.
//!
//! Module configs drive the runner through options:
//!
//! | Declared on | Option | Meaning |
//! |-------------|--------|---------|
//! | `target_preparer` | `setup-command` | Runs before the module's tests; failure aborts the module |
//! | `target_preparer` | `teardown-command` | Runs after the tests, in reverse preparer order |
//! | `test` | `command` | The test body; exit status 0 passes |
//! | `test` | `name` | Test method name, defaults to `run` |
//! | `test` | `timeout-secs` | Overrides the default timeout |
//! | `test` | `report-log` | JSON report log the command leaves behind |

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::capability::CapabilitySnapshot;
use crate::gating::GateRegistry;
use crate::module::{ModuleDef, TestDecl};
use crate::report::{ListenerEvent, RESULT_METRIC_KEY, ShardEvent};
use crate::repo::ModuleRef;
use crate::shell::{self, ShellCommand};

pub const SETUP_COMMAND_OPTION: &str = "setup-command";
pub const TEARDOWN_COMMAND_OPTION: &str = "teardown-command";
pub const COMMAND_OPTION: &str = "command";
pub const TIMEOUT_OPTION: &str = "timeout-secs";
pub const REPORT_LOG_OPTION: &str = "report-log";

/// How commands are run on the host.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Shell used as `<shell> -c <command>`.
    pub shell: String,
    /// Timeout for commands that do not set their own.
    pub default_timeout: Duration,
    /// Working directory for every command, usually the tests directory.
    pub working_dir: Option<PathBuf>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            default_timeout: Duration::from_secs(600),
            working_dir: None,
        }
    }
}

/// Executes modules sequentially for one device serial.
pub struct ModuleRunner {
    serial: String,
    snapshot: CapabilitySnapshot,
    options: RunnerOptions,
    events: UnboundedSender<ShardEvent>,
}

impl ModuleRunner {
    pub fn new(
        serial: impl Into<String>,
        snapshot: CapabilitySnapshot,
        options: RunnerOptions,
        events: UnboundedSender<ShardEvent>,
    ) -> Self {
        Self {
            serial: serial.into(),
            snapshot,
            options,
            events,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    /// Runs every module of the shard in order.
    pub async fn run_modules(&self, modules: &[ModuleRef]) {
        info!("{} running {} modules", self.serial, modules.len());
        for module in modules {
            self.run_module(module).await;
        }
    }

    /// Runs setup, the tests and teardown of one module.
    pub async fn run_module(&self, module: &ModuleDef) {
        let start = Instant::now();
        self.emit(
            module,
            ListenerEvent::TestRunStarted {
                num_tests: module.tests().len(),
            },
        );

        let mut prepared = 0;
        let mut setup_failure = None;
        for preparer in module.preparers() {
            if let Some(script) = preparer.options.get(SETUP_COMMAND_OPTION) {
                if let Err(message) = self.run_step(module, script).await {
                    setup_failure = Some(format!("Setup of {} failed: {}", preparer.class, message));
                    break;
                }
            }
            prepared += 1;
        }

        match setup_failure {
            Some(message) => {
                warn!("{} {}: {}", self.serial, module.id(), message);
                self.emit(module, ListenerEvent::TestRunFailed { message });
                for test in module.tests() {
                    self.skip_test(module, &test.test_id());
                }
            }
            None => {
                let gates = GateRegistry::from_tests(module.tests());
                for test in module.tests() {
                    self.run_test(module, test, &gates).await;
                }
            }
        }

        for preparer in module.preparers()[..prepared].iter().rev() {
            if let Some(script) = preparer.options.get(TEARDOWN_COMMAND_OPTION)
                && let Err(message) = self.run_step(module, script).await
            {
                warn!(
                    "{} {}: teardown of {} failed: {}",
                    self.serial,
                    module.id(),
                    preparer.class,
                    message
                );
            }
        }

        self.emit(
            module,
            ListenerEvent::TestRunEnded {
                elapsed_ms: start.elapsed().as_millis() as i64,
            },
        );
    }

    async fn run_test(&self, module: &ModuleDef, test: &TestDecl, gates: &GateRegistry) {
        let test_id = test.test_id();
        let script = match test.options.get(COMMAND_OPTION) {
            Some(script) => script,
            None => {
                debug!("{} has no command", test_id);
                self.skip_test(module, &test_id);
                return;
            }
        };
        if !module.is_test_selected(&test_id) {
            debug!("{} filtered out of {}", test_id, module.id());
            self.skip_test(module, &test_id);
            return;
        }
        if !gates.is_visible(&test_id, &self.snapshot) {
            debug!("{} not applicable to {}", test_id, self.serial);
            self.skip_test(module, &test_id);
            return;
        }

        self.emit(
            module,
            ListenerEvent::TestStarted {
                test_id: test_id.clone(),
            },
        );

        let timeout = test
            .options
            .get(TIMEOUT_OPTION)
            .and_then(|secs| secs.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.options.default_timeout);
        let cmd = self.command(module, script).timeout(timeout);

        match shell::run(&self.options.shell, &cmd).await {
            Ok(result) if result.success() => {}
            Ok(result) => {
                let output = result.combined_output();
                let trace = if output.is_empty() {
                    format!("Command exited with code {}", result.exit_code)
                } else {
                    format!("Command exited with code {}\n{}", result.exit_code, output)
                };
                self.emit(
                    module,
                    ListenerEvent::TestFailed {
                        test_id: test_id.clone(),
                        trace,
                    },
                );
            }
            Err(e) => {
                self.emit(
                    module,
                    ListenerEvent::TestFailed {
                        test_id: test_id.clone(),
                        trace: e.to_string(),
                    },
                );
            }
        }

        let mut metrics = BTreeMap::new();
        if let Some(path) = test.options.get(REPORT_LOG_OPTION) {
            let path = match &self.options.working_dir {
                Some(dir) => dir.join(path),
                None => PathBuf::from(path),
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(json) => {
                    metrics.insert(RESULT_METRIC_KEY.to_string(), json);
                }
                Err(e) => warn!("No report log for {} at {}: {}", test_id, path.display(), e),
            }
        }
        self.emit(module, ListenerEvent::TestEnded { test_id, metrics });
    }

    fn skip_test(&self, module: &ModuleDef, test_id: &str) {
        for event in [
            ListenerEvent::TestStarted {
                test_id: test_id.to_string(),
            },
            ListenerEvent::TestIgnored {
                test_id: test_id.to_string(),
            },
            ListenerEvent::TestEnded {
                test_id: test_id.to_string(),
                metrics: BTreeMap::new(),
            },
        ] {
            self.emit(module, event);
        }
    }

    /// Runs a preparer step, returning the failure reason.
    async fn run_step(&self, module: &ModuleDef, script: &str) -> Result<(), String> {
        let cmd = self
            .command(module, script)
            .timeout(self.options.default_timeout);
        match shell::run(&self.options.shell, &cmd).await {
            Ok(result) if result.success() => Ok(()),
            Ok(result) => Err(format!(
                "'{}' exited with code {}: {}",
                script,
                result.exit_code,
                result.combined_output()
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    fn command(&self, module: &ModuleDef, script: &str) -> ShellCommand {
        let mut cmd = ShellCommand::new(script)
            .env("ANDROID_SERIAL", &self.serial)
            .env("COMPAT_ABI", module.abi().name())
            .env("COMPAT_MODULE", module.name());
        if let Some(dir) = &self.options.working_dir {
            cmd = cmd.working_dir(dir);
        }
        cmd
    }

    fn emit(&self, module: &ModuleDef, event: ListenerEvent) {
        // The pump only goes away when the invocation is being torn down.
        if self
            .events
            .send(ShardEvent::new(&self.serial, module.id(), event))
            .is_err()
        {
            debug!("Event channel closed, dropping event for {}", module.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::Abi;
    use crate::module::TargetPreparer;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn test_decl(name: &str, command: Option<&str>) -> TestDecl {
        let mut test = TestDecl::new("com.example.HostTest");
        test.options.push("name", name);
        if let Some(command) = command {
            test.options.push(COMMAND_OPTION, command);
        }
        test
    }

    fn module(tests: Vec<TestDecl>, preparers: Vec<TargetPreparer>) -> ModuleDef {
        ModuleDef::new("CtsHostModule", Abi::new("x86_64", "64"), tests, preparers)
    }

    async fn run(
        module: &ModuleDef,
        features: &[&str],
        working_dir: Option<PathBuf>,
    ) -> Vec<ListenerEvent> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let snapshot = CapabilitySnapshot::new(
            "abc",
            features.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
        );
        let options = RunnerOptions {
            default_timeout: Duration::from_secs(10),
            working_dir,
            ..Default::default()
        };
        let runner = ModuleRunner::new("abc", snapshot, options, tx);
        runner.run_module(module).await;
        drop(runner);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            assert_eq!(event.serial, "abc");
            assert_eq!(event.module_id, "x86_64 CtsHostModule");
            events.push(event.event);
        }
        events
    }

    fn outcomes(events: &[ListenerEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                ListenerEvent::TestFailed { test_id, .. } => Some(format!("FAIL {}", test_id)),
                ListenerEvent::TestIgnored { test_id } => Some(format!("SKIP {}", test_id)),
                ListenerEvent::TestRunFailed { .. } => Some("RUN FAILED".to_string()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_pass_fail_and_skip() {
        let module = module(
            vec![
                test_decl("testPass", Some("test \"$COMPAT_MODULE\" = CtsHostModule")),
                test_decl("testFail", Some("echo boom >&2; exit 4")),
                test_decl("testNoCommand", None),
            ],
            vec![],
        );
        let events = run(&module, &[], None).await;

        assert!(matches!(
            events.first(),
            Some(ListenerEvent::TestRunStarted { num_tests: 3 })
        ));
        assert!(matches!(
            events.last(),
            Some(ListenerEvent::TestRunEnded { .. })
        ));
        assert_eq!(
            outcomes(&events),
            vec![
                "FAIL com.example.HostTest#testFail",
                "SKIP com.example.HostTest#testNoCommand",
            ]
        );
        let trace = events.iter().find_map(|e| match e {
            ListenerEvent::TestFailed { trace, .. } => Some(trace.clone()),
            _ => None,
        });
        assert_eq!(trace.as_deref(), Some("Command exited with code 4\nboom"));

        let ended = events
            .iter()
            .filter(|e| matches!(e, ListenerEvent::TestEnded { .. }))
            .count();
        assert_eq!(ended, 3);
    }

    #[tokio::test]
    async fn test_setup_failure_skips_tests() -> Result<(), Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let mut ok = TargetPreparer::new("com.example.Push");
        ok.options.push(SETUP_COMMAND_OPTION, "touch setup-ran");
        ok.options.push(TEARDOWN_COMMAND_OPTION, "touch teardown-ran");
        let mut broken = TargetPreparer::new("com.example.Broken");
        broken.options.push(SETUP_COMMAND_OPTION, "exit 1");
        broken.options.push(TEARDOWN_COMMAND_OPTION, "touch broken-teardown-ran");

        let module = module(vec![test_decl("testA", Some("true"))], vec![ok, broken]);
        let events = run(&module, &[], Some(temp.path().to_path_buf())).await;

        assert_eq!(
            outcomes(&events),
            vec!["RUN FAILED", "SKIP com.example.HostTest#testA"]
        );
        assert!(temp.path().join("setup-ran").exists());
        assert!(temp.path().join("teardown-ran").exists());
        assert!(!temp.path().join("broken-teardown-ran").exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_teardown_runs_in_reverse() -> Result<(), Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let mut first = TargetPreparer::new("com.example.First");
        first.options.push(TEARDOWN_COMMAND_OPTION, "echo first >> order");
        let mut second = TargetPreparer::new("com.example.Second");
        second.options.push(TEARDOWN_COMMAND_OPTION, "echo second >> order");

        let module = module(vec![test_decl("testA", Some("true"))], vec![first, second]);
        run(&module, &[], Some(temp.path().to_path_buf())).await;

        let order = std::fs::read_to_string(temp.path().join("order"))?;
        assert_eq!(order, "second\nfirst\n");
        Ok(())
    }

    #[tokio::test]
    async fn test_feature_gated_test_is_skipped() {
        let mut gated = test_decl("testNfc", Some("true"));
        gated
            .options
            .push(crate::gating::REQUIRED_FEATURES_OPTION, "android.hardware.nfc");
        let module = module(vec![gated], vec![]);

        let without = run(&module, &[], None).await;
        assert_eq!(outcomes(&without), vec!["SKIP com.example.HostTest#testNfc"]);

        let with = run(&module, &["android.hardware.nfc"], None).await;
        assert!(outcomes(&with).is_empty());
    }

    #[tokio::test]
    async fn test_timeout_fails_test() {
        let mut slow = test_decl("testSlow", Some("sleep 5"));
        slow.options.push(TIMEOUT_OPTION, "0");
        let module = module(vec![slow], vec![]);
        let events = run(&module, &[], None).await;
        assert_eq!(outcomes(&events), vec!["FAIL com.example.HostTest#testSlow"]);
    }

    #[tokio::test]
    async fn test_report_log_is_attached() -> Result<(), Box<dyn std::error::Error>> {
        let temp = TempDir::new()?;
        let mut test = test_decl("testPerf", Some("echo '{\"details\":[]}' > log.json"));
        test.options.push(REPORT_LOG_OPTION, "log.json");
        let module = module(vec![test], vec![]);
        let events = run(&module, &[], Some(temp.path().to_path_buf())).await;

        let metrics = events.iter().find_map(|e| match e {
            ListenerEvent::TestEnded { metrics, .. } => Some(metrics.clone()),
            _ => None,
        });
        let metrics = metrics.ok_or("no TestEnded")?;
        assert!(metrics[RESULT_METRIC_KEY].contains("details"));
        Ok(())
    }
}
