//! The listener that owns the invocation result tree and writes the report.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Local, Utc};
use tracing::{debug, error, info, warn};

use super::{
    InvocationInfo, InvocationListener, InvocationSummary, ListenerEvent, RESULT_METRIC_KEY,
    ShardEvent, assets, xml,
};
use crate::result::{InvocationResult, ReportLog, TestStatus};

/// Directory name format for result and log directories.
pub const DIR_NAME_FORMAT: &str = "%Y.%m.%d_%H.%M.%S";

/// Current time in epoch millis.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Where and under which names a [`ResultReporter`] writes.
#[derive(Debug, Clone, Default)]
pub struct ResultReporterOptions {
    pub suite_name: String,
    pub suite_version: String,
    pub plan: String,
    pub results_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub build_info: BTreeMap<String, String>,
}

/// Folds test events into an [`InvocationResult`] and writes the report
/// when the invocation ends.
///
/// Output lands in `results/<yyyy.MM.dd_HH.mm.ss>/` with a sibling `.zip`;
/// a matching empty directory is created under the logs directory. Every
/// I/O failure is logged and swallowed so a broken disk never aborts a run.
pub struct ResultReporter {
    options: ResultReporterOptions,
    result: InvocationResult,
    result_dir: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    report_path: Option<PathBuf>,
    zip_path: Option<PathBuf>,
}

impl ResultReporter {
    pub fn new(options: ResultReporterOptions) -> Self {
        let result = InvocationResult::new(now_millis(), options.results_dir.clone());
        Self {
            options,
            result,
            result_dir: None,
            log_dir: None,
            report_path: None,
            zip_path: None,
        }
    }

    pub fn result(&self) -> &InvocationResult {
        &self.result
    }

    /// Directory this invocation's report is written to.
    pub fn result_dir(&self) -> Option<&Path> {
        self.result_dir.as_deref()
    }

    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    /// `test-result.xml`, once written.
    pub fn report_path(&self) -> Option<&Path> {
        self.report_path.as_deref()
    }

    pub fn zip_path(&self) -> Option<&Path> {
        self.zip_path.as_deref()
    }

    /// Counts over the tree as it stands.
    pub fn summary(&self, elapsed_ms: i64) -> InvocationSummary {
        InvocationSummary {
            passed: self.result.count_results(TestStatus::Pass),
            failed: self.result.count_results(TestStatus::Fail),
            not_executed: self.result.count_results(TestStatus::NotExecuted),
            elapsed_ms,
        }
    }

    /// Applies one event to the result tree.
    pub fn apply(&mut self, event: &ShardEvent) {
        let now = now_millis();
        let module = self.result.get_or_create_module(&event.module_id);
        match &event.event {
            ListenerEvent::TestRunStarted { num_tests } => {
                // Modules no device took arrive without a serial.
                if !event.serial.is_empty() {
                    module.set_device_serial(event.serial.clone());
                    self.result.add_device_serial(event.serial.clone());
                }
                debug!(
                    "Starting {} with {} tests on {}",
                    event.module_id, num_tests, event.serial
                );
            }
            ListenerEvent::TestStarted { test_id } => {
                let result = module.get_or_create_result(test_id);
                result.set_start_time(now);
            }
            ListenerEvent::TestEnded { test_id, metrics } => {
                let report_log = metrics.get(RESULT_METRIC_KEY).and_then(|json| {
                    ReportLog::from_json(json)
                        .map_err(|e| warn!("Ignoring unreadable report log for {}: {}", test_id, e))
                        .ok()
                });
                module.report_test_ended(test_id, report_log);
                module.get_or_create_result(test_id).set_end_time(now);
            }
            ListenerEvent::TestFailed { test_id, trace } => {
                module.report_test_failure(test_id, trace);
            }
            ListenerEvent::TestIgnored { test_id }
            | ListenerEvent::TestAssumptionFailure { test_id, .. } => {
                module.report_test_not_executed(test_id);
            }
            ListenerEvent::TestRunFailed { message } => {
                warn!("{} failed on {}: {}", event.module_id, event.serial, message);
            }
            ListenerEvent::TestRunEnded { elapsed_ms } => {
                module.add_runtime(*elapsed_ms);
                info!(
                    "{} {} completed in {} ms. {} passed, {} failed, {} not executed",
                    event.serial,
                    event.module_id,
                    elapsed_ms,
                    module.count_results(TestStatus::Pass),
                    module.count_results(TestStatus::Fail),
                    module.count_results(TestStatus::NotExecuted)
                );
            }
        }
    }

    fn create_dirs(&mut self) {
        let name = Local::now().format(DIR_NAME_FORMAT).to_string();
        match create_unique_dir(&self.options.results_dir, &name) {
            Ok(dir) => {
                // Log directory mirrors the result directory's final name.
                let dir_name = dir
                    .file_name()
                    .map(|n| n.to_os_string())
                    .unwrap_or_else(|| name.clone().into());
                let log_dir = self.options.logs_dir.join(dir_name);
                match fs::create_dir_all(&log_dir) {
                    Ok(()) => self.log_dir = Some(log_dir),
                    Err(e) => warn!("Failed to create log directory {}: {}", log_dir.display(), e),
                }
                self.result_dir = Some(dir);
            }
            Err(e) => error!(
                "Failed to create result directory under {}: {}",
                self.options.results_dir.display(),
                e
            ),
        }
    }
}

/// Creates `parent/name`, appending `_1`, `_2`, ... if it already exists.
fn create_unique_dir(parent: &Path, name: &str) -> std::io::Result<PathBuf> {
    fs::create_dir_all(parent)?;
    let mut candidate = parent.join(name);
    let mut suffix = 1;
    loop {
        match fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                candidate = parent.join(format!("{}_{}", name, suffix));
                suffix += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[async_trait]
impl InvocationListener for ResultReporter {
    async fn invocation_started(&mut self, info: &InvocationInfo) {
        self.create_dirs();
        let dir = self
            .result_dir
            .clone()
            .unwrap_or_else(|| self.options.results_dir.clone());
        self.result = InvocationResult::new(now_millis(), dir);
        self.result.set_test_plan(self.options.plan.clone());
        for (key, value) in &self.options.build_info {
            self.result.add_build_info(key.clone(), value.clone());
        }
        if let Some(dir) = &self.result_dir {
            info!("Results will be written to {}", dir.display());
        }
        debug!("Invocation of {} started on {:?}", info.plan, info.serials);
    }

    async fn on_event(&mut self, event: &ShardEvent) {
        self.apply(event);
    }

    async fn invocation_ended(&mut self, summary: &InvocationSummary) {
        info!(
            "Invocation finished in {} ms. {} passed, {} failed, {} not executed",
            summary.elapsed_ms,
            self.result.count_results(TestStatus::Pass),
            self.result.count_results(TestStatus::Fail),
            self.result.count_results(TestStatus::NotExecuted)
        );

        let Some(dir) = self.result_dir.clone() else {
            warn!("No result directory; skipping report");
            return;
        };

        let end = self.result.start_time() + summary.elapsed_ms.max(0);
        match xml::write_results(
            &self.options.suite_name,
            &self.options.suite_version,
            &self.options.plan,
            &self.result,
            &dir,
            self.result.start_time(),
            end,
        ) {
            Ok(path) => {
                info!("Test result: {}", path.display());
                self.report_path = Some(path);
            }
            Err(e) => error!("Failed to write results to {}: {}", dir.display(), e),
        }

        assets::copy_formatting_files(&dir);

        if let Some(zip) = assets::zip_results(&dir) {
            info!("Full results: {}", zip.display());
            self.zip_path = Some(zip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{Metric, ResultType, ResultUnit};
    use tempfile::TempDir;

    const MODULE: &str = "arm64-v8a CtsFoo";
    const SERIAL: &str = "device123";

    fn options(root: &Path) -> ResultReporterOptions {
        ResultReporterOptions {
            suite_name: "CTS".to_string(),
            suite_version: "5.0".to_string(),
            plan: "cts".to_string(),
            results_dir: root.join("results"),
            logs_dir: root.join("logs"),
            build_info: BTreeMap::from([("build_number".to_string(), "42".to_string())]),
        }
    }

    fn event(event: ListenerEvent) -> ShardEvent {
        ShardEvent::new(SERIAL, MODULE, event)
    }

    #[tokio::test]
    async fn test_full_invocation() -> Result<(), Box<dyn std::error::Error>> {
        let root = TempDir::new()?;
        let mut reporter = ResultReporter::new(options(root.path()));
        reporter.invocation_started(&InvocationInfo::default()).await;

        let result_dir = reporter.result_dir().expect("result dir").to_path_buf();
        assert!(result_dir.starts_with(root.path().join("results")));
        assert!(reporter.log_dir().expect("log dir").is_dir());

        let mut log = ReportLog::new();
        log.set_summary(Metric::new(
            "src:1",
            "speed",
            ResultType::HigherBetter,
            ResultUnit::Fps,
            vec![60.0],
        ));
        let metrics = BTreeMap::from([(RESULT_METRIC_KEY.to_string(), log.to_json()?)]);

        for e in [
            ListenerEvent::TestRunStarted { num_tests: 3 },
            ListenerEvent::TestStarted { test_id: "a#pass".into() },
            ListenerEvent::TestEnded { test_id: "a#pass".into(), metrics },
            ListenerEvent::TestStarted { test_id: "a#fail".into() },
            ListenerEvent::TestFailed { test_id: "a#fail".into(), trace: "boom\nat x".into() },
            ListenerEvent::TestEnded { test_id: "a#fail".into(), metrics: BTreeMap::new() },
            ListenerEvent::TestStarted { test_id: "a#skip".into() },
            ListenerEvent::TestIgnored { test_id: "a#skip".into() },
            ListenerEvent::TestEnded { test_id: "a#skip".into(), metrics: BTreeMap::new() },
            ListenerEvent::TestRunEnded { elapsed_ms: 5 },
        ] {
            reporter.on_event(&event(e)).await;
        }

        let summary = reporter.summary(5);
        assert_eq!((summary.passed, summary.failed, summary.not_executed), (1, 1, 1));

        reporter.invocation_ended(&summary).await;
        let report = reporter.report_path().expect("report written");
        assert!(report.is_file());
        assert!(result_dir.join("logo.png").is_file());
        assert!(reporter.zip_path().expect("zip written").is_file());

        let parsed = xml::parse_results(&root.path().join("results"))?;
        assert_eq!(parsed.len(), 1);
        let module = parsed[0].get_module(MODULE).expect("module present");
        assert_eq!(module.device_serial(), Some(SERIAL));
        let pass = module.get_result("a#pass").unwrap();
        assert_eq!(pass.report_log(), Some(&log));
        assert_eq!(module.get_result("a#fail").unwrap().message(), Some("boom"));
        assert_eq!(parsed[0].build_info()["build_number"], "42");
        Ok(())
    }

    #[test]
    fn test_unreadable_metric_is_ignored() {
        let mut reporter = ResultReporter::new(ResultReporterOptions::default());
        let metrics = BTreeMap::from([(RESULT_METRIC_KEY.to_string(), "{not json".to_string())]);
        reporter.apply(&event(ListenerEvent::TestEnded {
            test_id: "a#b".into(),
            metrics,
        }));
        let result = reporter.result().get_module(MODULE).unwrap().get_result("a#b").unwrap();
        assert_eq!(result.status(), TestStatus::Pass);
        assert!(result.report_log().is_none());
    }

    #[test]
    fn test_create_unique_dir() -> Result<(), Box<dyn std::error::Error>> {
        let root = TempDir::new()?;
        let first = create_unique_dir(root.path(), "2016.01.01_00.00.00")?;
        let second = create_unique_dir(root.path(), "2016.01.01_00.00.00")?;
        assert_ne!(first, second);
        assert!(second.ends_with("2016.01.01_00.00.00_1"));
        Ok(())
    }

    #[tokio::test]
    async fn test_unwritable_results_dir_is_not_fatal() -> Result<(), Box<dyn std::error::Error>> {
        let root = TempDir::new()?;
        let blocker = root.path().join("results");
        fs::write(&blocker, "not a directory")?;
        let mut reporter = ResultReporter::new(options(root.path()));
        reporter.invocation_started(&InvocationInfo::default()).await;
        assert!(reporter.result_dir().is_none());
        let summary = reporter.summary(0);
        reporter.invocation_ended(&summary).await;
        assert!(reporter.report_path().is_none());
        Ok(())
    }
}
