//! Invocation result tree.
//!
//! ```text
//! InvocationResult ─┬─ ModuleResult "arm64-v8a CtsFoo" ─┬─ TestResult "android.foo.A#test1"
//!                   │                                   └─ TestResult "android.foo.A#test2"
//!                   └─ ModuleResult "x86 CtsBar" ──────── ...
//! ```
//!
//! Modules and tests are keyed by id and kept sorted. Nothing here performs
//! I/O; the XML writer in [`crate::report::xml`] serializes the tree.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::abi;

/// Outcome of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Pass,
    Fail,
    NotExecuted,
}

impl TestStatus {
    /// Value written to the `result` attribute of the report.
    pub fn value(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::NotExecuted => "not-executed",
        }
    }

    pub fn from_value(value: &str) -> Option<Self> {
        match value {
            "pass" => Some(TestStatus::Pass),
            "fail" => Some(TestStatus::Fail),
            "not-executed" => Some(TestStatus::NotExecuted),
            _ => None,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.value())
    }
}

/// How a metric score should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultType {
    HigherBetter,
    LowerBetter,
    Neutral,
    Warning,
}

impl ResultType {
    pub fn report_string(&self) -> &'static str {
        match self {
            ResultType::HigherBetter => "higher_better",
            ResultType::LowerBetter => "lower_better",
            ResultType::Neutral => "neutral",
            ResultType::Warning => "warning",
        }
    }
}

impl FromStr for ResultType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "higher_better" => Ok(ResultType::HigherBetter),
            "lower_better" => Ok(ResultType::LowerBetter),
            "neutral" => Ok(ResultType::Neutral),
            "warning" => Ok(ResultType::Warning),
            other => Err(format!("unknown score type '{}'", other)),
        }
    }
}

/// Unit of a metric score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultUnit {
    None,
    Ms,
    Us,
    Fps,
    Ops,
    Kbps,
    Mbps,
    Byte,
    Count,
    Score,
    Hz,
}

impl ResultUnit {
    pub fn report_string(&self) -> &'static str {
        match self {
            ResultUnit::None => "none",
            ResultUnit::Ms => "ms",
            ResultUnit::Us => "us",
            ResultUnit::Fps => "fps",
            ResultUnit::Ops => "ops",
            ResultUnit::Kbps => "kbps",
            ResultUnit::Mbps => "mbps",
            ResultUnit::Byte => "byte",
            ResultUnit::Count => "count",
            ResultUnit::Score => "score",
            ResultUnit::Hz => "hz",
        }
    }
}

impl FromStr for ResultUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let unit = match s {
            "none" => ResultUnit::None,
            "ms" => ResultUnit::Ms,
            "us" => ResultUnit::Us,
            "fps" => ResultUnit::Fps,
            "ops" => ResultUnit::Ops,
            "kbps" => ResultUnit::Kbps,
            "mbps" => ResultUnit::Mbps,
            "byte" => ResultUnit::Byte,
            "count" => ResultUnit::Count,
            "score" => ResultUnit::Score,
            "hz" => ResultUnit::Hz,
            other => return Err(format!("unknown score unit '{}'", other)),
        };
        Ok(unit)
    }
}

/// One named measurement with its ordered values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub source: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<f64>,
    pub score_type: ResultType,
    pub score_unit: ResultUnit,
    #[serde(default)]
    pub values: Vec<f64>,
}

impl Metric {
    pub fn new(
        source: impl Into<String>,
        message: impl Into<String>,
        score_type: ResultType,
        score_unit: ResultUnit,
        values: Vec<f64>,
    ) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            target: None,
            score_type,
            score_unit,
            values,
        }
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target = Some(target);
        self
    }
}

/// Structured numeric results attached to a passing test.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Metric>,
    #[serde(default)]
    pub details: Vec<Metric>,
}

impl ReportLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_summary(&mut self, summary: Metric) {
        self.summary = Some(summary);
    }

    pub fn add_detail(&mut self, detail: Metric) {
        self.details.push(detail);
    }

    pub fn is_empty(&self) -> bool {
        self.summary.is_none() && self.details.is_empty()
    }

    /// Encodes the log as the JSON payload carried by test metrics.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Result of one test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestResult {
    name: String,
    status: Option<TestStatus>,
    message: Option<String>,
    stack_trace: Option<String>,
    report_log: Option<ReportLog>,
    start_time: i64,
    end_time: i64,
}

impl TestResult {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: None,
            message: None,
            stack_trace: None,
            report_log: None,
            start_time: 0,
            end_time: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status; a test with no recorded outcome is not executed.
    pub fn status(&self) -> TestStatus {
        self.status.unwrap_or(TestStatus::NotExecuted)
    }

    /// Whether any outcome has been recorded.
    pub fn has_outcome(&self) -> bool {
        self.status.is_some()
    }

    pub fn set_status(&mut self, status: TestStatus) {
        self.status = Some(status);
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn set_message(&mut self, message: impl Into<String>) {
        self.message = Some(message.into());
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.stack_trace.as_deref()
    }

    pub fn set_stack_trace(&mut self, trace: impl Into<String>) {
        self.stack_trace = Some(trace.into());
    }

    pub fn report_log(&self) -> Option<&ReportLog> {
        self.report_log.as_ref()
    }

    pub fn set_report_log(&mut self, log: ReportLog) {
        self.report_log = Some(log);
    }

    /// Start time in epoch millis.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn set_start_time(&mut self, millis: i64) {
        self.start_time = millis;
    }

    /// End time in epoch millis.
    pub fn end_time(&self) -> i64 {
        self.end_time
    }

    pub fn set_end_time(&mut self, millis: i64) {
        self.end_time = millis;
    }

    /// Clears the outcome and everything attached to it, keeping the name.
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.name));
    }
}

/// Results of one module instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleResult {
    id: String,
    device_serial: Option<String>,
    runtime_ms: i64,
    results: BTreeMap<String, TestResult>,
}

impl ModuleResult {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            device_serial: None,
            runtime_ms: 0,
            results: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        abi::parse_id(&self.id).1
    }

    pub fn abi(&self) -> Option<&str> {
        abi::parse_id(&self.id).0
    }

    pub fn device_serial(&self) -> Option<&str> {
        self.device_serial.as_deref()
    }

    pub fn set_device_serial(&mut self, serial: impl Into<String>) {
        self.device_serial = Some(serial.into());
    }

    /// Accumulated run time across test runs.
    pub fn runtime_ms(&self) -> i64 {
        self.runtime_ms
    }

    pub fn add_runtime(&mut self, millis: i64) {
        self.runtime_ms += millis;
    }

    pub fn get_or_create_result(&mut self, test_id: &str) -> &mut TestResult {
        self.results
            .entry(test_id.to_string())
            .or_insert_with(|| TestResult::new(test_id))
    }

    pub fn get_result(&self, test_id: &str) -> Option<&TestResult> {
        self.results.get(test_id)
    }

    /// Test results sorted by name.
    pub fn results(&self) -> impl Iterator<Item = &TestResult> {
        self.results.values()
    }

    pub fn results_with_status(&self, status: TestStatus) -> Vec<&TestResult> {
        self.results().filter(|r| r.status() == status).collect()
    }

    pub fn count_results(&self, status: TestStatus) -> usize {
        self.results().filter(|r| r.status() == status).count()
    }

    /// Marks the test passed unless it already has an outcome.
    pub fn report_test_ended(&mut self, test_id: &str, report_log: Option<ReportLog>) {
        let result = self.get_or_create_result(test_id);
        if result.has_outcome() {
            return;
        }
        result.set_status(TestStatus::Pass);
        if let Some(log) = report_log.filter(|log| !log.is_empty()) {
            result.set_report_log(log);
        }
    }

    /// Marks the test failed. The message is the first line of `trace`.
    pub fn report_test_failure(&mut self, test_id: &str, trace: &str) {
        let result = self.get_or_create_result(test_id);
        result.set_status(TestStatus::Fail);
        let message = trace.lines().next().unwrap_or_default();
        result.set_message(message);
        result.set_stack_trace(trace);
    }

    /// Marks the test not executed unless it already failed.
    pub fn report_test_not_executed(&mut self, test_id: &str) {
        let result = self.get_or_create_result(test_id);
        if result.status != Some(TestStatus::Fail) {
            result.set_status(TestStatus::NotExecuted);
        }
    }
}

/// Results of one invocation across every device.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResult {
    start_time: i64,
    test_plan: Option<String>,
    result_dir: PathBuf,
    device_serials: BTreeSet<String>,
    build_info: BTreeMap<String, String>,
    modules: BTreeMap<String, ModuleResult>,
}

impl InvocationResult {
    pub fn new(start_time: i64, result_dir: impl Into<PathBuf>) -> Self {
        Self {
            start_time,
            test_plan: None,
            result_dir: result_dir.into(),
            device_serials: BTreeSet::new(),
            build_info: BTreeMap::new(),
            modules: BTreeMap::new(),
        }
    }

    /// Start time in epoch millis.
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn set_start_time(&mut self, millis: i64) {
        self.start_time = millis;
    }

    pub fn test_plan(&self) -> Option<&str> {
        self.test_plan.as_deref()
    }

    pub fn set_test_plan(&mut self, plan: impl Into<String>) {
        self.test_plan = Some(plan.into());
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn device_serials(&self) -> &BTreeSet<String> {
        &self.device_serials
    }

    pub fn add_device_serial(&mut self, serial: impl Into<String>) {
        self.device_serials.insert(serial.into());
    }

    pub fn build_info(&self) -> &BTreeMap<String, String> {
        &self.build_info
    }

    pub fn add_build_info(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.build_info.insert(key.into(), value.into());
    }

    pub fn get_or_create_module(&mut self, id: &str) -> &mut ModuleResult {
        self.modules
            .entry(id.to_string())
            .or_insert_with(|| ModuleResult::new(id))
    }

    pub fn get_module(&self, id: &str) -> Option<&ModuleResult> {
        self.modules.get(id)
    }

    /// Module results sorted by id.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleResult> {
        self.modules.values()
    }

    pub fn count_results(&self, status: TestStatus) -> usize {
        self.modules().map(|m| m.count_results(status)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST: &str = "android.test.Foo#testBar";

    #[test]
    fn test_get_or_create_is_idempotent() {
        let mut module = ModuleResult::new("arm64-v8a CtsFoo");
        module.get_or_create_result(TEST).set_start_time(42);
        assert_eq!(module.get_or_create_result(TEST).start_time(), 42);
        assert_eq!(module.results().count(), 1);
        assert_eq!(module.name(), "CtsFoo");
        assert_eq!(module.abi(), Some("arm64-v8a"));
    }

    #[test]
    fn test_each_new_id_adds_one_result() {
        let mut module = ModuleResult::new("x86 CtsFoo");
        for i in 0..5 {
            module.get_or_create_result(&format!("android.test.Foo#test{}", i));
            assert_eq!(module.results().count(), i + 1);
        }
        module.get_or_create_result("android.test.Foo#test3");
        assert_eq!(module.results().count(), 5);
        assert_eq!(module.count_results(TestStatus::NotExecuted), 5);
    }

    #[test]
    fn test_new_result_is_not_executed() {
        let mut module = ModuleResult::new("x86 CtsFoo");
        module.get_or_create_result(TEST);
        assert_eq!(module.count_results(TestStatus::NotExecuted), 1);
        assert_eq!(module.count_results(TestStatus::Pass), 0);
    }

    #[test]
    fn test_failure_message_is_first_line() {
        let mut module = ModuleResult::new("x86 CtsFoo");
        let trace = "Something small is not alright\n at four.big.insects.Marley.sing(Marley.java:10)";
        module.report_test_failure(TEST, trace);
        let result = module.get_result(TEST).unwrap();
        assert_eq!(result.status(), TestStatus::Fail);
        assert_eq!(result.message(), Some("Something small is not alright"));
        assert_eq!(result.stack_trace(), Some(trace));

        module.report_test_failure("single", "one line");
        assert_eq!(module.get_result("single").unwrap().message(), Some("one line"));
    }

    #[test]
    fn test_fail_is_sticky() {
        let mut module = ModuleResult::new("x86 CtsFoo");
        module.report_test_failure(TEST, "boom");
        module.report_test_ended(TEST, None);
        module.report_test_not_executed(TEST);
        assert_eq!(module.get_result(TEST).unwrap().status(), TestStatus::Fail);

        // A failure after a pass still wins.
        module.report_test_ended("other", None);
        module.report_test_failure("other", "late");
        assert_eq!(module.get_result("other").unwrap().status(), TestStatus::Fail);
    }

    #[test]
    fn test_ended_keeps_not_executed() {
        let mut module = ModuleResult::new("x86 CtsFoo");
        module.report_test_not_executed(TEST);
        module.report_test_ended(TEST, None);
        assert_eq!(module.get_result(TEST).unwrap().status(), TestStatus::NotExecuted);
    }

    #[test]
    fn test_ended_attaches_report_log() {
        let mut module = ModuleResult::new("x86 CtsFoo");
        let mut log = ReportLog::new();
        log.set_summary(Metric::new(
            "src:20",
            "Headline",
            ResultType::HigherBetter,
            ResultUnit::Score,
            vec![9001.0],
        ));
        module.report_test_ended(TEST, Some(log.clone()));
        module.report_test_ended("empty", Some(ReportLog::new()));
        let result = module.get_result(TEST).unwrap();
        assert_eq!(result.status(), TestStatus::Pass);
        assert_eq!(result.report_log(), Some(&log));
        assert!(module.get_result("empty").unwrap().report_log().is_none());
    }

    #[test]
    fn test_reset() {
        let mut result = TestResult::new(TEST);
        result.set_status(TestStatus::Fail);
        result.set_message("boom");
        result.set_end_time(7);
        result.reset();
        assert_eq!(result.name(), TEST);
        assert!(!result.has_outcome());
        assert_eq!(result.message(), None);
        assert_eq!(result.end_time(), 0);
    }

    #[test]
    fn test_invocation_counts_and_order() {
        let mut invocation = InvocationResult::new(1000, "/tmp/results/x");
        invocation.get_or_create_module("x86 B").report_test_ended("t1", None);
        invocation.get_or_create_module("x86 A").report_test_failure("t2", "boom");
        invocation.get_or_create_module("x86 A").get_or_create_result("t3");
        invocation.add_device_serial("device123");
        invocation.add_device_serial("device123");

        let ids: Vec<&str> = invocation.modules().map(|m| m.id()).collect();
        assert_eq!(ids, vec!["x86 A", "x86 B"]);
        assert_eq!(invocation.count_results(TestStatus::Pass), 1);
        assert_eq!(invocation.count_results(TestStatus::Fail), 1);
        assert_eq!(invocation.count_results(TestStatus::NotExecuted), 1);
        assert_eq!(invocation.device_serials().len(), 1);
    }

    #[test]
    fn test_report_log_json() -> Result<(), Box<dyn std::error::Error>> {
        let mut log = ReportLog::new();
        log.add_detail(
            Metric::new(
                "src:18",
                "Deats",
                ResultType::LowerBetter,
                ResultUnit::Ms,
                vec![14.0, 18.0, 17.0],
            )
            .with_target(15.0),
        );
        let json = log.to_json()?;
        assert!(json.contains("\"lower_better\""));
        assert_eq!(ReportLog::from_json(&json)?, log);
        Ok(())
    }

    #[test]
    fn test_status_values() {
        for status in [TestStatus::Pass, TestStatus::Fail, TestStatus::NotExecuted] {
            assert_eq!(TestStatus::from_value(status.value()), Some(status));
        }
        assert_eq!("score".parse::<ResultUnit>(), Ok(ResultUnit::Score));
        assert!("bogus".parse::<ResultType>().is_err());
    }
}
