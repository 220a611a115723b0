//! Test event listeners and result reporting.
//!
//! Shard tasks never touch the result tree directly. They emit
//! [`ShardEvent`]s onto a channel; a single pump task drains it into the
//! [`ResultReporter`] first and then into any other [`InvocationListener`],
//! such as a [`ConsoleListener`] or a [`MultiListener`] of several.

pub mod assets;
pub mod reporter;
pub mod xml;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;

use crate::result::TestStatus;

pub use reporter::{ResultReporter, ResultReporterOptions};
pub use xml::{ResultXmlError, parse_results, write_results};

/// Metric key carrying a JSON-encoded report log on `TestEnded`.
pub const RESULT_METRIC_KEY: &str = "COMPATIBILITY_TEST_RESULT";

/// Events emitted while a module runs on a device.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    TestRunStarted { num_tests: usize },
    TestStarted { test_id: String },
    TestEnded {
        test_id: String,
        metrics: BTreeMap<String, String>,
    },
    TestFailed { test_id: String, trace: String },
    TestIgnored { test_id: String },
    TestAssumptionFailure { test_id: String, trace: String },
    TestRunFailed { message: String },
    TestRunEnded { elapsed_ms: i64 },
}

/// A [`ListenerEvent`] tagged with the device and module it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardEvent {
    pub serial: String,
    pub module_id: String,
    pub event: ListenerEvent,
}

impl ShardEvent {
    pub fn new(serial: impl Into<String>, module_id: impl Into<String>, event: ListenerEvent) -> Self {
        Self {
            serial: serial.into(),
            module_id: module_id.into(),
            event,
        }
    }
}

/// What is known when an invocation starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationInfo {
    pub plan: String,
    pub serials: Vec<String>,
    pub total_modules: usize,
    pub total_tests: usize,
}

/// Final counts handed to listeners when an invocation ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvocationSummary {
    pub passed: usize,
    pub failed: usize,
    pub not_executed: usize,
    pub elapsed_ms: i64,
}

impl InvocationSummary {
    pub fn count(&self, status: TestStatus) -> usize {
        match status {
            TestStatus::Pass => self.passed,
            TestStatus::Fail => self.failed,
            TestStatus::NotExecuted => self.not_executed,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.not_executed
    }

    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Receives invocation lifecycle and test events.
///
/// Listeners are driven from a single task, so they take `&mut self`.
#[async_trait]
pub trait InvocationListener: Send {
    /// Called once before any shard starts.
    async fn invocation_started(&mut self, info: &InvocationInfo);

    /// Called for every event, in the order the pump receives them.
    async fn on_event(&mut self, event: &ShardEvent);

    /// Called once after every shard has finished.
    async fn invocation_ended(&mut self, summary: &InvocationSummary);
}

/// A listener that does nothing.
pub struct NullListener;

#[async_trait]
impl InvocationListener for NullListener {
    async fn invocation_started(&mut self, _info: &InvocationInfo) {}
    async fn on_event(&mut self, _event: &ShardEvent) {}
    async fn invocation_ended(&mut self, _summary: &InvocationSummary) {}
}

/// Fans events out to several listeners in order.
#[derive(Default)]
pub struct MultiListener {
    listeners: Vec<Box<dyn InvocationListener>>,
}

impl MultiListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listener<L: InvocationListener + 'static>(mut self, listener: L) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }
}

#[async_trait]
impl InvocationListener for MultiListener {
    async fn invocation_started(&mut self, info: &InvocationInfo) {
        for listener in &mut self.listeners {
            listener.invocation_started(info).await;
        }
    }

    async fn on_event(&mut self, event: &ShardEvent) {
        for listener in &mut self.listeners {
            listener.on_event(event).await;
        }
    }

    async fn invocation_ended(&mut self, summary: &InvocationSummary) {
        for listener in &mut self.listeners {
            listener.invocation_ended(summary).await;
        }
    }
}

/// Shows progress and per-test outcomes in the terminal.
pub struct ConsoleListener {
    progress: Option<indicatif::ProgressBar>,
    verbose: bool,
    // Tests that failed or were skipped and have not ended yet.
    settled: BTreeSet<String>,
}

impl ConsoleListener {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: None,
            verbose,
            settled: BTreeSet::new(),
        }
    }

    fn print(&self, line: String) {
        match &self.progress {
            Some(pb) if !pb.is_hidden() => pb.println(line),
            _ => println!("{}", line),
        }
    }

    fn tick(&self) {
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
    }
}

#[async_trait]
impl InvocationListener for ConsoleListener {
    async fn invocation_started(&mut self, info: &InvocationInfo) {
        println!(
            "Running plan {} on {} device(s): {} modules, {} tests",
            info.plan,
            info.serials.len(),
            info.total_modules,
            info.total_tests
        );

        let pb = indicatif::ProgressBar::new(info.total_tests as u64);
        if let Ok(style) = indicatif::ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})",
        ) {
            pb.set_style(style.progress_chars("#>-"));
        }
        self.progress = Some(pb);
    }

    async fn on_event(&mut self, event: &ShardEvent) {
        let prefix = format!("[{}] {}", event.serial, event.module_id);
        let key = |test_id: &str| format!("{} {}", event.module_id, test_id);
        match &event.event {
            ListenerEvent::TestRunStarted { num_tests } => {
                if self.verbose {
                    self.print(format!("{} starting {} tests", prefix, num_tests));
                }
            }
            ListenerEvent::TestStarted { test_id } => {
                if self.verbose {
                    self.print(format!("{} running {}", prefix, test_id));
                }
            }
            ListenerEvent::TestEnded { test_id, .. } => {
                self.tick();
                if !self.settled.remove(&key(test_id)) && self.verbose {
                    self.print(format!("{} {} {}", console::style("PASS").green(), prefix, test_id));
                }
            }
            ListenerEvent::TestFailed { test_id, trace } => {
                self.settled.insert(key(test_id));
                let message = trace.lines().next().unwrap_or_default();
                self.print(format!("{} {} {}", console::style("FAIL").red(), prefix, test_id));
                self.print(format!("    {}", console::style(message).dim()));
            }
            ListenerEvent::TestIgnored { test_id }
            | ListenerEvent::TestAssumptionFailure { test_id, .. } => {
                self.settled.insert(key(test_id));
                if self.verbose {
                    self.print(format!("{} {} {}", console::style("SKIP").yellow(), prefix, test_id));
                }
            }
            ListenerEvent::TestRunFailed { message } => {
                self.print(format!(
                    "{} {} {}",
                    console::style("ERR ").red().bold(),
                    prefix,
                    message
                ));
            }
            ListenerEvent::TestRunEnded { elapsed_ms } => {
                if self.verbose {
                    self.print(format!("{} finished in {} ms", prefix, elapsed_ms));
                }
            }
        }
    }

    async fn invocation_ended(&mut self, summary: &InvocationSummary) {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }

        println!();
        println!("Test Results:");
        println!("  Total:        {}", summary.total());
        println!("  Passed:       {}", console::style(summary.passed).green());
        println!("  Failed:       {}", console::style(summary.failed).red());
        println!(
            "  Not Executed: {}",
            console::style(summary.not_executed).yellow()
        );
        println!("  Duration:     {} ms", summary.elapsed_ms);

        println!();
        if summary.success() {
            println!("{}", console::style("All executed tests passed!").green().bold());
        } else {
            println!("{}", console::style("Some tests failed.").red().bold());
        }
    }
}
