//! Result XML writing and reading.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <?xml-stylesheet type="text/xsl" href="compatibility_result.xsl"?>
//! <Result start="2015-05-14 00:00:01" end="2015-05-14 23:59:59" suite-name="CTS" ...>
//!   <Summary pass="2" failed="1" not-executed="1"/>
//!   <Module name="ModuleA" abi="mips64" device="device123">
//!     <Test result="pass" name="android.test.Foor#testBlah1" start="..." end="..."/>
//!     <Test result="fail" name="android.test.Bar#testBlah3" start="..." end="...">
//!       <Failure message="Something small is not alright">
//!         <StackTrace>Something small is not alright ...</StackTrace>
//!       </Failure>
//!     </Test>
//!     <Test result="pass" name="android.test.Bar#testBlah4" start="..." end="...">
//!       <Summary source="..." message="Headline" score-type="higher_better" score-unit="score">
//!         <Value>9001.0</Value>
//!       </Summary>
//!       <Detail source="..." message="Deats" score-type="lower_better" score-unit="ms">
//!         <Value>14.0</Value>
//!       </Detail>
//!     </Test>
//!   </Module>
//! </Result>
//! ```

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime, TimeZone};
use quick_xml::events::{BytesDecl, BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

use crate::abi;
use crate::result::{InvocationResult, Metric, ReportLog, ResultType, ResultUnit, TestStatus};

/// Name of the report file inside a result directory.
pub const TEST_RESULT_FILE_NAME: &str = "test-result.xml";

/// Version of the report format written by [`write_results`].
pub const RESULT_FILE_VERSION: &str = "5.0";

/// Stylesheet referenced by the report.
pub const STYLESHEET: &str = "compatibility_result.xsl";

/// Timestamp format used for every time attribute.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const RESULT_TAG: &[u8] = b"Result";
const SUMMARY_TAG: &[u8] = b"Summary";
const BUILD_TAG: &[u8] = b"Build";
const MODULE_TAG: &[u8] = b"Module";
const TEST_TAG: &[u8] = b"Test";
const FAILURE_TAG: &[u8] = b"Failure";
const STACK_TAG: &[u8] = b"StackTrace";
const DETAIL_TAG: &[u8] = b"Detail";
const METRIC_TAG: &[u8] = b"Metric";
const VALUE_TAG: &[u8] = b"Value";

/// Errors raised while writing or reading result XML.
#[derive(Debug, thiserror::Error)]
pub enum ResultXmlError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write result XML: {0}")]
    Write(#[from] std::io::Error),

    #[error("Failed to parse result XML: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Malformed result file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Host attributes recorded on the `Result` element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostInfo {
    pub host_name: String,
    pub os_name: String,
    pub os_version: String,
    pub os_arch: String,
    pub runtime_vendor: String,
    pub runtime_version: String,
}

impl HostInfo {
    /// Describes the machine this process runs on.
    pub fn current() -> Self {
        Self {
            host_name: host_name(),
            os_name: std::env::consts::OS.to_string(),
            os_version: os_version(),
            os_arch: std::env::consts::ARCH.to_string(),
            runtime_vendor: env!("CARGO_PKG_NAME").to_string(),
            runtime_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn host_name() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .unwrap_or_default()
}

fn os_version() -> String {
    fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Formats epoch millis as a local `yyyy-MM-dd HH:mm:ss` timestamp.
pub fn format_timestamp(millis: i64) -> String {
    Local
        .timestamp_millis_opt(millis)
        .single()
        .map(|t| t.format(TIME_FORMAT).to_string())
        .unwrap_or_default()
}

/// Parses a local `yyyy-MM-dd HH:mm:ss` timestamp back to epoch millis.
pub fn parse_timestamp(text: &str) -> Option<i64> {
    let naive = NaiveDateTime::parse_from_str(text, TIME_FORMAT).ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|t| t.timestamp_millis())
}

/// Writes `result` to `result_dir/test-result.xml` and returns the file path.
pub fn write_results(
    suite_name: &str,
    suite_version: &str,
    suite_plan: &str,
    result: &InvocationResult,
    result_dir: &Path,
    start_time: i64,
    end_time: i64,
) -> Result<PathBuf, ResultXmlError> {
    let xml = generate_xml(
        suite_name,
        suite_version,
        suite_plan,
        result,
        start_time,
        end_time,
        &HostInfo::current(),
    )?;

    let path = result_dir.join(TEST_RESULT_FILE_NAME);
    fs::write(&path, xml).map_err(|source| ResultXmlError::Io {
        path: path.clone(),
        source,
    })?;
    debug!("Wrote {}", path.display());
    Ok(path)
}

/// Renders the report document.
pub fn generate_xml(
    suite_name: &str,
    suite_version: &str,
    suite_plan: &str,
    result: &InvocationResult,
    start_time: i64,
    end_time: i64,
    host: &HostInfo,
) -> Result<String, ResultXmlError> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    writer.write_event(Event::PI(BytesPI::new(format!(
        "xml-stylesheet type=\"text/xsl\" href=\"{}\"",
        STYLESHEET
    ))))?;

    let mut root = BytesStart::new("Result");
    push_attr(&mut root, "start", format_timestamp(start_time).as_str());
    push_attr(&mut root, "end", format_timestamp(end_time).as_str());
    push_attr(&mut root, "suite-name", suite_name);
    push_attr(&mut root, "suite-version", suite_version);
    push_attr(&mut root, "suite-plan", suite_plan);
    push_attr(&mut root, "report-version", RESULT_FILE_VERSION);
    push_attr(&mut root, "host-name", host.host_name.as_str());
    push_attr(&mut root, "os-name", host.os_name.as_str());
    push_attr(&mut root, "os-version", host.os_version.as_str());
    push_attr(&mut root, "os-arch", host.os_arch.as_str());
    push_attr(&mut root, "runtime-vendor", host.runtime_vendor.as_str());
    push_attr(&mut root, "runtime-version", host.runtime_version.as_str());
    writer.write_event(Event::Start(root))?;

    let mut summary = BytesStart::new("Summary");
    summary.push_attribute((
        "pass",
        result.count_results(TestStatus::Pass).to_string().as_str(),
    ));
    summary.push_attribute((
        "failed",
        result.count_results(TestStatus::Fail).to_string().as_str(),
    ));
    summary.push_attribute((
        "not-executed",
        result
            .count_results(TestStatus::NotExecuted)
            .to_string()
            .as_str(),
    ));
    writer.write_event(Event::Empty(summary))?;

    if !result.build_info().is_empty() {
        let mut build = BytesStart::new("Build");
        for (key, value) in result.build_info() {
            push_attr(&mut build, key, value);
        }
        writer.write_event(Event::Empty(build))?;
    }

    for module in result.modules() {
        let mut element = BytesStart::new("Module");
        push_attr(&mut element, "name", module.name());
        push_attr(&mut element, "abi", module.abi().unwrap_or_default());
        push_attr(&mut element, "device", module.device_serial().unwrap_or_default());
        writer.write_event(Event::Start(element))?;

        for test in module.results() {
            let mut element = BytesStart::new("Test");
            push_attr(&mut element, "result", test.status().value());
            push_attr(&mut element, "name", test.name());
            push_attr(&mut element, "start", format_timestamp(test.start_time()).as_str());
            push_attr(&mut element, "end", format_timestamp(test.end_time()).as_str());

            if test.message().is_none() && test.report_log().is_none() {
                writer.write_event(Event::Empty(element))?;
                continue;
            }
            writer.write_event(Event::Start(element))?;

            if let Some(message) = test.message() {
                let mut failure = BytesStart::new("Failure");
                push_attr(&mut failure, "message", message);
                match test.stack_trace() {
                    Some(trace) => {
                        writer.write_event(Event::Start(failure))?;
                        writer.write_event(Event::Start(BytesStart::new("StackTrace")))?;
                        writer.write_event(Event::Text(BytesText::new(&xml_safe(trace))))?;
                        writer.write_event(Event::End(BytesEnd::new("StackTrace")))?;
                        writer.write_event(Event::End(BytesEnd::new("Failure")))?;
                    }
                    None => writer.write_event(Event::Empty(failure))?,
                }
            }

            if let Some(log) = test.report_log() {
                if let Some(summary) = &log.summary {
                    write_metric(&mut writer, "Summary", summary)?;
                }
                for detail in &log.details {
                    write_metric(&mut writer, "Detail", detail)?;
                }
            }

            writer.write_event(Event::End(BytesEnd::new("Test")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("Module")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("Result")))?;

    String::from_utf8(writer.into_inner()).map_err(|e| ResultXmlError::Malformed {
        path: PathBuf::from(TEST_RESULT_FILE_NAME),
        reason: e.to_string(),
    })
}

fn write_metric<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    metric: &Metric,
) -> Result<(), ResultXmlError> {
    let mut element = BytesStart::new(tag);
    push_attr(&mut element, "source", metric.source.as_str());
    push_attr(&mut element, "message", metric.message.as_str());
    if let Some(target) = metric.target {
        push_attr(&mut element, "target", &format_double(target));
    }
    push_attr(&mut element, "score-type", metric.score_type.report_string());
    push_attr(&mut element, "score-unit", metric.score_unit.report_string());

    if metric.values.is_empty() {
        writer.write_event(Event::Empty(element))?;
        return Ok(());
    }
    writer.write_event(Event::Start(element))?;
    for value in &metric.values {
        writer.write_event(Event::Start(BytesStart::new("Value")))?;
        writer.write_event(Event::Text(BytesText::new(&format_double(*value))))?;
        writer.write_event(Event::End(BytesEnd::new("Value")))?;
    }
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

fn push_attr(element: &mut BytesStart<'_>, key: &str, value: &str) {
    element.push_attribute((key, &*xml_safe(value)));
}

/// Replaces characters XML 1.0 cannot carry, such as terminal escapes in
/// command output, with U+FFFD.
pub fn xml_safe(text: &str) -> Cow<'_, str> {
    if text.chars().all(is_xml_char) {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.chars()
            .map(|c| if is_xml_char(c) { c } else { char::REPLACEMENT_CHARACTER })
            .collect(),
    )
}

fn is_xml_char(c: char) -> bool {
    matches!(
        c,
        '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'
    )
}

/// Formats a metric value the way report readers expect doubles: plain
/// decimals for magnitudes in `[1e-3, 1e7)`, otherwise `1.0E21` notation.
pub fn format_double(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }

    let magnitude = value.abs();
    if magnitude == 0.0 || (1e-3..1e7).contains(&magnitude) {
        return format!("{:?}", value);
    }

    let scientific = format!("{:e}", value);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .unwrap_or((scientific.as_str(), "0"));
    if mantissa.contains('.') {
        format!("{}E{}", mantissa, exponent)
    } else {
        format!("{}.0E{}", mantissa, exponent)
    }
}

/// Reads back every `<dir>/test-result.xml` under `results_dir`, oldest first.
///
/// A missing results directory yields no results. Unreadable or malformed
/// reports are skipped with a warning.
pub fn parse_results(results_dir: &Path) -> Result<Vec<InvocationResult>, ResultXmlError> {
    if !results_dir.is_dir() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(results_dir).map_err(|source| ResultXmlError::Io {
        path: results_dir.to_path_buf(),
        source,
    })?;

    let mut results = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        let file = dir.join(TEST_RESULT_FILE_NAME);
        if !file.is_file() {
            continue;
        }
        match parse_result_file(&file) {
            Ok(result) => results.push(result),
            Err(e) => warn!("Skipping unreadable result {}: {}", file.display(), e),
        }
    }
    results.sort_by_key(|r| r.start_time());
    Ok(results)
}

/// Parses a single `test-result.xml`. The invocation's result directory is the
/// file's parent.
pub fn parse_result_file(path: &Path) -> Result<InvocationResult, ResultXmlError> {
    let content = fs::read_to_string(path).map_err(|source| ResultXmlError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let result_dir = path.parent().unwrap_or(Path::new("."));
    parse_result_str(&content, result_dir).map_err(|e| match e {
        ResultXmlError::Malformed { reason, .. } => ResultXmlError::Malformed {
            path: path.to_path_buf(),
            reason,
        },
        other => other,
    })
}

/// Where text content should go.
enum TextSink {
    None,
    StackTrace,
    Value,
}

/// Which part of a report log is being read.
#[derive(Clone, Copy, PartialEq, Eq)]
enum MetricSlot {
    Summary,
    Detail,
}

/// Parses result XML held in memory.
pub fn parse_result_str(
    content: &str,
    result_dir: &Path,
) -> Result<InvocationResult, ResultXmlError> {
    // Text is not trimmed; indentation between elements falls into TextSink::None.
    let mut reader = Reader::from_str(content);

    let mut invocation: Option<InvocationResult> = None;
    let mut module_id: Option<String> = None;
    let mut test_id: Option<String> = None;
    let mut report: Option<ReportLog> = None;
    let mut slot: Option<MetricSlot> = None;
    let mut metric: Option<Metric> = None;
    let mut sink = TextSink::None;

    loop {
        let event = reader.read_event()?;
        let (element, is_empty) = match &event {
            Event::Start(e) => (Some(e.clone()), false),
            Event::Empty(e) => (Some(e.clone()), true),
            _ => (None, false),
        };

        if let Some(e) = element {
            match e.name().as_ref() {
                RESULT_TAG => {
                    let start = attr(&e, "start")?
                        .and_then(|s| parse_timestamp(&s))
                        .unwrap_or_default();
                    let mut result = InvocationResult::new(start, result_dir);
                    if let Some(plan) = attr(&e, "suite-plan")? {
                        result.set_test_plan(plan);
                    }
                    invocation = Some(result);
                }
                BUILD_TAG => {
                    let result = require(&mut invocation)?;
                    for attribute in e.attributes().flatten() {
                        let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
                        let value = attribute
                            .unescape_value()
                            .map_err(|err| malformed(err.to_string()))?
                            .into_owned();
                        result.add_build_info(key, value);
                    }
                }
                MODULE_TAG => {
                    let result = require(&mut invocation)?;
                    let name = attr(&e, "name")?.unwrap_or_default();
                    let id = match attr(&e, "abi")?.filter(|a| !a.is_empty()) {
                        Some(abi) => abi::create_id(&abi, &name),
                        None => name,
                    };
                    let module = result.get_or_create_module(&id);
                    if let Some(device) = attr(&e, "device")?.filter(|d| !d.is_empty()) {
                        module.set_device_serial(device.clone());
                        result.add_device_serial(device);
                    }
                    module_id = (!is_empty).then_some(id);
                }
                TEST_TAG => {
                    let (result, id) = current_module(&mut invocation, &module_id)?;
                    let name = attr(&e, "name")?.unwrap_or_default();
                    let status = attr(&e, "result")?
                        .as_deref()
                        .and_then(TestStatus::from_value)
                        .unwrap_or(TestStatus::NotExecuted);
                    let test = result.get_or_create_module(id).get_or_create_result(&name);
                    test.set_status(status);
                    if let Some(start) = attr(&e, "start")?.and_then(|s| parse_timestamp(&s)) {
                        test.set_start_time(start);
                    }
                    if let Some(end) = attr(&e, "end")?.and_then(|s| parse_timestamp(&s)) {
                        test.set_end_time(end);
                    }
                    test_id = (!is_empty).then_some(name);
                }
                FAILURE_TAG => {
                    if let Some(message) = attr(&e, "message")? {
                        current_test(&mut invocation, &module_id, &test_id)?.set_message(message);
                    }
                }
                STACK_TAG if !is_empty => sink = TextSink::StackTrace,
                SUMMARY_TAG | DETAIL_TAG if test_id.is_some() => {
                    let this_slot = if e.name().as_ref() == SUMMARY_TAG {
                        MetricSlot::Summary
                    } else {
                        MetricSlot::Detail
                    };
                    slot = Some(this_slot);
                    metric = read_metric(&e)?;
                    if is_empty {
                        store_metric(&mut report, this_slot, metric.take());
                        slot = None;
                    }
                }
                // Older reports nest the metric one level deeper.
                METRIC_TAG if slot.is_some() => {
                    metric = read_metric(&e)?;
                }
                VALUE_TAG if !is_empty => sink = TextSink::Value,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Text(text) => {
                let text = text.unescape().map_err(|err| malformed(err.to_string()))?;
                match sink {
                    TextSink::StackTrace => {
                        current_test(&mut invocation, &module_id, &test_id)?
                            .set_stack_trace(text.into_owned());
                    }
                    TextSink::Value => {
                        let value: f64 = text.trim().parse().map_err(|_| malformed(format!(
                            "invalid metric value '{}'",
                            text
                        )))?;
                        if let Some(metric) = metric.as_mut() {
                            metric.values.push(value);
                        }
                    }
                    TextSink::None => {}
                }
            }
            Event::End(e) => match e.name().as_ref() {
                STACK_TAG | VALUE_TAG => sink = TextSink::None,
                SUMMARY_TAG | DETAIL_TAG => {
                    if let Some(this_slot) = slot.take() {
                        store_metric(&mut report, this_slot, metric.take());
                    }
                }
                TEST_TAG => {
                    if let Some(log) = report.take() {
                        current_test(&mut invocation, &module_id, &test_id)?.set_report_log(log);
                    }
                    test_id = None;
                }
                MODULE_TAG => module_id = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    invocation.ok_or_else(|| malformed("missing <Result> element".to_string()))
}

fn read_metric(e: &BytesStart<'_>) -> Result<Option<Metric>, ResultXmlError> {
    let Some(source) = attr(e, "source")? else {
        return Ok(None);
    };
    let message = attr(e, "message")?.unwrap_or_default();
    let score_type: ResultType = attr(e, "score-type")?
        .unwrap_or_default()
        .parse()
        .map_err(malformed)?;
    let score_unit: ResultUnit = attr(e, "score-unit")?
        .unwrap_or_default()
        .parse()
        .map_err(malformed)?;
    let mut metric = Metric::new(source, message, score_type, score_unit, Vec::new());
    if let Some(target) = attr(e, "target")? {
        let target = target
            .parse()
            .map_err(|_| malformed(format!("invalid metric target '{}'", target)))?;
        metric = metric.with_target(target);
    }
    Ok(Some(metric))
}

fn store_metric(report: &mut Option<ReportLog>, slot: MetricSlot, metric: Option<Metric>) {
    let Some(metric) = metric else { return };
    let log = report.get_or_insert_with(ReportLog::new);
    match slot {
        MetricSlot::Summary => log.set_summary(metric),
        MetricSlot::Detail => log.add_detail(metric),
    }
}

fn attr(e: &BytesStart<'_>, key: &str) -> Result<Option<String>, ResultXmlError> {
    for attribute in e.attributes() {
        let attribute = attribute.map_err(|err| malformed(err.to_string()))?;
        if attribute.key.as_ref() == key.as_bytes() {
            let value = attribute
                .unescape_value()
                .map_err(|err| malformed(err.to_string()))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn require(invocation: &mut Option<InvocationResult>) -> Result<&mut InvocationResult, ResultXmlError> {
    invocation
        .as_mut()
        .ok_or_else(|| malformed("element outside <Result>".to_string()))
}

fn current_module<'a>(
    invocation: &'a mut Option<InvocationResult>,
    module_id: &'a Option<String>,
) -> Result<(&'a mut InvocationResult, &'a str), ResultXmlError> {
    let id = module_id
        .as_deref()
        .ok_or_else(|| malformed("<Test> outside <Module>".to_string()))?;
    Ok((require(invocation)?, id))
}

fn current_test<'a>(
    invocation: &'a mut Option<InvocationResult>,
    module_id: &Option<String>,
    test_id: &Option<String>,
) -> Result<&'a mut crate::result::TestResult, ResultXmlError> {
    let (Some(module), Some(test)) = (module_id.as_deref(), test_id.as_deref()) else {
        return Err(malformed("element outside <Test>".to_string()));
    };
    Ok(require(invocation)?
        .get_or_create_module(module)
        .get_or_create_result(test))
}

fn malformed(reason: String) -> ResultXmlError {
    ResultXmlError::Malformed {
        path: PathBuf::from(TEST_RESULT_FILE_NAME),
        reason,
    }
}
