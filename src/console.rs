//! Interactive console and the commands it shares with the CLI.
//!
//! ```text
//! cts-tf > list modules
//! cts-tf > run cts --module CtsFooTestCases --serial emulator-5554
//! cts-tf > list results
//! ```

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use console::{Alignment, pad_str, style};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use crate::abi::Abi;
use crate::config::{Config, PlanConfig};
use crate::executor::{InvocationOutcome, ShardExecutor};
use crate::filter::TestFilter;
use crate::report::{ConsoleListener, ResultReporter, parse_results, xml};
use crate::repo::ModuleRepo;
use crate::result::{InvocationResult, TestStatus};

const HELP: &str = "\
Commands:
  help                          Show this help
  version                       Show the suite version
  exit | quit                   Leave the console
  list|l modules|m              List every module for the configured ABIs
  list|l results|r              List previous invocations
  list|l plans|p                List test plans
  run <plan> [options]          Run a plan
      -m, --module <module>     Only run this module
      -t, --test <test>         Only run this test (needs --module)
      -s, --serial <serial>     Run on this device; repeat for several
      -a, --abi <abi>           Only run for this ABI
          --shard <n>           Split the run into n shards
          --token <serial:tok>  Extra device token";

/// What to list.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTarget {
    /// Modules for the configured ABIs
    #[command(alias = "m")]
    Modules,
    /// Previous invocations
    #[command(alias = "r")]
    Results,
    /// Test plans
    #[command(alias = "p")]
    Plans,
}

/// Options of `run`.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct RunArgs {
    /// Plan to run
    pub plan: String,

    /// Only run this module
    #[arg(short = 'm', long)]
    pub module: Option<String>,

    /// Only run this test of the module
    #[arg(short = 't', long)]
    pub test: Option<String>,

    /// Device serial; defaults to the configured devices
    #[arg(short = 's', long = "serial")]
    pub serials: Vec<String>,

    /// Only run for this ABI
    #[arg(short = 'a', long)]
    pub abi: Option<String>,

    /// Number of shards; defaults to one per device
    #[arg(long)]
    pub shard: Option<usize>,

    /// Extra `serial:token` entries
    #[arg(long = "token")]
    pub tokens: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_help_subcommand = true, disable_help_flag = true)]
struct ConsoleLine {
    #[command(subcommand)]
    command: ConsoleCommand,
}

#[derive(Subcommand, Debug)]
enum ConsoleCommand {
    Help,
    Version,
    #[command(alias = "quit")]
    Exit,
    #[command(alias = "l")]
    List {
        #[command(subcommand)]
        target: ListTarget,
    },
    Run(RunArgs),
}

/// Whether the console keeps reading after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// The interactive `<suite>-tf >` console.
pub struct Console {
    config: Config,
    verbose: bool,
}

impl Console {
    pub fn new(config: Config, verbose: bool) -> Self {
        Self { config, verbose }
    }

    pub fn prompt(&self) -> String {
        format!("{}-tf > ", self.config.suite.name.to_lowercase())
    }

    /// Reads commands from stdin until `exit` or end of input.
    pub async fn run(&mut self) -> Result<()> {
        println!("{}", version_string(&self.config));
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("{}", self.prompt());
            std::io::stdout().flush()?;

            let Some(line) = lines.next_line().await? else {
                println!();
                break;
            };
            match self.execute(&line).await {
                Ok(Flow::Exit) => break,
                Ok(Flow::Continue) => {}
                Err(e) => eprintln!("{} {:#}", style("Error:").red().bold(), e),
            }
        }
        Ok(())
    }

    /// Parses and runs one console line.
    pub async fn execute(&mut self, line: &str) -> Result<Flow> {
        let words = shell_words::split(line).context("Invalid command line")?;
        if words.is_empty() {
            return Ok(Flow::Continue);
        }
        let parsed = match ConsoleLine::try_parse_from(&words) {
            Ok(parsed) => parsed,
            Err(e) => {
                println!("{}", e.render());
                println!("Type 'help' for a list of commands.");
                return Ok(Flow::Continue);
            }
        };

        match parsed.command {
            ConsoleCommand::Help => println!("{}", HELP),
            ConsoleCommand::Version => println!("{}", version_string(&self.config)),
            ConsoleCommand::Exit => return Ok(Flow::Exit),
            ConsoleCommand::List { target } => println!("{}", list(&self.config, target, false)?),
            ConsoleCommand::Run(args) => {
                let outcome = run_plan(&self.config, &args, self.verbose).await?;
                print_outcome(&outcome);
            }
        }
        Ok(Flow::Continue)
    }
}

pub fn version_string(config: &Config) -> String {
    format!(
        "{} {} (compat-suite {})",
        config.suite.full_name,
        config.suite.version,
        env!("CARGO_PKG_VERSION")
    )
}

/// Renders a listing as a text table, or as JSON.
pub fn list(config: &Config, target: ListTarget, json: bool) -> Result<String> {
    match target {
        ListTarget::Modules => {
            let ids = module_ids(config)?;
            if json {
                Ok(serde_json::to_string_pretty(&ids)?)
            } else {
                Ok(ids.join("\n"))
            }
        }
        ListTarget::Results => {
            let results = parse_results(&config.paths.results_dir).with_context(|| {
                format!(
                    "Failed to read results from {}",
                    config.paths.results_dir.display()
                )
            })?;
            let rows = result_rows(&results);
            if json {
                Ok(serde_json::to_string_pretty(&rows)?)
            } else {
                Ok(results_table(&rows))
            }
        }
        ListTarget::Plans => {
            let plans: BTreeMap<String, PlanConfig> = config
                .plan_names()
                .into_iter()
                .filter_map(|name| config.plan(&name).map(|plan| (name, plan)))
                .collect();
            if json {
                Ok(serde_json::to_string_pretty(&plans)?)
            } else {
                Ok(plans_table(&plans))
            }
        }
    }
}

fn module_ids(config: &Config) -> Result<Vec<String>> {
    let repo = ModuleRepo::load(
        1,
        &config.paths.tests_dir,
        &config.abis()?,
        &config.devices.tokens,
        &[],
        &[],
    )
    .with_context(|| {
        format!(
            "Failed to load modules from {}",
            config.paths.tests_dir.display()
        )
    })?;
    Ok(repo.get_module_ids())
}

/// One previous invocation, as listed by `list results`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResultRow {
    pub session: usize,
    pub pass: usize,
    pub fail: usize,
    pub not_executed: usize,
    pub start_time: String,
    pub plan: String,
    pub devices: Vec<String>,
    pub dir: String,
}

pub fn result_rows(results: &[InvocationResult]) -> Vec<ResultRow> {
    results
        .iter()
        .enumerate()
        .map(|(session, result)| ResultRow {
            session,
            pass: result.count_results(TestStatus::Pass),
            fail: result.count_results(TestStatus::Fail),
            not_executed: result.count_results(TestStatus::NotExecuted),
            start_time: xml::format_timestamp(result.start_time()),
            plan: result.test_plan().unwrap_or_default().to_string(),
            devices: result.device_serials().iter().cloned().collect(),
            dir: result
                .result_dir()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        })
        .collect()
}

pub fn results_table(rows: &[ResultRow]) -> String {
    let header = [
        "Session",
        "Pass",
        "Fail",
        "Not Executed",
        "Start Time",
        "Test Plan",
        "Device serial(s)",
    ];
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            vec![
                row.session.to_string(),
                row.pass.to_string(),
                row.fail.to_string(),
                row.not_executed.to_string(),
                row.start_time.clone(),
                row.plan.clone(),
                row.devices.join(", "),
            ]
        })
        .collect();
    table(&header, &body)
}

fn plans_table(plans: &BTreeMap<String, PlanConfig>) -> String {
    let body: Vec<Vec<String>> = plans
        .iter()
        .map(|(name, plan)| {
            vec![
                name.clone(),
                plan.description.clone().unwrap_or_default(),
                plan.includes.len().to_string(),
                plan.excludes.len().to_string(),
            ]
        })
        .collect();
    table(&["Plan", "Description", "Includes", "Excludes"], &body)
}

fn table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(console::measure_text_width(cell));
        }
    }

    let render = |cells: Vec<&str>| {
        cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| pad_str(cell, *width, Alignment::Left, None).into_owned())
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut lines = vec![render(header.to_vec())];
    for row in rows {
        lines.push(render(row.iter().map(String::as_str).collect()));
    }
    lines.join("\n")
}

/// Loads, shards and runs a plan, then writes its report.
pub async fn run_plan(config: &Config, args: &RunArgs, verbose: bool) -> Result<InvocationOutcome> {
    let plan = config
        .plan(&args.plan)
        .with_context(|| format!("Unknown plan '{}'", args.plan))?;

    let mut abis = config.abis()?;
    if let Some(name) = &args.abi {
        let abi = Abi::from_name(name).with_context(|| format!("Unsupported ABI '{}'", name))?;
        abis.retain(|a| *a == abi);
        if abis.is_empty() {
            bail!("ABI '{}' is not configured", name);
        }
    }

    let includes = match (&args.module, &args.test) {
        (Some(module), test) => {
            vec![TestFilter::new(args.abi.clone(), module.clone(), test.clone()).to_string()]
        }
        (None, Some(_)) => bail!("--test requires --module"),
        (None, None) => plan.includes.clone(),
    };

    let mut serials = if args.serials.is_empty() {
        config.devices.serials.clone()
    } else {
        args.serials.clone()
    };
    if serials.is_empty() {
        bail!("No devices: pass --serial or set devices.serials in the config");
    }
    if let Some(shards) = args.shard {
        if shards == 0 || shards > serials.len() {
            bail!(
                "Cannot split into {} shards over {} device(s)",
                shards,
                serials.len()
            );
        }
        serials.truncate(shards);
    }

    let mut tokens = config.devices.tokens.clone();
    tokens.extend(args.tokens.iter().cloned());

    let repo = ModuleRepo::load(
        serials.len(),
        &config.paths.tests_dir,
        &abis,
        &tokens,
        &includes,
        &plan.excludes,
    )
    .with_context(|| {
        format!(
            "Failed to load modules from {}",
            config.paths.tests_dir.display()
        )
    })?;
    info!(
        "Plan {} selects {} modules across {} shard(s)",
        args.plan,
        repo.modules().len(),
        repo.get_number_of_shards()
    );

    let executor = ShardExecutor::new(
        Arc::new(Mutex::new(repo)),
        config.capability_source(),
        config.runner_options(),
    );
    let reporter = ResultReporter::new(config.reporter_options(&args.plan));
    executor
        .run(
            &args.plan,
            &serials,
            reporter,
            Box::new(ConsoleListener::new(verbose)),
        )
        .await
}

pub fn print_outcome(outcome: &InvocationOutcome) {
    if let Some(path) = &outcome.report_path {
        println!("Test result: {}", path.display());
    }
    if let Some(path) = &outcome.zip_path {
        println!("Full results: {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;
    use std::fs;
    use tempfile::TempDir;

    fn config_in(temp: &TempDir) -> Result<Config> {
        let mut config = load_config_str(
            r#"
            [suite]
            name = "CTS"

            [devices]
            serials = ["abc"]
            abis = ["x86_64"]

            [plans.cts-foo]
            description = "Foo only"
            includes = ["CtsFooTestCases"]
            "#,
        )?;
        config.paths.tests_dir = temp.path().join("testcases");
        config.paths.results_dir = temp.path().join("results");
        config.paths.logs_dir = temp.path().join("logs");
        fs::create_dir_all(&config.paths.tests_dir)?;
        for name in ["CtsFooTestCases", "CtsBarTestCases"] {
            fs::write(
                config.paths.tests_dir.join(format!("{}.config", name)),
                r#"<configuration description="test">
                       <test class="com.example.Host">
                           <option name="command" value="true" />
                       </test>
                   </configuration>"#,
            )?;
        }
        Ok(config)
    }

    #[test]
    fn test_console_line_parsing() {
        let parse = |line: &str| {
            let words = shell_words::split(line).unwrap();
            ConsoleLine::try_parse_from(words).map(|l| l.command)
        };
        assert!(matches!(
            parse("l m"),
            Ok(ConsoleCommand::List { target: ListTarget::Modules })
        ));
        assert!(matches!(
            parse("list results"),
            Ok(ConsoleCommand::List { target: ListTarget::Results })
        ));
        assert!(matches!(parse("quit"), Ok(ConsoleCommand::Exit)));
        assert!(matches!(parse("help"), Ok(ConsoleCommand::Help)));
        match parse("run cts -m CtsFoo -t 'a.B#c' -s abc -s def --shard 2") {
            Ok(ConsoleCommand::Run(args)) => {
                assert_eq!(args.plan, "cts");
                assert_eq!(args.module.as_deref(), Some("CtsFoo"));
                assert_eq!(args.test.as_deref(), Some("a.B#c"));
                assert_eq!(args.serials, vec!["abc", "def"]);
                assert_eq!(args.shard, Some(2));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
        assert!(parse("frobnicate").is_err());
    }

    #[test]
    fn test_list_modules_and_plans() -> Result<()> {
        let temp = TempDir::new()?;
        let config = config_in(&temp)?;

        let modules = list(&config, ListTarget::Modules, false)?;
        assert_eq!(modules, "x86_64 CtsBarTestCases\nx86_64 CtsFooTestCases");

        let plans = list(&config, ListTarget::Plans, false)?;
        let lines: Vec<&str> = plans.lines().collect();
        assert!(lines[0].starts_with("Plan"));
        assert!(lines[1].starts_with("cts "));
        assert!(lines[2].starts_with("cts-foo"));

        let json: serde_json::Value =
            serde_json::from_str(&list(&config, ListTarget::Plans, true)?)?;
        assert_eq!(json["cts-foo"]["includes"][0], "CtsFooTestCases");
        Ok(())
    }

    #[test]
    fn test_results_table_layout() {
        let rows = vec![ResultRow {
            session: 0,
            pass: 12,
            fail: 1,
            not_executed: 0,
            start_time: "2016-05-14 10:00:00".to_string(),
            plan: "cts".to_string(),
            devices: vec!["abc".to_string(), "def".to_string()],
            dir: "2016.05.14_10.00.00".to_string(),
        }];
        let table = results_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(
            lines[0],
            "Session  Pass  Fail  Not Executed  Start Time           Test Plan  Device serial(s)"
        );
        assert_eq!(
            lines[1],
            "0        12    1     0             2016-05-14 10:00:00  cts        abc, def"
        );
    }

    #[tokio::test]
    async fn test_run_module_then_list_results() -> Result<()> {
        let temp = TempDir::new()?;
        let config = config_in(&temp)?;
        let args = RunArgs {
            plan: "cts".to_string(),
            module: Some("CtsFooTestCases".to_string()),
            ..Default::default()
        };

        let outcome = run_plan(&config, &args, false).await?;
        assert_eq!(outcome.summary.passed, 1);
        assert_eq!(outcome.summary.total(), 1);

        let rows = result_rows(&parse_results(&config.paths.results_dir)?);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].pass, 1);
        assert_eq!(rows[0].plan, "cts");
        assert_eq!(rows[0].devices, vec!["abc"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_rejects_bad_arguments() -> Result<()> {
        let temp = TempDir::new()?;
        let config = config_in(&temp)?;

        let unknown = RunArgs {
            plan: "nope".to_string(),
            ..Default::default()
        };
        assert!(run_plan(&config, &unknown, false).await.is_err());

        let test_only = RunArgs {
            plan: "cts".to_string(),
            test: Some("a.B#c".to_string()),
            ..Default::default()
        };
        assert!(run_plan(&config, &test_only, false).await.is_err());

        let too_many = RunArgs {
            plan: "cts".to_string(),
            shard: Some(3),
            ..Default::default()
        };
        assert!(run_plan(&config, &too_many, false).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_console_execute() -> Result<()> {
        let temp = TempDir::new()?;
        let mut console = Console::new(config_in(&temp)?, false);
        assert_eq!(console.prompt(), "cts-tf > ");
        assert_eq!(console.execute("").await?, Flow::Continue);
        assert_eq!(console.execute("help").await?, Flow::Continue);
        assert_eq!(console.execute("bogus").await?, Flow::Continue);
        assert_eq!(console.execute("exit").await?, Flow::Exit);
        assert!(console.execute("run 'unterminated").await.is_err());
        Ok(())
    }
}
