//! Sharded invocation execution.
//!
//! ```text
//!              ┌─────────────────────────────┐
//!              │ ModuleRepo (Arc<Mutex<..>>) │
//!              └──────┬───────────┬──────────┘
//!        get_modules  │           │  get_modules
//!              ┌──────▼─────┐ ┌───▼────────┐
//!              │ shard task │ │ shard task │   one per device serial
//!              │ (serial A) │ │ (serial B) │
//!              └──────┬─────┘ └───┬────────┘
//!                     │ ShardEvent│
//!                     ▼           ▼
//!              ┌─────────────────────────────┐
//!              │ pump: ResultReporter +      │   single writer of the
//!              │       other listeners       │   result tree
//!              └─────────────────────────────┘
//! ```
//!
//! Shards are handed out before any task starts, so the invocation's totals
//! cover exactly what will be reported. Every shard task then fetches its
//! modules from the shared repository, captures its device's capability
//! snapshot and runs the modules with a [`ModuleRunner`]. Events flow over an
//! unbounded channel to a single pump task, which folds them into the
//! [`ResultReporter`] and forwards them to the remaining listeners. Modules
//! no participating device could take are reported as not executed once the
//! shards finish.

pub mod runner;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::capability::{CapabilitySnapshot, CapabilitySource};
use crate::report::{
    InvocationInfo, InvocationListener, InvocationSummary, ListenerEvent, ResultReporter,
    ShardEvent,
};
use crate::repo::{ModuleRef, ModuleRepo};

pub use runner::{ModuleRunner, RunnerOptions};

/// What a finished invocation produced.
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub summary: InvocationSummary,
    pub result_dir: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
    pub zip_path: Option<PathBuf>,
}

/// Runs an initialized [`ModuleRepo`] across a set of devices.
pub struct ShardExecutor {
    repo: Arc<Mutex<ModuleRepo>>,
    capabilities: Arc<dyn CapabilitySource>,
    options: RunnerOptions,
}

impl ShardExecutor {
    pub fn new(
        repo: Arc<Mutex<ModuleRepo>>,
        capabilities: Arc<dyn CapabilitySource>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            repo,
            capabilities,
            options,
        }
    }

    /// Runs one shard per serial and writes the report.
    ///
    /// The repository must have been initialized with one shard per serial.
    pub async fn run(
        &self,
        plan: &str,
        serials: &[String],
        mut reporter: ResultReporter,
        mut listener: Box<dyn InvocationListener>,
    ) -> anyhow::Result<InvocationOutcome> {
        let start = Instant::now();
        let info = self.assign_shards(plan, serials);
        info!(
            "Starting invocation of {} on {:?}: {} modules, {} tests",
            plan, serials, info.total_modules, info.total_tests
        );

        reporter.invocation_started(&info).await;
        listener.invocation_started(&info).await;

        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(rx, reporter, listener));

        let shards = serials.iter().map(|serial| {
            let repo = Arc::clone(&self.repo);
            let capabilities = Arc::clone(&self.capabilities);
            let options = self.options.clone();
            let tx = tx.clone();
            let serial = serial.clone();
            tokio::spawn(async move {
                let modules = take_shard(&repo, &serial);
                let snapshot = match capabilities.capture(&serial).await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!("{}; treating {} as having no features", e, serial);
                        CapabilitySnapshot::new(serial.as_str(), BTreeSet::new())
                    }
                };
                ModuleRunner::new(serial, snapshot, options, tx)
                    .run_modules(&modules)
                    .await;
            })
        });
        let shards: Vec<_> = shards.collect();

        for joined in futures::future::join_all(shards).await {
            if let Err(e) = joined {
                error!("Shard task failed: {}", e);
            }
        }
        report_unscheduled(&self.repo, &tx);
        drop(tx);

        let (mut reporter, mut listener) = pump.await.context("Event pump failed")?;

        let elapsed_ms = start.elapsed().as_millis() as i64;
        let summary = reporter.summary(elapsed_ms);
        reporter.invocation_ended(&summary).await;
        listener.invocation_ended(&summary).await;

        Ok(InvocationOutcome {
            summary,
            result_dir: reporter.result_dir().map(PathBuf::from),
            report_path: reporter.report_path().map(PathBuf::from),
            zip_path: reporter.zip_path().map(PathBuf::from),
        })
    }

    /// Hands every serial its shard and counts what the invocation will
    /// report: the assigned modules plus those no device can take.
    fn assign_shards(&self, plan: &str, serials: &[String]) -> InvocationInfo {
        let mut repo = self.repo.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let shards = repo.assign_all(serials);
        let reported: Vec<&ModuleRef> = shards
            .values()
            .flatten()
            .chain(unscheduled(&repo))
            .collect();
        InvocationInfo {
            plan: plan.to_string(),
            serials: serials.to_vec(),
            total_modules: reported.len(),
            total_tests: reported.iter().map(|m| m.tests().len()).sum(),
        }
    }
}

fn unscheduled(repo: &ModuleRepo) -> impl Iterator<Item = &ModuleRef> {
    repo.get_remaining_with_tokens()
        .iter()
        .chain(repo.get_remaining_modules())
}

/// Records every module left out of all shards as not executed.
fn report_unscheduled(repo: &Mutex<ModuleRepo>, tx: &mpsc::UnboundedSender<ShardEvent>) {
    let leftovers: Vec<ModuleRef> = {
        let repo = repo.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        unscheduled(&repo).cloned().collect()
    };

    for module in leftovers {
        if module.requires_tokens() {
            warn!(
                "No participating device holds {:?} for {}; reporting it not executed",
                module.tokens(),
                module.id()
            );
        } else {
            warn!("{} was not assigned to any device; reporting it not executed", module.id());
        }

        let mut events = vec![ListenerEvent::TestRunStarted {
            num_tests: module.tests().len(),
        }];
        for test in module.tests() {
            let test_id = test.test_id();
            events.push(ListenerEvent::TestStarted {
                test_id: test_id.clone(),
            });
            events.push(ListenerEvent::TestIgnored {
                test_id: test_id.clone(),
            });
            events.push(ListenerEvent::TestEnded {
                test_id,
                metrics: BTreeMap::new(),
            });
        }
        events.push(ListenerEvent::TestRunEnded { elapsed_ms: 0 });

        for event in events {
            if tx.send(ShardEvent::new("", module.id(), event)).is_err() {
                debug!("Event channel closed, dropping event for {}", module.id());
            }
        }
    }
}

fn take_shard(repo: &Mutex<ModuleRepo>, serial: &str) -> Vec<ModuleRef> {
    repo.lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get_modules(serial)
}

/// Drains shard events into the reporter, then the other listeners.
async fn pump_events(
    mut rx: mpsc::UnboundedReceiver<ShardEvent>,
    mut reporter: ResultReporter,
    mut listener: Box<dyn InvocationListener>,
) -> (ResultReporter, Box<dyn InvocationListener>) {
    while let Some(event) = rx.recv().await {
        reporter.on_event(&event).await;
        listener.on_event(&event).await;
    }
    (reporter, listener)
}
