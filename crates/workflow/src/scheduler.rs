//! Single-process workflow scheduler.
//!
//! A fixed-cadence timer per scheduled workflow, nothing more: no cluster
//! awareness, no persisted next-run times. Each entry's interval loop emits
//! a `ScheduledRun` over a channel; the caller owns actually loading and
//! executing the workflow (and skipping it if it has been deactivated since
//! scheduling).

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// A workflow scheduled at a fixed cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub workflow: Uuid,

    /// Seconds between runs.
    pub cadence_secs: u64,

    /// Variables seeded into each run.
    #[serde(default)]
    pub seed: serde_json::Map<String, serde_json::Value>,
}

/// One triggered execution, ready for the interpreter.
#[derive(Debug, Clone)]
pub struct ScheduledRun {
    pub workflow: Uuid,
    pub seed: serde_json::Map<String, serde_json::Value>,
}

/// Fires `ScheduledRun`s for a set of entries until dropped or aborted.
pub struct WorkflowScheduler {
    entries: Vec<ScheduleEntry>,
}

impl WorkflowScheduler {
    pub fn new(entries: Vec<ScheduleEntry>) -> Self {
        Self { entries }
    }

    /// Start the timer loops.
    ///
    /// Returns the run receiver plus one join handle per entry; aborting
    /// the handles (or dropping the receiver) stops the schedule.
    pub fn start(self) -> (mpsc::Receiver<ScheduledRun>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<ScheduledRun>(32);
        let mut handles = Vec::with_capacity(self.entries.len());

        for entry in self.entries {
            let tx = tx.clone();
            info!(
                workflow = %entry.workflow,
                cadence_secs = entry.cadence_secs,
                "Scheduling workflow"
            );
            handles.push(tokio::spawn(async move {
                let period = std::time::Duration::from_secs(entry.cadence_secs.max(1));
                let mut interval = tokio::time::interval(period);
                // The first tick of a tokio interval completes immediately;
                // a schedule should wait one full cadence before run #1.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    let run = ScheduledRun {
                        workflow: entry.workflow,
                        seed: entry.seed.clone(),
                    };
                    if tx.send(run).await.is_err() {
                        debug!(workflow = %entry.workflow, "Run receiver dropped, stopping schedule");
                        return;
                    }
                }
            }));
        }

        (rx, handles)
    }
}
