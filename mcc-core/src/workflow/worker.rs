//! Per-slot workflow worker

use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info, info_span, warn};

use super::actions::{low_voltage_recovery, measure_capacity, ActionFn, ActionOutcome, SnapshotReceiver};
use super::log::{WorkflowLog, WorkflowLogEntry};
use crate::charger::{ChargerApi, Slot, StatusString};

pub const LVC_ACTION: &str = "lvc recovery";
pub const MCAP_ACTION: &str = "capacity measure";

pub const PRECHARGE_FAIL_TAG: &str = ".props.tags.precharge_fail";
pub const EXCESSIVE_HEAT_TAG: &str = ".props.tags.excessive_heat";

/// What one worker did
#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub slot: Slot,
    pub cell_id: String,
    pub lvc: ActionOutcome,
    /// `None` when recovery failed and the capacity test never ran
    pub mcap: Option<ActionOutcome>,
}

impl WorkflowReport {
    pub fn ok(&self) -> bool {
        self.lvc.ok && self.mcap.as_ref().is_some_and(|m| m.ok)
    }
}

/// Low voltage recovery, then capacity measurement if recovery succeeded.
///
/// Failures never propagate: they end up as tags on the cell record and as
/// `end` events in the workflow log.
pub struct DefaultWorkflow {
    session: Box<dyn ChargerApi>,
    slot: Slot,
    queue: SnapshotReceiver,
    log: WorkflowLog,
    wait_timeout: Option<Duration>,
}

impl DefaultWorkflow {
    pub fn new(
        session: Box<dyn ChargerApi>,
        slot: Slot,
        queue: SnapshotReceiver,
        log: WorkflowLog,
        wait_timeout: Option<Duration>,
    ) -> Self {
        Self { session, slot, queue, log, wait_timeout }
    }

    /// Run on a dedicated thread named after the slot
    pub fn spawn(self) -> io::Result<JoinHandle<WorkflowReport>> {
        thread::Builder::new()
            .name(format!("workflow-{}", self.slot))
            .spawn(move || self.run())
    }

    pub fn run(mut self) -> WorkflowReport {
        let cell_id = self
            .log
            .cell()
            .lock()
            .fetch_str(".id")
            .unwrap_or_default()
            .to_string();
        let span = info_span!("workflow", slot = %self.slot, cell_id = %cell_id);
        let _enter = span.enter();

        info!("launching workflow");

        let lvc = self.stage(LVC_ACTION, low_voltage_recovery);
        let mut mcap = None;

        if lvc.ok {
            let outcome = self.stage(MCAP_ACTION, measure_capacity);
            if !outcome.ok {
                warn!(outcome = ?outcome, "failed capacity measurement");
                if matches!(outcome.status_text, Some(StatusString::HotCharged | StatusString::HotDischarged)) {
                    self.tag(EXCESSIVE_HEAT_TAG);
                }
            }
            mcap = Some(outcome);
        } else {
            warn!(outcome = ?lvc, "failed low voltage recovery attempt");
            self.tag(PRECHARGE_FAIL_TAG);
        }

        info!("workflow finished");
        WorkflowReport { slot: self.slot, cell_id, lvc, mcap }
    }

    /// Run one action between `start` and `end` log events.
    ///
    /// Results of a passed stage go into the main event; a stage whose
    /// results cannot be recorded counts as failed.
    fn stage(&mut self, name: &str, action: ActionFn) -> ActionOutcome {
        self.record(&WorkflowLogEntry::start(name));

        let mut outcome = match action(self.session.as_ref(), self.slot, &mut self.queue, self.wait_timeout) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(action = name, error = %e, "charger request failed");
                ActionOutcome::failed(e.to_string())
            }
        };

        if outcome.ok {
            if let Err(e) = self.log.merge_results(&outcome.results) {
                error!(action = name, error = %e, "cannot record results");
                outcome.ok = false;
                outcome.error = Some(e.to_string());
            }
        }

        self.record(&WorkflowLogEntry::end(name, &outcome));
        outcome
    }

    fn record(&self, entry: &WorkflowLogEntry) {
        if let Err(e) = self.log.append(entry) {
            error!(error = %e, "cannot record workflow event");
        }
    }

    fn tag(&self, path: &str) {
        self.log.cell().lock().put(path, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::new_record;
    use crate::charger::sim::{SimStep, SimulatedCharger};
    use crate::charger::ActionCode;
    use crate::workflow::log::SharedCell;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn slot() -> Slot {
        Slot::new(0).unwrap()
    }

    /// Run a worker, feeding it a snapshot whenever it is waiting
    fn run_worker(charger: &SimulatedCharger) -> (SharedCell, WorkflowReport) {
        let cell: SharedCell = Arc::new(Mutex::new(new_record("W-1", "/")));
        let log = WorkflowLog::open(cell.clone(), json!({"results": {}}));
        let (tx, rx) = unbounded_channel();

        let handle = DefaultWorkflow::new(charger.session(), slot(), rx, log, None)
            .spawn()
            .unwrap();

        while !handle.is_finished() {
            let _ = tx.send(Arc::new(charger.get_cells_info().unwrap()));
            std::thread::sleep(Duration::from_millis(1));
        }
        (cell, handle.join().unwrap())
    }

    fn workflow_entries(cell: &SharedCell) -> Vec<Value> {
        cell.lock().fetch(".log.1.workflow.log").unwrap().as_array().unwrap().clone()
    }

    #[test]
    fn test_precharge_fail_skips_capacity_test() {
        let charger = SimulatedCharger::new();
        charger
            .insert(slot(), SimStep::new(StatusString::NewCellInserted))
            .on_action(
                slot(),
                ActionCode::StartLvcRecovery,
                vec![SimStep::new(StatusString::LvcCharging), SimStep::new(StatusString::BadCell)],
            );

        let (cell, report) = run_worker(&charger);

        assert!(!report.lvc.ok);
        assert!(report.mcap.is_none());
        assert_eq!(cell.lock().fetch(PRECHARGE_FAIL_TAG), Some(&json!(true)));
        assert_eq!(charger.dispatched_to(slot()), vec![ActionCode::StartLvcRecovery]);

        let entries = workflow_entries(&cell);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["action"], "lvc recovery");
        assert_eq!(entries[1]["event"], "end");
    }

    #[test]
    fn test_full_workflow_merges_results() {
        let charger = SimulatedCharger::new();
        charger
            .insert(slot(), SimStep::new(StatusString::LvcCompleted).voltage(3.2))
            .on_action(
                slot(),
                ActionCode::StartCapacityTest,
                vec![
                    SimStep::new(StatusString::StartedCharging).voltage(4.0),
                    SimStep::new(StatusString::StoreCharged).voltage(3.7).capacity(2400.0, 2450.0).esr(0.04),
                ],
            );

        let (cell, report) = run_worker(&charger);

        assert!(report.ok());
        let record = cell.lock();
        assert_eq!(record.fetch(".log.1.results.capacity.v"), Some(&json!(2400.0)));
        assert_eq!(record.fetch(".log.1.results.IR.v"), Some(&json!(0.04)));
        assert!(record.fetch(PRECHARGE_FAIL_TAG).is_none());
        drop(record);

        let actions: Vec<(String, String)> = workflow_entries(&cell)
            .iter()
            .map(|e| (e["action"].as_str().unwrap().to_string(), e["event"].as_str().unwrap().to_string()))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("lvc recovery".to_string(), "start".to_string()),
                ("lvc recovery".to_string(), "end".to_string()),
                ("capacity measure".to_string(), "start".to_string()),
                ("capacity measure".to_string(), "end".to_string()),
            ]
        );
    }

    #[test]
    fn test_unrecorded_results_fail_the_stage() {
        let charger = SimulatedCharger::new();
        charger.insert(slot(), SimStep::new(StatusString::LvcCompleted).voltage(3.2));

        let cell: SharedCell = Arc::new(Mutex::new(new_record("W-2", "/")));
        let log = WorkflowLog::open(cell.clone(), json!({"results": {}}));
        // Main event dropped behind the worker's back
        cell.lock().put(".log", json!([]));
        let (_tx, rx) = unbounded_channel();

        let report = DefaultWorkflow::new(charger.session(), slot(), rx, log, None).run();

        assert!(!report.lvc.ok);
        assert!(report.lvc.error.as_deref().unwrap().contains("missing"));
        assert!(report.mcap.is_none());
        assert_eq!(cell.lock().fetch(PRECHARGE_FAIL_TAG), Some(&json!(true)));
        assert!(charger.dispatched().is_empty());
    }

    #[test]
    fn test_hot_charged_is_tagged() {
        let charger = SimulatedCharger::new();
        charger
            .insert(slot(), SimStep::new(StatusString::LvcCompleted))
            .on_action(
                slot(),
                ActionCode::StartCapacityTest,
                vec![SimStep::new(StatusString::HotCharged).voltage(4.1).temperature(58.0)],
            );

        let (cell, report) = run_worker(&charger);

        assert!(!report.ok());
        assert_eq!(cell.lock().fetch(EXCESSIVE_HEAT_TAG), Some(&json!(true)));
        assert!(cell.lock().fetch(PRECHARGE_FAIL_TAG).is_none());
    }
}
