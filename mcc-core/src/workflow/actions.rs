//! Per-slot action state machines
//!
//! Both actions follow the same shape: look at the slot once through the
//! session, decide pass/fail/continue, dispatch the start action, then block
//! on the slot queue until a terminal status shows up. Inside the wait loop
//! the device is never polled directly; the orchestrator feeds snapshots.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

use crate::charger::{ActionCode, ApiError, CellInfo, ChargerApi, ChargerSnapshot, Quantity, Slot, StateString, StatusString};

pub type SnapshotSender = UnboundedSender<Arc<ChargerSnapshot>>;
pub type SnapshotReceiver = UnboundedReceiver<Arc<ChargerSnapshot>>;

/// Signature shared by the action state machines
pub type ActionFn =
    fn(&dyn ChargerApi, Slot, &mut SnapshotReceiver, Option<Duration>) -> Result<ActionOutcome, ApiError>;

/// Measured values collected while an action runs.
///
/// Each field holds the latest positive reading. A zero reading means the
/// device has no value yet and leaves the field as it was.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MeasurementResults {
    #[serde(rename = "OCV", skip_serializing_if = "Option::is_none")]
    pub voltage: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<Quantity>,
    #[serde(rename = "IR", skip_serializing_if = "Option::is_none")]
    pub esr: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_capacity: Option<Quantity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_cycles: Option<i64>,
}

impl MeasurementResults {
    pub fn merge_latest(&mut self, cell: &CellInfo) {
        take_positive(&mut self.voltage, &cell.voltage);
        take_positive(&mut self.capacity, &cell.discharge_capacity);
        take_positive(&mut self.esr, &cell.esr);
        take_positive(&mut self.charge_capacity, &cell.charge_capacity);
        if cell.completed_cycles > 0 {
            self.completed_cycles = Some(cell.completed_cycles);
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn take_positive(slot: &mut Option<Quantity>, value: &Quantity) {
    if value.v > 0.0 {
        *slot = Some(value.clone());
    }
}

/// Result of one action run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActionOutcome {
    pub ok: bool,
    pub status_text: Option<StatusString>,
    pub state_text: Option<StateString>,
    pub results: MeasurementResults,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    /// Failed outcome for an action that could not run
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }

    fn observe(&mut self, cell: &CellInfo) {
        self.status_text = Some(cell.status);
        self.state_text = Some(cell.state);
    }
}

enum MergePolicy {
    /// Every snapshot read from the queue
    Progress,
    /// Only snapshots showing one of these statuses, including the first check
    AtStatus(&'static [StatusString]),
}

struct ActionPlan {
    name: &'static str,
    start: ActionCode,
    done: StatusString,
    failures: &'static [StatusString],
    merge: MergePolicy,
}

impl ActionPlan {
    fn should_merge(&self, status: StatusString, first_check: bool) -> bool {
        match self.merge {
            MergePolicy::Progress => !first_check,
            MergePolicy::AtStatus(statuses) => statuses.contains(&status),
        }
    }
}

const LVC: ActionPlan = ActionPlan {
    name: "low voltage recovery",
    start: ActionCode::StartLvcRecovery,
    done: StatusString::LvcCompleted,
    failures: &[StatusString::NotInserted, StatusString::BadCell],
    merge: MergePolicy::Progress,
};

const MCAP: ActionPlan = ActionPlan {
    name: "capacity measurement",
    start: ActionCode::StartCapacityTest,
    done: StatusString::StoreCharged,
    failures: &[
        StatusString::NotInserted,
        StatusString::OverdischargeHalt,
        StatusString::HotCharged,
        StatusString::HotDischarged,
        StatusString::BadCell,
    ],
    merge: MergePolicy::AtStatus(&[
        StatusString::BadCell,
        StatusString::StoreCharged,
        StatusString::HotCharged,
        StatusString::HotDischarged,
    ]),
};

/// Bring a deeply discharged cell back to a chargeable voltage.
///
/// Succeeds without dispatching when the slot already shows `LVC Completed`.
pub fn low_voltage_recovery(
    session: &dyn ChargerApi,
    slot: Slot,
    queue: &mut SnapshotReceiver,
    wait_timeout: Option<Duration>,
) -> Result<ActionOutcome, ApiError> {
    run_action(&LVC, session, slot, queue, wait_timeout)
}

/// Full charge/discharge capacity test ending at storage charge.
///
/// Overheating, overdischarge and bad-cell verdicts end the test as a
/// failure with the readings taken so far.
pub fn measure_capacity(
    session: &dyn ChargerApi,
    slot: Slot,
    queue: &mut SnapshotReceiver,
    wait_timeout: Option<Duration>,
) -> Result<ActionOutcome, ApiError> {
    run_action(&MCAP, session, slot, queue, wait_timeout)
}

fn run_action(
    plan: &ActionPlan,
    session: &dyn ChargerApi,
    slot: Slot,
    queue: &mut SnapshotReceiver,
    wait_timeout: Option<Duration>,
) -> Result<ActionOutcome, ApiError> {
    info!(action = plan.name, "performing action");
    let mut outcome = ActionOutcome::default();

    let snapshot = session.get_cells_info()?;
    let cell = snapshot.cell(slot);
    outcome.observe(cell);
    if plan.should_merge(cell.status, true) {
        outcome.results.merge_latest(cell);
    }

    match cell.status {
        StatusString::NotInserted => {
            error!(action = plan.name, "cell not inserted");
            return Ok(outcome);
        }
        StatusString::BadCell => {
            error!(action = plan.name, "bad cell");
            return Ok(outcome);
        }
        status if status == plan.done => {
            warn!(action = plan.name, "already completed");
            outcome.ok = true;
            return Ok(outcome);
        }
        _ => {}
    }

    if !session.multiple_slots_action(&[slot], plan.start)? {
        error!(action = plan.name, "cannot start action");
        outcome.error = Some(format!("{} was not acknowledged by the charger", plan.start));
        return Ok(outcome);
    }
    info!(action = plan.name, "action started");

    let started = Instant::now();
    loop {
        let Some(snapshot) = queue.blocking_recv() else {
            error!(action = plan.name, "snapshot feed closed");
            outcome.error = Some("snapshot feed closed before the action finished".to_string());
            return Ok(outcome);
        };

        let cell = snapshot.cell(slot);
        outcome.observe(cell);
        if plan.should_merge(cell.status, false) {
            outcome.results.merge_latest(cell);
        }

        if cell.status == plan.done {
            break;
        }

        if plan.failures.contains(&cell.status) {
            error!(action = plan.name, status = %cell.status, "action failed");
            return Ok(outcome);
        }

        debug!(action = plan.name, cell_info = %cell.to_infoset().to_json(), "waiting for action to finish");

        if let Some(timeout) = wait_timeout {
            if started.elapsed() >= timeout {
                error!(action = plan.name, timeout = ?timeout, "timed out");
                outcome.error = Some(format!("no terminal status after {timeout:?}"));
                return Ok(outcome);
            }
        }
    }

    outcome.ok = true;
    info!(action = plan.name, status = ?outcome.status_text, "action finished");
    Ok(outcome)
}
