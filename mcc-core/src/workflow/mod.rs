//! Two-stage cell workflow
//!
//! - `actions`: low voltage recovery and capacity measurement state machines
//! - `log`: workflow events appended to the cell record
//! - `worker`: one `DefaultWorkflow` thread per slot
//! - `orchestrator`: slot selection, worker startup and the polling loop

pub mod actions;
pub mod log;
pub mod worker;
pub mod orchestrator;

pub use actions::{
    low_voltage_recovery, measure_capacity, ActionOutcome, MeasurementResults, SnapshotReceiver, SnapshotSender,
};
pub use log::{main_event, SharedCell, WorkflowEvent, WorkflowLog, WorkflowLogEntry, WorkflowLogError};
pub use worker::{DefaultWorkflow, WorkflowReport, EXCESSIVE_HEAT_TAG, LVC_ACTION, MCAP_ACTION, PRECHARGE_FAIL_TAG};
pub use orchestrator::{
    fan_out, run_workflow, CellIdPrompt, SessionFactory, SlotSelection, SlotWorker, StdinPrompt, WorkflowError,
    WorkflowSummary,
};
