//! # Megacell Charger Workflow
//!
//! Client-side orchestration for the Megacell 16-slot battery charger.
//!
//! Every occupied slot runs the same two-stage workflow (low voltage
//! recovery, then capacity measurement) in its own worker thread. A single
//! main loop polls the device once per tick and hands the same snapshot to
//! every worker still running.
//!
//! ## Architecture
//!
//! ```text
//!            Megacell charger (HTTP JSON)
//!                 ▲            ▲
//!   get_cells_info│            │set_cell (per worker session)
//! ┌───────────────┴──┐   ┌─────┴──────────────────────┐
//! │ orchestrator     │   │ DefaultWorkflow  (slot C1) │
//! │  poll → fan out  ├──►│  lvc recovery → mcap       │
//! │  sleep → repeat  │   │  WorkflowLog → cell record │
//! │                  ├──►│ DefaultWorkflow  (slot C2) │
//! └───────┬──────────┘   └────────────────────────────┘
//!         │ put (on exit)
//!         ▼
//!   CellBackend (json files / memory)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use mcc_core::{connect, SessionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::new("http://192.168.4.1");
//!     let session = connect(&config)?.ok_or("unsupported firmware")?;
//!
//!     let snapshot = session.get_cells_info()?;
//!     for cell in snapshot.cells() {
//!         println!("{}: {}", cell.slot, cell.status);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod charger;
pub mod retry;
pub mod infoset;
pub mod backend;
pub mod config;
pub mod workflow;

pub use charger::{
    connect, open_session, ActionCode, ApiError, CellInfo, ChargerApi, ChargerSettings, ChargerSnapshot,
    ProtocolError, Slot, StateString, StatusString,
};
pub use retry::{retry, RetryPolicy};
pub use infoset::Infoset;
pub use backend::{BackendError, CellBackend, JsonFilesBackend, MemoryBackend};
pub use config::{ChargerUrls, ConfigError, SessionConfig, WorkflowConfig};
pub use workflow::{
    run_workflow, ActionOutcome, CellIdPrompt, SlotSelection, StdinPrompt, WorkflowError, WorkflowSummary,
};

/// Seconds since the Unix epoch, as stored in log entries
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
