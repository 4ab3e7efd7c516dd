//! Workflow orchestrator
//!
//! One worker thread per selected slot, plus the calling thread acting as
//! the feeder: one `get_cells_info` poll per tick, the same snapshot pushed
//! to every live worker, then a fixed sleep. The loop ends when no worker is
//! left alive; every cell record is then written back to the backend.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{error, info, warn};

use super::actions::SnapshotSender;
use super::log::{main_event, SharedCell, WorkflowLog};
use super::worker::{DefaultWorkflow, WorkflowReport};
use crate::backend::{BackendError, CellBackend};
use crate::charger::{connect, ApiError, ChargerApi, ChargerSnapshot, SimulatedCharger, Slot, StatusString};
use crate::config::{SessionConfig, WorkflowConfig};

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("charger firmware is not supported")]
    UnsupportedFirmware,

    #[error("cell {0:?} not found")]
    CellNotFound(String),

    #[error("cannot read cell id: {0}")]
    Prompt(#[source] io::Error),

    #[error("cannot start worker thread: {0}")]
    Spawn(#[source] io::Error),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Which slots a command applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotSelection {
    All,
    /// Slots currently reporting `New cell inserted`
    New,
    Explicit(Vec<Slot>),
}

impl SlotSelection {
    /// Concrete slots, in order and without repeats
    pub fn resolve(&self, session: &dyn ChargerApi) -> Result<Vec<Slot>, ApiError> {
        let slots = match self {
            SlotSelection::All => Slot::all().collect(),
            SlotSelection::New => session.get_cells_info()?.slots_with_status(StatusString::NewCellInserted),
            SlotSelection::Explicit(slots) => {
                let mut unique = Vec::with_capacity(slots.len());
                for slot in slots {
                    if !unique.contains(slot) {
                        unique.push(*slot);
                    }
                }
                unique
            }
        };
        Ok(slots)
    }
}

/// Source of the cell id placed in each slot
pub trait CellIdPrompt {
    fn cell_id(&mut self, selector: Option<&str>, slot: Slot) -> io::Result<String>;
}

/// Asks on stdout, reads one line from stdin
pub struct StdinPrompt;

impl CellIdPrompt for StdinPrompt {
    fn cell_id(&mut self, selector: Option<&str>, slot: Slot) -> io::Result<String> {
        let mut stdout = io::stdout().lock();
        write!(stdout, "[{}/{}] Input cell ID > ", selector.unwrap_or_default(), slot)?;
        stdout.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no cell id entered"));
        }
        Ok(line.trim().to_string())
    }
}

/// Scripted answers, in slot order
impl CellIdPrompt for VecDeque<String> {
    fn cell_id(&mut self, _selector: Option<&str>, slot: Slot) -> io::Result<String> {
        self.pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, format!("no cell id for {slot}")))
    }
}

/// Opens a fresh device session; called once for the feeder and once per worker
pub trait SessionFactory {
    fn open(&self) -> Result<Option<Box<dyn ChargerApi>>, ApiError>;
}

impl<F> SessionFactory for F
where
    F: Fn() -> Result<Option<Box<dyn ChargerApi>>, ApiError>,
{
    fn open(&self) -> Result<Option<Box<dyn ChargerApi>>, ApiError> {
        self()
    }
}

impl SessionFactory for SessionConfig {
    fn open(&self) -> Result<Option<Box<dyn ChargerApi>>, ApiError> {
        connect(self)
    }
}

impl SessionFactory for SimulatedCharger {
    fn open(&self) -> Result<Option<Box<dyn ChargerApi>>, ApiError> {
        Ok(Some(self.session()))
    }
}

/// Feeder-side handle of one worker
pub struct SlotWorker {
    queue: SnapshotSender,
    handle: Option<JoinHandle<WorkflowReport>>,
}

impl SlotWorker {
    pub fn new(queue: SnapshotSender, handle: Option<JoinHandle<WorkflowReport>>) -> Self {
        Self { queue, handle }
    }

    /// Started and not yet finished
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn join(&mut self) -> Option<WorkflowReport> {
        self.handle.take()?.join().ok()
    }
}

/// Push `snapshot` to every live worker, returns how many received it
pub fn fan_out(snapshot: &Arc<ChargerSnapshot>, workers: &BTreeMap<Slot, SlotWorker>) -> usize {
    workers
        .values()
        .filter(|worker| worker.is_alive())
        .filter(|worker| worker.queue.send(Arc::clone(snapshot)).is_ok())
        .count()
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowSummary {
    pub reports: Vec<WorkflowReport>,
    /// Feeder polls made while workers were running
    pub polls: usize,
}

impl WorkflowSummary {
    pub fn report(&self, slot: Slot) -> Option<&WorkflowReport> {
        self.reports.iter().find(|r| r.slot == slot)
    }

    pub fn failed(&self) -> usize {
        self.reports.iter().filter(|r| !r.ok()).count()
    }
}

/// Run the default workflow on the selected slots until every worker ends
pub fn run_workflow(
    config: &WorkflowConfig,
    sessions: &dyn SessionFactory,
    backend: &mut dyn CellBackend,
    prompt: &mut dyn CellIdPrompt,
    selection: &SlotSelection,
) -> Result<WorkflowSummary, WorkflowError> {
    let session = sessions.open()?.ok_or(WorkflowError::UnsupportedFirmware)?;
    let settings = session.get_charger_settings()?;

    let slots = selection.resolve(session.as_ref())?;
    info!(slots = ?slots, "selected slots");

    let selector = config.selector.as_deref();
    let mut cells: Vec<SharedCell> = Vec::with_capacity(slots.len());
    let mut pending = Vec::with_capacity(slots.len());

    for &slot in &slots {
        let cell_id = prompt.cell_id(selector, slot).map_err(WorkflowError::Prompt)?;

        let record = match backend.fetch(&cell_id)? {
            Some(record) => record,
            None if config.autocreate => {
                let record = backend.create(&cell_id, &config.path)?;
                backend.put(&record)?;
                record
            }
            None => {
                error!(id = %cell_id, "cell not found");
                return Err(WorkflowError::CellNotFound(cell_id));
            }
        };
        info!(id = %cell_id, "cell found");

        let cell: SharedCell = Arc::new(Mutex::new(record));
        cells.push(cell.clone());

        // Each worker owns its session
        let worker_session = sessions.open()?.ok_or(WorkflowError::UnsupportedFirmware)?;
        let log = WorkflowLog::open(cell, main_event(&settings, selector, worker_session.base_url(), slot));

        let (tx, rx) = unbounded_channel();
        pending.push((slot, tx, DefaultWorkflow::new(worker_session, slot, rx, log, config.wait_timeout)));
    }

    let mut workers = BTreeMap::new();
    for (slot, tx, workflow) in pending {
        let handle = workflow.spawn().map_err(WorkflowError::Spawn)?;
        workers.insert(slot, SlotWorker::new(tx, Some(handle)));
    }

    let mut polls = 0;
    loop {
        let active = workers.values().filter(|w| w.is_alive()).count();
        if active == 0 {
            break;
        }
        info!(active_workers = active, "cell state feeder loop");

        match session.get_cells_info() {
            Ok(snapshot) => {
                polls += 1;
                fan_out(&Arc::new(snapshot), &workers);
            }
            Err(e) => warn!(error = %e, "cannot poll charger"),
        }

        thread::sleep(config.poll_interval);
    }

    let mut reports = Vec::with_capacity(workers.len());
    for (slot, worker) in workers.iter_mut() {
        match worker.join() {
            Some(report) => reports.push(report),
            None => error!(slot = %slot, "worker panicked"),
        }
    }

    // A failed write must not keep the remaining cells from being stored
    let mut first_error = None;
    for cell in &cells {
        let record = cell.lock();
        if let Err(e) = backend.put(&record) {
            error!(id = record.fetch_str(".id").unwrap_or_default(), error = %e, "cannot store cell");
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e.into());
    }

    Ok(WorkflowSummary { reports, polls })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charger::sim::SimStep;
    use crate::workflow::actions::ActionOutcome;
    use std::sync::mpsc;
    use std::time::Duration;

    fn report(slot: Slot) -> WorkflowReport {
        WorkflowReport {
            slot,
            cell_id: String::new(),
            lvc: ActionOutcome::default(),
            mcap: None,
        }
    }

    #[test]
    fn test_fan_out_skips_finished_and_unstarted_workers() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        let mut workers = BTreeMap::new();
        let mut receivers = BTreeMap::new();

        // Slots 0..3 live, 3..5 finished, 5 never started
        for index in 0..6u8 {
            let slot = Slot::new(index).unwrap();
            let (tx, rx) = unbounded_channel();
            receivers.insert(slot, rx);

            let handle = match index {
                0..=2 => {
                    let release = release_rx.clone();
                    Some(thread::spawn(move || {
                        let _ = release.lock().unwrap().recv();
                        report(slot)
                    }))
                }
                3 | 4 => {
                    let handle = thread::spawn(move || report(slot));
                    while !handle.is_finished() {
                        thread::yield_now();
                    }
                    Some(handle)
                }
                _ => None,
            };
            workers.insert(slot, SlotWorker::new(tx, handle));
        }

        let snapshot = Arc::new(SimulatedCharger::new().get_cells_info().unwrap());
        assert_eq!(fan_out(&snapshot, &workers), 3);

        for (slot, rx) in receivers.iter_mut() {
            let received = rx.try_recv().ok();
            if slot.index() < 3 {
                // Same instance for everyone
                assert!(Arc::ptr_eq(received.as_ref().unwrap(), &snapshot));
            } else {
                assert!(received.is_none(), "slot {slot} should be skipped");
            }
        }

        drop(release_tx);
        for worker in workers.values_mut() {
            worker.join();
        }
    }

    #[test]
    fn test_slot_selection() {
        let charger = SimulatedCharger::new();
        let c2 = Slot::new(1).unwrap();
        let c9 = Slot::new(8).unwrap();
        charger
            .insert(c2, SimStep::new(StatusString::NewCellInserted))
            .insert(c9, SimStep::new(StatusString::NewCellInserted))
            .insert(Slot::new(3).unwrap(), SimStep::new(StatusString::LvcCompleted));

        assert_eq!(SlotSelection::All.resolve(&charger).unwrap().len(), 16);
        assert_eq!(SlotSelection::New.resolve(&charger).unwrap(), vec![c2, c9]);
        assert_eq!(
            SlotSelection::Explicit(vec![c9, c2, c9]).resolve(&charger).unwrap(),
            vec![c9, c2]
        );
    }

    #[test]
    fn test_unknown_cell_without_autocreate() {
        let charger = SimulatedCharger::new();
        let mut backend = crate::backend::MemoryBackend::new();
        let mut prompt: VecDeque<String> = VecDeque::from(vec!["NOPE".to_string()]);
        let config = WorkflowConfig::default().with_poll_interval(Duration::from_millis(1));

        let result = run_workflow(
            &config,
            &charger,
            &mut backend,
            &mut prompt,
            &SlotSelection::Explicit(vec![Slot::new(0).unwrap()]),
        );

        assert!(matches!(result, Err(WorkflowError::CellNotFound(id)) if id == "NOPE"));
        assert!(backend.is_empty());
    }

    /// Memory store refusing writes for one cell id
    struct RejectingBackend {
        inner: crate::backend::MemoryBackend,
        reject: &'static str,
    }

    impl CellBackend for RejectingBackend {
        fn fetch(&self, id: &str) -> Result<Option<crate::Infoset>, BackendError> {
            self.inner.fetch(id)
        }

        fn put(&mut self, record: &crate::Infoset) -> Result<(), BackendError> {
            if record.fetch_str(".id") == Some(self.reject) {
                return Err(BackendError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            self.inner.put(record)
        }

        fn move_to(&mut self, id: &str, destination: &str) -> Result<(), BackendError> {
            self.inner.move_to(id, destination)
        }
    }

    #[test]
    fn test_store_failure_does_not_skip_other_cells() {
        let mut inner = crate::backend::MemoryBackend::new();
        for id in ["BROKEN", "FINE"] {
            let record = inner.create(id, "/").unwrap();
            inner.put(&record).unwrap();
        }
        let mut backend = RejectingBackend { inner, reject: "BROKEN" };

        // Both slots are empty: each worker fails recovery at once
        let charger = SimulatedCharger::new();
        let mut prompt: VecDeque<String> = VecDeque::from(vec!["BROKEN".to_string(), "FINE".to_string()]);
        let config = WorkflowConfig::default().with_poll_interval(Duration::from_millis(1));

        let result = run_workflow(
            &config,
            &charger,
            &mut backend,
            &mut prompt,
            &SlotSelection::Explicit(vec![Slot::new(0).unwrap(), Slot::new(1).unwrap()]),
        );

        assert!(matches!(result, Err(WorkflowError::Backend(BackendError::Io(_)))));
        let fine = backend.inner.fetch("FINE").unwrap().unwrap();
        assert_eq!(fine.fetch(crate::workflow::PRECHARGE_FAIL_TAG), Some(&serde_json::json!(true)));
        let broken = backend.inner.fetch("BROKEN").unwrap().unwrap();
        assert!(broken.fetch(crate::workflow::PRECHARGE_FAIL_TAG).is_none());
    }

    #[test]
    fn test_unsupported_firmware_is_fatal() {
        let factory = || -> Result<Option<Box<dyn ChargerApi>>, ApiError> { Ok(None) };
        let mut backend = crate::backend::MemoryBackend::new();
        let mut prompt: VecDeque<String> = VecDeque::new();

        let result = run_workflow(
            &WorkflowConfig::default(),
            &factory,
            &mut backend,
            &mut prompt,
            &SlotSelection::All,
        );
        assert!(matches!(result, Err(WorkflowError::UnsupportedFirmware)));
    }
}
