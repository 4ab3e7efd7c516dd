//! Workflow events recorded in a cell's log
//!
//! Opening a `WorkflowLog` appends a main event to the cell's `.log` array.
//! Entries go into the main event's `workflow.log` list and each one moves
//! the main event timestamp forward. Nothing is rolled back: a workflow that
//! stops early leaves a partially filled main event.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use super::actions::{ActionOutcome, MeasurementResults};
use crate::charger::{units, ChargerSettings, Slot, CHARGE_CURRENT_MA};
use crate::infoset::Infoset;
use crate::unix_timestamp;

/// Cell record shared between the orchestrator and one worker
pub type SharedCell = Arc<Mutex<Infoset>>;

pub const EQUIPMENT_MODEL: &str = "Megacell Charger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowEvent {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowLogEntry {
    pub action: String,
    pub event: WorkflowEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ActionOutcome>,
    pub ts: f64,
}

impl WorkflowLogEntry {
    pub fn start(action: &str) -> Self {
        Self {
            action: action.to_string(),
            event: WorkflowEvent::Start,
            outcome: None,
            ts: unix_timestamp(),
        }
    }

    pub fn end(action: &str, outcome: &ActionOutcome) -> Self {
        Self {
            action: action.to_string(),
            event: WorkflowEvent::End,
            outcome: Some(outcome.clone()),
            ts: unix_timestamp(),
        }
    }
}

/// Main event describing one measurement run on `slot`
pub fn main_event(settings: &ChargerSettings, selector: Option<&str>, base_url: &str, slot: Slot) -> Value {
    json!({
        "type": "measurement",
        "equipment": {
            "model": EQUIPMENT_MODEL,
            "fw": settings.fw_version(),
            "selector": selector,
            "api_baseurl": base_url,
            "slot": slot.name(),
        },
        "setup": {
            "charger_settings": settings.as_value(),
            "charge_current": { "v": CHARGE_CURRENT_MA, "u": units::CURRENT },
            "discharge_current": settings.fetch("discharge.current.max"),
        },
        "results": {},
    })
}

#[derive(Debug, Error)]
pub enum WorkflowLogError {
    #[error("cannot encode workflow event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("main event .log.{0} is missing from the cell record")]
    MissingEvent(usize),
}

pub struct WorkflowLog {
    cell: SharedCell,
    index: usize,
}

impl WorkflowLog {
    /// Append `main_event` to the cell log and bind to it
    pub fn open(cell: SharedCell, mut main_event: Value) -> Self {
        main_event["workflow"] = json!({ "log": [] });
        main_event["ts"] = json!(unix_timestamp());

        let index = {
            let mut record = cell.lock();
            if !matches!(record.fetch(".log"), Some(Value::Array(_))) {
                record.put(".log", json!([]));
            }
            match record.fetch_mut(".log") {
                Some(Value::Array(log)) => {
                    log.push(main_event);
                    log.len() - 1
                }
                _ => 0,
            }
        };

        Self { cell, index }
    }

    pub fn cell(&self) -> &SharedCell {
        &self.cell
    }

    fn path(&self) -> String {
        format!(".log.{}", self.index)
    }

    pub fn append(&self, entry: &WorkflowLogEntry) -> Result<(), WorkflowLogError> {
        let entry = serde_json::to_value(entry)?;
        let path = self.path();

        let mut record = self.cell.lock();
        let Some(event) = record.fetch_mut(&path).filter(|event| event.is_object()) else {
            return Err(WorkflowLogError::MissingEvent(self.index));
        };
        match event["workflow"]["log"].as_array_mut() {
            Some(log) => log.push(entry),
            None => event["workflow"]["log"] = json!([entry]),
        }
        event["ts"] = json!(unix_timestamp());
        Ok(())
    }

    /// Copy stage results into the main event, newer values replace older ones
    pub fn merge_results(&self, results: &MeasurementResults) -> Result<(), WorkflowLogError> {
        let results = serde_json::to_value(results)?;
        let path = self.path();

        let mut record = self.cell.lock();
        let Some(event) = record.fetch_mut(&path).filter(|event| event.is_object()) else {
            return Err(WorkflowLogError::MissingEvent(self.index));
        };
        if !event["results"].is_object() {
            event["results"] = json!({});
        }
        if let (Value::Object(target), Value::Object(results)) = (&mut event["results"], results) {
            target.extend(results);
        }
        Ok(())
    }

    pub fn main_event(&self) -> Value {
        self.cell.lock().fetch_or(&self.path(), Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::charger::{Quantity, StatusString};
    use crate::charger::codec::{tests::raw_settings, unpack_settings};

    fn cell() -> SharedCell {
        Arc::new(Mutex::new(crate::backend::new_record("C-1", "/")))
    }

    #[test]
    fn test_main_event_shape() {
        let settings = unpack_settings(&raw_settings()).unwrap();
        let event = main_event(&settings, Some("left"), "http://10.0.0.5", Slot::new(2).unwrap());

        assert_eq!(event["type"], "measurement");
        assert_eq!(event["equipment"]["model"], "Megacell Charger");
        assert_eq!(event["equipment"]["fw"], "Firmware V4.3.0.11");
        assert_eq!(event["equipment"]["slot"], "C3");
        assert_eq!(event["setup"]["charge_current"], json!({"v": 1000.0, "u": "mA"}));
        assert_eq!(event["setup"]["discharge_current"], json!({"v": 500, "u": "mA"}));
        assert_eq!(event["results"], json!({}));
    }

    #[test]
    fn test_open_appends_after_existing_entries() {
        let cell = cell();
        let log = WorkflowLog::open(cell.clone(), json!({"type": "measurement", "results": {}}));

        let record = cell.lock();
        let entries = record.fetch(".log").unwrap().as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event"], "entry-created");
        assert_eq!(entries[1]["workflow"]["log"], json!([]));
        drop(record);

        assert_eq!(log.main_event()["type"], "measurement");
    }

    #[test]
    fn test_open_creates_missing_log() {
        let cell: SharedCell = Arc::new(Mutex::new(Infoset::new()));
        WorkflowLog::open(cell.clone(), json!({"results": {}}));
        assert_eq!(cell.lock().fetch(".log").unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_append_and_merge() {
        let cell = cell();
        let log = WorkflowLog::open(cell, json!({"results": {}}));
        let opened_ts = log.main_event()["ts"].as_f64().unwrap();

        let mut outcome = ActionOutcome {
            ok: true,
            status_text: Some(StatusString::LvcCompleted),
            ..ActionOutcome::default()
        };
        outcome.results.voltage = Some(Quantity::new(3.3, "V"));

        log.append(&WorkflowLogEntry::start("lvc recovery")).unwrap();
        log.append(&WorkflowLogEntry::end("lvc recovery", &outcome)).unwrap();
        log.merge_results(&outcome.results).unwrap();

        let event = log.main_event();
        let entries = event["workflow"]["log"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event"], "start");
        assert!(entries[0].get("outcome").is_none());
        assert_eq!(entries[1]["event"], "end");
        assert_eq!(entries[1]["outcome"]["status_text"], "LVC Completed");
        assert_eq!(event["results"]["OCV"]["v"], 3.3);
        assert!(event["ts"].as_f64().unwrap() >= opened_ts);
    }

    #[test]
    fn test_merge_keeps_the_rest_of_the_log() {
        let cell = cell();
        let log = WorkflowLog::open(cell.clone(), json!({"type": "measurement", "results": {"IR": {"v": 0.05, "u": "Ohm"}}}));
        log.append(&WorkflowLogEntry::start("lvc recovery")).unwrap();

        let mut results = MeasurementResults::default();
        results.voltage = Some(Quantity::new(3.3, "V"));
        log.merge_results(&results).unwrap();

        let record = cell.lock();
        let entries = record.fetch(".log").unwrap().as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0]["event"], "entry-created");
        assert_eq!(entries[1]["type"], "measurement");
        assert_eq!(entries[1]["workflow"]["log"].as_array().unwrap().len(), 1);
        assert_eq!(
            entries[1]["results"],
            json!({"IR": {"v": 0.05, "u": "Ohm"}, "OCV": {"v": 3.3, "u": "V"}})
        );
    }

    #[test]
    fn test_missing_main_event_is_an_error() {
        let cell = cell();
        let log = WorkflowLog::open(cell.clone(), json!({"results": {}}));
        cell.lock().put(".log", json!([]));

        assert!(matches!(
            log.append(&WorkflowLogEntry::start("lvc recovery")),
            Err(WorkflowLogError::MissingEvent(1))
        ));
        assert!(matches!(
            log.merge_results(&MeasurementResults::default()),
            Err(WorkflowLogError::MissingEvent(1))
        ));
        assert_eq!(cell.lock().fetch(".log"), Some(&json!([])));
    }
}
