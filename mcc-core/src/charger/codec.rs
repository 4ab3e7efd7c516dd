//! Translation between raw device JSON and structured values
//!
//! Settings go through the shared `SETTINGS_FIELDS` table in both directions.
//! Cell records are decoded into `CellInfo`; status and state strings must be
//! known values, anything else is a wire-contract violation.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use super::definitions::*;
use crate::infoset::Infoset;

/// Wire-contract violations found while decoding device payloads
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown status: {0:?}")]
    UnknownStatus(String),

    #[error("unknown state: {0:?}")]
    UnknownState(String),

    #[error("unknown slot id: {0}")]
    UnknownSlot(i64),

    #[error("unknown slot name: {0:?}")]
    UnknownSlotName(String),

    #[error("unknown action: {0:?}")]
    UnknownAction(String),

    #[error("missing or invalid field {field:?}")]
    InvalidField { field: String },

    #[error("snapshot does not cover every slot exactly once (got {0} records)")]
    IncompleteSnapshot(usize),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

// ============================================================================
// Measured values
// ============================================================================

/// Numeric reading with its unit, serialized as `{"v": .., "u": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub v: f64,
    pub u: String,
}

impl Quantity {
    pub fn new(v: f64, u: &str) -> Self {
        Self { v, u: u.to_string() }
    }
}

/// Current flow direction derived from the sign of `amps`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Charging,
    Discharging,
}

/// Current reading: magnitude with unit, plus the signed raw value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Current {
    pub v: f64,
    pub u: String,
    pub direction: Option<Direction>,
    #[serde(rename = "_raw_v")]
    pub raw: f64,
}

impl Current {
    pub fn from_raw(raw: f64) -> Self {
        let direction = if raw > 0.0 {
            Some(Direction::Charging)
        } else if raw < 0.0 {
            Some(Direction::Discharging)
        } else {
            None
        };

        Self {
            v: raw.abs(),
            u: units::CURRENT.to_string(),
            direction,
            raw,
        }
    }
}

/// Decoded state of one slot
#[derive(Debug, Clone, PartialEq)]
pub struct CellInfo {
    pub slot: Slot,
    pub voltage: Quantity,
    pub current: Current,
    pub discharge_capacity: Quantity,
    pub charge_capacity: Quantity,
    pub esr: Quantity,
    pub temperature: Quantity,
    pub action_time_elapsed: Quantity,
    pub target_cycles: i64,
    pub completed_cycles: i64,
    pub busy: bool,
    pub status: StatusString,
    pub state: StateString,
}

impl CellInfo {
    /// Empty bay with all readings at zero
    pub fn not_inserted(slot: Slot) -> Self {
        Self {
            slot,
            voltage: Quantity::new(0.0, units::VOLTAGE),
            current: Current::from_raw(0.0),
            discharge_capacity: Quantity::new(0.0, units::CAPACITY),
            charge_capacity: Quantity::new(0.0, units::CAPACITY),
            esr: Quantity::new(0.0, units::ESR),
            temperature: Quantity::new(0.0, units::TEMPERATURE),
            action_time_elapsed: Quantity::new(0.0, units::TIME),
            target_cycles: 1,
            completed_cycles: 0,
            busy: false,
            status: StatusString::NotInserted,
            state: StateString::Healthy,
        }
    }

    /// Nested JSON view, laid out like the unpacked device record
    pub fn to_infoset(&self) -> Infoset {
        Infoset::from_value(json!({
            "slot": self.slot,
            "voltage": self.voltage,
            "current": self.current,
            "discharge": { "capacity": self.discharge_capacity },
            "charge": { "capacity": self.charge_capacity },
            "esr": self.esr,
            "temperature": self.temperature,
            "action": { "time_elapsed": self.action_time_elapsed },
            "capacity_test": {
                "target_cycles": self.target_cycles,
                "completed_cycles": self.completed_cycles,
            },
            "busy": self.busy,
            "status_text": self.status,
            "state": self.state,
        }))
    }
}

/// One consistent read of all 16 slots
#[derive(Debug, Clone, PartialEq)]
pub struct ChargerSnapshot {
    cells: Vec<CellInfo>,
}

impl ChargerSnapshot {
    /// Build a snapshot; every slot must appear exactly once
    pub fn new(mut cells: Vec<CellInfo>) -> Result<Self, ProtocolError> {
        cells.sort_by_key(|c| c.slot);

        let complete = cells.len() == SLOT_COUNT
            && cells.iter().zip(Slot::all()).all(|(cell, slot)| cell.slot == slot);
        if !complete {
            return Err(ProtocolError::IncompleteSnapshot(cells.len()));
        }

        Ok(Self { cells })
    }

    pub fn cell(&self, slot: Slot) -> &CellInfo {
        &self.cells[slot.index() as usize]
    }

    pub fn cells(&self) -> impl Iterator<Item = &CellInfo> {
        self.cells.iter()
    }

    pub fn slots_with_status(&self, status: StatusString) -> Vec<Slot> {
        self.cells
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.slot)
            .collect()
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Global device configuration, unpacked into dotted paths
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChargerSettings(pub Infoset);

impl ChargerSettings {
    pub fn fw_version(&self) -> Option<&str> {
        self.0.fetch_str(FW_VERSION_PATH)
    }

    pub fn fetch(&self, path: &str) -> Option<&Value> {
        self.0.fetch(path)
    }

    pub fn as_value(&self) -> &Value {
        self.0.as_value()
    }
}

/// Raw `/api/get_config_info` payload → settings
pub fn unpack_settings(raw: &Value) -> Result<ChargerSettings, ProtocolError> {
    let mut settings = Infoset::new();

    let fw = raw
        .get(FW_VERSION_CODE)
        .cloned()
        .ok_or_else(|| invalid(FW_VERSION_CODE))?;
    settings.put(FW_VERSION_PATH, fw);

    for field in SETTINGS_FIELDS {
        let value = raw.get(field.code).cloned().ok_or_else(|| invalid(field.code))?;
        match field.unit {
            Some(unit) => settings.put(field.path, json!({ "v": value, "u": unit })),
            None => settings.put(field.path, value),
        }
    }

    Ok(ChargerSettings(settings))
}

/// Settings → `/api/set_config_info` payload.
///
/// Only fields of the shared table are emitted; units are stripped.
pub fn pack_settings(settings: &ChargerSettings) -> Result<Value, ProtocolError> {
    let mut data = Map::new();

    for field in SETTINGS_FIELDS {
        let value = settings.fetch(field.path).ok_or_else(|| invalid(field.path))?;
        let value = match value {
            Value::Object(quantity) => quantity.get("v").cloned().ok_or_else(|| invalid(field.path))?,
            other => other.clone(),
        };
        data.insert(field.code.to_string(), value);
    }

    Ok(Value::Object(data))
}

// ============================================================================
// Cell data
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawCellsInfo {
    cells: Vec<RawCell>,
}

#[derive(Debug, Deserialize)]
struct RawCell {
    #[serde(rename = "CiD")]
    slot: i64,
    voltage: f64,
    amps: f64,
    capacity: f64,
    #[serde(rename = "chargeCapacity")]
    charge_capacity: f64,
    status: String,
    esr: f64,
    action_length: f64,
    #[serde(rename = "DiC")]
    target_cycles: i64,
    complete_cycles: i64,
    temperature: f64,
    #[serde(rename = "ChC")]
    busy: Value,
    #[serde(rename = "State")]
    state: String,
}

impl RawCell {
    fn decode(self) -> Result<CellInfo, ProtocolError> {
        let busy = match &self.busy {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map(|n| n != 0.0).ok_or_else(|| invalid("ChC"))?,
            _ => return Err(invalid("ChC")),
        };

        Ok(CellInfo {
            slot: Slot::try_from(self.slot)?,
            voltage: Quantity::new(self.voltage, units::VOLTAGE),
            current: Current::from_raw(self.amps),
            discharge_capacity: Quantity::new(self.capacity, units::CAPACITY),
            charge_capacity: Quantity::new(self.charge_capacity, units::CAPACITY),
            esr: Quantity::new(self.esr, units::ESR),
            temperature: Quantity::new(self.temperature, units::TEMPERATURE),
            action_time_elapsed: Quantity::new(self.action_length, units::TIME),
            target_cycles: self.target_cycles,
            completed_cycles: self.complete_cycles,
            busy,
            status: self.status.parse()?,
            state: self.state.parse()?,
        })
    }
}

/// Raw `/api/get_cells_info` payload → snapshot of all slots
pub fn unpack_cell_data(raw: &Value) -> Result<ChargerSnapshot, ProtocolError> {
    let raw = RawCellsInfo::deserialize(raw)?;
    let cells = raw
        .cells
        .into_iter()
        .map(RawCell::decode)
        .collect::<Result<Vec<_>, _>>()?;
    ChargerSnapshot::new(cells)
}

fn invalid(field: &str) -> ProtocolError {
    ProtocolError::InvalidField { field: field.to_string() }
}
