//! In-process simulated charger
//!
//! Implements `ChargerApi` without a device. Every call to `get_cells_info`
//! advances each slot with a queued progression by one step, so a scripted
//! action plays out over successive polls. Clones share the same device
//! state, which lets one simulator back several sessions.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use super::api::{ApiError, ChargerApi};
use super::codec::{CellInfo, ChargerSettings, ChargerSnapshot, Current, Quantity};
use super::definitions::*;
use crate::infoset::Infoset;

pub const SIM_FIRMWARE: &str = "Firmware V4.3.0.11";

/// One observed slot state in a scripted progression
#[derive(Debug, Clone, PartialEq)]
pub struct SimStep {
    pub status: StatusString,
    pub state: StateString,
    pub voltage: f64,
    pub current: f64,
    pub discharge_capacity: f64,
    pub charge_capacity: f64,
    pub esr: f64,
    pub temperature: f64,
    pub completed_cycles: i64,
}

impl SimStep {
    pub fn new(status: StatusString) -> Self {
        Self {
            status,
            state: StateString::Healthy,
            voltage: 0.0,
            current: 0.0,
            discharge_capacity: 0.0,
            charge_capacity: 0.0,
            esr: 0.0,
            temperature: 25.0,
            completed_cycles: 0,
        }
    }

    pub fn state(mut self, state: StateString) -> Self {
        self.state = state;
        self
    }

    pub fn voltage(mut self, v: f64) -> Self {
        self.voltage = v;
        self
    }

    pub fn current(mut self, ma: f64) -> Self {
        self.current = ma;
        self
    }

    pub fn capacity(mut self, discharge_mah: f64, charge_mah: f64) -> Self {
        self.discharge_capacity = discharge_mah;
        self.charge_capacity = charge_mah;
        self
    }

    pub fn esr(mut self, ohm: f64) -> Self {
        self.esr = ohm;
        self
    }

    pub fn temperature(mut self, deg_c: f64) -> Self {
        self.temperature = deg_c;
        self
    }

    pub fn cycles(mut self, completed: i64) -> Self {
        self.completed_cycles = completed;
        self
    }

    fn apply(&self, cell: &mut CellInfo) {
        cell.status = self.status;
        cell.state = self.state;
        cell.voltage = Quantity::new(self.voltage, units::VOLTAGE);
        cell.current = Current::from_raw(self.current);
        cell.discharge_capacity = Quantity::new(self.discharge_capacity, units::CAPACITY);
        cell.charge_capacity = Quantity::new(self.charge_capacity, units::CAPACITY);
        cell.esr = Quantity::new(self.esr, units::ESR);
        cell.temperature = Quantity::new(self.temperature, units::TEMPERATURE);
        cell.completed_cycles = self.completed_cycles;
        cell.busy = !matches!(
            self.status,
            StatusString::NotInserted
                | StatusString::NewCellInserted
                | StatusString::LvcCompleted
                | StatusString::StoreCharged
                | StatusString::BadCell
        );
    }
}

struct SimState {
    cells: Vec<CellInfo>,
    programs: HashMap<(Slot, ActionCode), Vec<SimStep>>,
    pending: HashMap<Slot, VecDeque<SimStep>>,
    dispatched: Vec<(Slot, ActionCode)>,
    polls: usize,
    settings: ChargerSettings,
    accept_actions: bool,
}

#[derive(Clone)]
pub struct SimulatedCharger {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedCharger {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCharger {
    /// Charger with every bay empty
    pub fn new() -> Self {
        let mut settings = Infoset::new();
        settings.put(FW_VERSION_PATH, SIM_FIRMWARE);
        for field in SETTINGS_FIELDS {
            match field.unit {
                Some(unit) => settings.put(field.path, json!({ "v": 0, "u": unit })),
                None => settings.put(field.path, 0),
            }
        }
        settings.put("discharge.current.max", json!({ "v": 500, "u": "mA" }));

        Self {
            state: Arc::new(Mutex::new(SimState {
                cells: Slot::all().map(CellInfo::not_inserted).collect(),
                programs: HashMap::new(),
                pending: HashMap::new(),
                dispatched: Vec::new(),
                polls: 0,
                settings: ChargerSettings(settings),
                accept_actions: true,
            })),
        }
    }

    /// Put a cell in `slot` showing `step`
    pub fn insert(&self, slot: Slot, step: SimStep) -> &Self {
        let mut state = self.state.lock();
        step.apply(&mut state.cells[slot.index() as usize]);
        self
    }

    /// Progression played, one step per poll, once `action` is accepted for `slot`
    pub fn on_action(&self, slot: Slot, action: ActionCode, steps: Vec<SimStep>) -> &Self {
        self.state.lock().programs.insert((slot, action), steps);
        self
    }

    /// Answer every action with something other than `"Received"`
    pub fn reject_actions(&self) -> &Self {
        self.state.lock().accept_actions = false;
        self
    }

    /// Accepted actions in dispatch order
    pub fn dispatched(&self) -> Vec<(Slot, ActionCode)> {
        self.state.lock().dispatched.clone()
    }

    pub fn dispatched_to(&self, slot: Slot) -> Vec<ActionCode> {
        self.dispatched()
            .into_iter()
            .filter(|(s, _)| *s == slot)
            .map(|(_, a)| a)
            .collect()
    }

    pub fn polls(&self) -> usize {
        self.state.lock().polls
    }

    /// Boxed session over this simulator
    pub fn session(&self) -> Box<dyn ChargerApi> {
        Box::new(self.clone())
    }
}

impl ChargerApi for SimulatedCharger {
    fn api_version(&self) -> &'static str {
        "sim"
    }

    fn firmware(&self) -> &str {
        SIM_FIRMWARE
    }

    fn base_url(&self) -> &str {
        "sim://charger"
    }

    fn get_charger_settings(&self) -> Result<ChargerSettings, ApiError> {
        Ok(self.state.lock().settings.clone())
    }

    fn set_charger_settings(&self, settings: &ChargerSettings) -> Result<bool, ApiError> {
        self.state.lock().settings = settings.clone();
        Ok(true)
    }

    fn get_cells_info(&self) -> Result<ChargerSnapshot, ApiError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.polls += 1;

        for (slot, steps) in state.pending.iter_mut() {
            if let Some(step) = steps.pop_front() {
                step.apply(&mut state.cells[slot.index() as usize]);
            }
        }
        state.pending.retain(|_, steps| !steps.is_empty());

        Ok(ChargerSnapshot::new(state.cells.clone())?)
    }

    fn multiple_slots_action(&self, slots: &[Slot], action: ActionCode) -> Result<bool, ApiError> {
        let mut state = self.state.lock();
        if !state.accept_actions {
            return Ok(false);
        }

        for slot in slots {
            debug!(slot = %slot, action = %action, "simulated action");
            state.dispatched.push((*slot, action));
            if let Some(steps) = state.programs.get(&(*slot, action)).cloned() {
                state.pending.insert(*slot, steps.into());
            }
        }

        Ok(true)
    }
}
