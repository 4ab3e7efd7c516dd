//! Megacell protocol vocabulary
//!
//! Action codes, the status/state strings reported per slot, slot identifiers
//! and the field tables shared by the settings codec.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize, Serializer};

use super::codec::ProtocolError;

/// Number of physical bays in the charger
pub const SLOT_COUNT: usize = 16;

// ============================================================================
// Action codes
// ============================================================================

/// Slot commands understood by `/api/set_cell` (`CmD` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionCode {
    StartLvcRecovery,
    StartCharging,
    StopCharging,
    StartDischarging,
    StopDischarging,
    StartCapacityTest,
    StopCapacityTest,
}

impl ActionCode {
    pub const ALL: [ActionCode; 7] = [
        ActionCode::StartLvcRecovery,
        ActionCode::StartCharging,
        ActionCode::StopCharging,
        ActionCode::StartDischarging,
        ActionCode::StopDischarging,
        ActionCode::StartCapacityTest,
        ActionCode::StopCapacityTest,
    ];

    /// Wire code sent as `CmD`
    pub fn code(&self) -> &'static str {
        match self {
            ActionCode::StartLvcRecovery => "alr",
            ActionCode::StartCharging => "ach",
            ActionCode::StopCharging => "sc",
            ActionCode::StartDischarging => "adc",
            ActionCode::StopDischarging => "odc",
            ActionCode::StartCapacityTest => "act",
            ActionCode::StopCapacityTest => "omc",
        }
    }

    /// Symbolic name used on the command line
    pub fn name(&self) -> &'static str {
        match self {
            ActionCode::StartLvcRecovery => "START_LVC_RECOVERY",
            ActionCode::StartCharging => "START_CHARGING",
            ActionCode::StopCharging => "STOP_CHARGING",
            ActionCode::StartDischarging => "START_DISCHARGING",
            ActionCode::StopDischarging => "STOP_DISCHARGING",
            ActionCode::StartCapacityTest => "START_CAPACITY_TEST",
            ActionCode::StopCapacityTest => "STOP_CAPACITY_TEST",
        }
    }
}

impl fmt::Display for ActionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ActionCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionCode::ALL
            .iter()
            .copied()
            .find(|a| a.name() == s)
            .ok_or_else(|| ProtocolError::UnknownAction(s.to_string()))
    }
}

// ============================================================================
// Status / state strings
// ============================================================================

/// Generates a closed string enum renamed to its wire text for serde, plus a
/// `FromStr` that rejects anything else with a `ProtocolError`.
macro_rules! wire_strings {
    (
        $(#[$meta:meta])*
        $name:ident, $err:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal, )+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                #[serde(rename = $text)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[ $( $name::$variant, )+ ];

            /// Text exactly as reported by the device
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( $name::$variant => $text, )+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $text => Ok($name::$variant), )+
                    _ => Err(ProtocolError::$err(s.to_string())),
                }
            }
        }
    };
}

wire_strings! {
    /// Per-slot `status` field
    StatusString, UnknownStatus {
        NotInserted => "Not Inserted",
        NewCellInserted => "New cell inserted",

        LvcStartCharging => "LVC start charging",
        LvcCharging => "LVC Charging",
        LvcCharged => "LVC Charged",
        LvcCellRest => "Cell rest 5 Min",
        LvcCompleted => "LVC Completed",

        StartedCharging => "Started Charging",
        StoppedCharging => "Stopped Charging",
        HotCharged => "Hot Charged",

        StartedDischarging => "Started Discharging",
        Discharged => "Discharged",
        HotDischarged => "Hot Discharged",

        InitiatingMcap => "Initiating mCap",
        McapStartedCharging => "mCap Started Charging",
        WaitForEsrTest => "Wait For ESR Test",
        McapStartedDischarging => "mCap Started Discharging",
        McapStoreCharging => "mCap Store Charging",
        StoreCharged => "Store Charged",

        /// Details are in the accompanying `StateString`
        BadCell => "Bad Cell",

        OverdischargeHalt => "Overdischarge halt",
    }
}

wire_strings! {
    /// Per-slot `State` field.
    ///
    /// The device does not always refresh it when a new action starts, so it is
    /// diagnostic only; decisions are taken on `StatusString`.
    StateString, UnknownState {
        LowVoltageCell => "Low voltage cell",
        Healthy => "Healthy",
        HighEsrError => "High ESR Error",
        HotCharged => "HOT charged",
        HotDischarged => "HOT discharged",
        LowCapacityError => "Low capacity Error",
        HighVoltDropError => "High volt drop Error",
        LvcRecoveryFailed => "LVC recovery failed",
        EmergencyStop => "!!!Emergency stop!!!",
    }
}

// ============================================================================
// Slots
// ============================================================================

/// Physical bay, 0-based on the wire and shown as `C1`..`C16`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slot(u8);

impl Slot {
    pub fn new(index: u8) -> Result<Self, ProtocolError> {
        if (index as usize) < SLOT_COUNT {
            Ok(Slot(index))
        } else {
            Err(ProtocolError::UnknownSlot(index as i64))
        }
    }

    /// All slots in bay order
    pub fn all() -> impl Iterator<Item = Slot> {
        (0..SLOT_COUNT as u8).map(Slot)
    }

    /// Wire identifier (`CiD`)
    pub fn index(&self) -> u8 {
        self.0
    }

    /// Label printed on the charger
    pub fn name(&self) -> String {
        format!("C{}", self.0 + 1)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0 + 1)
    }
}

impl FromStr for Slot {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u8 = s
            .strip_prefix('C')
            .and_then(|n| n.parse().ok())
            .filter(|n| (1..=SLOT_COUNT as u8).contains(n))
            .ok_or_else(|| ProtocolError::UnknownSlotName(s.to_string()))?;
        Ok(Slot(n - 1))
    }
}

impl TryFrom<i64> for Slot {
    type Error = ProtocolError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| ProtocolError::UnknownSlot(value))
            .and_then(Slot::new)
    }
}

impl Serialize for Slot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Field tables
// ============================================================================

/// One entry of the settings field table
#[derive(Debug, Clone, Copy)]
pub struct SettingsField {
    /// Short device code
    pub code: &'static str,
    /// Dotted path in the unpacked settings
    pub path: &'static str,
    /// Unit attached on unpack, `None` for plain values
    pub unit: Option<&'static str>,
}

const fn field(code: &'static str, path: &'static str, unit: Option<&'static str>) -> SettingsField {
    SettingsField { code, path, unit }
}

/// Settings field table, used in both directions by the codec.
///
/// `FwV` is copied separately; `ChC` and `MuL` are not settings.
pub const SETTINGS_FIELDS: &[SettingsField] = &[
    field("MaV", "charge.voltage.max", Some("V")),
    field("StV", "charge.voltage.storage", Some("V")),
    field("MiV", "charge.voltage.min", Some("V")),
    field("DiR", "discharge.current.max", Some("mA")),
    field("MaT", "charge.temp.max", Some("degC")),
    field("DiC", "capacity_test.cycles", None),
    field("LmV", "lcv.voltage.min", Some("V")),
    field("LcV", "lcv.voltage.end", Some("V")),
    field("LmD", "bad_cell_rejection.lcv.max_voltage_drop", Some("V")),
    field("LmR", "lcv.time.max", Some("minutes")),
    field("McH", "charge.time.max", Some("minutes")),
    field("LcR", "bad_cell_rejection.capacity.min", Some("mAh")),
    field("CcO", "charge.correction_factor", Some("1/1")),
    field("DcO", "discharge.correction_factor", Some("1/1")),
    field("MsR", "bad_cell_rejection.esr.max", Some("mOhm")),
];

/// Firmware version field of the settings payload
pub const FW_VERSION_CODE: &str = "FwV";
pub const FW_VERSION_PATH: &str = "fw_version";

/// Units attached to cell data
pub mod units {
    pub const VOLTAGE: &str = "V";
    pub const CURRENT: &str = "mA";
    pub const CAPACITY: &str = "mAh";
    pub const ESR: &str = "Ohm";
    pub const TEMPERATURE: &str = "degC";
    pub const TIME: &str = "second";
}

/// The charge current is fixed by the hardware and cannot be configured
pub const CHARGE_CURRENT_MA: f64 = 1000.0;
