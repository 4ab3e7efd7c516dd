//! Megacell charger protocol
//!
//! This module provides the device layer of the workflow engine:
//! - `definitions`: action codes, status/state strings, slots, settings table
//! - `codec`: raw device JSON ↔ structured snapshots and settings
//! - `transport`: JSON POST transport, reqwest backed
//! - `api`: firmware-dispatched sessions bound to one device
//! - `sim`: in-process simulated charger

pub mod definitions;
pub mod codec;
pub mod transport;
pub mod api;
pub mod sim;

pub use definitions::*;
pub use codec::{
    pack_settings, unpack_cell_data, unpack_settings, CellInfo, ChargerSettings, ChargerSnapshot,
    Current, Direction, ProtocolError, Quantity,
};
pub use transport::{HttpTransport, Reply, Transport};
pub use api::{
    api_version_for_firmware, connect, endpoints, open_session, supported_firmware_patterns, ApiError,
    ChargerApi, MegacellV0Session,
};
pub use sim::{SimStep, SimulatedCharger};
