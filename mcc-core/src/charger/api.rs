//! Charger API sessions
//!
//! A session is bound to one device. `open_session` asks the device for its
//! firmware string and picks the session implementation from an ordered
//! table of firmware patterns; new firmware gets a new implementation and a
//! new table entry, existing wire formats stay untouched.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::codec::{self, ChargerSettings, ChargerSnapshot, ProtocolError};
use super::definitions::{ActionCode, Slot};
use super::transport::{HttpTransport, Reply, Transport};
use crate::config::SessionConfig;
use crate::retry::RetryPolicy;

/// Errors talking to the device
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{path} returned HTTP {status}: {body}")]
    Status { path: String, status: u16, body: String },

    #[error("invalid JSON from device: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub mod endpoints {
    pub const WHO_AM_I: &str = "/api/who_am_i";
    pub const GET_CONFIG_INFO: &str = "/api/get_config_info";
    pub const SET_CONFIG_INFO: &str = "/api/set_config_info";
    pub const GET_CELLS_INFO: &str = "/api/get_cells_info";
    pub const SET_CELL: &str = "/api/set_cell";
}

/// Operations every session implementation offers
pub trait ChargerApi: Send {
    /// Implementation name, e.g. `"v0"`
    fn api_version(&self) -> &'static str;

    /// Firmware string reported at connect time
    fn firmware(&self) -> &str;

    fn base_url(&self) -> &str;

    fn get_charger_settings(&self) -> Result<ChargerSettings, ApiError>;

    /// `Ok(false)` when the device does not acknowledge the write
    fn set_charger_settings(&self, settings: &ChargerSettings) -> Result<bool, ApiError>;

    fn get_cells_info(&self) -> Result<ChargerSnapshot, ApiError>;

    /// Send one action to several slots; all-or-nothing acknowledgement
    fn multiple_slots_action(&self, slots: &[Slot], action: ActionCode) -> Result<bool, ApiError>;
}

// ============================================================================
// Firmware dispatch
// ============================================================================

type SessionConstructor = fn(Arc<dyn Transport>, &SessionConfig, String) -> Box<dyn ChargerApi>;

/// Ordered firmware pattern → implementation table; first match wins
static FIRMWARE_TABLE: Lazy<Vec<(Regex, &'static str, SessionConstructor)>> = Lazy::new(|| {
    vec![(
        Regex::new(r"^Firmware V4\.3\.0\.11$").expect("static firmware pattern"),
        MegacellV0Session::API_VERSION,
        MegacellV0Session::boxed as SessionConstructor,
    )]
});

/// Session implementation name for a firmware string, `None` if unsupported
pub fn api_version_for_firmware(fw_version: &str) -> Option<&'static str> {
    FIRMWARE_TABLE
        .iter()
        .find(|(pattern, _, _)| pattern.is_match(fw_version))
        .map(|(_, version, _)| *version)
}

/// Firmware strings the table knows a pattern for, one per entry
pub fn supported_firmware_patterns() -> Vec<&'static str> {
    FIRMWARE_TABLE.iter().map(|(pattern, _, _)| pattern.as_str()).collect()
}

/// Detect the firmware and build the matching session.
///
/// `Ok(None)` means the firmware is not supported; callers treat that as fatal.
pub fn open_session(
    transport: Arc<dyn Transport>,
    config: &SessionConfig,
) -> Result<Option<Box<dyn ChargerApi>>, ApiError> {
    info!(base_url = transport.base_url(), "detecting firmware version");

    let fw_version = who_am_i(transport.as_ref(), &config.retry)?;
    info!(base_url = transport.base_url(), fw_version = %fw_version, "charger online");

    let session = FIRMWARE_TABLE
        .iter()
        .find(|(pattern, _, _)| pattern.is_match(&fw_version))
        .map(|(_, _, construct)| construct(transport.clone(), config, fw_version.clone()));

    if session.is_none() {
        error!(fw_version = %fw_version, "unsupported firmware version");
    }

    Ok(session)
}

/// `open_session` over HTTP
pub fn connect(config: &SessionConfig) -> Result<Option<Box<dyn ChargerApi>>, ApiError> {
    let transport = HttpTransport::new(&config.base_url, config.request_timeout)?;
    open_session(Arc::new(transport), config)
}

fn who_am_i(transport: &dyn Transport, retry: &RetryPolicy) -> Result<String, ApiError> {
    let reply = retry.run_with(
        || {
            let reply = transport
                .post(endpoints::WHO_AM_I, None)?
                .error_for_status(endpoints::WHO_AM_I)?;
            reply.parse::<Value>()
        },
        log_http_error(endpoints::WHO_AM_I),
    )?;

    reply
        .get("McC")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::InvalidField { field: "McC".to_string() }.into())
}

fn log_http_error(path: &'static str) -> impl FnMut(&ApiError, u32) {
    move |e: &ApiError, attempt: u32| {
        warn!(path, attempt, error = %e, "exception in http request");
        if let ApiError::Status { status, body, .. } = e {
            debug!(path, code = status, content = %body, "http response");
        }
    }
}

// ============================================================================
// Firmware V4.3.0.11
// ============================================================================

/// Session for firmware V4.3.0.11
pub struct MegacellV0Session {
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    charger_id: u32,
    firmware: String,
}

impl MegacellV0Session {
    pub const API_VERSION: &'static str = "v0";

    pub fn new(transport: Arc<dyn Transport>, config: &SessionConfig, firmware: String) -> Self {
        debug!(base_url = transport.base_url(), "creating session");
        Self {
            transport,
            retry: config.retry,
            charger_id: config.charger_id,
            firmware,
        }
    }

    fn boxed(transport: Arc<dyn Transport>, config: &SessionConfig, firmware: String) -> Box<dyn ChargerApi> {
        Box::new(Self::new(transport, config, firmware))
    }

    /// Retried POST; non-2xx statuses count as failures
    fn post(&self, path: &'static str, body: Option<&Value>) -> Result<Reply, ApiError> {
        self.retry.run_with(
            || self.transport.post(path, body)?.error_for_status(path),
            log_http_error(path),
        )
    }

    fn post_json(&self, path: &'static str, body: Option<&Value>) -> Result<Value, ApiError> {
        self.retry.run_with(
            || {
                let reply = self.transport.post(path, body)?.error_for_status(path)?;
                reply.parse::<Value>()
            },
            log_http_error(path),
        )
    }
}

impl ChargerApi for MegacellV0Session {
    fn api_version(&self) -> &'static str {
        Self::API_VERSION
    }

    fn firmware(&self) -> &str {
        &self.firmware
    }

    fn base_url(&self) -> &str {
        self.transport.base_url()
    }

    fn get_charger_settings(&self) -> Result<ChargerSettings, ApiError> {
        debug!("getting charger settings");

        let config_data = self.post_json(endpoints::GET_CONFIG_INFO, None)?;
        debug!(config_data = %config_data, "charger settings data");

        Ok(codec::unpack_settings(&config_data)?)
    }

    fn set_charger_settings(&self, settings: &ChargerSettings) -> Result<bool, ApiError> {
        debug!(config = %settings.as_value(), "setting charger settings");

        let packed = codec::pack_settings(settings)?;
        let reply = self.post(endpoints::SET_CONFIG_INFO, Some(&packed))?;

        debug!(response = %reply.body, "set config response");
        if !reply.is_received() {
            error!(config = %packed, response = %reply.body, "error setting charger settings");
            return Ok(false);
        }

        Ok(true)
    }

    fn get_cells_info(&self) -> Result<ChargerSnapshot, ApiError> {
        debug!("getting cells info");

        let body = json!({ "settings": { "charger_id": self.charger_id } });
        let cells_data = self.post_json(endpoints::GET_CELLS_INFO, Some(&body))?;
        debug!(cells_info = %cells_data, "cells data from charger");

        Ok(codec::unpack_cell_data(&cells_data)?)
    }

    fn multiple_slots_action(&self, slots: &[Slot], action: ActionCode) -> Result<bool, ApiError> {
        debug!(slots = ?slots, action = %action, "sending action to slots");

        let cells: Vec<Value> = slots
            .iter()
            .map(|slot| json!({ "CiD": slot.index(), "CmD": action.code() }))
            .collect();
        let request = json!({ "cells": cells });

        let reply = self.post(endpoints::SET_CELL, Some(&request))?;

        debug!(response = %reply.body, "set state response");
        if !reply.is_received() {
            error!(slots = ?slots, action = %action, response = %reply.body, "error sending action to slots");
            return Ok(false);
        }

        Ok(true)
    }
}
