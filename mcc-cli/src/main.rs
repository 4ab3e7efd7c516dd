//! mcl - Megacell charger command line
//!
//! # Usage
//!
//! ```bash
//! # Print the charger settings
//! mcl --mcc-baseurl http://192.168.4.1 charger --read-settings
//!
//! # Write settings from a file
//! mcl --mcc-baseurl http://192.168.4.1 charger --write-settings @settings.json
//!
//! # Start low voltage recovery on two slots and print their state
//! mcl --mcc-baseurl http://192.168.4.1 slots C1 C2 --action START_LVC_RECOVERY --info
//!
//! # Run the full workflow on every slot holding a new cell
//! MCC_URLS_FILE=chargers.json mcl --mcc-select left workflow --new-cells --autocreate
//! ```

use std::error::Error;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mcc_core::charger::ChargerSettings;
use mcc_core::config::resolve_base_url;
use mcc_core::{
    connect, run_workflow, ActionCode, ChargerApi, Infoset, JsonFilesBackend, SessionConfig, Slot, SlotSelection,
    StdinPrompt, WorkflowConfig,
};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Megacell charger control and test workflow
#[derive(Parser, Debug)]
#[command(name = "mcl", author, version, about, long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// URL of the charger API endpoint
    #[arg(long, env = "MCC_BASEURL", global = true)]
    mcc_baseurl: Option<String>,

    /// Select a charger from the urls file
    #[arg(long, value_name = "ID", global = true)]
    mcc_select: Option<String>,

    /// JSON file mapping charger ids to API endpoint URLs
    #[arg(long, env = "MCC_URLS_FILE", global = true)]
    mcc_urls_file: Option<PathBuf>,

    /// Base directory of the json-files cell database
    #[arg(long, env = "CELLDB_DSN", default_value = ".", global = true)]
    backend_dsn: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Charger commands
    Charger {
        /// Print charger settings
        #[arg(long, conflicts_with = "write_settings")]
        read_settings: bool,

        /// Set new charger settings from a JSON file
        #[arg(long, value_name = "@FILE")]
        write_settings: Option<String>,
    },

    /// Slot commands
    Slots {
        #[command(flatten)]
        slots: SlotArgs,

        /// Action to be performed by the charger
        #[arg(long, value_name = "ACTION")]
        action: Option<ActionCode>,

        /// Print current cell data
        #[arg(long)]
        info: bool,
    },

    /// Run the test workflow on the selected slots
    Workflow {
        #[command(flatten)]
        slots: SlotArgs,

        /// Create cell ids that are selected but not found
        #[arg(long)]
        autocreate: bool,

        /// Container path for created cells
        #[arg(long, env = "CELLDB_PATH", default_value = "/")]
        path: String,

        /// Give up on an action after this many seconds
        #[arg(long, value_name = "SECS")]
        wait_timeout: Option<u64>,

        /// Seconds between two polls of the charger
        #[arg(long, value_name = "SECS", default_value = "5")]
        poll_interval: u64,
    },
}

#[derive(Args, Debug)]
struct SlotArgs {
    /// Select slots which contain new cells
    #[arg(long, conflicts_with_all = ["all_slots", "slots"])]
    new_cells: bool,

    /// Select all slots in the charger
    #[arg(long, conflicts_with = "slots")]
    all_slots: bool,

    /// Slots by name (C1..C16)
    slots: Vec<Slot>,
}

impl SlotArgs {
    fn selection(&self) -> SlotSelection {
        if self.all_slots {
            SlotSelection::All
        } else if self.new_cells {
            SlotSelection::New
        } else {
            SlotSelection::Explicit(self.slots.clone())
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let base_url = resolve_base_url(
        cli.mcc_baseurl.as_deref(),
        cli.mcc_select.as_deref(),
        cli.mcc_urls_file.as_deref(),
    )?;
    let session_config = SessionConfig::new(base_url);

    match &cli.command {
        Command::Charger { read_settings, write_settings } => {
            charger(&session_config, *read_settings, write_settings.as_deref())
        }
        Command::Slots { slots, action, info } => slot(&session_config, &slots.selection(), *action, *info),
        Command::Workflow { slots, autocreate, path, wait_timeout, poll_interval } => {
            let mut config = WorkflowConfig::default()
                .with_autocreate(*autocreate)
                .with_path(path.as_str())
                .with_poll_interval(Duration::from_secs(*poll_interval));
            if let Some(selector) = &cli.mcc_select {
                config = config.with_selector(selector.as_str());
            }
            if let Some(secs) = wait_timeout {
                config = config.with_wait_timeout(Duration::from_secs(*secs));
            }
            workflow(&session_config, &config, &cli.backend_dsn, &slots.selection())
        }
    }
}

fn open(config: &SessionConfig) -> Result<Box<dyn ChargerApi>, Box<dyn Error>> {
    match connect(config)? {
        Some(session) => Ok(session),
        None => {
            error!(base_url = %config.base_url, "unsupported charger firmware");
            Err("unsupported charger firmware".into())
        }
    }
}

fn charger(config: &SessionConfig, read: bool, write: Option<&str>) -> Result<(), Box<dyn Error>> {
    let session = open(config)?;

    if read {
        let settings = session.get_charger_settings()?;
        println!("{}", settings.0.to_json());
        return Ok(());
    }

    if let Some(arg) = write {
        let settings = load_settings(arg)?;
        info!("configuring charger");
        if !session.set_charger_settings(&settings)? {
            return Err("charger did not acknowledge the settings".into());
        }
    }

    Ok(())
}

/// `@file.json` → settings document
fn load_settings(arg: &str) -> Result<ChargerSettings, Box<dyn Error>> {
    let Some(filename) = arg.strip_prefix('@') else {
        return Err("argument must be a filename starting with @".into());
    };
    let text = std::fs::read_to_string(filename)?;
    let value: Value = serde_json::from_str(&text)?;
    Ok(ChargerSettings(Infoset::from_value(value)))
}

fn slot(
    config: &SessionConfig,
    selection: &SlotSelection,
    action: Option<ActionCode>,
    print_info: bool,
) -> Result<(), Box<dyn Error>> {
    let session = open(config)?;
    let slots = selection.resolve(session.as_ref())?;
    info!(slots = ?slots, "selected slots");

    if let Some(action) = action {
        if !session.multiple_slots_action(&slots, action)? {
            warn!(action = %action, "action not acknowledged");
        }
    }

    if print_info {
        let snapshot = session.get_cells_info()?;
        let cells: Map<String, Value> = slots
            .iter()
            .map(|slot| (slot.name(), snapshot.cell(*slot).to_infoset().into_value()))
            .collect();
        println!("{}", Value::Object(cells));
    }

    Ok(())
}

fn workflow(
    session_config: &SessionConfig,
    config: &WorkflowConfig,
    dsn: &Path,
    selection: &SlotSelection,
) -> Result<(), Box<dyn Error>> {
    let mut backend = JsonFilesBackend::open(dsn)?;
    let summary = run_workflow(config, session_config, &mut backend, &mut StdinPrompt, selection)?;

    for report in &summary.reports {
        if report.ok() {
            info!(slot = %report.slot, cell_id = %report.cell_id, "workflow passed");
        } else {
            warn!(slot = %report.slot, cell_id = %report.cell_id, "workflow failed");
        }
    }
    info!(cells = summary.reports.len(), failed = summary.failed(), "workflow complete");

    Ok(())
}
