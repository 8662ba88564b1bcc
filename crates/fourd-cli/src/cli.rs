//! Clap CLI definitions for fourd.

use clap::{Parser, Subcommand};
use fourd_types::{CommandPath, SendState};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  fourd serve --port 19300 --name AId          Answer control commands on a port
  fourd send 10.0.0.5:19300 Daemon/Information/Version --to AId
  fourd send 10.0.0.5:19300 AI/Operation/Calibration --to AId --set Mode=fast
  fourd probe 10.0.0.5:19300 CCd               Show process metadata for CCd
  fourd restart CCd                            Restart CCd and reconnect its cameras

\x1b[1;36mConfig:\x1b[0m
  ~/.fourd/config.toml (override with --config)";

/// fourd: control-plane tool for 4D capture daemons.
#[derive(Parser)]
#[command(name = "fourd", version, about = "Control-plane tool for 4D capture daemons", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Listen for control commands until Ctrl-C.
    Serve {
        /// Port to listen on [default: listener.port from config].
        #[arg(long)]
        port: Option<u16>,
        /// Logical daemon id reported by the Version command.
        #[arg(long)]
        name: Option<String>,
    },
    /// Send one envelope and print the reply.
    Send {
        /// Destination as host:port.
        addr: String,
        /// Command path, e.g. Daemon/Information/Version.
        path: CommandPath,
        /// Destination daemon id.
        #[arg(long, default_value = "4DPD")]
        to: String,
        /// request, response or notify. Notify does not wait for a reply.
        #[arg(long, default_value = "request")]
        state: SendState,
        /// Payload entry as key=value; values that parse as JSON are sent as JSON.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
    },
    /// Query a daemon's process status and print one process's snapshot.
    Probe {
        /// Destination as host:port.
        addr: String,
        /// Process name to extract.
        process: String,
        /// Daemon id that answers the status query [default: the process name].
        #[arg(long)]
        to: Option<String>,
    },
    /// Restart a configured daemon and reconnect its dependents.
    Restart {
        /// Daemon id as configured under [daemons.<id>].
        daemon: String,
        /// Also confirm from process metadata that a new process is running.
        #[arg(long)]
        verify: bool,
    },
}
