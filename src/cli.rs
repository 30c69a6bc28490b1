//! Command line interface for the `relink` binary.
//!
//! Flags override individual health settings; anything left unset keeps its
//! library default.

use std::net::SocketAddr;

use clap::Parser;

/// Command line arguments for the `relink` binary.
#[derive(Debug, Parser)]
#[command(
    name = "relink",
    version,
    about = "Connection-health detection and recovery engine"
)]
pub struct Cli {
    /// Length of the error observation window, in seconds.
    #[arg(long, value_name = "SECS")]
    pub window_secs: Option<u64>,

    /// Classified errors within the window that trigger a recovery.
    #[arg(long, value_name = "COUNT")]
    pub error_threshold: Option<u32>,

    /// Recovery attempts per incident before operator escalation.
    #[arg(long, value_name = "COUNT")]
    pub max_attempts: Option<u32>,

    /// Pause after a failed recovery attempt, in seconds.
    #[arg(long, value_name = "SECS")]
    pub cooldown_secs: Option<u64>,

    /// Base interval between health scans, in seconds.
    #[arg(long, value_name = "SECS")]
    pub scan_interval_secs: Option<u64>,

    /// Resend attempts per pending message.
    #[arg(long, value_name = "COUNT")]
    pub retry_max_attempts: Option<u32>,

    /// Gap between resends while draining, in milliseconds.
    #[arg(long, value_name = "MS")]
    pub drain_interval_ms: Option<u64>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,

    /// Run a scripted in-process incident and exit.
    #[arg(long)]
    pub simulate: bool,
}
