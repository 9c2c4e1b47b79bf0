use std::path::PathBuf;

use clap::Parser;

/// Score a candidate's frames and stream proctor events to a collector.
#[derive(Parser, Debug)]
#[command(name = "proctor", version, about)]
pub struct Cli {
    /// Session the events are reported under
    #[arg(long)]
    pub session_id: String,

    /// Collector base URL, e.g. http://localhost:5000
    #[arg(long)]
    pub server_url: String,

    /// Connect, emit a test_connection event, disconnect and exit
    #[arg(long)]
    pub test: bool,

    /// Terminate at the strict threshold (5) instead of the default (10)
    #[arg(long)]
    pub strict: bool,

    /// Recorded frames to replay (JSON lines); "-" reads stdin
    #[arg(long, default_value = "-")]
    pub frames: String,

    /// Socket.IO namespace events are sent on
    #[arg(long, default_value = "/proctor")]
    pub namespace: String,

    /// TOML file with [policy] and [reconnect] overrides
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Minimum spacing between replayed frames in milliseconds
    #[arg(long)]
    pub frame_interval_ms: Option<u64>,
}
