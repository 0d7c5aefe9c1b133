use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
pub struct CliOpt {
    /// Path to the JSON file describing the relay, its interfaces, its contexts and the traffic
    #[arg(long)]
    pub config: PathBuf,

    /// The duration of the run, after which traffic stops and every context is shut down
    #[arg(long, default_value_t = 5_000)]
    pub duration_ms: u64,

    /// Whether the run should be non-deterministic, i.e. using a non-constant seed for the random
    /// number generators
    #[arg(long)]
    pub non_deterministic: bool,

    /// The random seed used for traffic generation (frame contents, probe latencies)
    #[arg(long, default_value_t = 42)]
    pub traffic_rng_seed: u64,

    /// Send telemetry records as UDP datagrams to this address instead of printing them
    #[arg(long)]
    pub telemetry_udp: Option<SocketAddr>,

    /// Discard telemetry records altogether
    #[arg(long, conflicts_with = "telemetry_udp")]
    pub no_telemetry: bool,

    /// Directory where a pcapng capture of every interface's transmitted frames is written
    #[arg(long)]
    pub capture_dir: Option<PathBuf>,

    /// Measure intervals with the time stamp counter instead of the monotonic clock (x86_64 only)
    #[arg(long)]
    pub tsc_clock: bool,
}
