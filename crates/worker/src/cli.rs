use clap::Parser;

pub fn default_max_concurrent() -> u16 {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(32) as u16
}

#[derive(Debug, Clone, Parser)]
#[command(name = "drover", version, about = "Drover worker node agent")]
pub struct Cli {
    /// Master base URL.
    #[arg(long, env = "DROVER_MASTER_URL", default_value = "http://127.0.0.1:8700")]
    pub master_url: String,

    /// Node identity; defaults to the machine code when empty.
    #[arg(long, env = "DROVER_NODE_ID", default_value = "")]
    pub node_id: String,

    /// API key presented to the Master.
    #[arg(long, env = "DROVER_API_KEY", default_value = "")]
    pub api_key: String,

    /// HMAC secret for signed request/response traffic.
    #[arg(long, env = "DROVER_SECRET_KEY")]
    pub secret_key: Option<String>,

    /// Port of the Master's streaming listener.
    #[arg(long, env = "DROVER_STREAM_PORT", default_value_t = 8701)]
    pub stream_port: u16,

    /// Skip the streaming driver and use request/response only.
    #[arg(long, env = "DROVER_NO_STREAM", default_value_t = false)]
    pub no_stream: bool,

    /// Number of tasks to run concurrently.
    #[arg(
        short = 'p',
        long,
        env = "DROVER_MAX_CONCURRENT",
        default_value_t = default_max_concurrent(),
        value_parser = clap::value_parser!(u16).range(1..=256)
    )]
    pub max_concurrent: u16,

    /// Node heartbeat cadence in seconds.
    #[arg(long, env = "DROVER_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval: u64,

    /// First reconnect delay in seconds.
    #[arg(long, env = "DROVER_RECONNECT_BASE_DELAY", default_value_t = 5)]
    pub reconnect_base_delay: u64,

    /// Reconnect delay cap in seconds.
    #[arg(long, env = "DROVER_RECONNECT_MAX_DELAY", default_value_t = 60)]
    pub reconnect_max_delay: u64,

    /// Persist the pending queue to this file across restarts.
    #[arg(long, env = "DROVER_PERSIST_QUEUE")]
    pub persist_queue: Option<std::path::PathBuf>,

    /// Default per-task wall-clock budget in seconds.
    #[arg(long, env = "DROVER_TASK_TIMEOUT", default_value_t = 3600)]
    pub task_timeout: u64,

    /// Per-task memory cap in MiB (0 = unlimited).
    #[arg(long, env = "DROVER_MEMORY_LIMIT_MB", default_value_t = 0)]
    pub memory_limit_mb: u64,

    /// Per-task CPU-time cap in seconds (0 = unlimited).
    #[arg(long, env = "DROVER_CPU_LIMIT_SECS", default_value_t = 0)]
    pub cpu_limit_secs: u64,

    /// Screen project sources for denylisted calls before spawning.
    #[arg(long, env = "DROVER_SCAN_SOURCES", default_value_t = false)]
    pub scan_sources: bool,

    /// Screen project archives for zip-bomb signals before spawning.
    #[arg(long, env = "DROVER_SCAN_ARCHIVES", default_value_t = false)]
    pub scan_archives: bool,

    /// Give each run a scoped temp directory as HOME/TMPDIR.
    #[arg(long, env = "DROVER_SCOPED_TMP", default_value_t = false)]
    pub scoped_tmp: bool,

    /// Grace period for in-flight runs on shutdown, in seconds.
    #[arg(long, env = "DROVER_STOP_GRACE", default_value_t = 30)]
    pub stop_grace: u64,
}
