use crate::dispatch::{
    Dispatcher, DEFAULT_MAX_CONCURRENT_DELIVERIES, DEFAULT_SUBSCRIBER_BACKLOG,
    DEFAULT_SUBSCRIBER_BUDGET,
};
use crate::server::{DEFAULT_MAX_BODY_BYTES, DEFAULT_SHUTDOWN_GRACE};
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 8080;
const IMAGE_DIR_NAME: &str = "tollgate_images";

/// Runtime settings, read once at startup. Every flag can also come from the
/// environment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "lpr-push",
    version,
    about = "Receives push notifications and images from LPR tollgate cameras"
)]
pub struct Config {
    #[arg(long, env = "LPR_PUSH_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED), help = "Address to bind")]
    pub host: IpAddr,
    #[arg(long, env = "LPR_PUSH_PORT", default_value_t = DEFAULT_PORT, help = "Port to bind")]
    pub port: u16,
    #[arg(
        long,
        env = "LPR_PUSH_OUTPUT_DIR",
        default_value_os_t = default_output_dir(),
        help = "Directory received images are written to"
    )]
    pub output_dir: PathBuf,
    #[arg(
        long,
        env = "LPR_PUSH_LOG_LEVEL",
        default_value = "info",
        help = "Log level (error, warn, info, debug, trace)"
    )]
    pub log_level: String,
    #[arg(
        long,
        env = "LPR_PUSH_SHUTDOWN_GRACE_SECS",
        default_value_t = DEFAULT_SHUTDOWN_GRACE.as_secs(),
        help = "Seconds to let in-flight requests finish on shutdown"
    )]
    pub shutdown_grace_secs: u64,
    #[arg(
        long,
        env = "LPR_PUSH_SUBSCRIBER_BUDGET_MS",
        default_value_t = DEFAULT_SUBSCRIBER_BUDGET.as_millis() as u64,
        help = "Milliseconds a subscriber may take before it is reported as slow"
    )]
    pub subscriber_budget_ms: u64,
    #[arg(
        long,
        env = "LPR_PUSH_MAX_SUBSCRIBER_JOBS",
        default_value_t = DEFAULT_MAX_CONCURRENT_DELIVERIES,
        help = "Maximum deliveries running at once for one subscriber"
    )]
    pub max_subscriber_jobs: usize,
    #[arg(
        long,
        env = "LPR_PUSH_SUBSCRIBER_BACKLOG",
        default_value_t = DEFAULT_SUBSCRIBER_BACKLOG,
        help = "Events one subscriber may have outstanding before new ones are dropped for it"
    )]
    pub subscriber_backlog: usize,
    #[arg(
        long,
        env = "LPR_PUSH_MAX_BODY_BYTES",
        default_value_t = DEFAULT_MAX_BODY_BYTES,
        help = "Largest request body read; bigger ones are acknowledged and dropped"
    )]
    pub max_body_bytes: u64,
}

impl Config {
    /// The output directory with a leading `~` expanded.
    pub fn image_dir(&self) -> PathBuf {
        expand_home(&self.output_dir, dirs::home_dir())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(
            Duration::from_millis(self.subscriber_budget_ms),
            self.max_subscriber_jobs,
        )
        .with_backlog(self.subscriber_backlog)
    }
}

fn default_output_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(IMAGE_DIR_NAME)
}

fn expand_home(path: &Path, home: Option<PathBuf>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}
