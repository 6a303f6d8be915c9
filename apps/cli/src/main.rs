//! automountd - Auto-mount daemon for removable devices.
//!
//! Every setting can be given as a flag or as an environment variable of the
//! same name in upper snake case (e.g. `--watch-dev-dir` / `WATCH_DEV_DIR`).

mod daemon;

use std::path::PathBuf;
use std::time::Duration;

use automount_core::channel::{HttpConfig, RedisConfig};
use automount_core::config::{DEFAULT_BLKID_PATH, DEFAULT_WATCH_DIR};
use automount_core::fstype::FsOverrides;
use automount_core::{Result, Settings};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Auto-mount daemon.
#[derive(Parser, Debug)]
#[command(name = "automountd")]
#[command(version, about = "Mounts removable devices as they appear", long_about = None)]
struct Args {
    /// Directory under which each device gets its own mount directory
    #[arg(long, env = "MOUNTPOINTS_BASE_DIR")]
    mountpoints_base_dir: PathBuf,

    /// Directory whose entries represent connected devices
    #[arg(long, env = "WATCH_DEV_DIR", default_value = DEFAULT_WATCH_DIR)]
    watch_dev_dir: PathBuf,

    /// Comma-separated globs a device name must match to be auto-mounted
    #[arg(long, env = "FILTER_ALLOW", value_delimiter = ',')]
    filter_allow: Vec<String>,

    /// Comma-separated globs excluding device names from auto-mounting
    #[arg(long, env = "FILTER_BLOCK", value_delimiter = ',')]
    filter_block: Vec<String>,

    /// Comma-separated `detected=override` filesystem type pairs
    #[arg(long, env = "FILESYSTEM_TYPES_OVERRIDES", value_delimiter = ',')]
    filesystem_types_overrides: Vec<String>,

    /// Mount every filtered device present at startup
    #[arg(long, env = "AUTOMOUNT_AT_START", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    automount_at_start: bool,

    /// Unmount every managed device on exit
    #[arg(long, env = "UNMOUNT_AT_EXIT", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    unmount_at_exit: bool,

    /// Remove mount directories after a successful unmount
    #[arg(long, env = "REMOVE_MOUNTDIRS_AFTER_UNMOUNT", default_value_t = true, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    remove_mountdirs_after_unmount: bool,

    /// Filesystem detection tool
    #[arg(long, env = "BLKID_PATH", default_value = DEFAULT_BLKID_PATH)]
    blkid_path: String,

    /// Poll the watched directory instead of using inotify
    #[arg(long, env = "WATCH_POLLING", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    watch_polling: bool,

    /// Polling interval in milliseconds
    #[arg(long, env = "WATCH_POLL_INTERVAL_MS", default_value_t = 1000)]
    watch_poll_interval_ms: u64,

    /// Redis host; enables the pub/sub channel
    #[arg(long, env = "REDIS_HOST")]
    redis_host: Option<String>,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    redis_port: u16,

    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    #[arg(long, env = "REDIS_DB", default_value_t = 0)]
    redis_db: i64,

    /// Topic commands are received from
    #[arg(long, env = "REDIS_TOPIC_COMMANDS", default_value = "mountagne/cmd")]
    redis_topic_commands: String,

    /// Topic the managed device set is published to
    #[arg(long, env = "REDIS_TOPIC_STATUS")]
    redis_topic_status: Option<String>,

    /// Enable the HTTP channel
    #[arg(long, env = "HTTP_ENABLED", default_value_t = false, action = ArgAction::Set, value_parser = BoolishValueParser::new())]
    http_enabled: bool,

    #[arg(long, env = "HTTP_HOST", default_value = "0.0.0.0")]
    http_host: String,

    #[arg(long, env = "HTTP_PORT", default_value_t = 8000)]
    http_port: u16,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Drops empty items left by empty variables or trailing commas.
fn non_empty(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

impl Args {
    fn into_settings(self) -> Result<Settings> {
        let mut settings = Settings::new(self.mountpoints_base_dir);
        settings.watch_dev_dir = self.watch_dev_dir;
        settings.filter_allow = non_empty(self.filter_allow);
        settings.filter_block = non_empty(self.filter_block);
        settings.filesystem_types_overrides =
            FsOverrides::parse(&non_empty(self.filesystem_types_overrides))?;
        settings.automount_at_start = self.automount_at_start;
        settings.unmount_at_exit = self.unmount_at_exit;
        settings.remove_mountdirs_after_unmount = self.remove_mountdirs_after_unmount;
        settings.blkid_path = self.blkid_path;
        settings.watch_polling = self.watch_polling;
        settings.watch_poll_interval = Duration::from_millis(self.watch_poll_interval_ms);

        settings.redis = self
            .redis_host
            .filter(|host| !host.is_empty())
            .map(|host| RedisConfig {
                port: self.redis_port,
                password: self.redis_password.filter(|p| !p.is_empty()),
                db: self.redis_db,
                topic_commands: Some(self.redis_topic_commands).filter(|t| !t.is_empty()),
                topic_status: self.redis_topic_status.filter(|t| !t.is_empty()),
                ..RedisConfig::new(host)
            });

        if self.http_enabled {
            settings.http = Some(HttpConfig {
                host: self.http_host,
                port: self.http_port,
            });
        }

        Ok(settings)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);

    let result = args.into_settings().and_then(daemon::run);
    if let Err(e) = result {
        error!(kind = e.kind(), error = %e, "daemon error");
        std::process::exit(1);
    }
}
