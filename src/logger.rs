use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::append::rolling_file::policy::compound::{
    CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
};
use log4rs::config::{Appender, Config, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;

use crate::config::MapperConfig;
use crate::errors::MapperError;

/// Logger target for compiled-query tracing.
pub const QUERY_TARGET: &str = "docmapper::query";

const PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} - {m}{n}";
const ROLL_SIZE: u64 = 10 * 1024 * 1024;

/// Initializes logging from `log4rs.yaml` in the working directory, if present.
pub fn init() -> Result<(), MapperError> {
    let _ = log4rs::init_file("log4rs.yaml", log4rs::config::Deserializers::default());
    Ok(())
}

/// Initializes logging from a specific log4rs config file.
///
/// # Errors
/// Returns `Config` when the file cannot be loaded.
pub fn init_path(path: &Path) -> Result<(), MapperError> {
    log4rs::init_file(path, log4rs::config::Deserializers::default())
        .map_err(|e| MapperError::Config(format!("log config {}: {e}", path.display())))
}

#[must_use]
pub fn parse_level(level: Option<&str>) -> LevelFilter {
    match level.unwrap_or("info").to_ascii_lowercase().as_str() {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

fn rolling(base: &Path, name: &str, keep: u32) -> Result<RollingFileAppender, MapperError> {
    let pattern = format!("{}", base.join(format!("{name}.{{}}.log")).display());
    let roller = FixedWindowRoller::builder()
        .build(&pattern, keep)
        .map_err(|e| MapperError::Config(format!("log roller: {e}")))?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(ROLL_SIZE)), Box::new(roller));
    Ok(RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(PATTERN)))
        .build(base.join(format!("{name}.log")), Box::new(policy))?)
}

/// Builds the rolling-file configuration: `docmapper.log` for everything and
/// `query.log` for the query-compilation target.
///
/// # Errors
/// Returns an error if the directory or the log files cannot be created.
pub fn build_config(dir: Option<&Path>, level: Option<&str>, retention: Option<u32>) -> Result<Config, MapperError> {
    let base = match dir {
        Some(d) => d.to_path_buf(),
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    std::fs::create_dir_all(&base)?;
    let keep = retention.unwrap_or(7);
    let lvl = parse_level(level);
    Config::builder()
        .appender(Appender::builder().build("app", Box::new(rolling(&base, "docmapper", keep)?)))
        .appender(Appender::builder().build("query", Box::new(rolling(&base, "query", keep)?)))
        .logger(Logger::builder().appender("query").additive(false).build(QUERY_TARGET, lvl))
        .build(Root::builder().appender("app").build(lvl))
        .map_err(|e| MapperError::Config(format!("log config: {e}")))
}

/// Configures process-wide logging. A logger that is already installed is kept.
///
/// # Errors
/// Returns an error if the configuration cannot be built.
pub fn configure_logging(dir: Option<&Path>, level: Option<&str>, retention: Option<u32>) -> Result<(), MapperError> {
    let config = build_config(dir, level, retention)?;
    let _ = log4rs::init_config(config);
    Ok(())
}

/// Configures logging from the logging fields of a [`MapperConfig`].
///
/// # Errors
/// See [`configure_logging`].
pub fn configure_from_config(cfg: &MapperConfig) -> Result<(), MapperError> {
    configure_logging(cfg.log_dir.as_deref(), Some(&cfg.log_level), Some(cfg.log_retention))
}

/// Configures logging from environment variables if present:
/// - DOCMAPPER_LOG_DIR
/// - DOCMAPPER_LOG_LEVEL
/// - DOCMAPPER_LOG_RETENTION
///
/// # Errors
/// See [`configure_logging`].
pub fn configure_from_env() -> Result<(), MapperError> {
    let dir = std::env::var("DOCMAPPER_LOG_DIR").ok().map(PathBuf::from);
    let level = std::env::var("DOCMAPPER_LOG_LEVEL").ok();
    let retention = std::env::var("DOCMAPPER_LOG_RETENTION").ok().and_then(|s| s.parse::<u32>().ok());
    configure_logging(dir.as_deref(), level.as_deref(), retention)
}
