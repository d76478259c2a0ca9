//! Shared infrastructure for the CTP7 RPC modules
//!
//! * logging setup with our format
//! * service settings (toml)
//! * the keyed RPC message and the module registry
//! * thread control for the service loop
//! * hardware constants of the GE1/1 system
//!
pub mod constants;
pub mod settings;
pub mod rpc;
pub mod thread_control;

pub use settings::Ctp7Settings;
pub use rpc::{
    RpcMessage,
    RpcError,
    ModuleManager,
};

#[macro_use] extern crate log;
extern crate env_logger;

use std::fs;
use std::io::Write;

use colored::{
    Colorize,
    ColoredString
};

use log::Level;

use crate::constants::{
    LOG_CONFIG_ENV,
    DEFAULT_LOG_FILTER,
};

/// Make sure that the loglevel is in color, even though not using pretty_env logger
pub fn color_log(level : &Level) -> ColoredString {
  match level {
    Level::Error    => String::from(" ERROR!").red(),
    Level::Warn     => String::from(" WARN  ").yellow(),
    Level::Info     => String::from(" Info  ").green(),
    Level::Debug    => String::from(" debug ").blue(),
    Level::Trace    => String::from(" trace ").cyan(),
  }
}

/// Get the log filter from an external configuration
/// file, if any.
///
/// The file is designated by the CTP7_LOG_CONFIG
/// environment variable. The first line which is
/// neither empty nor a comment ('#') is the filter
/// string, e.g. "info,ctp7_modules::memhub=debug"
pub fn log_filter_from_config() -> Option<String> {
  let path = std::env::var(LOG_CONFIG_ENV).ok()?;
  match fs::read_to_string(&path) {
    Err(err) => {
      eprintln!("Unable to read log config {}! {} Using embedded default.", path, err);
      None
    }
    Ok(content) => {
      content.lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
    }
  }
}

/// Set up the environmental (env) logger
/// with our format
///
/// Ensure that the lines and module paths
/// are printed in the logging output.
/// The filter is taken from the file given by
/// CTP7_LOG_CONFIG, then RUST_LOG, then the
/// embedded default
pub fn init_env_logger() {
  let mut builder = env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or(DEFAULT_LOG_FILTER));
  if let Some(filter) = log_filter_from_config() {
    builder.parse_filters(&filter);
  }
  builder.format(|buf, record| {
    writeln!( buf, "[{level}][{module_path}:{line}] {args}",
      level = color_log(&record.level()),
      module_path = record.module_path().unwrap_or("<unknown>"),
      line = record.line().unwrap_or(0),
      args = record.args()
      )
    }).init();
  debug!("Logger initialized");
}
