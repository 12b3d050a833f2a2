//! Logging backend built on the standard `log` crate
//!
//! Records go to stderr, and additionally to an append file when one is
//! configured. Configure once at startup, then use the standard macros
//! (`info!`, `warn!`, ...) anywhere.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::{Mutex, Once};

use anyhow::Result;
use chrono::Local;
use log::LevelFilter;

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// Initialize the logger. Safe to call more than once; only the first call
/// takes effect.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_internal(config);
    });
    result
}

fn init_internal(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level);
    let file = match &config.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            Some(Mutex::new(file))
        }
        None => None,
    };
    log::set_boxed_logger(Box::new(FrontendLogger { level, file }))?;
    log::set_max_level(level);
    Ok(())
}

fn parse_level(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}

struct FrontendLogger {
    level: LevelFilter,
    file: Option<Mutex<File>>,
}

impl log::Log for FrontendLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!(
            "[{}] {:5} {} {}",
            Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            record.level(),
            record.target(),
            record.args()
        );
        eprintln!("{}", line);
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", line);
            }
        }
    }

    fn flush(&self) {
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = f.flush();
            }
        }
    }
}
