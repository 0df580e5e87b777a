//! Bridge from the `log` facade into Python's `logging` module.
//!
//! When the crate is loaded as an extension module, driver logs should end
//! up wherever the host application's `logging` configuration sends them.
//! The bridge installs a global [`log::Log`] that forwards each record to
//! `logging.getLogger(target)` with `::` mapped to `.`, so
//! `daqflex_rs::device` shows up as the `daqflex_rs.device` logger.
//!
//! The Rust demo binary does not use this; it configures `env_logger`.

use std::sync::{Mutex, Once};

use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::{PyModule, PyTuple};

static PY_LOG_ONCE: Once = Once::new();
static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

/// Level from `DAQFLEX_LOG` or `RUST_LOG`, defaulting to `info`.
pub fn env_level() -> LevelFilter {
    std::env::var("DAQFLEX_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(|v| v.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info)
}

struct PyLogger {
    top_filter: Mutex<LevelFilter>,
    logging_mod: Py<PyModule>,
}

impl PyLogger {
    fn new(py: Python<'_>, top_filter: LevelFilter) -> PyResult<Self> {
        let logging = py.import("logging")?;
        Ok(Self {
            top_filter: Mutex::new(top_filter),
            logging_mod: logging.into(),
        })
    }

    fn map_level(level: log::Level) -> usize {
        match level {
            log::Level::Error => 40,
            log::Level::Warn => 30,
            log::Level::Info => 20,
            log::Level::Debug => 10,
            log::Level::Trace => 5,
        }
    }

    fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
        let target = record.target().replace("::", ".");
        let logging = self.logging_mod.bind(py);
        let logger = logging.getattr("getLogger")?.call1((&target,))?;
        let level = Self::map_level(record.level());
        if !logger.call_method1("isEnabledFor", (level,))?.is_truthy()? {
            return Ok(());
        }
        let none = py.None();
        let py_record = logger.call_method1(
            "makeRecord",
            (
                &target,
                level,
                record.file(),
                record.line().unwrap_or_default(),
                format!("{}", record.args()),
                PyTuple::empty(py),
                &none,
            ),
        )?;
        logger.call_method1("handle", (py_record,))?;
        Ok(())
    }
}

impl Log for PyLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        let top = *self.top_filter.lock().unwrap_or_else(|e| e.into_inner());
        metadata.level().to_level_filter() <= top
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        Python::attach(|py| {
            if let Err(e) = self.forward(py, record) {
                e.restore(py);
            }
        });
    }

    fn flush(&self) {}
}

/// Install the bridge so Rust logs flow into Python's `logging`.
/// Safe to call repeatedly; the logger is installed on the first call.
pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
    let level = env_level();
    PY_LOG_ONCE.call_once(|| match PyLogger::new(py, level) {
        Ok(logger) => {
            let leaked: &'static PyLogger = Box::leak(Box::new(logger));
            if log::set_logger(leaked).is_ok() {
                log::set_max_level(level);
                let _ = PY_LOGGER.set(leaked);
            }
        }
        Err(e) => e.restore(py),
    });
    Ok(())
}

/// Adjust the bridge's minimum level at runtime (exposed to Python as
/// `set_log_level`). Falls back to the environment level when the string
/// does not parse.
pub fn set_python_log_level(level: Option<&str>) {
    let level = level
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or_else(env_level);
    if let Some(logger) = PY_LOGGER.get() {
        *logger.top_filter.lock().unwrap_or_else(|e| e.into_inner()) = level;
    }
    log::set_max_level(level);
}
