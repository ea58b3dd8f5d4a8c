//! Bridges the caller-supplied `log_fn` passed to `start_server` into the
//! `log` facade every module in this crate logs through, `log::{error,
//! warn, info, debug, trace}`, exactly as `virtiofsd` and `vhost-device`'s
//! scsi backend do. No `env_logger`/`fern` dependency is pulled in here;
//! the caller's callback *is* the logging backend.

use std::sync::OnceLock;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::error::Error;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Forwards every `log::Record` at or above the configured level to a
/// caller-supplied closure.
struct CallbackLogger {
    callback: Box<dyn Fn(Level, &str) + Send + Sync>,
}

impl Log for CallbackLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        (self.callback)(record.level(), &format!("{}", record.args()));
    }

    fn flush(&self) {}
}

/// Installs `log_fn` as the process-wide `log` backend. May only be
/// called once per process (mirrors the reference server's single
/// global logging context); a second call returns an error rather than
/// silently replacing the first caller's logger.
pub fn install(log_fn: Box<dyn Fn(Level, &str) + Send + Sync>) -> Result<(), Error> {
    if INSTALLED.set(()).is_err() {
        return Err(Error::InvalidConfig("logger already installed".into()));
    }
    log::set_boxed_logger(Box::new(CallbackLogger { callback: log_fn }))
        .map_err(|e| Error::InvalidConfig(e.to_string()))?;
    log::set_max_level(LevelFilter::Trace);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callback_logger_formats_records() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let logger = CallbackLogger {
            callback: Box::new(move |level, msg| seen2.lock().unwrap().push((level, msg.to_string()))),
        };
        logger.log(
            &Record::builder()
                .level(Level::Warn)
                .args(format_args!("queue broken"))
                .build(),
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, Level::Warn);
        assert_eq!(seen[0].1, "queue broken");
    }
}
