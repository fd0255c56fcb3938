pub mod logger;

use std::time::{SystemTime, UNIX_EPOCH};

use hiro_system_kit::slog::Logger;

/// Logging handle threaded through every component. `display_internals`
/// mirrors the `logs.indexer_internals` switch: per-pin decode chatter is
/// gated on it, the operational log is not.
#[derive(Clone)]
pub struct Context {
    pub logger: Option<Logger>,
    pub display_internals: bool,
}

impl Context {
    pub fn empty() -> Context {
        Context {
            logger: None,
            display_internals: false,
        }
    }

    pub fn with_logger(logger: Logger) -> Context {
        Context {
            logger: Some(logger),
            display_internals: true,
        }
    }

    pub fn try_log<F>(&self, closure: F)
    where
        F: FnOnce(&Logger),
    {
        if let Some(ref logger) = self.logger {
            closure(logger)
        }
    }

    /// Like [`try_log`](Context::try_log), but silenced when internals
    /// logging is switched off.
    pub fn try_log_internals<F>(&self, closure: F)
    where
        F: FnOnce(&Logger),
    {
        if self.display_internals {
            self.try_log(closure)
        }
    }

    pub fn expect_logger(&self) -> &Logger {
        self.logger.as_ref().expect("logger not instantiated")
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock set before unix epoch")
        .as_millis() as i64
}

/// Timestamps inscribed on chain come in both second and millisecond
/// precision; everything persisted is millisecond precision.
pub fn ensure_millisecond_timestamp(timestamp: i64) -> i64 {
    if timestamp < 10_000_000_000 {
        timestamp * 1000
    } else {
        timestamp
    }
}

#[cfg(test)]
mod test {
    use super::ensure_millisecond_timestamp;

    #[test]
    fn second_precision_timestamps_are_scaled() {
        assert_eq!(
            ensure_millisecond_timestamp(1_700_000_000),
            1_700_000_000_000
        );
    }

    #[test]
    fn millisecond_precision_timestamps_are_untouched() {
        assert_eq!(
            ensure_millisecond_timestamp(1_700_000_000_123),
            1_700_000_000_123
        );
    }

    #[test]
    fn zero_remains_zero() {
        assert_eq!(ensure_millisecond_timestamp(0), 0);
    }
}
