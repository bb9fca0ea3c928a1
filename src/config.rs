//! Pipeline configuration: builder defaults plus environment overrides.

use std::env;
use std::time::Duration;

use log::warn;

use crate::dispatch::DEFAULT_FLUSH_INTERVAL;

/// Default truncation width for debug-hook payload previews.
pub const DEFAULT_PREVIEW_CHARS: usize = 120;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Batch flush cadence.
    pub flush_interval: Duration,
    /// Enables the wildcard debug subscriber.
    pub debug_log: bool,
    /// Truncation width for debug payload previews.
    pub preview_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            debug_log: false,
            preview_chars: DEFAULT_PREVIEW_CHARS,
        }
    }
}

impl PipelineConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `STREAM_LOOM_FLUSH_MS`, `STREAM_LOOM_DEBUG`,
    /// and `STREAM_LOOM_PREVIEW_CHARS`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(flush_ms) = env_u64_opt("STREAM_LOOM_FLUSH_MS") {
            if flush_ms == 0 {
                warn!("STREAM_LOOM_FLUSH_MS=0 is invalid; keeping the default cadence");
            } else {
                config.flush_interval = Duration::from_millis(flush_ms);
            }
        }
        if env_flag("STREAM_LOOM_DEBUG") {
            config.debug_log = true;
        }
        if let Some(chars) = env_u64_opt("STREAM_LOOM_PREVIEW_CHARS") {
            config.preview_chars = chars as usize;
        }

        config
    }

    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    #[must_use]
    pub fn with_debug_log(mut self, enabled: bool) -> Self {
        self.debug_log = enabled;
        self
    }

    #[must_use]
    pub fn with_preview_chars(mut self, chars: usize) -> Self {
        self.preview_chars = chars;
        self
    }
}

fn env_flag(key: &str) -> bool {
    env::var(key).map(|value| value == "1").unwrap_or(false)
}

fn env_u64_opt(key: &str) -> Option<u64> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("ignoring non-numeric {key}='{value}'");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::sync::{Mutex, MutexGuard, OnceLock};
    use std::time::Duration;

    use super::PipelineConfig;

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.previous {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }

    fn set_env_guard(key: &'static str, value: Option<&str>) -> EnvGuard {
        let previous = env::var(key).ok();
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
        EnvGuard { key, previous }
    }

    #[test]
    fn defaults_match_the_redraw_budget() {
        let _lock = env_lock();
        let _g1 = set_env_guard("STREAM_LOOM_FLUSH_MS", None);
        let _g2 = set_env_guard("STREAM_LOOM_DEBUG", None);
        let _g3 = set_env_guard("STREAM_LOOM_PREVIEW_CHARS", None);

        let config = PipelineConfig::from_env();
        assert_eq!(config.flush_interval, Duration::from_millis(16));
        assert!(!config.debug_log);
        assert_eq!(config.preview_chars, 120);
    }

    #[test]
    fn env_overrides_apply() {
        let _lock = env_lock();
        let _g1 = set_env_guard("STREAM_LOOM_FLUSH_MS", Some("33"));
        let _g2 = set_env_guard("STREAM_LOOM_DEBUG", Some("1"));
        let _g3 = set_env_guard("STREAM_LOOM_PREVIEW_CHARS", Some("40"));

        let config = PipelineConfig::from_env();
        assert_eq!(config.flush_interval, Duration::from_millis(33));
        assert!(config.debug_log);
        assert_eq!(config.preview_chars, 40);
    }

    #[test]
    fn invalid_flush_interval_keeps_the_default() {
        let _lock = env_lock();
        let _g1 = set_env_guard("STREAM_LOOM_FLUSH_MS", Some("0"));
        let _g2 = set_env_guard("STREAM_LOOM_DEBUG", None);
        let _g3 = set_env_guard("STREAM_LOOM_PREVIEW_CHARS", None);

        let config = PipelineConfig::from_env();
        assert_eq!(config.flush_interval, Duration::from_millis(16));

        let _g4 = set_env_guard("STREAM_LOOM_FLUSH_MS", Some("not-a-number"));
        let config = PipelineConfig::from_env();
        assert_eq!(config.flush_interval, Duration::from_millis(16));
    }

    #[test]
    fn builder_methods_override_defaults() {
        let config = PipelineConfig::new()
            .with_flush_interval(Duration::from_millis(8))
            .with_debug_log(true)
            .with_preview_chars(64);

        assert_eq!(config.flush_interval, Duration::from_millis(8));
        assert!(config.debug_log);
        assert_eq!(config.preview_chars, 64);
    }
}
