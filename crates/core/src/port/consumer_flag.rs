// Consumer Flag Port
// Process-wide switch deciding whether queue listeners are started at all

use std::sync::atomic::{AtomicBool, Ordering};

/// Default environment variable holding the consumer switch
pub const ENABLE_CONSUMERS_ENV: &str = "BURROW_ENABLE_CONSUMERS";

/// Consumer switch interface (evaluated on every lifecycle call, never cached)
pub trait ConsumerFlag: Send + Sync {
    fn consumers_enabled(&self) -> bool;
}

/// Reads the switch from the environment on every call
///
/// Only a case-insensitive `true` enables consumers; unset or anything else
/// disables them.
#[derive(Debug, Clone)]
pub struct EnvConsumerFlag {
    var: String,
}

impl EnvConsumerFlag {
    pub fn new() -> Self {
        Self::with_var(ENABLE_CONSUMERS_ENV)
    }

    pub fn with_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }

    pub fn var(&self) -> &str {
        &self.var
    }
}

impl Default for EnvConsumerFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerFlag for EnvConsumerFlag {
    fn consumers_enabled(&self) -> bool {
        parse_flag(std::env::var(&self.var).ok().as_deref())
    }
}

/// Boolean parsing shared with configuration loading
pub fn parse_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// In-memory switch (tests, embedding applications)
#[derive(Debug, Default)]
pub struct StaticConsumerFlag {
    enabled: AtomicBool,
}

impl StaticConsumerFlag {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl ConsumerFlag for StaticConsumerFlag {
    fn consumers_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some("TRUE")));
        assert!(parse_flag(Some(" True ")));
        assert!(!parse_flag(Some("false")));
        assert!(!parse_flag(Some("1")));
        assert!(!parse_flag(Some("")));
        assert!(!parse_flag(None));
    }

    #[test]
    fn test_env_flag_is_read_on_every_call() {
        // Unique variable name so parallel tests never collide
        let flag = EnvConsumerFlag::with_var("BURROW_TEST_FLAG_RELOAD");
        std::env::remove_var(flag.var());
        assert!(!flag.consumers_enabled());

        std::env::set_var(flag.var(), "true");
        assert!(flag.consumers_enabled());

        std::env::set_var(flag.var(), "false");
        assert!(!flag.consumers_enabled());

        std::env::remove_var(flag.var());
    }

    #[test]
    fn test_static_flag_toggle() {
        let flag = StaticConsumerFlag::new(false);
        assert!(!flag.consumers_enabled());
        flag.set(true);
        assert!(flag.consumers_enabled());
    }
}
