// Engine configuration
//
// Loaded from environment variables with defaults; every field has a
// `with_*` builder for tests and embedding.

use std::time::Duration;

use flowgate_durable::RetryPolicy;

/// Workflow engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Re-read and recompute a transition this many times on a revision conflict
    pub conflict_retries: u32,

    /// Run an instance's queued actions right after its commit
    pub inline_dispatch: bool,

    /// How long a call waits for inline dispatch before returning
    pub inline_dispatch_timeout: Duration,

    /// Retry policy for definition actions
    pub action_retry_policy: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            conflict_retries: 5,
            inline_dispatch: true,
            inline_dispatch_timeout: Duration::from_millis(500),
            action_retry_policy: RetryPolicy::exponential(),
        }
    }
}

impl EngineConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `ENGINE_CONFLICT_RETRIES`: conflict retries (default: 5)
    /// - `ENGINE_INLINE_DISPATCH`: "false" disables inline dispatch
    /// - `ENGINE_INLINE_DISPATCH_MS`: inline dispatch wait (default: 500)
    /// - `ACTION_MAX_ATTEMPTS`: attempts per action (default: 5)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(retries) = env_parse::<u32>("ENGINE_CONFLICT_RETRIES") {
            config.conflict_retries = retries;
        }
        if let Ok(value) = std::env::var("ENGINE_INLINE_DISPATCH") {
            config.inline_dispatch = !matches!(value.as_str(), "false" | "0" | "off");
        }
        if let Some(ms) = env_parse::<u64>("ENGINE_INLINE_DISPATCH_MS") {
            config.inline_dispatch_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_parse::<u32>("ACTION_MAX_ATTEMPTS") {
            config.action_retry_policy = config.action_retry_policy.with_max_attempts(attempts);
        }

        config
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_inline_dispatch(mut self, enabled: bool) -> Self {
        self.inline_dispatch = enabled;
        self
    }

    pub fn with_inline_dispatch_timeout(mut self, timeout: Duration) -> Self {
        self.inline_dispatch_timeout = timeout;
        self
    }

    pub fn with_action_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.action_retry_policy = policy;
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.conflict_retries, 5);
        assert!(config.inline_dispatch);
        assert_eq!(config.inline_dispatch_timeout, Duration::from_millis(500));
        assert_eq!(config.action_retry_policy.max_attempts, 5);
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_conflict_retries(0)
            .with_inline_dispatch(false)
            .with_action_retry_policy(RetryPolicy::no_retry());
        assert_eq!(config.conflict_retries, 0);
        assert!(!config.inline_dispatch);
        assert_eq!(config.action_retry_policy.max_attempts, 1);
    }
}
