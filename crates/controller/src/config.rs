use kiln_core::{env_or, EnvError};
use serde::Serialize;

use crate::{parse_bounds, Bound, ConfigError, RetryPolicy, RetryPolicyBuilder, TokenBucket};

/// Controller knobs, read once from `KILN_*` variables.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerConfig {
    pub workers: usize,
    pub retry_qps: f64,
    pub retry_burst: u32,
    pub retry_bounds: Vec<Bound>,
    /// Start with the controller plug closed.
    pub paused: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { workers: 1, retry_qps: 1.0, retry_burst: 10, retry_bounds: vec![Bound::Count(60)], paused: false }
    }
}

impl ControllerConfig {
    /// Defaults overridden by `KILN_WORKERS`, `KILN_RETRY_QPS`,
    /// `KILN_RETRY_BURST`, `KILN_RETRY_POLICY` and `KILN_PAUSE_CONTROLLERS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();
        let workers = env_or("KILN_WORKERS", d.workers)?;
        if workers == 0 {
            return Err(EnvError { var: "KILN_WORKERS", value: "0".into() }.into());
        }
        let retry_qps = env_or("KILN_RETRY_QPS", d.retry_qps)?;
        let retry_burst = env_or("KILN_RETRY_BURST", d.retry_burst)?;
        let retry_bounds = match std::env::var("KILN_RETRY_POLICY") {
            Ok(raw) => parse_bounds(&raw)?,
            Err(_) => d.retry_bounds,
        };
        let paused = env_or("KILN_PAUSE_CONTROLLERS", d.paused)?;
        Ok(Self { workers, retry_qps, retry_burst, retry_bounds, paused })
    }

    pub fn limiter(&self) -> Result<TokenBucket, ConfigError> {
        TokenBucket::new(self.retry_qps, self.retry_burst)
    }

    /// Policy builder preloaded with the configured bounds; callers add the
    /// fatal classifier and give-up action their domain needs.
    pub fn policy<T>(&self) -> RetryPolicyBuilder<T> {
        RetryPolicy::builder().bounds(self.retry_bounds.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ControllerConfig::default();
        assert_eq!(c.workers, 1);
        assert_eq!(c.retry_burst, 10);
        assert_eq!(c.retry_bounds, vec![Bound::Count(60)]);
        assert!(!c.paused);
        assert!(c.limiter().is_ok());
        assert!(c.policy::<()>().build().is_ok());
    }

    #[test]
    fn serializes_bounds_in_env_syntax() {
        let c = ControllerConfig { retry_bounds: vec![Bound::Count(3), Bound::Never], ..ControllerConfig::default() };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["retry_bounds"], serde_json::json!(["count=3", "never"]));
    }
}
