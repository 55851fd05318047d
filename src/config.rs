use std::env;

/// Tunables for the TSB and ad-insertion core, loaded from environment
/// variables. Every knob has a default suitable for development; hosts
/// override via `DVR_*` variables.
#[derive(Clone, Debug)]
pub struct Config {
    /// Fragment budget across all tracks of a TSB session; the fetch loop
    /// yields when the budget is exhausted
    pub tsb_max_fragments: usize,
    /// Default wait for the next-ad-resolved signal in milliseconds
    pub ad_resolve_timeout_ms: u64,
    /// Per-request timeout for ad manifest downloads in milliseconds
    pub ad_fetch_timeout_ms: u64,
    /// Retries after a failed ad manifest download
    pub ad_fetch_retries: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tsb_max_fragments: 2048,
            ad_resolve_timeout_ms: 8000,
            ad_fetch_timeout_ms: 5000,
            ad_fetch_retries: 1,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            tsb_max_fragments: parse_env("DVR_TSB_MAX_FRAGMENTS", defaults.tsb_max_fragments),
            ad_resolve_timeout_ms: parse_env(
                "DVR_AD_RESOLVE_TIMEOUT_MS",
                defaults.ad_resolve_timeout_ms,
            ),
            ad_fetch_timeout_ms: parse_env("DVR_AD_FETCH_TIMEOUT_MS", defaults.ad_fetch_timeout_ms),
            ad_fetch_retries: parse_env("DVR_AD_FETCH_RETRIES", defaults.ad_fetch_retries),
        }
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tsb_max_fragments, 2048);
        assert_eq!(config.ad_resolve_timeout_ms, 8000);
        assert_eq!(config.ad_fetch_timeout_ms, 5000);
        assert_eq!(config.ad_fetch_retries, 1);
    }

    #[test]
    fn test_env_override() {
        // Env vars are process-global; use a name no other test touches
        unsafe { env::set_var("DVR_TSB_MAX_FRAGMENTS", "64") };
        let config = Config::from_env();
        assert_eq!(config.tsb_max_fragments, 64);
        unsafe { env::remove_var("DVR_TSB_MAX_FRAGMENTS") };
    }

    #[test]
    fn test_unparsable_env_falls_back() {
        unsafe { env::set_var("DVR_AD_FETCH_RETRIES", "not-a-number") };
        let config = Config::from_env();
        assert_eq!(config.ad_fetch_retries, 1);
        unsafe { env::remove_var("DVR_AD_FETCH_RETRIES") };
    }
}
