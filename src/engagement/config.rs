use std::env;
use std::time::Duration;

/// Largest page the provider's list endpoint accepts.
pub const MAX_PAGE_SIZE: usize = 100;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_duration_millis(key: &str, default_millis: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or_else(|| Duration::from_millis(default_millis))
}

fn env_duration_secs(key: &str, default_secs: u64) -> Duration {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(default_secs))
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Connection settings for the transactional-email provider.
#[derive(Debug, Clone)]
pub struct ResendConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

impl ResendConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: env_string("RESEND_API_URL", "https://api.resend.com"),
            api_key: env::var("RESEND_API_KEY")
                .ok()
                .filter(|key| !key.trim().is_empty()),
            request_timeout: env_duration_millis("RESEND_TIMEOUT_MS", 30_000),
        }
    }
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Tuning for a single engagement sync run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Events requested per provider page.
    pub page_size: usize,
    /// Hard stop on pages fetched per run.
    pub max_pages: usize,
    /// Writes per store transaction; clamped to the store's own ceiling.
    pub batch_size: usize,
    /// Delay between scheduled runs. Zero disables the scheduler.
    pub interval: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            page_size: env_usize("ENGAGEMENT_PAGE_SIZE", MAX_PAGE_SIZE),
            max_pages: env_usize("ENGAGEMENT_MAX_PAGES", 20),
            batch_size: env_usize("ENGAGEMENT_BATCH_SIZE", 500),
            interval: env_duration_secs("ENGAGEMENT_SYNC_INTERVAL_SECS", 6 * 60 * 60),
        }
        .normalized()
    }

    /// Force every knob into a usable range.
    pub fn normalized(mut self) -> Self {
        self.page_size = self.page_size.clamp(1, MAX_PAGE_SIZE);
        self.max_pages = self.max_pages.max(1);
        self.batch_size = self.batch_size.max(1);
        self
    }

    pub fn scheduler_enabled(&self) -> bool {
        !self.interval.is_zero()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Per-transaction operation ceiling enforced by the subscriber store.
pub fn store_max_transaction_ops() -> usize {
    env_usize("STORE_MAX_TRANSACTION_OPS", 500).max(1)
}
