use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub storage_path: String,
    pub db_path: String,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_api_url: String,
    pub google_oauth_url: String,
    // Public address the provider delivers push notifications to
    pub webhook_url: String,
    // Shared secret echoed back by the provider on every notification
    pub channel_token: String,
    pub placeholder_title: String,
    pub pending_grace: Duration,
    // How long an unconfirmed placeholder is searched for before it is abandoned
    pub failed_search_window: Duration,
    pub sync_pass_budget: Duration,
    pub lock_lease: Duration,
    pub provider_timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    pub read_rate_per_sec: f64,
    pub write_rate_per_sec: f64,
    pub subscription_ttl: Duration,
    pub renewal_buffer: Duration,
    pub subscription_failure_threshold: u32,
    pub full_sync_lookback_days: i64,
    pub cache_capacity: usize,
    pub sync_interval: Duration,
    pub poll_interval: Duration,
    pub full_resync_interval: Duration,
    pub maintenance_interval: Duration,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(env_or(key, default))
}

impl Default for AppConfig {
    fn default() -> Self {
        let host = "127.0.0.1";
        let port = "2323";
        let storage_path = env::var("BUSYSYNC_STORAGE_PATH").unwrap_or("./".to_string());
        let db_path = format!("{}/db", storage_path);
        let google_client_id = env::var("BUSYSYNC_GOOGLE_CLIENT_ID").unwrap_or_default();
        let google_client_secret = env::var("BUSYSYNC_GOOGLE_CLIENT_SECRET").unwrap_or_default();
        let google_api_url = env::var("BUSYSYNC_GOOGLE_API_URL")
            .unwrap_or_else(|_| "https://www.googleapis.com".to_string());
        let google_oauth_url = env::var("BUSYSYNC_GOOGLE_OAUTH_URL")
            .unwrap_or_else(|_| "https://oauth2.googleapis.com".to_string());
        let webhook_url = env::var("BUSYSYNC_WEBHOOK_URL")
            .unwrap_or(format!("http://{}:{}/api/webhook/google", host, port));
        let channel_token = env::var("BUSYSYNC_CHANNEL_TOKEN").unwrap_or_default();
        let placeholder_title =
            env::var("BUSYSYNC_PLACEHOLDER_TITLE").unwrap_or_else(|_| "Busy".to_string());

        Self {
            storage_path,
            db_path,
            google_client_id,
            google_client_secret,
            google_api_url,
            google_oauth_url,
            webhook_url,
            channel_token,
            placeholder_title,
            pending_grace: env_secs("BUSYSYNC_PENDING_GRACE_SECS", 15 * 60),
            failed_search_window: env_secs("BUSYSYNC_FAILED_SEARCH_WINDOW_SECS", 24 * 60 * 60),
            sync_pass_budget: env_secs("BUSYSYNC_SYNC_BUDGET_SECS", 120),
            lock_lease: env_secs("BUSYSYNC_LOCK_LEASE_SECS", 180),
            provider_timeout: env_secs("BUSYSYNC_PROVIDER_TIMEOUT_SECS", 10),
            max_retries: env_or("BUSYSYNC_MAX_RETRIES", 4),
            backoff_base: Duration::from_millis(env_or("BUSYSYNC_BACKOFF_BASE_MS", 250)),
            backoff_max: env_secs("BUSYSYNC_BACKOFF_MAX_SECS", 30),
            breaker_failure_threshold: env_or("BUSYSYNC_BREAKER_THRESHOLD", 5),
            breaker_cooldown: env_secs("BUSYSYNC_BREAKER_COOLDOWN_SECS", 60),
            read_rate_per_sec: env_or("BUSYSYNC_READ_RATE", 10.0),
            write_rate_per_sec: env_or("BUSYSYNC_WRITE_RATE", 5.0),
            // Google caps channel lifetime at roughly a week
            subscription_ttl: env_secs("BUSYSYNC_SUBSCRIPTION_TTL_SECS", 7 * 24 * 60 * 60),
            renewal_buffer: env_secs("BUSYSYNC_RENEWAL_BUFFER_SECS", 24 * 60 * 60),
            subscription_failure_threshold: env_or("BUSYSYNC_SUBSCRIPTION_FAILURES", 3),
            full_sync_lookback_days: env_or("BUSYSYNC_LOOKBACK_DAYS", 30),
            cache_capacity: env_or("BUSYSYNC_CACHE_CAPACITY", 10_000),
            sync_interval: env_secs("BUSYSYNC_SYNC_INTERVAL_SECS", 30 * 60),
            poll_interval: env_secs("BUSYSYNC_POLL_INTERVAL_SECS", 2 * 60),
            full_resync_interval: env_secs("BUSYSYNC_FULL_RESYNC_INTERVAL_SECS", 24 * 60 * 60),
            maintenance_interval: env_secs("BUSYSYNC_MAINTENANCE_INTERVAL_SECS", 10 * 60),
        }
    }
}
