use crate::retry::RetryPolicy;
use clap::Args as ClapArgs;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "https://graph.facebook.com";
const DEFAULT_API_VERSION: &str = "v15.0";
const WAREHOUSE_DIR: &str = "./warehouse";

#[derive(ClapArgs, Clone, Debug)]
pub struct Config {
    #[arg(long, default_value = DEFAULT_API_URL, env = "API_URL")]
    pub(crate) api_url: String,

    #[arg(long, default_value = DEFAULT_API_VERSION, env = "API_VERSION")]
    pub(crate) api_version: String,

    #[arg(long, env = "ACCESS_TOKEN", hide_env_values = true)]
    pub(crate) access_token: Option<String>,

    #[arg(long, env = "ACCESS_TOKEN_FILE")]
    pub(crate) access_token_file: Option<PathBuf>,

    #[arg(long, default_value = WAREHOUSE_DIR, env = "WAREHOUSE_DIR")]
    pub(crate) warehouse_dir: String,

    /// Delay between two status checks of a running report
    #[arg(long, default_value_t = 5, env = "POLL_INTERVAL_SECS")]
    pub(crate) poll_interval_secs: u64,

    /// Give up on a single report job after this long
    #[arg(long, default_value_t = 3600, env = "MAX_POLL_SECS")]
    pub(crate) max_poll_secs: u64,

    /// Total report jobs created per invocation before failing
    #[arg(long, default_value_t = 5, env = "MAX_JOB_ATTEMPTS")]
    pub(crate) max_job_attempts: u32,

    #[arg(long, default_value_t = 500, env = "PAGE_SIZE")]
    pub(crate) page_size: u32,

    /// Trailing window used when no start date is given
    #[arg(long, default_value_t = 8, env = "DEFAULT_WINDOW_DAYS")]
    pub(crate) default_window_days: u32,

    #[arg(long, default_value_t = 5, env = "HTTP_MAX_ATTEMPTS")]
    pub(crate) http_max_attempts: u32,

    #[arg(long, default_value_t = 500, env = "HTTP_INITIAL_BACKOFF_MS")]
    pub(crate) http_initial_backoff_ms: u64,

    #[arg(long, default_value_t = 60, env = "HTTP_TIMEOUT_SECS")]
    pub(crate) http_timeout_secs: u64,

    /// Worker URL that fan-out tasks are posted to
    #[arg(long, env = "TASK_ENDPOINT")]
    pub(crate) task_endpoint: Option<String>,
}

impl Config {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.http_max_attempts,
            initial_backoff: Duration::from_millis(self.http_initial_backoff_ms),
            max_backoff: Duration::from_secs(30),
        }
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Config with every knob at its default, for tests.
    #[cfg(test)]
    pub fn for_tests(api_url: &str) -> Self {
        Config {
            api_url: api_url.to_string(),
            api_version: DEFAULT_API_VERSION.to_string(),
            access_token: Some("test_token".to_string()),
            access_token_file: None,
            warehouse_dir: WAREHOUSE_DIR.to_string(),
            poll_interval_secs: 0,
            max_poll_secs: 60,
            max_job_attempts: 5,
            page_size: 500,
            default_window_days: 8,
            http_max_attempts: 1,
            http_initial_backoff_ms: 0,
            http_timeout_secs: 5,
            task_endpoint: None,
        }
    }
}
