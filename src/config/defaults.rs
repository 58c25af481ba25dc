//! Default configuration values

use std::time::Duration;

/// Base URL used when a request is built without one
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1/";

/// Default wait budget for a response that is not ready yet, in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Upper bound of the jittered sleep between not-ready reads
pub const NOT_READY_WAIT: Duration = Duration::from_millis(30);

/// Default cap for the adaptive thread limit
pub const DEFAULT_MAX_THREADS: usize = 7;

/// Default service URL
pub fn default_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

/// Default wait budget in seconds
pub const fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

/// Default thread cap
pub const fn default_max_threads() -> usize {
    DEFAULT_MAX_THREADS
}

/// Default connections per pool key (number of CPU cores, at least 7)
pub fn default_pool_size() -> usize {
    num_cpus::get().max(DEFAULT_MAX_THREADS)
}
