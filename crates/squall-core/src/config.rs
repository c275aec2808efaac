//! Server configuration

use std::time::Duration;

use crate::parser::DEFAULT_BUFFER_SIZE;

/// Server configuration
///
/// The body-size cap and keep-alive timeout guard the read loop; the
/// temp-file switch decides whether oversized POST bodies may spool to
/// a file-backed mapping instead of failing.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    pub workers: usize,
    /// Largest accepted `Content-Length` for POST bodies
    pub max_post_data_size: usize,
    /// Wall-clock budget for reading a request body
    pub keep_alive_timeout: Duration,
    /// Allow bodies of 1 MiB and more to spool into an unlinked temp file
    pub allow_post_temp_file: bool,
    /// Accept a PROXY v1/v2 preamble on new connections
    pub allow_proxy: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: "0.0.0.0".to_string(),
            port: 8080,
            workers: num_cpus::get(),
            max_post_data_size: 10 * DEFAULT_BUFFER_SIZE,
            keep_alive_timeout: Duration::from_secs(15),
            allow_post_temp_file: false,
            allow_proxy: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.max_post_data_size, 10 * DEFAULT_BUFFER_SIZE);
        assert_eq!(config.keep_alive_timeout, Duration::from_secs(15));
        assert!(!config.allow_post_temp_file);
        assert!(!config.allow_proxy);
    }
}
