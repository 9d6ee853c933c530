// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// crconfig-core server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// HTTP listen address
    pub http_addr: SocketAddr,
    /// Pool size
    pub max_connections: u32,
    /// Upper bound for one compile or snapshot request
    pub request_timeout: Duration,
    /// Host name recorded in CRConfig stats
    pub tm_host: String,
    /// User name recorded in CRConfig stats
    pub tm_user: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CRCONFIG_DATABASE_URL`: PostgreSQL connection string
    ///
    /// Optional (with defaults):
    /// - `CRCONFIG_HTTP_PORT`: HTTP port (default: 8080)
    /// - `CRCONFIG_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `CRCONFIG_REQUEST_TIMEOUT_SECS`: per-request timeout (default: 60)
    /// - `CRCONFIG_TM_HOST`: stats host name (default: localhost)
    /// - `CRCONFIG_TM_USER`: stats user name (default: admin)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CRCONFIG_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("CRCONFIG_DATABASE_URL"))?;

        let http_port: u16 = std::env::var("CRCONFIG_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("CRCONFIG_HTTP_PORT", "must be a valid port number"))?;

        let max_connections: u32 = std::env::var("CRCONFIG_MAX_CONNECTIONS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CRCONFIG_MAX_CONNECTIONS", "must be a positive integer")
            })?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "CRCONFIG_MAX_CONNECTIONS",
                "must be a positive integer",
            ));
        }

        let timeout_secs: u64 = std::env::var("CRCONFIG_REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CRCONFIG_REQUEST_TIMEOUT_SECS", "must be a number of seconds")
            })?;

        let tm_host = std::env::var("CRCONFIG_TM_HOST").unwrap_or_else(|_| "localhost".to_string());
        let tm_user = std::env::var("CRCONFIG_TM_USER").unwrap_or_else(|_| "admin".to_string());

        Ok(Self {
            database_url,
            http_addr: SocketAddr::from(([0, 0, 0, 0], http_port)),
            max_connections,
            request_timeout: Duration::from_secs(timeout_secs),
            tm_host,
            tm_user,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ALL_VARS: [&str; 6] = [
        "CRCONFIG_DATABASE_URL",
        "CRCONFIG_HTTP_PORT",
        "CRCONFIG_MAX_CONNECTIONS",
        "CRCONFIG_REQUEST_TIMEOUT_SECS",
        "CRCONFIG_TM_HOST",
        "CRCONFIG_TM_USER",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn clean() -> Self {
            let mut guard = Self::new();
            for var in ALL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CRCONFIG_DATABASE_URL", "postgres://localhost/to");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "postgres://localhost/to");
        assert_eq!(config.http_addr.port(), 8080);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.tm_host, "localhost");
        assert_eq!(config.tm_user, "admin");
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CRCONFIG_DATABASE_URL", "postgres://user:pass@db:5432/to");
        guard.set("CRCONFIG_HTTP_PORT", "3443");
        guard.set("CRCONFIG_MAX_CONNECTIONS", "32");
        guard.set("CRCONFIG_REQUEST_TIMEOUT_SECS", "5");
        guard.set("CRCONFIG_TM_HOST", "to.cdn.example");
        guard.set("CRCONFIG_TM_USER", "ops");

        let config = Config::from_env().unwrap();

        assert_eq!(config.http_addr.port(), 3443);
        assert_eq!(config.max_connections, 32);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.tm_host, "to.cdn.example");
        assert_eq!(config.tm_user, "ops");
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CRCONFIG_DATABASE_URL")));
        assert!(err.to_string().contains("CRCONFIG_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_http_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CRCONFIG_DATABASE_URL", "postgres://localhost/to");
        guard.set("CRCONFIG_HTTP_PORT", "99999"); // > 65535

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CRCONFIG_HTTP_PORT", _)));
    }

    #[test]
    fn test_config_zero_max_connections() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CRCONFIG_DATABASE_URL", "postgres://localhost/to");
        guard.set("CRCONFIG_MAX_CONNECTIONS", "0");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CRCONFIG_MAX_CONNECTIONS", _)));
    }

    #[test]
    fn test_config_invalid_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("CRCONFIG_DATABASE_URL", "postgres://localhost/to");
        guard.set("CRCONFIG_REQUEST_TIMEOUT_SECS", "soon");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CRCONFIG_REQUEST_TIMEOUT_SECS", _)
        ));
    }

    #[test]
    fn test_config_error_display() {
        let missing = ConfigError::Missing("MY_VAR");
        assert_eq!(
            missing.to_string(),
            "missing required environment variable: MY_VAR"
        );

        let invalid = ConfigError::Invalid("MY_VAR", "must be a number");
        assert_eq!(
            invalid.to_string(),
            "invalid value for MY_VAR: must be a number"
        );
    }
}
