//! Runtime configuration.
//!
//! Values come from environment variables, with `.env` support provided by the
//! caller through `dotenvy`. Everything has a default except the delivery
//! gateways, which are simply absent when unconfigured.

use std::env;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::notify::sms::SmsConfig;
use crate::notify::smtp::SmtpConfig;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:vigil.db?mode=rwc";

/// Base URL used in acknowledgement links.
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:3000";

/// Seconds between checks for paused rules due to resume.
pub const DEFAULT_RESUME_INTERVAL_SECS: u64 = 60;

/// Parse an optional numeric variable, failing on malformed values.
macro_rules! parse_var {
    ($lookup:expr, $name:expr, $ty:ty, $default:expr) => {
        $lookup($name)
            .map(|v| v.parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $name, e))?
            .unwrap_or($default)
    };
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    /// Externally reachable base URL of this server.
    pub public_url: String,
    pub resume_interval: Duration,
    pub smtp: Option<SmtpConfig>,
    pub sms: Option<SmsConfig>,
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// | Variable                     | Default                     |
    /// |------------------------------|-----------------------------|
    /// | `VIGIL_PORT`                 | `3000`                      |
    /// | `VIGIL_DATABASE_URL`         | `sqlite:vigil.db?mode=rwc`  |
    /// | `VIGIL_PUBLIC_URL`           | `http://localhost:3000`     |
    /// | `VIGIL_RESUME_INTERVAL_SECS` | `60`                        |
    ///
    /// SMTP and SMS gateway variables are read by [`SmtpConfig::from_env`]
    /// and [`SmsConfig::from_env`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::from_lookup(|name| env::var(name).ok())?;
        config.smtp = SmtpConfig::from_env();
        config.sms = SmsConfig::from_env();
        Ok(config)
    }

    /// Load the core settings through `lookup`. Gateways are left unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let port = parse_var!(lookup, "VIGIL_PORT", u16, DEFAULT_PORT);
        let resume_secs = parse_var!(
            lookup,
            "VIGIL_RESUME_INTERVAL_SECS",
            u64,
            DEFAULT_RESUME_INTERVAL_SECS
        );
        if resume_secs == 0 {
            return Err(anyhow!("Invalid VIGIL_RESUME_INTERVAL_SECS: must be positive"));
        }

        Ok(Self {
            port,
            database_url: lookup("VIGIL_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            public_url: lookup("VIGIL_PUBLIC_URL")
                .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string()),
            resume_interval: Duration::from_secs(resume_secs),
            smtp: None,
            sms: None,
        })
    }

    /// Log the loaded configuration. Secrets are never printed.
    pub fn log_config(&self) {
        tracing::info!("Configuration loaded:");
        tracing::info!("  VIGIL_PORT            : {}", self.port);
        tracing::info!("  VIGIL_DATABASE_URL    : {}", self.database_url);
        tracing::info!("  VIGIL_PUBLIC_URL      : {}", self.public_url);
        tracing::info!(
            "  VIGIL_RESUME_INTERVAL : {}s",
            self.resume_interval.as_secs()
        );
        match &self.smtp {
            Some(smtp) => tracing::info!(
                "  SMTP                  : {}:{} (auth: {})",
                smtp.smtp_host,
                smtp.smtp_port,
                smtp.smtp_user.is_some()
            ),
            None => tracing::info!("  SMTP                  : not configured"),
        }
        match &self.sms {
            Some(sms) => tracing::info!("  SMS_API_URL           : {}", sms.api_url),
            None => tracing::info!("  SMS_API_URL           : not configured"),
        }
    }
}
