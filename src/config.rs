use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::services::{RetryPolicy, SyncSettings};
use crate::validation::BranchPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    /// Authority Postgres URL; only `serve` and `db` need it.
    pub database_url: Option<String>,
    pub device_database_path: PathBuf,
    pub authority_url: String,
    pub device_id: String,
    pub allowed_branches: BranchPolicy,
    pub receipt_start: u64,
    pub sync: SyncSettings,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present

        let sync_defaults = SyncSettings::default();
        let retry_defaults = RetryPolicy::default();

        let config = Config {
            server_port: parse_var("SERVER_PORT", 3000)?,
            database_url: env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            device_database_path: PathBuf::from(
                env::var("DEVICE_DATABASE_PATH").unwrap_or_else(|_| "parish-ledger.db".to_string()),
            ),
            authority_url: env::var("AUTHORITY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:3000".to_string()),
            device_id: env::var("DEVICE_ID").unwrap_or_else(|_| "kiosk-1".to_string()),
            allowed_branches: parse_allowed_branches(
                &env::var("ALLOWED_BRANCHES").unwrap_or_else(|_| "*".to_string()),
            )?,
            receipt_start: parse_var("RECEIPT_START", 1)?,
            sync: SyncSettings {
                batch_size: parse_var("SYNC_BATCH_SIZE", sync_defaults.batch_size)?,
                push_timeout: Duration::from_secs(parse_var(
                    "SYNC_PUSH_TIMEOUT_SECS",
                    sync_defaults.push_timeout.as_secs(),
                )?),
                reconciliation_window: Duration::from_secs(parse_var(
                    "SYNC_RECONCILE_WINDOW_SECS",
                    sync_defaults.reconciliation_window.as_secs(),
                )?),
                poll_interval: Duration::from_secs(parse_var(
                    "SYNC_POLL_INTERVAL_SECS",
                    sync_defaults.poll_interval.as_secs(),
                )?),
                reversal_review_interval: Duration::from_secs(parse_var(
                    "SYNC_REVERSAL_REVIEW_SECS",
                    sync_defaults.reversal_review_interval.as_secs(),
                )?),
                reversal_horizon: Duration::from_secs(parse_var(
                    "SYNC_REVERSAL_HORIZON_SECS",
                    sync_defaults.reversal_horizon.as_secs(),
                )?),
            },
            retry: RetryPolicy {
                base: Duration::from_millis(parse_var(
                    "SYNC_BASE_BACKOFF_MS",
                    u64::try_from(retry_defaults.base.as_millis()).unwrap_or(2000),
                )?),
                cap: parse_var("SYNC_BACKOFF_CAP", retry_defaults.cap)?,
                max_attempts: parse_var("SYNC_MAX_ATTEMPTS", retry_defaults.max_attempts)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.authority_url).context("AUTHORITY_URL is not a valid URL")?;
        if let Some(database_url) = &self.database_url {
            url::Url::parse(database_url).context("DATABASE_URL is not a valid URL")?;
        }
        if self.device_id.trim().is_empty() {
            anyhow::bail!("DEVICE_ID must not be empty");
        }
        if self.receipt_start == 0 {
            anyhow::bail!("RECEIPT_START must be at least 1");
        }
        if self.sync.batch_size == 0 {
            anyhow::bail!("SYNC_BATCH_SIZE must be at least 1");
        }
        if self.sync.poll_interval.is_zero() {
            anyhow::bail!("SYNC_POLL_INTERVAL_SECS must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("SYNC_MAX_ATTEMPTS must be at least 1");
        }
        Ok(())
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set for the authority")
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", name, raw)),
        _ => Ok(default),
    }
}

pub fn parse_allowed_branches(raw: &str) -> Result<BranchPolicy> {
    let value = raw.trim();
    if value == "*" {
        return Ok(BranchPolicy::Any);
    }

    let branches = value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(Uuid::parse_str)
        .collect::<Result<HashSet<_>, _>>()
        .context("ALLOWED_BRANCHES contains an invalid UUID")?;

    if branches.is_empty() {
        anyhow::bail!("ALLOWED_BRANCHES must be '*' or a comma-separated list of branch UUIDs");
    }

    Ok(BranchPolicy::Only(branches))
}
