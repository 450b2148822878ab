//! Application configuration loaded from environment variables.
//!
//! Validation is strict: an out-of-range value aborts startup rather than
//! limping along with a silently clamped setting.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, Context, Result};

/// Default principal sweep schedule (standard 5-field crontab).
pub const DEFAULT_CRON_SCHEDULE: &str = "0 2 * * *";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    /// Preferred listen port; the binder walks up to `max_port` on conflict.
    pub port: u16,
    pub max_port: u16,
    pub health_check_port: Option<u16>,
    pub max_concurrent: usize,
    pub log_level: String,
    pub app_env: String,
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    /// Root directory whose immediate subdirectories are swept as repositories.
    pub repos_root: Option<PathBuf>,
    pub cron_schedule: String,
    pub run_on_startup: bool,
    pub git: GitSettings,
    pub doppler: DopplerSettings,
}

#[derive(Debug, Clone)]
pub struct GitSettings {
    pub enabled: bool,
    pub base_branch: String,
    pub branch_prefix: String,
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct DopplerSettings {
    pub token: Option<String>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
    pub cache_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let port = match env::var("JOBS_API_PORT").ok().or_else(|| env::var("PORT").ok()) {
            Some(raw) => parse_in_range("JOBS_API_PORT/PORT", &raw, 1, 65_535)? as u16,
            None => 8080,
        };
        let max_port = match env::var("MAX_PORT").ok() {
            Some(raw) => parse_in_range("MAX_PORT", &raw, port as u32, 65_535)? as u16,
            None => port.saturating_add(10),
        };
        let health_check_port = match env::var("HEALTH_CHECK_PORT").ok() {
            Some(raw) => Some(parse_in_range("HEALTH_CHECK_PORT", &raw, 1, 65_535)? as u16),
            None => None,
        };
        let max_concurrent = match env::var("MAX_CONCURRENT").ok() {
            Some(raw) => parse_in_range("MAX_CONCURRENT", &raw, 1, 50)? as usize,
            None => 5,
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port,
            max_port,
            health_check_port,
            max_concurrent,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            app_env: env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
            db_path: env::var("SIDEQUEST_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/jobs.db")),
            log_dir: env::var("SIDEQUEST_LOG_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/job-logs")),
            repos_root: env::var("SIDEQUEST_REPOS_ROOT").ok().map(PathBuf::from),
            cron_schedule: env::var("CRON_SCHEDULE")
                .unwrap_or_else(|_| DEFAULT_CRON_SCHEDULE.to_string()),
            run_on_startup: parse_bool("RUN_ON_STARTUP", false)?,
            git: GitSettings {
                enabled: parse_bool("ENABLE_GIT_WORKFLOW", false)?,
                base_branch: env::var("GIT_BASE_BRANCH").unwrap_or_else(|_| "main".to_string()),
                branch_prefix: env::var("GIT_BRANCH_PREFIX")
                    .unwrap_or_else(|_| "automated".to_string()),
                dry_run: parse_bool("GIT_DRY_RUN", false)?,
            },
            doppler: DopplerSettings {
                token: env::var("DOPPLER_TOKEN").ok(),
                failure_threshold: parse_or("DOPPLER_FAILURE_THRESHOLD", 3)?,
                success_threshold: parse_or("DOPPLER_SUCCESS_THRESHOLD", 2)?,
                timeout_ms: parse_or("DOPPLER_TIMEOUT", 5_000)?,
                base_delay_ms: parse_or("DOPPLER_BASE_DELAY_MS", 1_000)?,
                backoff_multiplier: parse_or("DOPPLER_BACKOFF_MULTIPLIER", 2.0)?,
                max_backoff_ms: parse_or("DOPPLER_MAX_BACKOFF_MS", 10_000)?,
                cache_dir: env::var("DOPPLER_CACHE_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("data/doppler-cache")),
            },
        })
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{name} must be a valid number, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn parse_in_range(name: &str, raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .with_context(|| format!("{name} must be a valid number, got {raw:?}"))?;
    if value < min || value > max {
        bail!("{name} must be between {min} and {max}, got {value}");
    }
    Ok(value)
}

fn parse_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => bail!("{name} must be a boolean, got {other:?}"),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(name, _)| (name.to_string(), env::var(name).ok()))
            .collect();
        for (name, value) in vars {
            match value {
                Some(v) => env::set_var(name, v),
                None => env::remove_var(name),
            }
        }
        f();
        for (name, value) in saved {
            match value {
                Some(v) => env::set_var(&name, v),
                None => env::remove_var(&name),
            }
        }
    }

    #[test]
    fn defaults_apply_without_env() {
        with_env(
            &[
                ("PORT", None),
                ("JOBS_API_PORT", None),
                ("MAX_CONCURRENT", None),
                ("ENABLE_GIT_WORKFLOW", None),
                ("CRON_SCHEDULE", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.port, 8080);
                assert_eq!(config.max_concurrent, 5);
                assert_eq!(config.cron_schedule, DEFAULT_CRON_SCHEDULE);
                assert!(!config.git.enabled);
                assert_eq!(config.doppler.failure_threshold, 3);
            },
        );
    }

    #[test]
    fn out_of_range_max_concurrent_aborts() {
        with_env(&[("MAX_CONCURRENT", Some("51"))], || {
            let err = Config::from_env().unwrap_err().to_string();
            assert!(err.contains("MAX_CONCURRENT"), "{err}");
        });
    }

    #[test]
    fn zero_port_aborts() {
        with_env(&[("PORT", Some("0")), ("JOBS_API_PORT", None)], || {
            assert!(Config::from_env().is_err());
        });
    }

    #[test]
    fn jobs_api_port_takes_precedence() {
        with_env(
            &[
                ("PORT", Some("9000")),
                ("JOBS_API_PORT", Some("9100")),
                ("MAX_PORT", None),
            ],
            || {
                let config = Config::from_env().unwrap();
                assert_eq!(config.port, 9100);
                assert_eq!(config.max_port, 9110);
            },
        );
    }

    #[test]
    fn bad_boolean_aborts() {
        with_env(&[("GIT_DRY_RUN", Some("maybe"))], || {
            assert!(Config::from_env().is_err());
        });
    }
}
