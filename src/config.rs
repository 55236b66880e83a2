use anyhow::{Context, Result};
use std::{env, path::PathBuf, time::Duration};

use crate::tasks::Schedule;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub secret_key: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub diff_sweep_schedule: Schedule,
    pub diff_sweep_budget: Duration,
    pub report_outcome_delay: Duration,
    pub task_workers: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let secret_key = env::var("SECRET_KEY").context("SECRET_KEY not set")?;
        let diff_sweep_schedule = env::var("DIFF_SWEEP_SCHEDULE")
            .unwrap_or_else(|_| "* * * * *".into())
            .parse()
            .context("DIFF_SWEEP_SCHEDULE")?;

        Ok(Config {
            database_url,
            secret_key,
            port: parsed("PORT", 8081)?,
            data_dir: PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".into())),
            diff_sweep_schedule,
            diff_sweep_budget: Duration::from_secs(parsed("DIFF_SWEEP_BUDGET_SECS", 10)?),
            report_outcome_delay: Duration::from_millis(parsed("REPORT_OUTCOME_DELAY_MS", 100)?),
            task_workers: parsed("TASK_WORKERS", 4)?,
        })
    }
}

fn parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(s) => s.parse().with_context(|| format!("invalid {key}: {s:?}")),
        Err(_) => Ok(default),
    }
}
