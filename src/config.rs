use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PASS_GRADE: f64 = 6.0;
pub const DEFAULT_PASS_ATTENDANCE: f64 = 75.0;

/// When a poller pushes a freshly fetched result to its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublishPolicy {
    OnChange,
    EveryTick,
}

impl FromStr for PublishPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "on-change" | "on_change" | "onchange" => Ok(PublishPolicy::OnChange),
            "every-tick" | "every_tick" | "everytick" => Ok(PublishPolicy::EveryTick),
            other => anyhow::bail!("unknown publish policy `{other}`"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PassThresholds {
    pub min_mean_grade: f64,
    /// Percentage, 0-100.
    pub min_attendance_rate: f64,
}

impl Default for PassThresholds {
    fn default() -> Self {
        Self {
            min_mean_grade: DEFAULT_PASS_GRADE,
            min_attendance_rate: DEFAULT_PASS_ATTENDANCE,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub roster_interval: Duration,
    pub statistics_interval: Duration,
    pub detail_interval: Duration,
    pub roster_policy: PublishPolicy,
    pub statistics_policy: PublishPolicy,
    pub thresholds: PassThresholds,
    pub shutdown_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            roster_interval: DEFAULT_POLL_INTERVAL,
            statistics_interval: DEFAULT_POLL_INTERVAL,
            detail_interval: DEFAULT_POLL_INTERVAL,
            roster_policy: PublishPolicy::OnChange,
            statistics_policy: PublishPolicy::EveryTick,
            thresholds: PassThresholds::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with the `ROSTER_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(secs) = parse_var::<u64>(&lookup, "ROSTER_POLL_SECS")? {
            config.roster_interval = positive_secs("ROSTER_POLL_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ROSTER_STATS_POLL_SECS")? {
            config.statistics_interval = positive_secs("ROSTER_STATS_POLL_SECS", secs)?;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "ROSTER_DETAIL_POLL_SECS")? {
            config.detail_interval = positive_secs("ROSTER_DETAIL_POLL_SECS", secs)?;
        }
        if let Some(grade) = parse_var::<f64>(&lookup, "ROSTER_PASS_GRADE")? {
            config.thresholds.min_mean_grade = grade;
        }
        if let Some(rate) = parse_var::<f64>(&lookup, "ROSTER_PASS_ATTENDANCE")? {
            config.thresholds.min_attendance_rate = rate;
        }
        if let Some(policy) = lookup("ROSTER_STATS_POLICY") {
            config.statistics_policy = policy
                .parse()
                .context("ROSTER_STATS_POLICY must be `on-change` or `every-tick`")?;
        }

        Ok(config)
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse::<T>()
                .with_context(|| format!("{key} has an invalid value `{raw}`"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn positive_secs(key: &str, secs: u64) -> anyhow::Result<Duration> {
    anyhow::ensure!(secs > 0, "{key} must be greater than zero");
    Ok(Duration::from_secs(secs))
}

#[derive(Debug, Clone)]
pub struct HttpSourceConfig {
    pub base_url: String,
    pub timeout: Duration,
    /// Accept self-signed certificates, for local development servers.
    pub accept_invalid_certs: bool,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/students/".to_string(),
            timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_keep_roster_and_statistics_asymmetric() {
        let config = EngineConfig::default();
        assert_eq!(config.roster_policy, PublishPolicy::OnChange);
        assert_eq!(config.statistics_policy, PublishPolicy::EveryTick);
        assert_eq!(config.roster_interval, Duration::from_secs(30));
        assert_eq!(config.thresholds.min_mean_grade, 6.0);
        assert_eq!(config.thresholds.min_attendance_rate, 75.0);
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("ROSTER_POLL_SECS", "5"),
            ("ROSTER_PASS_GRADE", "7.5"),
            ("ROSTER_STATS_POLICY", "on-change"),
        ]))
        .expect("valid overrides");
        assert_eq!(config.roster_interval, Duration::from_secs(5));
        assert_eq!(config.statistics_interval, Duration::from_secs(30));
        assert_eq!(config.thresholds.min_mean_grade, 7.5);
        assert_eq!(config.statistics_policy, PublishPolicy::OnChange);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("ROSTER_POLL_SECS", "soon")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("ROSTER_POLL_SECS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("ROSTER_STATS_POLICY", "hourly")])).is_err());
    }
}
