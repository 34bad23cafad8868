//! Runtime configuration read from the environment (`.env` is loaded first).

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::player::{PlayerSettings, UnattendedRule};
use crate::policy::AutoLeavePolicy;
use crate::provider::direct;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value} is not valid: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("volume bounds are inconsistent: min {min}, default {default}, max {max}")]
    VolumeRange { min: u16, default: u16, max: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoLeaveConfig {
    pub enabled: bool,
    pub inactivity_threshold: Duration,
    pub sweep_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoEndConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub min_played: Duration,
    /// How long an idle session with an empty queue is kept.
    pub idle_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub telegram_token: Option<String>,
    pub database_path: PathBuf,
    pub http_port: u16,
    pub auto_leave: AutoLeaveConfig,
    pub flush_interval: Duration,
    pub auto_end: AutoEndConfig,
    pub default_provider: String,
    pub fetch_timeout: Duration,
    pub volume_min: u16,
    pub volume_max: u16,
    pub volume_default: u16,
    /// Playback controls in groups are limited to chat administrators.
    pub admin_only_controls: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Unset or empty keys take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);

        let home = env.get("HOME").unwrap_or_else(|| ".".into());
        let database_path = env
            .get("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home).join(".tunedeck").join("tunedeck.db"));

        let config = Self {
            telegram_token: env.get("TELOXIDE_TOKEN").or_else(|| env.get("TELEGRAM_BOT_TOKEN")),
            database_path,
            http_port: env.parse("HTTP_PORT", 3000)?,
            auto_leave: AutoLeaveConfig {
                enabled: env.flag("AUTO_LEAVE_ENABLED", true)?,
                inactivity_threshold: env.secs("INACTIVITY_THRESHOLD_SECS", 7 * 24 * 60 * 60)?,
                sweep_interval: env.secs("SWEEP_INTERVAL_SECS", 6 * 60 * 60)?,
            },
            flush_interval: env.secs("FLUSH_INTERVAL_SECS", 5 * 60)?,
            auto_end: AutoEndConfig {
                enabled: env.flag("AUTO_END_ENABLED", true)?,
                interval: env.secs("AUTO_END_INTERVAL_SECS", 30)?,
                min_played: env.secs("AUTO_END_MIN_PLAYED_SECS", 15)?,
                idle_grace: env.secs("AUTO_END_IDLE_SECS", 60 * 60)?,
            },
            default_provider: env
                .get("DEFAULT_PROVIDER")
                .unwrap_or_else(|| direct::TAG.to_string()),
            fetch_timeout: env.secs("FETCH_TIMEOUT_SECS", 30)?,
            volume_min: env.parse("VOLUME_MIN", 0)?,
            volume_max: env.parse("VOLUME_MAX", 200)?,
            volume_default: env.parse("VOLUME_DEFAULT", 100)?,
            admin_only_controls: env.flag("ADMIN_ONLY_CONTROLS", true)?,
        };

        if !(config.volume_min <= config.volume_default && config.volume_default <= config.volume_max) {
            return Err(ConfigError::VolumeRange {
                min: config.volume_min,
                default: config.volume_default,
                max: config.volume_max,
            });
        }
        Ok(config)
    }

    pub fn auto_leave_policy(&self) -> AutoLeavePolicy {
        let to_chrono = |d: Duration| {
            chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
        };
        AutoLeavePolicy::new(
            self.auto_leave.enabled,
            to_chrono(self.auto_leave.inactivity_threshold),
            to_chrono(self.auto_leave.sweep_interval),
        )
    }

    pub fn unattended_rule(&self) -> UnattendedRule {
        let to_chrono = |d: Duration| chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52));
        UnattendedRule {
            min_played: to_chrono(self.auto_end.min_played),
            idle_grace: to_chrono(self.auto_end.idle_grace),
        }
    }

    pub fn player_settings(&self) -> PlayerSettings {
        PlayerSettings {
            volume_min: self.volume_min,
            volume_max: self.volume_max,
            default_volume: self.volume_default,
        }
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                reason: e.to_string(),
                value,
            }),
        }
    }

    fn secs(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        let secs = self.parse(key, default)?;
        if secs == 0 {
            return Err(ConfigError::InvalidValue {
                key,
                value: secs.to_string(),
                reason: "must be at least one second".into(),
            });
        }
        Ok(Duration::from_secs(secs))
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) => match v.as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key,
                    value: v.clone(),
                    reason: "expected true or false".into(),
                }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let c = config(&[("HOME", "/home/dj")]).unwrap();
        assert_eq!(c.database_path, PathBuf::from("/home/dj/.tunedeck/tunedeck.db"));
        assert_eq!(c.http_port, 3000);
        assert!(c.auto_leave.enabled);
        assert_eq!(c.auto_leave.inactivity_threshold, Duration::from_secs(604_800));
        assert_eq!(c.auto_leave.sweep_interval, Duration::from_secs(21_600));
        assert_eq!(c.flush_interval, Duration::from_secs(300));
        assert_eq!(c.auto_end.min_played, Duration::from_secs(15));
        assert_eq!(c.auto_end.idle_grace, Duration::from_secs(3600));
        assert!(c.admin_only_controls);
        assert_eq!(c.default_provider, "url");
        assert_eq!((c.volume_min, c.volume_default, c.volume_max), (0, 100, 200));
        assert!(c.telegram_token.is_none());
    }

    #[test]
    fn either_token_variable_is_accepted() {
        let c = config(&[("TELEGRAM_BOT_TOKEN", "123:abc")]).unwrap();
        assert_eq!(c.telegram_token.as_deref(), Some("123:abc"));
    }

    #[test]
    fn overrides_are_parsed() {
        let c = config(&[
            ("AUTO_LEAVE_ENABLED", "off"),
            ("INACTIVITY_THRESHOLD_SECS", "3600"),
            ("HTTP_PORT", "8080"),
            ("DATABASE_PATH", "/tmp/x.db"),
        ])
        .unwrap();
        assert!(!c.auto_leave.enabled);
        assert_eq!(c.auto_leave.inactivity_threshold, Duration::from_secs(3600));
        assert_eq!(c.http_port, 8080);
        assert_eq!(c.database_path, PathBuf::from("/tmp/x.db"));

        let policy = c.auto_leave_policy();
        assert!(!policy.enabled);
        assert_eq!(policy.inactivity_threshold, chrono::Duration::hours(1));
    }

    #[test]
    fn idle_grace_is_separate_from_check_interval() {
        let c = config(&[
            ("AUTO_END_INTERVAL_SECS", "30"),
            ("AUTO_END_IDLE_SECS", "600"),
            ("ADMIN_ONLY_CONTROLS", "false"),
        ])
        .unwrap();
        let rule = c.unattended_rule();
        assert_eq!(rule.idle_grace, chrono::Duration::minutes(10));
        assert_eq!(rule.min_played, chrono::Duration::seconds(15));
        assert_eq!(c.auto_end.interval, Duration::from_secs(30));
        assert!(!c.admin_only_controls);
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            config(&[("HTTP_PORT", "eighty")]),
            Err(ConfigError::InvalidValue { key: "HTTP_PORT", .. })
        ));
        assert!(matches!(
            config(&[("SWEEP_INTERVAL_SECS", "0")]),
            Err(ConfigError::InvalidValue { key: "SWEEP_INTERVAL_SECS", .. })
        ));
        assert!(matches!(
            config(&[("AUTO_END_ENABLED", "maybe")]),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            config(&[("VOLUME_DEFAULT", "250")]),
            Err(ConfigError::VolumeRange { .. })
        ));
    }
}
