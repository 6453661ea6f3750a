use crate::error::{Result, SprinklerError};
use crate::hardware::DEFAULT_SYSFS_ROOT;
use chrono::{DateTime, Days, NaiveTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn error(message: String) -> Self {
        Self {
            level: WarnLevel::Error,
            message,
        }
    }

    fn warning(message: String) -> Self {
        Self {
            level: WarnLevel::Warning,
            message,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Deployment namespace. Remote collections are scoped by it so a
/// development box never writes into production records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Production,
    #[default]
    Development,
}

impl Environment {
    pub fn collection(self, base: &str) -> String {
        match self {
            Self::Production => base.to_string(),
            Self::Development => format!("dev_{base}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Actuators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorConfig {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "gpio")]
    pub line: u32,
    #[serde(default, alias = "sprinklingRateLitersPerSecond")]
    pub rate_liters_per_second: f64,
    #[serde(default)]
    pub auto_shut_off_seconds: u64,
    #[serde(default)]
    pub is_active_by_default: bool,
    /// Relay boards usually switch on a low line.
    #[serde(default = "default_active_low")]
    pub active_low: bool,
}

/// Upper bound for `autoShutOffSeconds` (one year).
pub const MAX_AUTO_SHUT_OFF_SECONDS: u64 = 366 * 24 * 3600;

fn default_active_low() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineStep {
    #[serde(rename = "actuator", alias = "sprinkler")]
    pub actuator_id: u64,
    #[serde(alias = "runtimeSeconds")]
    pub duration_seconds: u64,
}

/// Time of day (local time) at which a daily scenario repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyTime {
    pub hour: u32,
    pub minute: u32,
    #[serde(default)]
    pub second: u32,
}

impl DailyTime {
    pub fn as_naive(&self) -> Option<NaiveTime> {
        NaiveTime::from_hms_opt(self.hour, self.minute, self.second)
    }

    /// First occurrence of this time of day strictly after `now`, in `now`'s
    /// time zone. Days where the time does not exist (DST gap) are skipped.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let at = self.as_naive()?;
        let tz = now.timezone();
        let today = now.date_naive();
        (0..=2u64).find_map(|offset| {
            let day = today.checked_add_days(Days::new(offset))?;
            let candidate = tz.from_local_datetime(&day.and_time(at)).earliest()?;
            (candidate > *now).then_some(candidate)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioConfig {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub timeline: Vec<TimelineStep>,
    #[serde(default)]
    pub run_daily: Option<DailyTime>,
}

// ---------------------------------------------------------------------------
// Hardware / remote backends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HardwareConfig {
    Sysfs {
        #[serde(default = "default_sysfs_root")]
        root: PathBuf,
    },
    Mock,
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self::Mock
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteConfig {
    /// In-process store; nothing leaves the device.
    Memory,
    Firebase {
        database_url: String,
        #[serde(default, skip_serializing)]
        auth_token: Option<String>,
    },
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self::Memory
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    #[serde(default)]
    pub environment: Environment,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_event_log_path")]
    pub event_log_path: PathBuf,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    pub actuators: Vec<ActuatorConfig>,
    #[serde(default)]
    pub scenarios: Vec<ScenarioConfig>,
}

fn default_port() -> u16 {
    3000
}

fn default_event_log_path() -> PathBuf {
    PathBuf::from("sprinkler-events.redb")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SprinklerError::InvalidConfig(format!(
                "config file not found: {}",
                path.display()
            )));
        }
        let data = std::fs::read_to_string(path)?;
        let mut cfg = Self::from_yaml_str(&data)?;
        if cfg.event_log_path.is_relative() {
            if let Some(dir) = path.parent() {
                cfg.event_log_path = dir.join(&cfg.event_log_path);
            }
        }
        Ok(cfg)
    }

    /// Parse YAML. JSON configs parse too, YAML being a superset.
    pub fn from_yaml_str(data: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        // 1. Actuators: at least one, unique ids and lines, sane numbers
        if self.actuators.is_empty() {
            warnings.push(ConfigWarning::error(
                "at least one actuator must be configured".into(),
            ));
        }
        let mut ids = HashSet::new();
        let mut lines = HashSet::new();
        for a in &self.actuators {
            let label = a.id.map_or_else(|| format!("line {}", a.line), |id| id.to_string());
            if let Some(id) = a.id {
                if !ids.insert(id) {
                    warnings.push(ConfigWarning::error(format!("duplicate actuator id {id}")));
                }
            }
            if !lines.insert(a.line) {
                warnings.push(ConfigWarning::warning(format!(
                    "line {} is shared by more than one actuator",
                    a.line
                )));
            }
            if !a.rate_liters_per_second.is_finite() || a.rate_liters_per_second < 0.0 {
                warnings.push(ConfigWarning::error(format!(
                    "actuator {label}: rateLitersPerSecond must be a non-negative number"
                )));
            }
            if a.auto_shut_off_seconds > MAX_AUTO_SHUT_OFF_SECONDS {
                warnings.push(ConfigWarning::error(format!(
                    "actuator {label}: autoShutOffSeconds must not exceed {MAX_AUTO_SHUT_OFF_SECONDS}"
                )));
            }
        }

        // 2. Scenarios: unique ids, non-empty timelines, known actuators
        let mut scenario_ids = HashSet::new();
        for s in &self.scenarios {
            if !scenario_ids.insert(s.id) {
                warnings.push(ConfigWarning::error(format!("duplicate scenario id {}", s.id)));
            }
            if s.timeline.is_empty() {
                warnings.push(ConfigWarning::error(format!(
                    "scenario {}: timeline is empty",
                    s.id
                )));
            }
            for (idx, step) in s.timeline.iter().enumerate() {
                if step.duration_seconds == 0 {
                    warnings.push(ConfigWarning::error(format!(
                        "scenario {} step {idx}: durationSeconds must be greater than zero",
                        s.id
                    )));
                }
                match self
                    .actuators
                    .iter()
                    .find(|a| a.id == Some(step.actuator_id))
                {
                    None => warnings.push(ConfigWarning::error(format!(
                        "scenario {} step {idx}: unknown actuator {}",
                        s.id, step.actuator_id
                    ))),
                    Some(a)
                        if a.auto_shut_off_seconds > 0
                            && step.duration_seconds > a.auto_shut_off_seconds =>
                    {
                        warnings.push(ConfigWarning::warning(format!(
                            "scenario {} step {idx}: runs {}s but actuator {} shuts off after {}s",
                            s.id, step.duration_seconds, step.actuator_id, a.auto_shut_off_seconds
                        )));
                    }
                    Some(_) => {}
                }
            }
            if let Some(daily) = s.run_daily {
                if daily.as_naive().is_none() {
                    warnings.push(ConfigWarning::error(format!(
                        "scenario {}: runDaily {:02}:{:02}:{:02} is not a valid time of day",
                        s.id, daily.hour, daily.minute, daily.second
                    )));
                }
            }
        }

        // 3. Remote backend
        if let RemoteConfig::Firebase { database_url, .. } = &self.remote {
            if !database_url.starts_with("https://") && !database_url.starts_with("http://") {
                warnings.push(ConfigWarning::error(format!(
                    "remote.database_url '{database_url}' must be an http(s) URL"
                )));
            }
        }

        warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Timelike, Utc};
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
environment: production
port: 8080
hardware:
  type: sysfs
remote:
  type: memory
actuators:
  - id: 1
    name: Lawn
    line: 17
    rateLitersPerSecond: 0.5
    autoShutOffSeconds: 1800
  - id: 2
    name: Roses
    line: 22
scenarios:
  - id: 10
    name: Morning
    timeline:
      - { actuator: 1, durationSeconds: 600 }
      - { actuator: 2, durationSeconds: 300 }
    runDaily: { hour: 6, minute: 30 }
"#;

    #[test]
    fn parses_yaml_config() {
        let cfg = Config::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(cfg.environment, Environment::Production);
        assert_eq!(cfg.port, 8080);
        assert_eq!(
            cfg.hardware,
            HardwareConfig::Sysfs {
                root: PathBuf::from(DEFAULT_SYSFS_ROOT)
            }
        );
        assert_eq!(cfg.actuators.len(), 2);
        assert!(cfg.actuators[0].active_low);
        assert_eq!(cfg.actuators[1].auto_shut_off_seconds, 0);
        let daily = cfg.scenarios[0].run_daily.unwrap();
        assert_eq!((daily.hour, daily.minute, daily.second), (6, 30, 0));
        assert!(cfg.validate().is_empty(), "{:?}", cfg.validate());
    }

    #[test]
    fn accepts_legacy_json_field_names() {
        let json = r#"{
            "actuators": [
                {"id": 7, "name": "Hedge", "gpio": 4, "sprinklingRateLitersPerSecond": 0.2,
                 "isActiveByDefault": false}
            ],
            "scenarios": [
                {"id": 1, "name": "Quick", "timeline": [{"sprinkler": 7, "runtimeSeconds": 30}]}
            ]
        }"#;
        let cfg = Config::from_yaml_str(json).unwrap();
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.actuators[0].line, 4);
        assert!((cfg.actuators[0].rate_liters_per_second - 0.2).abs() < f64::EPSILON);
        assert_eq!(
            cfg.scenarios[0].timeline[0],
            TimelineStep {
                actuator_id: 7,
                duration_seconds: 30
            }
        );
    }

    #[test]
    fn validate_flags_broken_scenarios() {
        let mut cfg = Config::from_yaml_str(SAMPLE).unwrap();
        cfg.scenarios.push(ScenarioConfig {
            id: 10,
            name: "dup".into(),
            timeline: vec![],
            run_daily: Some(DailyTime {
                hour: 25,
                minute: 0,
                second: 0,
            }),
        });
        cfg.scenarios.push(ScenarioConfig {
            id: 11,
            name: "ghost".into(),
            timeline: vec![TimelineStep {
                actuator_id: 99,
                duration_seconds: 0,
            }],
            run_daily: None,
        });

        let warnings = cfg.validate();
        let messages: Vec<&str> = warnings.iter().map(|w| w.message.as_str()).collect();
        assert!(messages.iter().any(|m| m.contains("duplicate scenario id 10")));
        assert!(messages.iter().any(|m| m.contains("timeline is empty")));
        assert!(messages.iter().any(|m| m.contains("not a valid time of day")));
        assert!(messages.iter().any(|m| m.contains("unknown actuator 99")));
        assert!(messages.iter().any(|m| m.contains("greater than zero")));
        assert!(Config::has_errors(&warnings));
    }

    #[test]
    fn step_longer_than_auto_shutoff_is_only_a_warning() {
        let mut cfg = Config::from_yaml_str(SAMPLE).unwrap();
        cfg.scenarios[0].timeline[0].duration_seconds = 3600;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(!Config::has_errors(&warnings));
    }

    #[test]
    fn validate_rejects_negative_rate_and_empty_actuators() {
        let mut cfg = Config::from_yaml_str(SAMPLE).unwrap();
        cfg.actuators[1].rate_liters_per_second = -1.0;
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("non-negative")));

        cfg.actuators.clear();
        cfg.scenarios.clear();
        assert!(cfg
            .validate()
            .iter()
            .any(|w| w.message.contains("at least one actuator")));
    }

    #[test]
    fn validate_rejects_auto_shutoff_beyond_a_year() {
        let mut cfg = Config::from_yaml_str(SAMPLE).unwrap();
        cfg.actuators[0].auto_shut_off_seconds = MAX_AUTO_SHUT_OFF_SECONDS;
        assert!(cfg.validate().is_empty());

        cfg.actuators[0].auto_shut_off_seconds = 10_000_000_000_000_000;
        let warnings = cfg.validate();
        assert!(Config::has_errors(&warnings));
        assert!(warnings
            .iter()
            .any(|w| w.message.contains("autoShutOffSeconds must not exceed")));
    }

    #[test]
    fn auth_token_is_never_serialized() {
        let cfg = Config::from_yaml_str(
            r#"
remote:
  type: firebase
  database_url: https://garden.example.firebaseio.com
  auth_token: s3cret
actuators:
  - { id: 1, line: 17 }
"#,
        )
        .unwrap();
        assert!(matches!(
            &cfg.remote,
            RemoteConfig::Firebase { auth_token: Some(t), .. } if t == "s3cret"
        ));
        let out = serde_yaml::to_string(&cfg).unwrap();
        assert!(!out.contains("s3cret"), "{out}");
        assert!(out.contains("garden.example.firebaseio.com"));
    }

    #[test]
    fn environment_scopes_collections() {
        assert_eq!(Environment::Production.collection("sprinklers"), "sprinklers");
        assert_eq!(
            Environment::Development.collection("sprinklers"),
            "dev_sprinklers"
        );
    }

    #[test]
    fn next_after_rolls_over_to_tomorrow() {
        let daily = DailyTime {
            hour: 6,
            minute: 30,
            second: 0,
        };
        let before = Utc.with_ymd_and_hms(2024, 5, 1, 5, 0, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2024, 5, 1, 7, 0, 0).unwrap();
        let exactly = Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap();

        assert_eq!(
            daily.next_after(&before).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 6, 30, 0).unwrap()
        );
        assert_eq!(
            daily.next_after(&after).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 2, 6, 30, 0).unwrap()
        );
        let next = daily.next_after(&exactly).unwrap();
        assert_eq!(next.date_naive().to_string(), "2024-05-02");
        assert_eq!(next.hour(), 6);
    }

    #[test]
    fn load_resolves_event_log_relative_to_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sprinklers.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.event_log_path, dir.path().join("sprinkler-events.redb"));
    }

    #[test]
    fn load_missing_file_is_invalid_config() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(&dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, SprinklerError::InvalidConfig(_)));
    }
}
