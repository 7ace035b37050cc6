//! Configuration vault – reads/writes `~/.servolink/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use servolink_hal::SimTopics;
use servolink_middleware::topics;
use servolink_runtime::{DEFAULT_PERIOD, DEFAULT_SERVICE_TIMEOUT, GainTable, ServiceTopics};
use servolink_types::{LinkError, N_JOINTS};

/// Topic names used by this station.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    pub low_state: String,
    pub control_mode_state: String,
    pub low_cmd: String,
    #[serde(flatten)]
    pub services: ServiceTopics,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            low_state: topics::LOW_STATE.to_string(),
            control_mode_state: topics::CONTROL_MODE_STATE.to_string(),
            low_cmd: topics::LOW_CMD.to_string(),
            services: ServiceTopics::default(),
        }
    }
}

impl TopicConfig {
    /// The same names, as served by the simulated robot.
    pub fn sim_topics(&self) -> SimTopics {
        SimTopics {
            low_state: self.low_state.clone(),
            control_mode_state: self.control_mode_state.clone(),
            low_cmd: self.low_cmd.clone(),
            bms_init_request: self.services.bms_init_request.clone(),
            bms_init_response: self.services.bms_init_response.clone(),
            torque_request: self.services.torque_request.clone(),
            torque_response: self.services.torque_response.clone(),
            control_mode_request: self.services.control_mode_request.clone(),
            control_mode_response: self.services.control_mode_response.clone(),
        }
    }
}

/// Per-joint PD gains, one entry per joint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GainConfig {
    pub kp: Vec<f32>,
    pub kd: Vec<f32>,
}

impl Default for GainConfig {
    fn default() -> Self {
        Self {
            kp: vec![default_kp(); N_JOINTS],
            kd: vec![default_kd(); N_JOINTS],
        }
    }
}

/// Persisted station configuration stored in `~/.servolink/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Transport domain; peers only see each other within one domain.
    #[serde(default)]
    pub domain_id: u32,

    /// Control loop period in microseconds.
    #[serde(default = "default_period_us")]
    pub period_us: u64,

    /// Timeout applied to every blocking service call.
    #[serde(default = "default_service_timeout_ms")]
    pub service_timeout_ms: u64,

    #[serde(default)]
    pub topics: TopicConfig,

    #[serde(default)]
    pub gains: GainConfig,
}

fn default_period_us() -> u64 {
    DEFAULT_PERIOD.as_micros() as u64
}
fn default_service_timeout_ms() -> u64 {
    DEFAULT_SERVICE_TIMEOUT.as_millis() as u64
}
fn default_kp() -> f32 {
    40.0
}
fn default_kd() -> f32 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain_id: 0,
            period_us: default_period_us(),
            service_timeout_ms: default_service_timeout_ms(),
            topics: TopicConfig::default(),
            gains: GainConfig::default(),
        }
    }
}

impl Config {
    pub fn period(&self) -> Duration {
        Duration::from_micros(self.period_us)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_millis(self.service_timeout_ms)
    }

    /// Check the values that cannot be caught by deserialization.
    pub fn validate(&self) -> Result<(), LinkError> {
        if self.period_us == 0 {
            return Err(LinkError::Config("period_us must be positive".to_string()));
        }
        if self.service_timeout_ms == 0 {
            return Err(LinkError::Config(
                "service_timeout_ms must be positive".to_string(),
            ));
        }
        self.gain_table().map(|_| ())
    }

    pub fn gain_table(&self) -> Result<GainTable, LinkError> {
        GainTable::new(self.gains.kp.clone(), self.gains.kd.clone())
    }
}

/// Return the path to `~/.servolink/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".servolink").join("config.toml")
}

/// Load the config from a specific path and apply environment overrides.
/// Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<Config>, String> {
    let mut cfg = read_from(path)?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the file as written, without environment overrides.
pub(crate) fn read_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `SERVOLINK_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SERVOLINK_DOMAIN_ID` | `domain_id` |
/// | `SERVOLINK_PERIOD_US` | `period_us` |
/// | `SERVOLINK_SERVICE_TIMEOUT_MS` | `service_timeout_ms` |
/// | `SERVOLINK_LOWSTATE_TOPIC` | `topics.low_state` |
/// | `SERVOLINK_LOWCMD_TOPIC` | `topics.low_cmd` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("SERVOLINK_DOMAIN_ID")
        && let Ok(id) = v.parse::<u32>()
    {
        cfg.domain_id = id;
    }
    if let Ok(v) = std::env::var("SERVOLINK_PERIOD_US")
        && let Ok(us) = v.parse::<u64>()
    {
        cfg.period_us = us;
    }
    if let Ok(v) = std::env::var("SERVOLINK_SERVICE_TIMEOUT_MS")
        && let Ok(ms) = v.parse::<u64>()
    {
        cfg.service_timeout_ms = ms;
    }
    if let Ok(v) = std::env::var("SERVOLINK_LOWSTATE_TOPIC") {
        cfg.topics.low_state = v;
    }
    if let Ok(v) = std::env::var("SERVOLINK_LOWCMD_TOPIC") {
        cfg.topics.low_cmd = v;
    }
}

/// Load `path`, falling back to defaults (plus environment overrides) when
/// the file is absent.
pub fn load_or_default(path: &Path) -> Result<Config, String> {
    match load_from(path)? {
        Some(cfg) => Ok(cfg),
        None => {
            let mut cfg = Config::default();
            apply_env_overrides(&mut cfg);
            Ok(cfg)
        }
    }
}

/// Save the config to a specific path, creating the parent directory if
/// necessary.
pub fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw =
        toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}
