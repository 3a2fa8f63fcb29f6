//! Operator configuration – reads/writes `~/.armguard/config.toml`.

use armguard_runtime::ArmConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted operator configuration stored in `~/.armguard/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Key under which this arm's calibration table is stored.
    #[serde(default = "default_arm_id")]
    pub arm_id: String,

    /// SQLite database holding calibration tables.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Start the telemetry poller and maintenance thread at launch.
    #[serde(default = "default_monitor_on_start")]
    pub monitor_on_start: bool,

    /// Every tunable of the supervised arm.
    #[serde(default)]
    pub arm: ArmConfig,
}

fn default_arm_id() -> String {
    "so101-follower".to_string()
}
fn default_db_path() -> String {
    armguard_dir_for_home(&home_dir())
        .join("calibration.db")
        .to_string_lossy()
        .into_owned()
}
fn default_monitor_on_start() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arm_id: default_arm_id(),
            db_path: default_db_path(),
            monitor_on_start: default_monitor_on_start(),
            arm: ArmConfig::default(),
        }
    }
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn armguard_dir_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".armguard")
}

/// Return the path to `~/.armguard/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    armguard_dir_for_home(home).join("config.toml")
}

/// Load the config from disk.  Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config =
        toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `ARMGUARD_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `ARMGUARD_ARM_ID` | `arm_id` |
/// | `ARMGUARD_DB_PATH` | `db_path` |
/// | `ARMGUARD_POLL_HZ` | `arm.telemetry.poll_rate_hz` |
/// | `ARMGUARD_TEMP_WARNING` | `arm.safety.warning_c` |
/// | `ARMGUARD_TEMP_CRITICAL` | `arm.safety.critical_c` |
///
/// Values that do not parse are ignored.
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("ARMGUARD_ARM_ID") {
        cfg.arm_id = v;
    }
    if let Ok(v) = std::env::var("ARMGUARD_DB_PATH") {
        cfg.db_path = v;
    }
    if let Ok(v) = std::env::var("ARMGUARD_POLL_HZ")
        && let Ok(hz) = v.parse::<f64>()
        && hz > 0.0
    {
        cfg.arm.telemetry.poll_rate_hz = hz;
    }
    if let Ok(v) = std::env::var("ARMGUARD_TEMP_WARNING")
        && let Ok(c) = v.parse::<f32>()
    {
        cfg.arm.safety.warning_c = c;
    }
    if let Ok(v) = std::env::var("ARMGUARD_TEMP_CRITICAL")
        && let Ok(c) = v.parse::<f32>()
    {
        cfg.arm.safety.critical_c = c;
    }
}

/// Save the config to disk, creating `~/.armguard/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        // Owner only (rwx------).
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

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).expect("file metadata").permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600, "config file must have 0o600 permissions");

        let dir_meta = std::fs::metadata(path.parent().unwrap()).expect("dir metadata");
        assert_eq!(dir_meta.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let mut cfg = Config::default();
        cfg.arm.calibration.step_size = 25;
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.arm.calibration.step_size, 25);
        assert_eq!(loaded.arm.stall, cfg.arm.stall);
        assert!(loaded.monitor_on_start);
    }

    #[test]
    fn sparse_file_fills_in_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "arm_id = \"bench\"\n\n[arm.stall]\nconfirmations = 3\n").unwrap();

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.arm.stall.confirmations, 3);
        assert_eq!(loaded.arm.stall.position_epsilon, 5);
        assert_eq!(loaded.arm.drift, armguard_runtime::DriftConfig::default());
    }

    #[test]
    fn config_path_points_to_armguard_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".armguard"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "arm_id = [").unwrap();
        assert!(load_from(&path).is_err());
    }

    // Env-var tests each use a variable no other test touches.

    #[test]
    fn apply_env_overrides_changes_arm_id() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("ARMGUARD_ARM_ID", "left-arm") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.arm_id, "left-arm");
        unsafe { std::env::remove_var("ARMGUARD_ARM_ID") };
    }

    #[test]
    fn apply_env_overrides_changes_poll_rate() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("ARMGUARD_POLL_HZ", "25") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.arm.telemetry.poll_rate_hz - 25.0).abs() < f64::EPSILON);
        unsafe { std::env::remove_var("ARMGUARD_POLL_HZ") };
    }

    #[test]
    fn apply_env_overrides_changes_temperature_thresholds() {
        // SAFETY: no other test reads or writes these variables.
        unsafe {
            std::env::set_var("ARMGUARD_TEMP_WARNING", "38.5");
            std::env::set_var("ARMGUARD_TEMP_CRITICAL", "not-a-number");
        }
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert!((cfg.arm.safety.warning_c - 38.5).abs() < f32::EPSILON);
        assert!((cfg.arm.safety.critical_c - 50.0).abs() < f32::EPSILON);
        unsafe {
            std::env::remove_var("ARMGUARD_TEMP_WARNING");
            std::env::remove_var("ARMGUARD_TEMP_CRITICAL");
        }
    }

    #[test]
    fn apply_env_overrides_changes_db_path() {
        // SAFETY: no other test reads or writes this variable.
        unsafe { std::env::set_var("ARMGUARD_DB_PATH", "/tmp/arm.db") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.db_path, "/tmp/arm.db");
        unsafe { std::env::remove_var("ARMGUARD_DB_PATH") };
    }
}
