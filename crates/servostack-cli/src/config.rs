//! Reads `~/.servostack/config.toml` (or `$SERVOSTACK_CONFIG`).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use servostack_runtime::{ServoConfig, StackConfig};
use servostack_types::StackError;

/// The simulated cell the CLI drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Height of the table top in the base frame.
    pub table_height: f32,
    /// Edge lengths of every box; the third entry should match
    /// `stack.object_height`.
    pub object_dimensions: [f32; 3],
    /// `[x, y]` of each box on the table.
    pub objects: Vec<[f32; 2]>,
    /// Error the tracker adds to every reported position.
    pub tracker_offset: [f32; 3],
    /// Where the end effector starts.
    pub start_position: [f32; 3],
    /// Radius of the planner's reach sphere around the base.
    pub reach_radius: f32,
    pub vision_period_ms: u64,
    pub tracker_period_ms: u64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            table_height: -0.13,
            object_dimensions: [0.05, 0.05, 0.06],
            objects: vec![[0.62, 0.08], [0.70, -0.02], [0.52, 0.22]],
            tracker_offset: [0.012, -0.01, 0.0],
            start_position: [0.6, 0.0, 0.15],
            reach_radius: 1.2,
            vision_period_ms: 20,
            tracker_period_ms: 200,
        }
    }
}

/// Everything the CLI reads at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub servo: ServoConfig,
    pub stack: StackConfig,
    pub sim: SimConfig,
}

impl Config {
    /// # Errors
    ///
    /// [`StackError::Config`] for the first invalid field.
    pub fn validate(&self) -> Result<(), StackError> {
        self.servo.validate()?;
        self.stack.validate()?;
        if self.sim.vision_period_ms == 0 || self.sim.tracker_period_ms == 0 {
            return Err(StackError::Config(
                "sim periods must be at least 1 ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// `$SERVOSTACK_CONFIG` if set, else `~/.servostack/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("SERVOSTACK_CONFIG") {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".servostack").join("config.toml")
}

/// Load `path` (or [`config_path`]), apply environment overrides and
/// validate.  A missing file yields the defaults.
///
/// # Errors
///
/// [`StackError::Config`] when the file cannot be read or parsed, or the
/// result is invalid.
pub fn load(path: Option<&Path>) -> Result<Config, StackError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);
    let mut cfg = load_from(&path)?.unwrap_or_default();
    apply_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg.validate()?;
    Ok(cfg)
}

/// Parse `path`.  `Ok(None)` when the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, StackError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        StackError::Config(format!("failed to read {}: {e}", path.display()))
    })?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| StackError::Config(format!("failed to parse {}: {e}", path.display())))
}

/// Apply `SERVOSTACK_*` overrides, reading each variable through `lookup`.
/// Unparseable values are ignored.
///
/// | Variable | Field |
/// |---|---|
/// | `SERVOSTACK_SERVO_SPEED` | `servo.servo_speed` |
/// | `SERVOSTACK_MIN_POSE_HEIGHT` | `servo.min_pose_height` |
/// | `SERVOSTACK_MIN_RANGE_DEPTH` | `servo.min_range_depth` |
/// | `SERVOSTACK_OBJECT_HEIGHT` | `stack.object_height` |
pub fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let overrides: [(&str, &mut f32); 4] = [
        ("SERVOSTACK_SERVO_SPEED", &mut cfg.servo.servo_speed),
        ("SERVOSTACK_MIN_POSE_HEIGHT", &mut cfg.servo.min_pose_height),
        ("SERVOSTACK_MIN_RANGE_DEPTH", &mut cfg.servo.min_range_depth),
        ("SERVOSTACK_OBJECT_HEIGHT", &mut cfg.stack.object_height),
    ];
    for (name, field) in overrides {
        if let Some(v) = lookup(name)
            && let Ok(value) = v.trim().parse::<f32>()
        {
            *field = value;
        }
    }
}

/// Pretty TOML of `cfg`, for `--print-config`.
///
/// # Errors
///
/// [`StackError::Config`] if serialisation fails.
pub fn to_toml(cfg: &Config) -> Result<String, StackError> {
    toml::to_string_pretty(cfg).map_err(|e| StackError::Config(format!("serialise config: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).unwrap().is_none());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[servo]\nservo_speed = 0.02\n\n[stack]\nstack_xy = [0.4, -0.3]\n",
        )
        .unwrap();

        let cfg = load_from(&path).unwrap().expect("some");
        assert_eq!(cfg.servo.servo_speed, 0.02);
        assert_eq!(cfg.servo.min_range_depth, 0.02);
        assert_eq!(cfg.stack.stack_xy, [0.4, -0.3]);
        assert_eq!(cfg.stack.object_height, 0.06);
        assert_eq!(cfg.sim, SimConfig::default());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[servo\nservo_speed = ").unwrap();
        assert!(matches!(load_from(&path), Err(StackError::Config(_))));
    }

    #[test]
    fn printed_config_parses_back() {
        let text = to_toml(&Config::default()).unwrap();
        let cfg: Config = toml::from_str(&text).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn invalid_values_fail_load() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[stack]\nobject_height = 0.0\n").unwrap();
        assert!(matches!(load(Some(&path)), Err(StackError::Config(_))));
    }

    #[test]
    fn config_path_points_to_servostack_dir() {
        let p = config_path_for_home("/home/operator");
        assert!(p.to_string_lossy().contains(".servostack"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn override_changes_servo_speed() {
        let env = vars(&[("SERVOSTACK_SERVO_SPEED", " 0.005 ")]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, |name| env.get(name).cloned());
        assert_eq!(cfg.servo.servo_speed, 0.005);
        assert_eq!(cfg.stack.object_height, 0.06);
    }

    #[test]
    fn override_ignores_garbage() {
        let env = vars(&[
            ("SERVOSTACK_OBJECT_HEIGHT", "tall"),
            ("SERVOSTACK_MIN_RANGE_DEPTH", "0.03"),
        ]);
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, |name| env.get(name).cloned());
        assert_eq!(cfg.stack.object_height, 0.06);
        assert_eq!(cfg.servo.min_range_depth, 0.03);
    }

    #[test]
    fn no_overrides_keeps_file_values() {
        let mut cfg = Config::default();
        cfg.servo.min_pose_height = -0.2;
        apply_overrides(&mut cfg, |_| None);
        assert_eq!(cfg.servo.min_pose_height, -0.2);
        assert_eq!(cfg.servo.servo_speed, ServoConfig::default().servo_speed);
    }

    #[test]
    fn default_servo_run_is_bounded() {
        let cfg = Config::default();
        assert!(cfg.stack.servo_timeout().is_some());
        assert!(cfg.servo.servo_speed < 0.005);
    }
}
