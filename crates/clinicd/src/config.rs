use anyhow::{ensure, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration: defaults, then an optional TOML file, then
/// `CLINIC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Path to the face encoding key.
    pub key_path: PathBuf,
    /// Cosine similarity threshold for a positive match.
    pub similarity_threshold: f32,
    /// Seconds between recognition attempts.
    pub recognition_interval_secs: u64,
    /// Seconds a recognised patient stays displayed after the face is lost.
    pub display_hold_secs: u64,
    /// Seconds before the same patient can be checked in again.
    pub revisit_cooldown_secs: u64,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    /// Frames captured per recognition attempt.
    pub frames_per_attempt: usize,
    /// Frames captured per registration.
    pub frames_per_register: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 1280,
            camera_height: 720,
            model_dir: clinic_core::default_model_dir(),
            db_path: clinic_store::default_db_path(),
            key_path: clinic_store::default_key_path(),
            similarity_threshold: clinic_core::DEFAULT_SIMILARITY_THRESHOLD,
            recognition_interval_secs: 2,
            display_hold_secs: 5,
            revisit_cooldown_secs: 300,
            warmup_frames: 4,
            frames_per_attempt: 3,
            frames_per_register: 5,
        }
    }
}

impl Config {
    /// Load the layered configuration for this process.
    pub fn load() -> Result<Self> {
        let path = config_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let config = Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?;
            tracing::info!(path = %path.display(), "loaded config file");
            config
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            clinic_core::is_valid_threshold(self.similarity_threshold),
            "similarity_threshold must be in (0, 1], got {}",
            self.similarity_threshold
        );
        Ok(())
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `CLINIC_*` variables; unparsable values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("CLINIC_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = get("CLINIC_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CLINIC_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("CLINIC_KEY_PATH") {
            self.key_path = PathBuf::from(v);
        }

        override_parsed(&mut self.camera_width, get("CLINIC_CAMERA_WIDTH"));
        override_parsed(&mut self.camera_height, get("CLINIC_CAMERA_HEIGHT"));
        let threshold = get("CLINIC_SIMILARITY_THRESHOLD");
        match threshold.as_deref().map(|v| v.trim().parse::<f32>()) {
            Some(Ok(t)) if clinic_core::is_valid_threshold(t) => self.similarity_threshold = t,
            Some(_) => tracing::warn!(
                value = threshold.as_deref().unwrap_or_default(),
                "ignoring CLINIC_SIMILARITY_THRESHOLD outside (0, 1]"
            ),
            None => {}
        }
        override_parsed(&mut self.recognition_interval_secs, get("CLINIC_RECOGNITION_INTERVAL_SECS"));
        override_parsed(&mut self.display_hold_secs, get("CLINIC_DISPLAY_HOLD_SECS"));
        override_parsed(&mut self.revisit_cooldown_secs, get("CLINIC_REVISIT_COOLDOWN_SECS"));
        override_parsed(&mut self.warmup_frames, get("CLINIC_WARMUP_FRAMES"));
        override_parsed(&mut self.frames_per_attempt, get("CLINIC_FRAMES_PER_ATTEMPT"));
        override_parsed(&mut self.frames_per_register, get("CLINIC_FRAMES_PER_REGISTER"));
    }

    pub fn recognition_interval(&self) -> Duration {
        Duration::from_secs(self.recognition_interval_secs.max(1))
    }

    pub fn display_hold(&self) -> Duration {
        Duration::from_secs(self.display_hold_secs)
    }

    pub fn revisit_cooldown(&self) -> Duration {
        Duration::from_secs(self.revisit_cooldown_secs)
    }
}

fn override_parsed<T: FromStr>(field: &mut T, value: Option<String>) {
    if let Some(parsed) = value.and_then(|v| v.trim().parse().ok()) {
        *field = parsed;
    }
}

/// `$CLINIC_CONFIG`, else `$XDG_CONFIG_HOME/clinic/clinicd.toml`.
fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("CLINIC_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            Path::new(&home).join(".config")
        })
        .join("clinic")
        .join("clinicd.toml")
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.recognition_interval(), Duration::from_secs(2));
        assert_eq!(config.display_hold(), Duration::from_secs(5));
    }

    #[test]
    fn test_toml_overrides_some_fields() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video2"
            similarity_threshold = 0.45
            frames_per_attempt = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video2");
        assert_eq!(config.similarity_threshold, 0.45);
        assert_eq!(config.frames_per_attempt, 5);
        assert_eq!(config.camera_width, 1280);
    }

    #[test]
    fn test_toml_rejects_unknown_key() {
        assert!(Config::from_toml("camera = \"/dev/video0\"").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::from_toml("similarity_threshold = 0.45").unwrap();
        config.apply_env(lookup(&[
            ("CLINIC_SIMILARITY_THRESHOLD", "0.7"),
            ("CLINIC_DB_PATH", "/var/lib/clinic/clinic.db"),
            ("CLINIC_RECOGNITION_INTERVAL_SECS", "3"),
        ]));
        assert_eq!(config.similarity_threshold, 0.7);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/clinic/clinic.db"));
        assert_eq!(config.recognition_interval_secs, 3);
    }

    #[test]
    fn test_malformed_env_keeps_previous_value() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("CLINIC_SIMILARITY_THRESHOLD", "high"),
            ("CLINIC_WARMUP_FRAMES", "-1"),
            ("CLINIC_CAMERA_DEVICE", ""),
        ]));
        assert_eq!(config.similarity_threshold, 0.6);
        assert_eq!(config.warmup_frames, 4);
        assert_eq!(config.camera_device, "/dev/video0");
    }

    #[test]
    fn test_out_of_range_env_threshold_ignored() {
        for bad in ["NaN", "1.5", "0", "-0.2"] {
            let mut config = Config::default();
            config.apply_env(lookup(&[("CLINIC_SIMILARITY_THRESHOLD", bad)]));
            assert_eq!(config.similarity_threshold, 0.6, "accepted {bad}");
        }
        let mut config = Config::default();
        config.apply_env(lookup(&[("CLINIC_SIMILARITY_THRESHOLD", "1.0")]));
        assert_eq!(config.similarity_threshold, 1.0);
    }

    #[test]
    fn test_validate_threshold() {
        assert!(Config::default().validate().is_ok());
        let config = Config::from_toml("similarity_threshold = 1.5").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("similarity_threshold"), "{err}");
        let config = Config::from_toml("similarity_threshold = 0.0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_clamped() {
        let config = Config {
            recognition_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.recognition_interval(), Duration::from_secs(1));
    }
}
