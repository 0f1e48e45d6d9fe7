use recon_core::profile::TagError;
use recon_core::{Profile, RecognitionConfig, Tag, TagCatalog};
use recon_hw::CaptureConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid tag catalog: {0}")]
    Tags(#[from] TagError),
}

/// Daemon settings: TOML file, then `RECON_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Euclidean distance below which a match is accepted.
    pub recognition_threshold: f32,
    /// Minimum detector confidence for a face box.
    pub confidence_threshold: f32,
    /// Run recognition on every Nth captured frame.
    pub process_every_n_frames: u32,
    /// V4L2 device path.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Bounded wait per frame before the camera counts as unavailable.
    pub camera_timeout_ms: u64,
    /// Flip frames horizontally before recognition.
    pub mirror_mode: bool,
    /// Minimum seconds between sighting-counter updates per identity.
    pub sighting_debounce_secs: u64,
    /// Seconds without a match before an identity is no longer visible.
    pub inactivity_secs: u64,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Gallery root with one directory per identity.
    pub data_dir: PathBuf,
    pub threat_levels: Vec<Tag>,
    pub status_types: Vec<Tag>,
    pub gender_options: Vec<String>,
    pub default_status: String,
    pub default_threat_level: String,
    pub default_gender: String,
}

impl Default for Settings {
    fn default() -> Self {
        let data_home = data_home();
        Self {
            recognition_threshold: 0.8,
            confidence_threshold: 0.5,
            process_every_n_frames: 2,
            camera_device: "/dev/video0".into(),
            camera_width: 1280,
            camera_height: 720,
            camera_timeout_ms: 2000,
            mirror_mode: true,
            sighting_debounce_secs: 5,
            inactivity_secs: 3,
            model_dir: std::env::var("RECON_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_home.join("models")),
            data_dir: data_home.join("dataset"),
            threat_levels: vec![
                Tag::new("LOW", "#00C864"),
                Tag::new("MODERATE", "#FFA500"),
                Tag::new("HIGH", "#FF4444"),
                Tag::new("CRITICAL", "#8B0000"),
            ],
            status_types: vec![
                Tag::new("CIVILIAN", "#6C757D"),
                Tag::new("VIP", "#FFD700"),
                Tag::new("EMPLOYEE", "#0096FF"),
                Tag::new("VISITOR", "#9370DB"),
                Tag::new("WANTED", "#DC143C"),
                Tag::new("UNKNOWN", "#808080"),
            ],
            gender_options: vec![
                "Male".into(),
                "Female".into(),
                "Other".into(),
                "Prefer not to say".into(),
            ],
            default_status: "CIVILIAN".into(),
            default_threat_level: "LOW".into(),
            default_gender: "Male".into(),
        }
    }
}

/// `$XDG_DATA_HOME/recon`, falling back to `~/.local/share/recon`.
fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("recon")
}

impl Settings {
    /// `$RECON_SETTINGS`, else `$XDG_CONFIG_HOME/recon/settings.toml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RECON_SETTINGS") {
            return PathBuf::from(path);
        }
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("recon")
            .join("settings.toml")
    }

    /// Load `path` (missing file = all defaults), then apply overrides from `env`.
    pub fn load_from(
        path: &Path,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut settings = match std::fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no settings file; using defaults");
                Settings::default()
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        settings.apply_env(env);
        // Validate the catalogs up front so a bad file is reported at load.
        settings.tag_catalog()?;
        Ok(settings)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        override_with(&env, "RECON_RECOGNITION_THRESHOLD", &mut self.recognition_threshold);
        override_with(&env, "RECON_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        override_with(&env, "RECON_PROCESS_EVERY_N_FRAMES", &mut self.process_every_n_frames);
        override_with(&env, "RECON_CAMERA_DEVICE", &mut self.camera_device);
        override_with(&env, "RECON_CAMERA_WIDTH", &mut self.camera_width);
        override_with(&env, "RECON_CAMERA_HEIGHT", &mut self.camera_height);
        override_with(&env, "RECON_CAMERA_TIMEOUT_MS", &mut self.camera_timeout_ms);
        override_with(&env, "RECON_SIGHTING_DEBOUNCE_SECS", &mut self.sighting_debounce_secs);
        override_with(&env, "RECON_INACTIVITY_SECS", &mut self.inactivity_secs);
        override_with(&env, "RECON_MODEL_DIR", &mut self.model_dir);
        override_with(&env, "RECON_DATA_DIR", &mut self.data_dir);
        if let Some(v) = env("RECON_MIRROR_MODE") {
            self.mirror_mode = !matches!(v.trim(), "0" | "false" | "no" | "off");
        }
    }

    pub fn recognition_config(&self) -> RecognitionConfig {
        RecognitionConfig {
            detection_confidence: self.confidence_threshold,
            match_threshold: self.recognition_threshold,
            frame_stride: self.process_every_n_frames.max(1),
            debounce: Duration::from_secs(self.sighting_debounce_secs),
            inactivity: Duration::from_secs(self.inactivity_secs),
        }
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            device: self.camera_device.clone(),
            width: self.camera_width,
            height: self.camera_height,
            timeout: Duration::from_millis(self.camera_timeout_ms.max(1)),
        }
    }

    pub fn tag_catalog(&self) -> Result<TagCatalog, TagError> {
        TagCatalog::new(
            self.status_types.clone(),
            self.threat_levels.clone(),
            self.gender_options.clone(),
        )
    }

    /// Fill blank tag fields of a submitted profile with the configured defaults.
    pub fn apply_profile_defaults(&self, profile: &mut Profile) {
        if profile.status.trim().is_empty() {
            profile.status = self.default_status.clone();
        }
        if profile.threat_level.trim().is_empty() {
            profile.threat_level = self.default_threat_level.clone();
        }
        if profile.gender.trim().is_empty() {
            profile.gender = self.default_gender.clone();
        }
    }

    /// Parse a submitted profile, filling absent or blank tags with the
    /// configured defaults.
    pub fn profile_from_json(&self, json: &str) -> Result<Profile, serde_json::Error> {
        let mut value: serde_json::Value = serde_json::from_str(json)?;
        if let Some(fields) = value.as_object_mut() {
            // Absent gender would otherwise deserialize to the record's "Unknown".
            fields
                .entry("gender")
                .or_insert_with(|| serde_json::Value::String(String::new()));
        }
        let mut profile: Profile = serde_json::from_value(value)?;
        self.apply_profile_defaults(&mut profile);
        Ok(profile)
    }
}

/// Replace `slot` with the parsed value of `key`; unparsable values are ignored
/// with a warning.
fn override_with<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = env(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(&dir.path().join("absent.toml"), no_env).unwrap();
        assert_eq!(settings.recognition_threshold, 0.8);
        assert_eq!(settings.process_every_n_frames, 2);
        assert_eq!(settings.camera_timeout_ms, 2000);
        assert_eq!(settings.status_types.len(), 6);
        assert!(settings.mirror_mode);
    }

    #[test]
    fn test_partial_file_merges_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r##"
recognition_threshold = 0.6
camera_device = "/dev/video4"

[[status_types]]
name = "CONTRACTOR"
color = "#123456"
"##,
        )
        .unwrap();

        let settings = Settings::load_from(&path, no_env).unwrap();
        assert_eq!(settings.recognition_threshold, 0.6);
        assert_eq!(settings.camera_device, "/dev/video4");
        assert_eq!(settings.confidence_threshold, 0.5);
        assert_eq!(settings.status_types, vec![Tag::new("CONTRACTOR", "#123456")]);
        assert_eq!(settings.threat_levels.len(), 4);
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "process_every_n_frames = 3\nmirror_mode = true\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("RECON_PROCESS_EVERY_N_FRAMES", "5"),
            ("RECON_MIRROR_MODE", "0"),
            ("RECON_RECOGNITION_THRESHOLD", "not-a-number"),
            ("RECON_DATA_DIR", "/srv/recon"),
        ]
        .into_iter()
        .collect();
        let settings =
            Settings::load_from(&path, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(settings.process_every_n_frames, 5);
        assert!(!settings.mirror_mode);
        assert_eq!(settings.recognition_threshold, 0.8);
        assert_eq!(settings.data_dir, PathBuf::from("/srv/recon"));
    }

    #[test]
    fn test_invalid_toml_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "recognition_threshold = \"high\"").unwrap();
        assert!(matches!(
            Settings::load_from(&path, no_env),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_blank_tag_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "gender_options = [\"Male\", \"  \"]").unwrap();
        assert!(matches!(
            Settings::load_from(&path, no_env),
            Err(ConfigError::Tags(_))
        ));
    }

    #[test]
    fn test_derived_configs() {
        let settings = Settings {
            process_every_n_frames: 0,
            sighting_debounce_secs: 7,
            camera_timeout_ms: 500,
            ..Settings::default()
        };
        let recognition = settings.recognition_config();
        assert_eq!(recognition.frame_stride, 1);
        assert_eq!(recognition.debounce, Duration::from_secs(7));
        assert_eq!(recognition.match_threshold, 0.8);

        let capture = settings.capture_config();
        assert_eq!(capture.timeout, Duration::from_millis(500));
        assert_eq!((capture.width, capture.height), (1280, 720));
    }

    #[test]
    fn test_profile_defaults_fill_blanks_only() {
        let settings = Settings::default();
        let mut profile = Profile::new("ivy");
        profile.status = "VIP".into();
        profile.gender = String::new();
        settings.apply_profile_defaults(&mut profile);
        assert_eq!(profile.status, "VIP");
        assert_eq!(profile.threat_level, "LOW");
        assert_eq!(profile.gender, "Male");
    }

    #[test]
    fn test_submitted_profile_without_gender_gets_default() {
        let settings = Settings {
            default_gender: "Female".into(),
            ..Settings::default()
        };
        let profile = settings.profile_from_json(r#"{"name": "ivy"}"#).unwrap();
        assert_eq!(profile.gender, "Female");
        assert_eq!(profile.status, "CIVILIAN");
        assert_eq!(profile.threat_level, "LOW");
        assert_eq!(profile.occupation, "Unknown");

        let explicit = settings
            .profile_from_json(r#"{"name": "ivy", "gender": "Other"}"#)
            .unwrap();
        assert_eq!(explicit.gender, "Other");
        assert!(settings.profile_from_json(r#"{"gender": "Other"}"#).is_err());
    }
}
