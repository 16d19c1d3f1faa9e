//! Configuration file support for detexport
//!
//! # Config File Locations
//!
//! Searched in order:
//! 1. Path given via `--config`
//! 2. `./detexport.toml`
//! 3. `./.detexport.toml`
//! 4. `~/.config/detexport/config.toml`
//!
//! # Example Config File
//!
//! ```toml
//! [export]
//! model = "yolov8n.safetensors"
//! imgsz = [640, 640]
//! nms = true
//! simplify = true
//! iou = 0.6
//! max_det = 100
//! ```

use crate::export::{ExportFormat, ExportOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration; accepts an `[export]` section or direct keys
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct RootConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    export: Option<ExportConfig>,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    direct: Option<ExportConfig>,
}

/// Export settings loaded from TOML
///
/// All fields are optional. CLI arguments override config file values.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ExportConfig {
    /// Checkpoint to export
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<ExportFormat>,

    /// `[height, width]`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub imgsz: Option<(usize, usize)>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nms: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub simplify: Option<bool>,

    /// NMS IoU threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iou: Option<f32>,

    /// NMS score threshold
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conf: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_det: Option<usize>,

    /// Artifact path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Values given on the command line; `None` defers to the config file
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub format: Option<ExportFormat>,
    pub imgsz: Option<(usize, usize)>,
    pub batch: Option<usize>,
    pub nms: Option<bool>,
    pub dynamic: Option<bool>,
    pub simplify: Option<bool>,
    pub iou: Option<f32>,
    pub conf: Option<f32>,
    pub max_det: Option<usize>,
    pub output: Option<PathBuf>,
}

impl ExportConfig {
    /// Load config from a TOML file, preferring the `[export]` section
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let root: RootConfig = toml::from_str(&contents).map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))?;
        Ok(root.export.or(root.direct).unwrap_or_default())
    }

    /// Find and load a config file from the standard locations
    ///
    /// Returns `None` if no config file is found.
    pub fn find_and_load() -> Result<Option<Self>, ConfigError> {
        for candidate in ["./detexport.toml", "./.detexport.toml"] {
            let path = PathBuf::from(candidate);
            if path.exists() {
                return Ok(Some(Self::load(&path)?));
            }
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".config/detexport/config.toml");
            if user_config.exists() {
                return Ok(Some(Self::load(&user_config)?));
            }
        }

        Ok(None)
    }

    /// Save config to a TOML file under an `[export]` section
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let root = RootConfig {
            export: Some(self.clone()),
            direct: None,
        };
        let contents = toml::to_string_pretty(&root).map_err(ConfigError::SerializeError)?;
        std::fs::write(path.as_ref(), contents).map_err(|e| ConfigError::IoError(path.as_ref().to_path_buf(), e))?;
        Ok(())
    }

    /// Merge with CLI arguments (CLI args take precedence)
    pub fn merge_with_cli(&self, cli: CliOverrides) -> ExportOptions {
        let defaults = ExportOptions::default();
        ExportOptions {
            format: cli.format.or(self.format).unwrap_or(defaults.format),
            imgsz: cli.imgsz.or(self.imgsz).unwrap_or(defaults.imgsz),
            batch: cli.batch.or(self.batch).unwrap_or(defaults.batch),
            nms: cli.nms.or(self.nms).unwrap_or(defaults.nms),
            dynamic: cli.dynamic.or(self.dynamic).unwrap_or(defaults.dynamic),
            simplify: cli.simplify.or(self.simplify).unwrap_or(defaults.simplify),
            iou: cli.iou.or(self.iou).unwrap_or(defaults.iou),
            conf: cli.conf.or(self.conf).unwrap_or(defaults.conf),
            max_det: cli.max_det.or(self.max_det).unwrap_or(defaults.max_det),
            output: cli.output.or_else(|| self.output.clone()),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, #[source] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[source] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_sectioned_format() {
        let file = write_config(
            r#"
            [other-tool]
            setting = "value"

            [export]
            imgsz = [480, 640]
            nms = true
            iou = 0.5
            "#,
        );
        let config = ExportConfig::load(file.path()).unwrap();
        assert_eq!(config.imgsz, Some((480, 640)));
        assert_eq!(config.nms, Some(true));
        assert_eq!(config.iou, Some(0.5));
        assert_eq!(config.simplify, None);
    }

    #[test]
    fn test_direct_format() {
        let file = write_config(
            r#"
            format = "onnx"
            simplify = true
            max_det = 100
            "#,
        );
        let config = ExportConfig::load(file.path()).unwrap();
        assert_eq!(config.format, Some(ExportFormat::Onnx));
        assert_eq!(config.simplify, Some(true));
        assert_eq!(config.max_det, Some(100));
    }

    #[test]
    fn test_invalid_toml() {
        let file = write_config(
            r#"
            [export]
            batch = "one"
            "#,
        );
        let err = ExportConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(..)));
    }

    #[test]
    fn test_missing_file() {
        let err = ExportConfig::load("/nonexistent/detexport.toml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(..)));
    }

    #[test]
    fn test_save_and_load_config() {
        let original = ExportConfig {
            imgsz: Some((320, 320)),
            nms: Some(true),
            conf: Some(0.4),
            output: Some(PathBuf::from("out/model.onnx")),
            ..Default::default()
        };
        let file = NamedTempFile::new().unwrap();
        original.save(file.path()).unwrap();
        assert_eq!(ExportConfig::load(file.path()).unwrap(), original);
    }

    #[test]
    fn test_merge_with_cli() {
        let config = ExportConfig {
            imgsz: Some((320, 320)),
            nms: Some(true),
            iou: Some(0.5),
            ..Default::default()
        };
        let options = config.merge_with_cli(CliOverrides {
            imgsz: Some((640, 480)),
            simplify: Some(true),
            ..Default::default()
        });
        assert_eq!(options.imgsz, (640, 480));
        assert!(options.nms);
        assert!(options.simplify);
        assert_eq!(options.iou, 0.5);
        assert_eq!(options.conf, 0.25);
        assert_eq!(options.max_det, 300);
    }

    #[test]
    fn test_merge_with_defaults() {
        let options = ExportConfig::default().merge_with_cli(CliOverrides::default());
        assert_eq!(options, ExportOptions::default());
    }
}
