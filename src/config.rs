use std::fs;
use std::time::Duration;

use camino::Utf8PathBuf;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::classify::ClassifyPatterns;
use crate::error::IngestError;
use crate::trajectory::TrajectoryPatterns;

pub const CONFIG_FILENAME: &str = "mdingest.json";
pub const STORE_URL_ENV: &str = "MDINGEST_STORE_URL";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub trajectory: TrajectorySection,
    #[serde(default)]
    pub annotation: AnnotationSection,
    #[serde(default)]
    pub classify: ClassifySection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StoreSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UploadSection {
    #[serde(default)]
    pub read_chunk_bytes: Option<usize>,
    #[serde(default)]
    pub sink_queue_depth: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TrajectorySection {
    #[serde(default)]
    pub dump_command: Option<Vec<String>>,
    #[serde(default)]
    pub frame_pattern: Option<String>,
    #[serde(default)]
    pub coordinate_pattern: Option<String>,
    #[serde(default)]
    pub scale: Option<f32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AnnotationSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub abort_poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ClassifySection {
    #[serde(default)]
    pub structure: Option<String>,
    #[serde(default)]
    pub topology: Option<String>,
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub references: Option<String>,
    #[serde(default)]
    pub project_files: Option<String>,
    #[serde(default)]
    pub trajectories: Option<String>,
    #[serde(default)]
    pub analyses: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadSettings {
    pub read_chunk_bytes: usize,
    pub sink_queue_depth: usize,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            read_chunk_bytes: 1024 * 1024,
            sink_queue_depth: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrajectorySettings {
    pub dump_command: Vec<String>,
    pub patterns: TrajectoryPatterns,
}

#[derive(Debug, Clone)]
pub struct AnnotationSettings {
    pub url: String,
    pub email: String,
    pub poll_interval: Duration,
    pub abort_poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub store: StoreSettings,
    pub upload: UploadSettings,
    pub trajectory: TrajectorySettings,
    pub annotation: AnnotationSettings,
    pub classify: ClassifyPatterns,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads `path`, or `mdingest.json` from the working directory when present.
    /// Without either, defaults apply.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, IngestError> {
        let config_path = match path {
            Some(path) => Utf8PathBuf::from(path),
            None => Utf8PathBuf::from(CONFIG_FILENAME),
        };

        let mut config = if path.is_none() && !config_path.as_std_path().exists() {
            Config::default()
        } else {
            let content = fs::read_to_string(config_path.as_std_path())
                .map_err(|_| IngestError::ConfigRead(config_path.clone()))?;
            serde_json::from_str(&content)
                .map_err(|err| IngestError::ConfigParse(err.to_string()))?
        };

        if let Ok(url) = std::env::var(STORE_URL_ENV) {
            if !url.trim().is_empty() {
                config.store.url = Some(url);
            }
        }

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, IngestError> {
        if let Some(version) = config.schema_version
            && version != SCHEMA_VERSION
        {
            return Err(IngestError::ConfigParse(format!(
                "unsupported schema_version {version}, expected {SCHEMA_VERSION}"
            )));
        }

        let upload_defaults = UploadSettings::default();
        let upload = UploadSettings {
            read_chunk_bytes: config
                .upload
                .read_chunk_bytes
                .filter(|size| *size > 0)
                .unwrap_or(upload_defaults.read_chunk_bytes),
            sink_queue_depth: config
                .upload
                .sink_queue_depth
                .filter(|depth| *depth > 0)
                .unwrap_or(upload_defaults.sink_queue_depth),
        };

        let mut patterns = TrajectoryPatterns::default();
        if let Some(pattern) = config.trajectory.frame_pattern.as_deref() {
            patterns.frame = compile(pattern)?;
        }
        if let Some(pattern) = config.trajectory.coordinate_pattern.as_deref() {
            patterns.coordinate = compile(pattern)?;
        }
        if let Some(scale) = config.trajectory.scale {
            patterns.scale = scale;
        }
        let trajectory = TrajectorySettings {
            dump_command: config
                .trajectory
                .dump_command
                .filter(|command| !command.is_empty())
                .unwrap_or_else(default_dump_command),
            patterns,
        };

        let annotation = AnnotationSettings {
            url: config
                .annotation
                .url
                .unwrap_or_else(|| DEFAULT_ANNOTATION_URL.to_string()),
            email: config
                .annotation
                .email
                .unwrap_or_else(|| "mdingest@localhost".to_string()),
            poll_interval: Duration::from_secs(config.annotation.poll_interval_secs.unwrap_or(5)),
            abort_poll_interval: Duration::from_secs(
                config.annotation.abort_poll_interval_secs.unwrap_or(1).max(1),
            ),
        };

        let section = config.classify;
        let mut classify = ClassifyPatterns::default();
        let overrides = [
            (section.structure, &mut classify.structure),
            (section.topology, &mut classify.topology),
            (section.metadata, &mut classify.metadata),
            (section.references, &mut classify.references),
            (section.project_files, &mut classify.project_files),
            (section.trajectories, &mut classify.trajectories),
            (section.analyses, &mut classify.analyses),
        ];
        for (pattern, slot) in overrides {
            if let Some(pattern) = pattern {
                *slot = compile(&pattern)?;
            }
        }

        Ok(ResolvedConfig {
            store: StoreSettings {
                url: config.store.url.filter(|url| !url.trim().is_empty()),
                timeout: Duration::from_secs(config.store.timeout_secs.unwrap_or(30)),
            },
            upload,
            trajectory,
            annotation,
            classify,
        })
    }
}

pub const DEFAULT_ANNOTATION_URL: &str = "https://www.ebi.ac.uk/Tools/services/rest/iprscan5";

pub fn default_dump_command() -> Vec<String> {
    vec![
        "gmx".to_string(),
        "dump".to_string(),
        "-f".to_string(),
        "{input}".to_string(),
    ]
}

pub(crate) fn compile(pattern: &str) -> Result<Regex, IngestError> {
    Regex::new(pattern).map_err(|err| IngestError::InvalidPattern {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_apply_to_empty_config() {
        let resolved = ConfigLoader::resolve_config(Config::default()).unwrap();
        assert_eq!(resolved.upload.read_chunk_bytes, 1024 * 1024);
        assert_eq!(resolved.trajectory.dump_command, default_dump_command());
        assert_eq!(resolved.annotation.abort_poll_interval, Duration::from_secs(1));
        assert!(resolved.store.url.is_none());
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let mut config = Config::default();
        config.trajectory.frame_pattern = Some("(".to_string());
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, IngestError::InvalidPattern { .. });
    }
}
