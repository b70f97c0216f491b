//! Grading image construction.
//!
//! A builder turns an autograder archive plus config overrides into a
//! reusable image reference. The archive may carry a stored autograder
//! configuration; overrides are merged onto it key-by-key (override wins,
//! unspecified keys preserved) and the merged object is persisted into
//! the build context before the image is built.

pub mod docker;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use crate::config::BuilderKind;
use crate::error::BuildError;

pub use docker::DockerImageBuilder;

/// Image name grading images are tagged under.
pub const GRADING_IMAGE_NAME: &str = "grading";

/// Autograder configuration file inside the archive.
pub const AUTOGRADER_CONFIG_FILENAME: &str = "autograder.json";

/// Inputs for one image build.
#[derive(Clone, Debug)]
pub struct BuildRequest {
    /// Dockerfile to build with; copied into the context.
    pub dockerfile: PathBuf,
    /// Autograder zip archive forming the build context.
    pub archive: PathBuf,
    /// Base image the Dockerfile builds from (`BASE_IMAGE` build arg).
    pub base_image: String,
    /// Tag for the produced image.
    pub tag: String,
    /// Overrides merged onto the archive's stored configuration. Must be
    /// a JSON object.
    pub config_overrides: Value,
}

impl BuildRequest {
    /// Full reference of the image this request produces.
    pub fn image(&self) -> String {
        format!("{GRADING_IMAGE_NAME}:{}", self.tag)
    }
}

/// Produces grading images from build requests.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Build the image and return its reference.
    async fn build_image(&self, request: &BuildRequest) -> Result<String, BuildError>;
}

/// Construct the builder for an explicitly named implementation.
pub fn image_builder(kind: BuilderKind) -> Result<Arc<dyn ImageBuilder>, BuildError> {
    Ok(match kind {
        BuilderKind::Local => Arc::new(DockerImageBuilder::from_local_daemon()?),
    })
}

/// Merge `overrides` onto `stored`, key by key. Override values win;
/// keys absent from the overrides keep their stored value.
pub fn merge_overrides(stored: Value, overrides: &Value) -> Value {
    let mut merged = match stored {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    if let Value::Object(overrides) = overrides {
        for (key, value) in overrides {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Extract the archive into a fresh build context, apply the config
/// merge, and place the Dockerfile at the context root.
pub(crate) fn prepare_build_context(request: &BuildRequest) -> Result<TempDir, BuildError> {
    let context = tempfile::Builder::new().prefix("grader-build-").tempdir()?;

    let archive = std::fs::File::open(&request.archive)?;
    zip::ZipArchive::new(archive)?.extract(context.path())?;

    let config_path = context.path().join(AUTOGRADER_CONFIG_FILENAME);
    let stored: Value = if config_path.exists() {
        serde_json::from_str(&std::fs::read_to_string(&config_path)?)?
    } else {
        Value::Object(serde_json::Map::new())
    };
    let merged = merge_overrides(stored, &request.config_overrides);
    std::fs::write(&config_path, serde_json::to_string_pretty(&merged)?)?;

    std::fs::copy(&request.dockerfile, context.path().join("Dockerfile"))?;
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn overrides_win_key_by_key() {
        let stored = json!({ "runs_on": "default", "x": 1 });
        let overrides = json!({ "runs_on": "colab" });
        assert_eq!(
            merge_overrides(stored, &overrides),
            json!({ "runs_on": "colab", "x": 1 })
        );
    }

    #[test]
    fn merge_onto_missing_config_keeps_overrides() {
        let merged = merge_overrides(Value::Null, &json!({ "runs_on": "colab" }));
        assert_eq!(merged, json!({ "runs_on": "colab" }));
    }

    #[test]
    fn unspecified_nested_keys_survive() {
        let stored = json!({ "limits": { "memory": "1G" }, "runs_on": "default" });
        let merged = merge_overrides(stored, &json!({ "runs_on": "colab" }));
        assert_eq!(merged["limits"]["memory"], "1G");
    }

    fn write_archive(dir: &std::path::Path, config: Option<&str>) -> PathBuf {
        let path = dir.join("autograder.zip");
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("requirements.txt", options).unwrap();
        zip.write_all(b"nbconvert\n").unwrap();
        if let Some(config) = config {
            zip.start_file(AUTOGRADER_CONFIG_FILENAME, options).unwrap();
            zip.write_all(config.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    fn request(dir: &std::path::Path, archive: PathBuf) -> BuildRequest {
        let dockerfile = dir.join("Dockerfile");
        std::fs::write(&dockerfile, "ARG BASE_IMAGE\nFROM ${BASE_IMAGE}\n").unwrap();
        BuildRequest {
            dockerfile,
            archive,
            base_image: "ubuntu:24.04".to_string(),
            tag: "hw01".to_string(),
            config_overrides: json!({ "runs_on": "colab" }),
        }
    }

    #[test]
    fn context_merges_stored_config() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), Some(r#"{ "runs_on": "default", "x": 1 }"#));
        let context = prepare_build_context(&request(dir.path(), archive)).unwrap();

        let merged: Value = serde_json::from_str(
            &std::fs::read_to_string(context.path().join(AUTOGRADER_CONFIG_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(merged, json!({ "runs_on": "colab", "x": 1 }));
        assert!(context.path().join("Dockerfile").exists());
        assert!(context.path().join("requirements.txt").exists());
    }

    #[test]
    fn context_synthesizes_config_when_archive_has_none() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), None);
        let context = prepare_build_context(&request(dir.path(), archive)).unwrap();

        let merged: Value = serde_json::from_str(
            &std::fs::read_to_string(context.path().join(AUTOGRADER_CONFIG_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(merged, json!({ "runs_on": "colab" }));
    }

    #[test]
    fn request_image_reference() {
        let dir = tempfile::tempdir().unwrap();
        let archive = write_archive(dir.path(), None);
        assert_eq!(request(dir.path(), archive).image(), "grading:hw01");
    }
}
