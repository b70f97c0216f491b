//! Local Docker image builder.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::image::BuildImageOptions;
use bollard::Docker;
use futures::StreamExt;
use tracing::{debug, info};

use crate::builder::{prepare_build_context, BuildRequest, ImageBuilder};
use crate::error::BuildError;

/// Builds grading images against the local daemon.
#[derive(Clone, Debug)]
pub struct DockerImageBuilder {
    docker: Docker,
}

impl DockerImageBuilder {
    pub fn from_local_daemon() -> Result<Self, BuildError> {
        Ok(Self {
            docker: Docker::connect_with_local_defaults()?,
        })
    }

    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build_image(&self, request: &BuildRequest) -> Result<String, BuildError> {
        let image = request.image();
        info!(image = %image, base_image = %request.base_image, "building grading image");

        let context = prepare_build_context(request)?;
        let mut builder = tar::Builder::new(Vec::new());
        builder.append_dir_all(".", context.path())?;
        let body = builder.into_inner()?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: image.clone(),
            buildargs: HashMap::from([(
                "BASE_IMAGE".to_string(),
                request.base_image.clone(),
            )]),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(body.into()));
        while let Some(message) = stream.next().await {
            let info = message?;
            if let Some(error) = info.error {
                return Err(BuildError::Build(error));
            }
            if let Some(line) = info.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(image = %image, "{line}");
                }
            }
        }

        info!(image = %image, "grading image built");
        Ok(image)
    }
}
