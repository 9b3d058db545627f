//! [`ImageBuilder`] over the native OCI layout writer.

use std::path::PathBuf;

use async_trait::async_trait;
use lre_core::{ProvisionError, Result};
use lre_oci::{BuildRequest, BuiltImage, OciImageBuilder};

use super::ImageBuilder;

#[async_trait]
impl ImageBuilder for OciImageBuilder {
    async fn build(&self, request: BuildRequest, layout_dir: PathBuf) -> Result<BuiltImage> {
        let builder = self.clone();
        let built = tokio::task::spawn_blocking(move || builder.build(&request, &layout_dir))
            .await
            .map_err(|e| ProvisionError::Image(format!("image build task failed: {e}")))??;
        Ok(built)
    }
}
