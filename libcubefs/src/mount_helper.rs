//! Invocation of the external CubeFS FUSE client.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, instrument};

use crate::error::CsiError;

/// Mounts a volume described by a persisted client configuration file.
#[async_trait]
pub trait MountHelper: Send + Sync {
    async fn mount(&self, config_file: &Path) -> Result<(), CsiError>;
}

/// Runs `<binary> -c <config_file>` and waits for it to exit.
#[derive(Debug, Clone)]
pub struct CfsClient {
    binary: PathBuf,
}

impl CfsClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl MountHelper for CfsClient {
    #[instrument(skip(self), fields(binary = %self.binary.display()))]
    async fn mount(&self, config_file: &Path) -> Result<(), CsiError> {
        let failed = |reason: String| CsiError::MountFailed {
            path: config_file.display().to_string(),
            reason,
        };

        let output = Command::new(&self.binary)
            .arg("-c")
            .arg(config_file)
            .output()
            .await
            .map_err(|e| failed(format!("spawn {}: {e}", self.binary.display())))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        info!(status = %output.status, output = %combined.trim(), "cfs-client finished");

        if !output.status.success() {
            return Err(failed(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                combined.trim()
            )));
        }
        Ok(())
    }
}
