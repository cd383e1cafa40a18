//! Persists the configuration file consumed by the CubeFS mount helper.
//!
//! The file is the only contract with the helper, which is invoked with
//! nothing but its path.  It is created read-only (`0444`); a file left by an
//! earlier stage of the same volume is replaced.

use std::io;
use std::path::PathBuf;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::descriptor::VolumeDescriptor;
use crate::error::CsiError;

const CONF_FILE_MODE: u32 = 0o444;

/// Write the client configuration for `desc` mounted at `mount_point` and
/// return its path.
pub async fn persist(desc: &VolumeDescriptor, mount_point: &str) -> Result<PathBuf, CsiError> {
    if let Err(e) = tokio::fs::create_dir_all(&desc.log_dir).await {
        warn!(log_dir = %desc.log_dir.display(), error = %e, "failed to create client log dir");
    }

    let path = &desc.config_file_path;
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| CsiError::Internal(format!("create {}: {e}", dir.display())))?;
    }

    let payload = serde_json::to_vec(&desc.client_conf(mount_point)).map_err(CsiError::internal)?;

    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "replaced previous client config file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CsiError::Internal(format!(
                "remove stale {}: {e}",
                path.display()
            )));
        }
    }

    let write_err = |e: io::Error| {
        CsiError::Internal(format!("create client config file {}: {e}", path.display()))
    };
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(CONF_FILE_MODE)
        .open(path)
        .await
        .map_err(write_err)?;
    file.write_all(&payload).await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;

    info!(volume = %desc.name, path = %path.display(), "client config file written");
    Ok(path.clone())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::config::BackendConfig;

    fn config(root: &std::path::Path) -> BackendConfig {
        BackendConfig {
            client_conf_dir: root.join("conf"),
            client_log_dir: root.join("logs"),
            ..Default::default()
        }
    }

    fn descriptor(cfg: &BackendConfig) -> VolumeDescriptor {
        let params = HashMap::from([
            ("masterAddr".to_owned(), "a:80,b:80".to_owned()),
            ("owner".to_owned(), "alice".to_owned()),
        ]);
        VolumeDescriptor::build("vol1", &params, cfg).unwrap()
    }

    #[tokio::test]
    async fn writes_read_only_json() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let desc = descriptor(&cfg);

        let path = persist(&desc, "/stage/vol1").await.unwrap();
        assert_eq!(path, tmp.path().join("conf/vol1.json"));
        assert!(tmp.path().join("logs/vol1").is_dir());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o444);

        let conf: HashMap<String, String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(conf["volName"], "vol1");
        assert_eq!(conf["masterAddr"], "a:80,b:80");
        assert_eq!(conf["owner"], "alice");
        assert_eq!(conf["mountPoint"], "/stage/vol1");
        assert_eq!(conf["volType"], "0");
    }

    #[tokio::test]
    async fn restage_replaces_previous_file() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path());
        let desc = descriptor(&cfg);

        persist(&desc, "/stage/old").await.unwrap();
        let path = persist(&desc, "/stage/new").await.unwrap();

        let conf: HashMap<String, String> =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(conf["mountPoint"], "/stage/new");
    }

    #[tokio::test]
    async fn unwritable_conf_dir_is_internal() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("conf");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let cfg = config(tmp.path());

        let err = persist(&descriptor(&cfg), "/stage/vol1").await.unwrap_err();
        assert!(matches!(err, CsiError::Internal(_)));
    }
}
