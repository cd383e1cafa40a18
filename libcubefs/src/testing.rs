//! In-memory fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nix::errno::Errno;

use crate::descriptor::KEY_MOUNT_POINT;
use crate::error::CsiError;
use crate::master::{MasterRequest, MasterResponse, MasterTransport};
use crate::mount_helper::MountHelper;
use crate::mounter::Mounter;

// ---------------------------------------------------------------------------
// Master
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ok(i64, &'static str),
    Unreachable,
}

/// Scripted master: one fixed reply per endpoint, unreachable otherwise.
#[derive(Default)]
pub(crate) struct FakeMaster {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<(String, MasterRequest)>>,
}

impl FakeMaster {
    pub(crate) fn script(&self, endpoint: &str, reply: Reply) {
        self.replies
            .lock()
            .unwrap()
            .insert(endpoint.to_owned(), reply);
    }

    pub(crate) fn calls(&self) -> Vec<(String, MasterRequest)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl MasterTransport for FakeMaster {
    async fn get(&self, endpoint: &str, req: &MasterRequest) -> Result<MasterResponse, CsiError> {
        self.calls
            .lock()
            .unwrap()
            .push((endpoint.to_owned(), req.clone()));
        let reply = self.replies.lock().unwrap().get(endpoint).cloned();
        match reply {
            Some(Reply::Ok(code, msg)) => Ok(MasterResponse {
                code,
                msg: msg.to_owned(),
                data: None,
            }),
            Some(Reply::Unreachable) | None => {
                Err(CsiError::unavailable(format!("{endpoint}: connection refused")))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mounter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeFs {
    dirs: HashSet<PathBuf>,
    /// target -> source; `None` for mounts set up by the test itself.
    mounts: HashMap<PathBuf, Option<PathBuf>>,
    /// Mounts on the same device as their parent, only visible in the table.
    hidden_mounts: HashSet<PathBuf>,
    corrupted: HashSet<PathBuf>,
    read_only: HashSet<PathBuf>,
    fail_bind: bool,
    unmounts: usize,
}

/// In-memory mount namespace.
#[derive(Default)]
pub(crate) struct FakeMounter {
    fs: Mutex<FakeFs>,
}

impl FakeMounter {
    pub(crate) fn add_dir(&self, path: &Path) {
        self.fs.lock().unwrap().dirs.insert(path.to_owned());
    }

    pub(crate) fn add_mount(&self, path: &Path) {
        let mut fs = self.fs.lock().unwrap();
        fs.dirs.insert(path.to_owned());
        fs.mounts.insert(path.to_owned(), None);
    }

    pub(crate) fn add_hidden_mount(&self, path: &Path) {
        let mut fs = self.fs.lock().unwrap();
        fs.dirs.insert(path.to_owned());
        fs.hidden_mounts.insert(path.to_owned());
    }

    pub(crate) fn add_corrupted(&self, path: &Path) {
        let mut fs = self.fs.lock().unwrap();
        fs.dirs.insert(path.to_owned());
        fs.corrupted.insert(path.to_owned());
    }

    pub(crate) fn fail_bind(&self) {
        self.fs.lock().unwrap().fail_bind = true;
    }

    pub(crate) fn has_dir(&self, path: &Path) -> bool {
        self.fs.lock().unwrap().dirs.contains(path)
    }

    pub(crate) fn is_mounted(&self, path: &Path) -> bool {
        let fs = self.fs.lock().unwrap();
        fs.mounts.contains_key(path) || fs.hidden_mounts.contains(path)
    }

    pub(crate) fn bind_source(&self, target: &Path) -> Option<PathBuf> {
        self.fs.lock().unwrap().mounts.get(target).cloned().flatten()
    }

    pub(crate) fn is_read_only(&self, target: &Path) -> bool {
        self.fs.lock().unwrap().read_only.contains(target)
    }

    pub(crate) fn unmount_count(&self) -> usize {
        self.fs.lock().unwrap().unmounts
    }
}

fn not_connected() -> io::Error {
    io::Error::from_raw_os_error(Errno::ENOTCONN as i32)
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn path_exists(&self, path: &Path) -> io::Result<bool> {
        let fs = self.fs.lock().unwrap();
        if fs.corrupted.contains(path) {
            return Err(not_connected());
        }
        Ok(fs.dirs.contains(path))
    }

    async fn is_mount_point(&self, path: &Path) -> Result<bool, CsiError> {
        let fs = self.fs.lock().unwrap();
        Ok(fs.mounts.contains_key(path)
            || fs.hidden_mounts.contains(path)
            || fs.corrupted.contains(path))
    }

    async fn is_likely_not_mount_point(&self, path: &Path) -> io::Result<bool> {
        let fs = self.fs.lock().unwrap();
        if fs.corrupted.contains(path) {
            return Err(not_connected());
        }
        if !fs.dirs.contains(path) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(!fs.mounts.contains_key(path))
    }

    async fn make_dir(&self, path: &Path) -> Result<(), CsiError> {
        self.fs.lock().unwrap().dirs.insert(path.to_owned());
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<(), CsiError> {
        let mut fs = self.fs.lock().unwrap();
        if fs.mounts.contains_key(path) || fs.hidden_mounts.contains(path) {
            return Err(CsiError::Internal(format!(
                "remove dir {}: device or resource busy",
                path.display()
            )));
        }
        fs.dirs.remove(path);
        Ok(())
    }

    async fn bind_mount(
        &self,
        source: &Path,
        target: &Path,
        read_only: bool,
    ) -> Result<(), CsiError> {
        let mut fs = self.fs.lock().unwrap();
        if fs.fail_bind || !fs.dirs.contains(target) {
            return Err(CsiError::MountFailed {
                path: target.display().to_string(),
                reason: "bind failed".into(),
            });
        }
        fs.mounts.insert(target.to_owned(), Some(source.to_owned()));
        if read_only {
            fs.read_only.insert(target.to_owned());
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path) -> Result<(), CsiError> {
        let mut fs = self.fs.lock().unwrap();
        let was_mounted = fs.mounts.remove(target).is_some()
            | fs.hidden_mounts.remove(target)
            | fs.corrupted.remove(target);
        if !was_mounted {
            return Err(CsiError::UnmountFailed {
                path: target.display().to_string(),
                reason: "not mounted".into(),
            });
        }
        fs.read_only.remove(target);
        fs.unmounts += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mount helper
// ---------------------------------------------------------------------------

/// Records every config path it is asked to mount.  When attached to a
/// [`FakeMounter`] a successful run mounts the config's `mountPoint` there.
/// Runs wait while a test holds the gate, then read the config file.
#[derive(Default)]
pub(crate) struct FakeHelper {
    invocations: Mutex<Vec<PathBuf>>,
    mount_points: Mutex<Vec<String>>,
    fail: Mutex<bool>,
    gate: Arc<tokio::sync::Mutex<()>>,
    mounter: Option<Arc<FakeMounter>>,
}

impl FakeHelper {
    pub(crate) fn mounting_into(mounter: Arc<FakeMounter>) -> Self {
        Self {
            mounter: Some(mounter),
            ..Default::default()
        }
    }

    pub(crate) fn fail(&self) {
        *self.fail.lock().unwrap() = true;
    }

    pub(crate) fn invocations(&self) -> Vec<PathBuf> {
        self.invocations.lock().unwrap().clone()
    }

    /// `mountPoint` values read from the config files, in run order.
    pub(crate) fn mount_points(&self) -> Vec<String> {
        self.mount_points.lock().unwrap().clone()
    }

    /// Block helper runs until the returned guard is dropped.
    pub(crate) async fn hold(&self) -> tokio::sync::OwnedMutexGuard<()> {
        Arc::clone(&self.gate).lock_owned().await
    }
}

#[async_trait]
impl MountHelper for FakeHelper {
    async fn mount(&self, config_file: &Path) -> Result<(), CsiError> {
        self.invocations
            .lock()
            .unwrap()
            .push(config_file.to_owned());
        if *self.fail.lock().unwrap() {
            return Err(CsiError::MountFailed {
                path: config_file.display().to_string(),
                reason: "cfs-client exited with status 1".into(),
            });
        }
        drop(self.gate.lock().await);
        if let Some(mounter) = &self.mounter {
            let raw = std::fs::read(config_file).map_err(CsiError::internal)?;
            let conf: HashMap<String, String> =
                serde_json::from_slice(&raw).map_err(CsiError::internal)?;
            let mount_point = conf
                .get(KEY_MOUNT_POINT)
                .ok_or_else(|| CsiError::internal("config without mountPoint"))?;
            self.mount_points.lock().unwrap().push(mount_point.clone());
            mounter.add_mount(Path::new(mount_point));
        }
        Ok(())
    }
}
