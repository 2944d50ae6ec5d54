//! Filesystem layout for the runtime home and per-VM directories.

use std::path::{Path, PathBuf};

use podlite_shared::{PodliteError, PodliteResult};

/// Mount tag of the 9p share exposed to every guest.
pub const SHARE_DIR_TAG: &str = "share_dir";

/// Runtime-wide layout rooted at the home directory.
#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
        }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    /// Image store: `<name>.img` files with optional `<name>.json` configs.
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join("images")
    }

    /// Layout of one VM's directory below the home.
    pub fn vm(&self, vm_id: &str) -> VmLayout {
        VmLayout {
            root: self.home_dir.join(vm_id),
        }
    }
}

/// Per-VM directory: sockets, console, and the 9p share tree.
#[derive(Debug, Clone)]
pub struct VmLayout {
    root: PathBuf,
}

impl VmLayout {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn qmp_socket(&self) -> PathBuf {
        self.root.join("qmp.sock")
    }

    /// Guest-agent channel socket, bridged into the VM over virtio-serial.
    pub fn agent_socket(&self) -> PathBuf {
        self.root.join("dvm.sock")
    }

    pub fn tty_socket(&self) -> PathBuf {
        self.root.join("tty.sock")
    }

    /// Serial console socket. QEMU serves this one; we only name it.
    pub fn console_socket(&self) -> PathBuf {
        self.root.join("console.sock")
    }

    pub fn share_dir(&self) -> PathBuf {
        self.root.join("share_dir")
    }

    /// Rootfs mount point of one directory-backed container inside the share.
    pub fn container_rootfs(&self, container_id: &str) -> PathBuf {
        self.share_dir().join(container_id).join("rootfs")
    }

    /// Directory-backed volume mount point inside the share.
    pub fn volume_dir(&self, name: &str) -> PathBuf {
        self.share_dir().join("vols").join(name)
    }

    /// Create the share tree and clear any stale socket files.
    ///
    /// Unwinds nothing on its own; callers remove the root on failure.
    pub fn prepare(&self) -> PodliteResult<()> {
        std::fs::create_dir_all(self.share_dir()).map_err(|e| {
            PodliteError::Setup(format!(
                "cannot create share dir {}: {}",
                self.share_dir().display(),
                e
            ))
        })?;

        for sock in [
            self.qmp_socket(),
            self.agent_socket(),
            self.tty_socket(),
            self.console_socket(),
        ] {
            make_sure_not_exist(&sock)?;
        }
        Ok(())
    }

    /// Remove socket files and the whole VM directory.
    pub fn cleanup(&self) {
        for sock in [
            self.qmp_socket(),
            self.agent_socket(),
            self.tty_socket(),
            self.console_socket(),
        ] {
            if let Err(e) = std::fs::remove_file(&sock) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %sock.display(), error = %e, "failed to remove socket file");
                }
            }
        }
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.root.display(), error = %e, "failed to remove vm dir");
            }
        }
    }
}

/// Remove a leftover file from a previous run, tolerating its absence.
fn make_sure_not_exist(path: &Path) -> PodliteResult<()> {
    match std::fs::metadata(path) {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Ok(_) => {
            tracing::debug!(path = %path.display(), "removing stale file");
            std::fs::remove_file(path)
                .map_err(|e| PodliteError::Setup(format!("cannot remove {}: {}", path.display(), e)))
        }
        Err(e) => Err(PodliteError::Setup(format!(
            "cannot stat {}: {}",
            path.display(),
            e
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vm_paths() {
        let layout = FilesystemLayout::new("/var/run/podlite");
        let vm = layout.vm("vm-abcdefghij");

        assert_eq!(
            vm.qmp_socket(),
            PathBuf::from("/var/run/podlite/vm-abcdefghij/qmp.sock")
        );
        assert_eq!(
            vm.agent_socket(),
            PathBuf::from("/var/run/podlite/vm-abcdefghij/dvm.sock")
        );
        assert!(vm
            .container_rootfs("c1")
            .ends_with("vm-abcdefghij/share_dir/c1/rootfs"));
    }

    #[test]
    fn test_prepare_clears_stale_sockets() {
        let dir = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(dir.path());
        let vm = layout.vm("vm-testtestte");

        std::fs::create_dir_all(vm.root()).unwrap();
        std::fs::write(vm.qmp_socket(), b"stale").unwrap();

        vm.prepare().unwrap();
        assert!(vm.share_dir().is_dir());
        assert!(!vm.qmp_socket().exists());
    }

    #[test]
    fn test_cleanup_removes_tree() {
        let dir = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(dir.path());
        let vm = layout.vm("vm-cleanuptes");

        vm.prepare().unwrap();
        std::fs::write(vm.share_dir().join("junk"), b"x").unwrap();

        vm.cleanup();
        assert!(!vm.root().exists());
    }
}
