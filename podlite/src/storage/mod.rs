//! Host-side storage helpers.
//!
//! Each helper runs as its own task, performs blocking mount work via
//! `spawn_blocking` or external tools, and reports back exclusively by
//! posting hub events. A helper must tolerate a closed hub (the context may
//! already be gone) by discarding its result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use nix::mount::{mount, umount, MsFlags};
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;

use podlite_shared::{PodliteError, PodliteResult};

use crate::pod::{UserContainer, UserVolume, VolumeDriver};
use crate::runtime::layout::VmLayout;
use crate::util::new_container_id;
use crate::vm::events::{ContainerCreatedInfo, VmEvent, VolumeReadyInfo};

/// Default size for volumes the runtime materializes itself.
const EMPTY_VOLUME_SIZE: &str = "1G";

/// Kernel overlayfs features, probed once per process.
#[derive(Debug, Clone, Copy)]
pub struct OverlayFeatures {
    pub metacopy: bool,
}

static OVERLAY_FEATURES: OnceLock<OverlayFeatures> = OnceLock::new();

/// Probe overlayfs support once and cache the result for the process.
pub fn overlay_features() -> OverlayFeatures {
    *OVERLAY_FEATURES.get_or_init(|| {
        let metacopy = std::fs::read_to_string("/sys/module/overlay/parameters/metacopy")
            .map(|v| v.trim() == "Y")
            .unwrap_or(false);
        tracing::debug!(metacopy, "probed overlayfs features");
        OverlayFeatures { metacopy }
    })
}

/// Optional per-image config resolved next to the image file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub workdir: String,
}

/// Materialize one container's rootfs and report `ContainerCreated`.
///
/// Directory-backed containers get an overlay mount inside the share dir and
/// never produce a block device; everything else resolves to an image file
/// that will be hot-plugged.
pub async fn create_container(
    index: usize,
    container: UserContainer,
    layout: VmLayout,
    images_dir: PathBuf,
    hub: mpsc::Sender<VmEvent>,
) {
    let result = if !container.rootfs.is_empty() {
        create_dir_container(index, &container, &layout).await
    } else {
        create_image_container(index, &container, &images_dir).await
    };

    let event = match result {
        Ok(info) => VmEvent::ContainerCreated(info),
        Err(e) => VmEvent::PrepFailed {
            target: crate::vm::events::PrepTarget::Container(index),
            cause: e.to_string(),
        },
    };
    let _ = hub.send(event).await;
}

async fn create_dir_container(
    index: usize,
    container: &UserContainer,
    layout: &VmLayout,
) -> PodliteResult<ContainerCreatedInfo> {
    let id = new_container_id();
    let lower = PathBuf::from(&container.rootfs);
    if !lower.is_dir() {
        return Err(PodliteError::Storage(format!(
            "rootfs {} is not a directory",
            lower.display()
        )));
    }

    let container_dir = layout.share_dir().join(&id);
    let upper = container_dir.join("upper");
    let work = container_dir.join("work");
    let merged = layout.container_rootfs(&id);

    let mount_id = id.clone();
    tokio::task::spawn_blocking(move || overlay_mount(&lower, &upper, &work, &merged))
        .await
        .map_err(|e| PodliteError::Storage(format!("mount worker died: {}", e)))?
        .map_err(|e| {
            PodliteError::Storage(format!("overlay mount for {} failed: {}", mount_id, e))
        })?;

    Ok(ContainerCreatedInfo {
        index,
        image: format!("{}/rootfs", id),
        id,
        rootfs: "rootfs".into(),
        fstype: "dir".into(),
        workdir: String::new(),
        entrypoint: Vec::new(),
        cmd: Vec::new(),
        envs: HashMap::new(),
    })
}

async fn create_image_container(
    index: usize,
    container: &UserContainer,
    images_dir: &Path,
) -> PodliteResult<ContainerCreatedInfo> {
    let image_file = images_dir.join(format!("{}.img", container.image));
    if !image_file.is_file() {
        return Err(PodliteError::Storage(format!(
            "image file {} not found",
            image_file.display()
        )));
    }

    let config = load_image_config(&images_dir.join(format!("{}.json", container.image)));
    let fstype = if container.fstype.is_empty() {
        "ext4".to_string()
    } else {
        container.fstype.clone()
    };

    Ok(ContainerCreatedInfo {
        index,
        id: new_container_id(),
        rootfs: "rootfs".into(),
        image: image_file.display().to_string(),
        fstype,
        workdir: config.workdir,
        entrypoint: config.entrypoint,
        cmd: config.cmd,
        envs: config.env,
    })
}

fn load_image_config(path: &Path) -> ImageConfig {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed image config");
            ImageConfig::default()
        }),
        Err(_) => ImageConfig::default(),
    }
}

fn overlay_mount(lower: &Path, upper: &Path, work: &Path, merged: &Path) -> PodliteResult<()> {
    std::fs::create_dir_all(upper)?;
    std::fs::create_dir_all(work)?;
    std::fs::create_dir_all(merged)?;

    let mut options = format!(
        "lowerdir={},upperdir={},workdir={}",
        lower.display(),
        upper.display(),
        work.display()
    );
    if overlay_features().metacopy {
        options.push_str(",metacopy=on");
    }

    mount(
        Some("overlay"),
        merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(options.as_str()),
    )
    .map_err(|e| PodliteError::Storage(format!("mount overlay: {}", e)))
}

/// Prepare one declared volume and report `VolumeReady`.
pub async fn prepare_volume(vol: UserVolume, layout: VmLayout, hub: mpsc::Sender<VmEvent>) {
    let result = match vol.driver {
        VolumeDriver::Vfs => prepare_vfs_volume(&vol, &layout).await,
        VolumeDriver::Raw | VolumeDriver::Qcow2 if !vol.source.is_empty() => {
            prepare_block_volume(&vol).await
        }
        _ => prepare_empty_volume(&vol, &layout).await,
    };

    let event = match result {
        Ok(info) => VmEvent::VolumeReady(info),
        Err(e) => VmEvent::PrepFailed {
            target: crate::vm::events::PrepTarget::Volume(vol.name.clone()),
            cause: e.to_string(),
        },
    };
    let _ = hub.send(event).await;
}

async fn prepare_vfs_volume(vol: &UserVolume, layout: &VmLayout) -> PodliteResult<VolumeReadyInfo> {
    let source = PathBuf::from(&vol.source);
    if !source.is_dir() {
        return Err(PodliteError::Storage(format!(
            "volume source {} is not a directory",
            source.display()
        )));
    }

    let target = layout.volume_dir(&vol.name);
    tokio::task::spawn_blocking(move || -> PodliteResult<()> {
        std::fs::create_dir_all(&target)?;
        mount(
            Some(&source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| PodliteError::Storage(format!("bind mount: {}", e)))
    })
    .await
    .map_err(|e| PodliteError::Storage(format!("mount worker died: {}", e)))??;

    Ok(VolumeReadyInfo {
        name: vol.name.clone(),
        filepath: format!("vols/{}", vol.name),
        format: "vfs".into(),
        fstype: "dir".into(),
    })
}

async fn prepare_block_volume(vol: &UserVolume) -> PodliteResult<VolumeReadyInfo> {
    if !Path::new(&vol.source).is_file() {
        return Err(PodliteError::Storage(format!(
            "volume source {} not found",
            vol.source
        )));
    }
    Ok(VolumeReadyInfo {
        name: vol.name.clone(),
        filepath: vol.source.clone(),
        format: vol.driver.as_str().into(),
        fstype: "ext4".into(),
    })
}

/// A volume with no source gets a fresh raw image with an ext4 filesystem.
async fn prepare_empty_volume(
    vol: &UserVolume,
    layout: &VmLayout,
) -> PodliteResult<VolumeReadyInfo> {
    let volumes_dir = layout.root().join("volumes");
    tokio::fs::create_dir_all(&volumes_dir)
        .await
        .map_err(|e| PodliteError::Storage(format!("create volumes dir: {}", e)))?;
    let file = volumes_dir.join(format!("{}.img", vol.name));

    run_tool(
        "qemu-img",
        &[
            "create",
            "-f",
            "raw",
            &file.display().to_string(),
            EMPTY_VOLUME_SIZE,
        ],
    )
    .await?;
    run_tool("mkfs.ext4", &["-F", "-q", &file.display().to_string()]).await?;

    Ok(VolumeReadyInfo {
        name: vol.name.clone(),
        filepath: file.display().to_string(),
        format: "raw".into(),
        fstype: "ext4".into(),
    })
}

async fn run_tool(tool: &str, args: &[&str]) -> PodliteResult<()> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| PodliteError::Storage(format!("failed to run {}: {}", tool, e)))?;
    if !output.status.success() {
        return Err(PodliteError::Storage(format!(
            "{} failed: {}",
            tool,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

/// Tear down one directory-backed container rootfs.
pub async fn umount_container(
    layout: VmLayout,
    container_id: String,
    index: usize,
    hub: mpsc::Sender<VmEvent>,
) {
    let merged = layout.container_rootfs(&container_id);
    let container_dir = layout.share_dir().join(&container_id);

    let success = tokio::task::spawn_blocking(move || -> bool {
        if let Err(e) = umount(&merged) {
            tracing::warn!(path = %merged.display(), error = %e, "overlay umount failed");
            return false;
        }
        if let Err(e) = std::fs::remove_dir_all(&container_dir) {
            tracing::warn!(path = %container_dir.display(), error = %e, "container dir removal failed");
        }
        true
    })
    .await
    .unwrap_or(false);

    let _ = hub
        .send(VmEvent::ContainerUnmounted { index, success })
        .await;
}

/// Tear down one directory-backed volume.
pub async fn umount_volume(layout: VmLayout, name: String, hub: mpsc::Sender<VmEvent>) {
    let target = layout.volume_dir(&name);

    let success = tokio::task::spawn_blocking(move || -> bool {
        if let Err(e) = umount(&target) {
            tracing::warn!(path = %target.display(), error = %e, "volume umount failed");
            return false;
        }
        let _ = std::fs::remove_dir(&target);
        true
    })
    .await
    .unwrap_or(false);

    let _ = hub.send(VmEvent::VolumeUnmounted { name, success }).await;
}

/// Remove the device-mapper node backing a block image, if there is one.
pub async fn remove_dm_device(filename: String, name: String, hub: mpsc::Sender<VmEvent>) {
    let success = if filename.starts_with("/dev/mapper/") {
        match run_tool("dmsetup", &["remove", &filename]).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(device = %filename, error = %e, "dmsetup remove failed");
                false
            }
        }
    } else {
        // Plain files have no dm node; nothing to do.
        true
    };

    let _ = hub.send(VmEvent::DmDeviceRemoved { name, success }).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_probe_is_cached() {
        let a = overlay_features();
        let b = overlay_features();
        assert_eq!(a.metacopy, b.metacopy);
    }

    #[test]
    fn test_image_config_defaults_on_missing_file() {
        let config = load_image_config(Path::new("/nonexistent/image.json"));
        assert!(config.entrypoint.is_empty());
        assert!(config.cmd.is_empty());
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_image_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busybox.json");
        std::fs::write(
            &path,
            br#"{"entrypoint":["/bin/sh"],"cmd":["-c","true"],"env":{"TERM":"xterm"},"workdir":"/"}"#,
        )
        .unwrap();

        let config = load_image_config(&path);
        assert_eq!(config.entrypoint, vec!["/bin/sh"]);
        assert_eq!(config.cmd, vec!["-c", "true"]);
        assert_eq!(config.env.get("TERM").map(String::as_str), Some("xterm"));
        assert_eq!(config.workdir, "/");
    }
}
