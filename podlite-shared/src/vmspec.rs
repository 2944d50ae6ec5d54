//! VM spec types serialized to the in-guest agent.
//!
//! This is the final, resolved description of the pod: device names and
//! mount points have been filled in by the host, and container commands and
//! environments have been merged with the image defaults.

use serde::{Deserialize, Serialize};

/// The resolved pod sent with [`crate::MessageCode::RunPod`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmPod {
    pub hostname: String,
    pub containers: Vec<VmContainer>,
    /// Filled in once, after the last network interface is hot-plugged.
    pub interfaces: Vec<VmNetworkInf>,
    /// Filled in together with `interfaces`.
    pub routes: Vec<VmRoute>,
    /// Socket name of the guest-agent channel inside the VM dir.
    pub socket: String,
    /// 9p mount tag of the shared directory.
    pub share_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VmContainer {
    /// 64-char hex container id, assigned when the rootfs is prepared.
    pub id: String,
    pub rootfs: String,
    /// "dir" for 9p-backed containers, a block filesystem type otherwise.
    pub fstype: String,
    /// Guest device name for block-backed containers, 9p-relative path for
    /// directory-backed ones.
    pub image: String,
    pub volumes: Vec<VmVolume>,
    pub fsmap: Vec<VmFsmap>,
    /// Attach id for interactive containers, 0 when no tty was requested.
    pub tty: u64,
    pub workdir: String,
    /// Always empty after the merge: the resolved entrypoint is folded into
    /// `cmd`.
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub envs: Vec<VmEnvVar>,
    pub restart_policy: String,
}

/// A block-backed volume mounted into one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmVolume {
    pub device: String,
    pub mount: String,
    pub fstype: String,
    pub read_only: bool,
}

/// A 9p-backed mount into one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFsmap {
    pub source: String,
    pub path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmEnvVar {
    pub env: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmNetworkInf {
    pub device: String,
    pub ip_address: String,
    pub net_mask: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmRoute {
    pub dest: String,
    pub gateway: String,
    /// Device name of the interface this route goes through, empty when the
    /// route is not bound to a specific interface.
    pub device: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vmpod_serializes_resolved_fields() {
        let pod = VmPod {
            hostname: "test".into(),
            containers: vec![VmContainer {
                id: "a".repeat(64),
                rootfs: "rootfs".into(),
                fstype: "ext4".into(),
                image: "sda".into(),
                cmd: vec!["/bin/sh".into()],
                restart_policy: "never".into(),
                ..Default::default()
            }],
            socket: "dvm.sock".into(),
            share_dir: "share_dir".into(),
            ..Default::default()
        };

        let json = serde_json::to_string(&pod).unwrap();
        let back: VmPod = serde_json::from_str(&json).unwrap();
        assert_eq!(back.containers.len(), 1);
        assert_eq!(back.containers[0].image, "sda");
        assert_eq!(back.containers[0].cmd, vec!["/bin/sh".to_string()]);
        assert!(back.interfaces.is_empty());
    }
}
