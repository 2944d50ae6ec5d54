//! Device registry: the authoritative record of guest-visible devices.
//!
//! Images, volumes, and network interfaces are tracked here from spec
//! ingestion until teardown. Cross-references to containers are kept as
//! indices into the vm spec's container vector, never as pointers.

use std::collections::HashMap;

use podlite_shared::{VmEnvVar, VmFsmap, VmNetworkInf, VmPod, VmRoute, VmVolume};

use super::events::{
    BlockdevInsertedInfo, BlockdevSource, ContainerCreatedInfo, InterfaceCreatedInfo,
    RouteRule, VolumeReadyInfo,
};
use super::progress::ProgressTracker;

/// Rootfs type of containers whose filesystem reaches the guest over 9p.
pub const FSTYPE_DIR: &str = "dir";

/// Host-side description of one guest block device.
#[derive(Debug, Clone, Default)]
pub struct BlockDescriptor {
    pub name: String,
    pub filename: String,
    pub format: String,
    pub fstype: String,
    /// Guest device name, filled in by QMP on hotplug.
    pub device_name: String,
    pub scsi_id: u32,
    /// PCI slot reserved for this device at plug time.
    pub pci_addr: u32,
}

/// A container image attached as a disk, back-referencing its container.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub info: BlockDescriptor,
    /// Index of the container this image backs.
    pub pos: usize,
}

/// A declared volume, possibly shared by several containers.
#[derive(Debug, Clone, Default)]
pub struct VolumeInfo {
    pub info: BlockDescriptor,
    /// containerIndex -> mount path.
    pub pos: HashMap<usize, String>,
    /// containerIndex -> read-only bit, parallel to `pos`.
    pub read_only: HashMap<usize, bool>,
}

/// Registry of every device the guest can see, keyed by name.
///
/// Image and volume names are each unique and the two namespaces are
/// disjoint within the blockdev pending set.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    pub image_map: HashMap<String, ImageInfo>,
    pub volume_map: HashMap<String, VolumeInfo>,
    pub network_map: HashMap<usize, InterfaceCreatedInfo>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a resolved container into the vm spec.
    ///
    /// Precedence: user entrypoint over image entrypoint; user cmd appended
    /// after the resolved entrypoint, image cmd only when the user cmd is
    /// empty; user env wins on key collision; user workdir only if set.
    ///
    /// Returns true when a block device must be hot-plugged for the image.
    pub fn container_created(
        &mut self,
        vm_spec: &mut VmPod,
        progress: &mut ProgressTracker,
        info: ContainerCreatedInfo,
    ) -> bool {
        let mut need_insert = false;

        let c = &mut vm_spec.containers[info.index];
        c.id = info.id;
        c.rootfs = info.rootfs;
        c.fstype = info.fstype.clone();

        let mut cmd = c.entrypoint.clone();
        if c.entrypoint.is_empty() && !info.entrypoint.is_empty() {
            cmd = info.entrypoint;
        }
        if !c.cmd.is_empty() {
            cmd.extend(c.cmd.iter().cloned());
        } else if !info.cmd.is_empty() {
            cmd.extend(info.cmd);
        }
        c.cmd = cmd;
        c.entrypoint = Vec::new();

        if c.workdir.is_empty() {
            c.workdir = info.workdir;
        }

        let mut image_envs = info.envs;
        for e in &c.envs {
            image_envs.remove(&e.env);
        }
        for (env, value) in image_envs {
            c.envs.push(VmEnvVar { env, value });
        }

        if info.fstype == FSTYPE_DIR {
            c.image = info.image;
        } else {
            self.image_map.insert(
                info.image.clone(),
                ImageInfo {
                    info: BlockDescriptor {
                        name: info.image.clone(),
                        filename: info.image.clone(),
                        format: "raw".into(),
                        fstype: info.fstype,
                        ..Default::default()
                    },
                    pos: info.index,
                },
            );
            progress.adding.blockdevs.insert(info.image);
            need_insert = true;
        }

        progress.container_done(info.index);
        need_insert
    }

    /// Record a prepared volume. Directory-backed volumes materialize fsmap
    /// entries for every container that mounts them; block-backed volumes
    /// become pending blockdevs.
    ///
    /// Returns true when the volume must be hot-plugged.
    pub fn volume_ready(
        &mut self,
        vm_spec: &mut VmPod,
        progress: &mut ProgressTracker,
        info: VolumeReadyInfo,
    ) -> bool {
        let mut need_insert = false;

        let Some(vol) = self.volume_map.get_mut(&info.name) else {
            tracing::warn!(volume = %info.name, "volume-ready for unknown volume");
            return false;
        };
        vol.info.filename = info.filepath.clone();
        vol.info.format = info.format;
        vol.info.fstype = info.fstype.clone();

        if info.fstype != FSTYPE_DIR {
            progress.adding.blockdevs.insert(info.name.clone());
            need_insert = true;
        } else {
            for (&idx, mount) in &vol.pos {
                vm_spec.containers[idx].fsmap.push(VmFsmap {
                    source: info.filepath.clone(),
                    path: mount.clone(),
                    read_only: vol.read_only.get(&idx).copied().unwrap_or(false),
                });
            }
        }

        progress.volume_done(&info.name);
        need_insert
    }

    /// Record the guest device name and scsi id assigned by QMP and
    /// back-propagate them into the owning containers.
    pub fn blockdev_inserted(
        &mut self,
        vm_spec: &mut VmPod,
        progress: &mut ProgressTracker,
        info: BlockdevInsertedInfo,
    ) {
        match info.source {
            BlockdevSource::Image => {
                if let Some(image) = self.image_map.get_mut(&info.name) {
                    image.info.device_name = info.device_name.clone();
                    image.info.scsi_id = info.scsi_id;
                    image.info.pci_addr = info.pci_addr;
                    vm_spec.containers[image.pos].image = info.device_name;
                } else {
                    tracing::warn!(name = %info.name, "blockdev-inserted for unknown image");
                }
            }
            BlockdevSource::Volume => {
                if let Some(volume) = self.volume_map.get_mut(&info.name) {
                    volume.info.device_name = info.device_name.clone();
                    volume.info.scsi_id = info.scsi_id;
                    volume.info.pci_addr = info.pci_addr;
                    for (&idx, mount) in &volume.pos {
                        vm_spec.containers[idx].volumes.push(VmVolume {
                            device: info.device_name.clone(),
                            mount: mount.clone(),
                            fstype: volume.info.fstype.clone(),
                            read_only: volume.read_only.get(&idx).copied().unwrap_or(false),
                        });
                    }
                } else {
                    tracing::warn!(name = %info.name, "blockdev-inserted for unknown volume");
                }
            }
        }

        progress.blockdev_done(&info.name);
    }

    pub fn interface_created(&mut self, info: InterfaceCreatedInfo) {
        self.network_map.insert(info.index, info);
    }

    /// Record one plugged netdev. When the last pending network drains, the
    /// interface list and route table are built in index order, reflecting a
    /// single consistent snapshot.
    pub fn netdev_inserted(
        &mut self,
        vm_spec: &mut VmPod,
        progress: &mut ProgressTracker,
        index: usize,
    ) {
        progress.network_done(index);

        if !progress.adding.networks.is_empty() {
            return;
        }

        let count = self.network_map.len();
        let mut infs = Vec::with_capacity(count);
        let mut routes = Vec::new();
        for i in 0..count {
            let Some(inf) = self.network_map.get(&i) else {
                tracing::warn!(index = i, "network map has a hole; skipping batch slot");
                continue;
            };
            infs.push(VmNetworkInf {
                device: inf.device.clone(),
                ip_address: inf.ip_addr.clone(),
                net_mask: inf.net_mask.clone(),
            });

            for rule in &inf.routes {
                let device = if rule.via_this {
                    inf.device.clone()
                } else {
                    String::new()
                };
                routes.push(VmRoute {
                    dest: rule.destination.clone(),
                    gateway: rule.gateway.clone(),
                    device,
                });
            }
        }
        vm_spec.interfaces = infs;
        vm_spec.routes = routes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podlite_shared::VmContainer;

    fn spec_with(containers: usize) -> VmPod {
        VmPod {
            hostname: "p".into(),
            containers: (0..containers)
                .map(|_| VmContainer {
                    rootfs: "rootfs".into(),
                    fstype: "ext4".into(),
                    restart_policy: "never".into(),
                    ..Default::default()
                })
                .collect(),
            socket: "dvm.sock".into(),
            share_dir: "share_dir".into(),
            ..Default::default()
        }
    }

    fn created(index: usize, fstype: &str) -> ContainerCreatedInfo {
        ContainerCreatedInfo {
            index,
            id: "c".repeat(64),
            rootfs: "rootfs".into(),
            image: format!("img-{}", index),
            fstype: fstype.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_user_entrypoint_wins() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();
        spec.containers[0].entrypoint = vec!["/user".into()];
        spec.containers[0].cmd = vec!["-a".into()];

        let mut info = created(0, FSTYPE_DIR);
        info.entrypoint = vec!["/image".into()];
        info.cmd = vec!["-b".into()];
        reg.container_created(&mut spec, &mut progress, info);

        assert_eq!(spec.containers[0].cmd, vec!["/user", "-a"]);
        assert!(spec.containers[0].entrypoint.is_empty());
    }

    #[test]
    fn test_merge_image_defaults_used_when_user_empty() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();

        let mut info = created(0, FSTYPE_DIR);
        info.entrypoint = vec!["/image".into()];
        info.cmd = vec!["-b".into()];
        reg.container_created(&mut spec, &mut progress, info);

        assert_eq!(spec.containers[0].cmd, vec!["/image", "-b"]);
    }

    #[test]
    fn test_merge_env_user_wins_on_collision() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();
        spec.containers[0].envs = vec![VmEnvVar {
            env: "PATH".into(),
            value: "/user/bin".into(),
        }];

        let mut info = created(0, FSTYPE_DIR);
        info.envs = HashMap::from([
            ("PATH".to_string(), "/image/bin".to_string()),
            ("TERM".to_string(), "xterm".to_string()),
        ]);
        reg.container_created(&mut spec, &mut progress, info);

        let envs = &spec.containers[0].envs;
        assert_eq!(envs.len(), 2);
        assert!(envs.contains(&VmEnvVar {
            env: "PATH".into(),
            value: "/user/bin".into()
        }));
        assert!(envs.contains(&VmEnvVar {
            env: "TERM".into(),
            value: "xterm".into()
        }));
    }

    #[test]
    fn test_merge_workdir_only_when_empty() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(2);
        let mut progress = ProgressTracker::new();
        spec.containers[0].workdir = "/srv".into();

        let mut info = created(0, FSTYPE_DIR);
        info.workdir = "/image-wd".into();
        reg.container_created(&mut spec, &mut progress, info);
        assert_eq!(spec.containers[0].workdir, "/srv");

        let mut info = created(1, FSTYPE_DIR);
        info.workdir = "/image-wd".into();
        reg.container_created(&mut spec, &mut progress, info);
        assert_eq!(spec.containers[1].workdir, "/image-wd");
    }

    #[test]
    fn test_dir_container_skips_blockdev() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();
        progress.adding.containers.insert(0);

        let mut info = created(0, FSTYPE_DIR);
        info.image = "/share/c0/rootfs".into();
        let need_insert = reg.container_created(&mut spec, &mut progress, info);

        assert!(!need_insert);
        assert!(reg.image_map.is_empty());
        assert!(progress.adding.blockdevs.is_empty());
        assert_eq!(spec.containers[0].image, "/share/c0/rootfs");
        assert!(progress.device_ready());
    }

    #[test]
    fn test_block_container_registers_image() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();
        progress.adding.containers.insert(0);

        let need_insert = reg.container_created(&mut spec, &mut progress, created(0, "ext4"));

        assert!(need_insert);
        assert!(reg.image_map.contains_key("img-0"));
        assert!(progress.adding.blockdevs.contains("img-0"));
        assert!(!progress.device_ready());
    }

    #[test]
    fn test_shared_volume_backprop() {
        // Two containers share one raw volume: rw in c0, ro in c1.
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(2);
        let mut progress = ProgressTracker::new();

        let mut vol = VolumeInfo {
            info: BlockDescriptor {
                name: "v1".into(),
                filename: "/vols/v1.img".into(),
                format: "raw".into(),
                fstype: "ext4".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        vol.pos.insert(0, "/data".into());
        vol.pos.insert(1, "/data".into());
        vol.read_only.insert(0, false);
        vol.read_only.insert(1, true);
        reg.volume_map.insert("v1".into(), vol);
        progress.adding.volumes.insert("v1".into());

        let need_insert = reg.volume_ready(
            &mut spec,
            &mut progress,
            VolumeReadyInfo {
                name: "v1".into(),
                filepath: "/vols/v1.img".into(),
                format: "raw".into(),
                fstype: "ext4".into(),
            },
        );
        assert!(need_insert);

        reg.blockdev_inserted(
            &mut spec,
            &mut progress,
            BlockdevInsertedInfo {
                name: "v1".into(),
                source: BlockdevSource::Volume,
                device_name: "sdb".into(),
                scsi_id: 1,
                pci_addr: 0x06,
            },
        );

        for (idx, read_only) in [(0usize, false), (1usize, true)] {
            let vols = &spec.containers[idx].volumes;
            assert_eq!(vols.len(), 1);
            assert_eq!(vols[0].device, "sdb");
            assert_eq!(vols[0].mount, "/data");
            assert_eq!(vols[0].read_only, read_only);
        }
        assert!(progress.device_ready());
    }

    #[test]
    fn test_dir_volume_fills_fsmap() {
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();

        let mut vol = VolumeInfo::default();
        vol.info.name = "v".into();
        vol.pos.insert(0, "/cfg".into());
        vol.read_only.insert(0, true);
        reg.volume_map.insert("v".into(), vol);
        progress.adding.volumes.insert("v".into());

        let need_insert = reg.volume_ready(
            &mut spec,
            &mut progress,
            VolumeReadyInfo {
                name: "v".into(),
                filepath: "vols/v".into(),
                format: "vfs".into(),
                fstype: FSTYPE_DIR.into(),
            },
        );

        assert!(!need_insert);
        assert_eq!(
            spec.containers[0].fsmap,
            vec![VmFsmap {
                source: "vols/v".into(),
                path: "/cfg".into(),
                read_only: true,
            }]
        );
        assert!(progress.device_ready());
    }

    #[test]
    fn test_network_batch_built_once_in_index_order() {
        // Interfaces arrive out of order (1 then 0); the batch is built only
        // after the last pending network drains, in index order.
        let mut reg = DeviceRegistry::new();
        let mut spec = spec_with(1);
        let mut progress = ProgressTracker::new();
        progress.adding.networks.insert(0);
        progress.adding.networks.insert(1);

        reg.interface_created(InterfaceCreatedInfo {
            index: 1,
            device: "eth1".into(),
            host_device: "tap1".into(),
            ip_addr: "10.0.1.2".into(),
            net_mask: "255.255.255.0".into(),
            routes: vec![RouteRule {
                destination: "10.0.1.0/24".into(),
                gateway: String::new(),
                via_this: true,
            }],
        });
        reg.interface_created(InterfaceCreatedInfo {
            index: 0,
            device: "eth0".into(),
            host_device: "tap0".into(),
            ip_addr: "10.0.0.2".into(),
            net_mask: "255.255.255.0".into(),
            routes: vec![RouteRule {
                destination: "0.0.0.0/0".into(),
                gateway: "10.0.0.1".into(),
                via_this: false,
            }],
        });

        reg.netdev_inserted(&mut spec, &mut progress, 1);
        assert!(spec.interfaces.is_empty());

        reg.netdev_inserted(&mut spec, &mut progress, 0);
        assert_eq!(spec.interfaces.len(), 2);
        assert_eq!(spec.interfaces[0].device, "eth0");
        assert_eq!(spec.interfaces[1].device, "eth1");

        assert_eq!(spec.routes.len(), 2);
        assert_eq!(spec.routes[0].device, "");
        assert_eq!(spec.routes[0].gateway, "10.0.0.1");
        assert_eq!(spec.routes[1].device, "eth1");
        assert!(progress.device_ready());
    }
}
