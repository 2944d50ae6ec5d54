//! The pod spec submitted by control clients.

use serde::{Deserialize, Serialize};

use podlite_shared::{PodliteError, PodliteResult};

/// A pod as submitted by the user: containers, volumes, and a tty flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserPod {
    pub name: String,
    pub containers: Vec<UserContainer>,
    #[serde(default)]
    pub volumes: Vec<UserVolume>,
    #[serde(default)]
    pub tty: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContainer {
    pub image: String,
    /// Pre-resolved rootfs path. When set together with `fstype = "dir"`,
    /// the container is 9p-backed and never produces a block device.
    #[serde(default)]
    pub rootfs: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub workdir: String,
    #[serde(default)]
    pub envs: Vec<UserEnvVar>,
    #[serde(default)]
    pub restart_policy: String,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub volumes: Vec<UserVolumeRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEnvVar {
    pub env: String,
    pub value: String,
}

/// A declared volume. `source` may be empty for volumes the runtime
/// materializes itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserVolume {
    pub name: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub driver: VolumeDriver,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDriver {
    Raw,
    Qcow2,
    Vfs,
    #[default]
    Empty,
}

impl VolumeDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeDriver::Raw => "raw",
            VolumeDriver::Qcow2 => "qcow2",
            VolumeDriver::Vfs => "vfs",
            VolumeDriver::Empty => "empty",
        }
    }

    /// Block-backed drivers reach the guest through SCSI hotplug.
    pub fn is_block(&self) -> bool {
        matches!(self, VolumeDriver::Raw | VolumeDriver::Qcow2)
    }
}

/// A per-container reference to a declared volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserVolumeRef {
    pub volume: String,
    pub path: String,
    #[serde(default)]
    pub read_only: bool,
}

impl UserPod {
    /// Parse and validate a spec from JSON bytes.
    ///
    /// Spec errors surface here, before any VM context is created.
    pub fn from_bytes(bytes: &[u8]) -> PodliteResult<Self> {
        let pod: UserPod = serde_json::from_slice(bytes)
            .map_err(|e| PodliteError::Spec(format!("malformed pod spec: {}", e)))?;
        pod.validate()?;
        Ok(pod)
    }

    pub fn validate(&self) -> PodliteResult<()> {
        if self.name.is_empty() {
            return Err(PodliteError::Spec("pod name must not be empty".into()));
        }
        if self.containers.is_empty() {
            return Err(PodliteError::Spec(
                "pod must declare at least one container".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for vol in &self.volumes {
            if vol.name.is_empty() {
                return Err(PodliteError::Spec("volume name must not be empty".into()));
            }
            if !names.insert(vol.name.as_str()) {
                return Err(PodliteError::Spec(format!(
                    "duplicate volume name '{}'",
                    vol.name
                )));
            }
            if vol.driver == VolumeDriver::Vfs && vol.source.is_empty() {
                return Err(PodliteError::Spec(format!(
                    "vfs volume '{}' needs a source path",
                    vol.name
                )));
            }
        }

        for (idx, c) in self.containers.iter().enumerate() {
            if c.image.is_empty() && c.rootfs.is_empty() {
                return Err(PodliteError::Spec(format!(
                    "container {} has neither image nor rootfs",
                    idx
                )));
            }
            for vref in &c.volumes {
                if !names.contains(vref.volume.as_str()) {
                    return Err(PodliteError::Spec(format!(
                        "container {} mounts undeclared volume '{}'",
                        idx, vref.volume
                    )));
                }
                if vref.path.is_empty() {
                    return Err(PodliteError::Spec(format!(
                        "container {} mounts volume '{}' without a path",
                        idx, vref.volume
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> UserPod {
        UserPod {
            name: "p".into(),
            containers: vec![UserContainer {
                image: "busybox".into(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_minimal_spec_parses() {
        let json = br#"{"name":"p","containers":[{"image":"busybox"}]}"#;
        let pod = UserPod::from_bytes(json).unwrap();
        assert_eq!(pod.name, "p");
        assert_eq!(pod.containers.len(), 1);
        assert!(!pod.tty);
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut pod = minimal();
        pod.name.clear();
        assert!(pod.validate().is_err());
    }

    #[test]
    fn test_no_containers_rejected() {
        let mut pod = minimal();
        pod.containers.clear();
        assert!(pod.validate().is_err());
    }

    #[test]
    fn test_duplicate_volume_rejected() {
        let mut pod = minimal();
        pod.volumes = vec![
            UserVolume {
                name: "v".into(),
                ..Default::default()
            },
            UserVolume {
                name: "v".into(),
                ..Default::default()
            },
        ];
        assert!(pod.validate().is_err());
    }

    #[test]
    fn test_undeclared_volume_ref_rejected() {
        let mut pod = minimal();
        pod.containers[0].volumes = vec![UserVolumeRef {
            volume: "missing".into(),
            path: "/data".into(),
            read_only: false,
        }];
        assert!(pod.validate().is_err());
    }

    #[test]
    fn test_driver_names() {
        assert_eq!(VolumeDriver::Raw.as_str(), "raw");
        assert!(VolumeDriver::Qcow2.is_block());
        assert!(!VolumeDriver::Vfs.is_block());
        let v: UserVolume =
            serde_json::from_str(r#"{"name":"v","source":"/s","driver":"vfs"}"#).unwrap();
        assert_eq!(v.driver, VolumeDriver::Vfs);
    }
}
