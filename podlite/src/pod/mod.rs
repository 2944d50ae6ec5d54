//! User-facing pod specification.

pub mod spec;

pub use spec::{UserContainer, UserPod, UserVolume, UserVolumeRef, VolumeDriver};
