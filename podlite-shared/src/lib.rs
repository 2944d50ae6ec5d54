//! Types shared between the podlite host runtime and guest-facing tooling.
//!
//! This crate carries the error type, the response codes reported to control
//! clients, the framed wire protocol spoken to the in-guest agent, and the
//! VM spec types serialized over that protocol.

pub mod codes;
pub mod errors;
pub mod protocol;
pub mod vmspec;

pub use errors::{PodliteError, PodliteResult};
pub use protocol::{ExitPayload, Frame, MessageCode, TtyPayload};
pub use vmspec::{VmContainer, VmEnvVar, VmFsmap, VmNetworkInf, VmPod, VmRoute, VmVolume};
