//! Events delivered to the per-VM dispatch loop.
//!
//! Every component — control clients, the QMP driver, the guest-agent
//! channel, host-side helpers, timers — communicates with the state machine
//! exclusively by posting one of these onto the hub.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::pod::UserPod;

/// The single inbound event type of a VM context.
#[derive(Debug)]
pub enum VmEvent {
    // -- control plane ------------------------------------------------------
    /// Run the given pod in this VM, with `networks` interfaces to create.
    RunPod {
        spec: Box<UserPod>,
        networks: usize,
    },
    /// Orderly shutdown requested by the control client.
    Shutdown,
    /// A tty client attached under `tag` for the given attach session.
    Attach {
        attach_id: u64,
        tag: String,
        output: mpsc::Sender<Vec<u8>>,
    },
    /// A tty client detached.
    Detach { tag: String },

    // -- QMP ----------------------------------------------------------------
    /// QMP connection established and capabilities negotiated.
    QmpReady,
    /// The QMP transport failed or the handshake did not complete.
    QmpFailed { cause: String },

    // -- guest agent --------------------------------------------------------
    /// The agent announced itself on the control channel.
    AgentReady,
    /// The agent acknowledged the last command.
    AgentAck,
    /// The agent reported a failure for the last command.
    AgentError { cause: String },
    /// A container process exited inside the guest.
    AgentExit { code: i32 },
    /// The whole pod finished.
    AgentFinished,
    /// Guest tty output for one attach session.
    TtyOutput { attach_id: u64, data: Vec<u8> },
    /// The guest closed one attach session.
    TtyClosed { attach_id: u64 },

    // -- host helper completions -------------------------------------------
    ContainerCreated(ContainerCreatedInfo),
    VolumeReady(VolumeReadyInfo),
    BlockdevInserted(BlockdevInsertedInfo),
    InterfaceCreated(InterfaceCreatedInfo),
    NetdevInserted { index: usize },
    /// A container rootfs or image drive finished tearing down.
    ContainerUnmounted { index: usize, success: bool },
    /// A volume dir or volume drive finished tearing down.
    VolumeUnmounted { name: String, success: bool },
    /// A device-mapper node backing a blockdev was removed.
    DmDeviceRemoved { name: String, success: bool },
    /// A preparation helper or QMP plug failed; fail-fast to teardown.
    PrepFailed { target: PrepTarget, cause: String },

    // -- liveness -----------------------------------------------------------
    /// The guest-agent watchdog fired.
    WatchdogFired,
    /// The QEMU child process exited.
    ProcessExited { status: Option<i32> },
    /// A socket owned by the context closed unexpectedly.
    TransportError {
        which: &'static str,
        cause: String,
    },
}

/// Resolved image layer (or passthrough directory) for one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreatedInfo {
    pub index: usize,
    pub id: String,
    pub rootfs: String,
    /// Host file for block-backed containers, 9p-relative path for
    /// directory-backed ones.
    pub image: String,
    /// "dir" means no block device is ever registered for this container.
    pub fstype: String,
    pub workdir: String,
    pub entrypoint: Vec<String>,
    pub cmd: Vec<String>,
    pub envs: HashMap<String, String>,
}

/// A volume's backing file or directory became available.
#[derive(Debug, Clone, Default)]
pub struct VolumeReadyInfo {
    pub name: String,
    pub filepath: String,
    pub format: String,
    pub fstype: String,
}

/// QMP confirmed a disk is plugged into the guest.
#[derive(Debug, Clone)]
pub struct BlockdevInsertedInfo {
    pub name: String,
    pub source: BlockdevSource,
    pub device_name: String,
    pub scsi_id: u32,
    /// PCI slot reserved when the plug was requested.
    pub pci_addr: u32,
}

/// Whether a blockdev backs a container image or a declared volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockdevSource {
    Image,
    Volume,
}

/// What a failed preparation step was working on. Lets the dispatcher clear
/// the matching pending entry so the drain still converges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepTarget {
    Container(usize),
    Volume(String),
    Blockdev(String),
    Network(usize),
}

impl std::fmt::Display for PrepTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepTarget::Container(idx) => write!(f, "container {}", idx),
            PrepTarget::Volume(name) => write!(f, "volume {}", name),
            PrepTarget::Blockdev(name) => write!(f, "blockdev {}", name),
            PrepTarget::Network(idx) => write!(f, "network {}", idx),
        }
    }
}

/// A host network interface was created for the VM.
#[derive(Debug, Clone, Default)]
pub struct InterfaceCreatedInfo {
    pub index: usize,
    /// Guest-side device name, e.g. `eth0`.
    pub device: String,
    /// Host-side tap name, used for the QMP netdev hotplug.
    pub host_device: String,
    pub ip_addr: String,
    pub net_mask: String,
    pub routes: Vec<RouteRule>,
}

#[derive(Debug, Clone, Default)]
pub struct RouteRule {
    pub destination: String,
    pub gateway: String,
    /// Route goes through the interface that carried this rule.
    pub via_this: bool,
}

impl VmEvent {
    /// Short name for logging dropped events.
    pub fn kind(&self) -> &'static str {
        match self {
            VmEvent::RunPod { .. } => "run-pod",
            VmEvent::Shutdown => "shutdown",
            VmEvent::Attach { .. } => "attach",
            VmEvent::Detach { .. } => "detach",
            VmEvent::QmpReady => "qmp-ready",
            VmEvent::QmpFailed { .. } => "qmp-failed",
            VmEvent::AgentReady => "agent-ready",
            VmEvent::AgentAck => "agent-ack",
            VmEvent::AgentError { .. } => "agent-error",
            VmEvent::AgentExit { .. } => "agent-exit",
            VmEvent::AgentFinished => "agent-finished",
            VmEvent::TtyOutput { .. } => "tty-output",
            VmEvent::TtyClosed { .. } => "tty-closed",
            VmEvent::ContainerCreated(_) => "container-created",
            VmEvent::VolumeReady(_) => "volume-ready",
            VmEvent::BlockdevInserted(_) => "blockdev-inserted",
            VmEvent::InterfaceCreated(_) => "interface-created",
            VmEvent::NetdevInserted { .. } => "netdev-inserted",
            VmEvent::ContainerUnmounted { .. } => "container-unmounted",
            VmEvent::VolumeUnmounted { .. } => "volume-unmounted",
            VmEvent::DmDeviceRemoved { .. } => "dm-removed",
            VmEvent::PrepFailed { .. } => "prep-failed",
            VmEvent::WatchdogFired => "watchdog-fired",
            VmEvent::ProcessExited { .. } => "process-exited",
            VmEvent::TransportError { .. } => "transport-error",
        }
    }
}
