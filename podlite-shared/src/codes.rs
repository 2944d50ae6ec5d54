//! Response codes reported on the per-pod response channel.
//!
//! The stop path waits for [`VM_SHUTDOWN`]; everything else is informational
//! or a failure cause carried alongside `cause` text.

/// Command accepted, nothing further to report.
pub const OK: i32 = 0;

/// The VM reached the running state and the workload was started.
pub const VM_RUNNING: i32 = 1;

/// Shutdown sentinel: the VM exited and all host resources were released.
/// `stop_pod` drains the response channel until it sees this code.
pub const VM_SHUTDOWN: i32 = 2;

/// The pod spec failed validation; no VM context was created.
pub const BAD_SPEC: i32 = 10;

/// QEMU failed to launch or the QMP handshake failed.
pub const VM_START_FAILED: i32 = 11;

/// A preparation helper or QMP hotplug failed; the VM is being torn down.
pub const DEVICE_FAILED: i32 = 12;

/// The guest agent reported a per-container failure; the VM keeps running.
pub const EXEC_ERROR: i32 = 13;

/// The guest agent went silent or the QEMU process died unexpectedly.
pub const VM_LOST: i32 = 14;

/// A response emitted toward the control client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodResponse {
    /// VM id the response belongs to (`vm-` + 10 alpha chars).
    pub vm_id: String,
    pub code: i32,
    pub cause: String,
}

impl PodResponse {
    pub fn new(vm_id: impl Into<String>, code: i32, cause: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            code,
            cause: cause.into(),
        }
    }
}
