//! Host-side network helpers.
//!
//! Creates tap interfaces for the VM and reports them to the hub; the
//! actual guest-side hotplug goes through the QMP driver. Addressing is a
//! flat per-index scheme; the routing table binds the default route to the
//! first interface.

use tokio::process::Command;
use tokio::sync::mpsc;

use podlite_shared::{PodliteError, PodliteResult};

use crate::vm::events::{InterfaceCreatedInfo, RouteRule, VmEvent};

/// Create `count` tap interfaces for the VM and post one
/// `InterfaceCreated` per success. The first failure is reported as
/// `PrepFailed` and stops the remaining creations.
pub async fn create_interfaces(vm_id: String, count: usize, hub: mpsc::Sender<VmEvent>) {
    for index in 0..count {
        match create_tap(&vm_id, index).await {
            Ok(info) => {
                if hub.send(VmEvent::InterfaceCreated(info)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = hub
                    .send(VmEvent::PrepFailed {
                        target: crate::vm::events::PrepTarget::Network(index),
                        cause: e.to_string(),
                    })
                    .await;
                return;
            }
        }
    }
}

async fn create_tap(vm_id: &str, index: usize) -> PodliteResult<InterfaceCreatedInfo> {
    let host_device = tap_name(vm_id, index);

    run_ip(&["tuntap", "add", "dev", &host_device, "mode", "tap"]).await?;
    run_ip(&["link", "set", &host_device, "up"]).await?;

    let mut routes = vec![RouteRule {
        destination: format!("192.168.{}.0/24", 100 + index),
        gateway: String::new(),
        via_this: true,
    }];
    if index == 0 {
        routes.push(RouteRule {
            destination: "0.0.0.0/0".into(),
            gateway: "192.168.100.1".into(),
            via_this: true,
        });
    }

    Ok(InterfaceCreatedInfo {
        index,
        device: format!("eth{}", index),
        host_device,
        ip_addr: format!("192.168.{}.2", 100 + index),
        net_mask: "255.255.255.0".into(),
        routes,
    })
}

/// Remove the VM's tap interfaces. Best-effort: errors are logged, teardown
/// never blocks on them.
pub async fn remove_interfaces(vm_id: &str, count: usize) {
    for index in 0..count {
        let name = tap_name(vm_id, index);
        if let Err(e) = run_ip(&["tuntap", "del", "dev", &name, "mode", "tap"]).await {
            tracing::warn!(device = %name, error = %e, "tap removal failed");
        }
    }
}

/// Tap name: `tp` + vm id suffix + index, kept under IFNAMSIZ.
fn tap_name(vm_id: &str, index: usize) -> String {
    let suffix = vm_id.strip_prefix("vm-").unwrap_or(vm_id);
    format!("tp{}{}", &suffix[..suffix.len().min(8)], index)
}

async fn run_ip(args: &[&str]) -> PodliteResult<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .await
        .map_err(|e| PodliteError::Network(format!("failed to run ip: {}", e)))?;
    if !output.status.success() {
        return Err(PodliteError::Network(format!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_name_is_short_and_stable() {
        let name = tap_name("vm-abcdefghij", 3);
        assert_eq!(name, "tpabcdefgh3");
        assert!(name.len() <= 15);
        assert_eq!(tap_name("vm-abcdefghij", 3), name);
    }
}
