//! QMP wire types.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// An outgoing monitor command.
#[derive(Debug, Clone, Serialize)]
pub struct QmpCommand {
    pub execute: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

impl QmpCommand {
    pub fn new(execute: impl Into<String>, arguments: Value) -> Self {
        Self {
            execute: execute.into(),
            arguments: Some(arguments),
        }
    }

    pub fn qmp_capabilities() -> Self {
        Self {
            execute: "qmp_capabilities".into(),
            arguments: None,
        }
    }

    /// First half of a disk hotplug: register the host file as a blockdev.
    pub fn blockdev_add(node_name: &str, filename: &str, format: &str) -> Self {
        Self::new(
            "blockdev-add",
            json!({
                "node-name": node_name,
                "driver": format,
                "file": { "driver": "file", "filename": filename },
            }),
        )
    }

    /// Second half of a disk hotplug: a scsi-hd on the synthetic scsi bus.
    pub fn device_add_scsi_hd(device_id: &str, node_name: &str, scsi_id: u32) -> Self {
        Self::new(
            "device_add",
            json!({
                "driver": "scsi-hd",
                "id": device_id,
                "bus": "scsi0.0",
                "scsi-id": scsi_id,
                "drive": node_name,
            }),
        )
    }

    pub fn device_del(device_id: &str) -> Self {
        Self::new("device_del", json!({ "id": device_id }))
    }

    pub fn netdev_add(netdev_id: &str, ifname: &str) -> Self {
        Self::new(
            "netdev_add",
            json!({
                "type": "tap",
                "id": netdev_id,
                "ifname": ifname,
                "script": "no",
                "downscript": "no",
            }),
        )
    }

    pub fn device_add_virtio_net(device_id: &str, netdev_id: &str, pci_addr: u32) -> Self {
        Self::new(
            "device_add",
            json!({
                "driver": "virtio-net-pci",
                "id": device_id,
                "netdev": netdev_id,
                "bus": "pci.0",
                "addr": format!("{:#04x}", pci_addr),
            }),
        )
    }
}

/// Anything QEMU can send on the monitor socket.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum QmpMessage {
    Greeting {
        #[serde(rename = "QMP")]
        qmp: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        data: Value,
    },
    Return {
        #[serde(rename = "return")]
        ret: Value,
    },
    Error {
        error: QmpError,
    },
}

#[derive(Debug, Deserialize)]
pub struct QmpError {
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub desc: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_serialization() {
        let cmd = QmpCommand::qmp_capabilities();
        let s = serde_json::to_string(&cmd).unwrap();
        assert_eq!(s, r#"{"execute":"qmp_capabilities"}"#);

        let cmd = QmpCommand::device_del("scsi-disk-2");
        let v: Value = serde_json::from_str(&serde_json::to_string(&cmd).unwrap()).unwrap();
        assert_eq!(v["execute"], "device_del");
        assert_eq!(v["arguments"]["id"], "scsi-disk-2");
    }

    #[test]
    fn test_blockdev_add_shape() {
        let cmd = QmpCommand::blockdev_add("drive-v1", "/vols/v1.img", "raw");
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["arguments"]["node-name"], "drive-v1");
        assert_eq!(v["arguments"]["driver"], "raw");
        assert_eq!(v["arguments"]["file"]["filename"], "/vols/v1.img");
    }

    #[test]
    fn test_message_parsing() {
        let greeting: QmpMessage =
            serde_json::from_str(r#"{"QMP":{"version":{},"capabilities":[]}}"#).unwrap();
        assert!(matches!(greeting, QmpMessage::Greeting { .. }));

        let ret: QmpMessage = serde_json::from_str(r#"{"return":{}}"#).unwrap();
        assert!(matches!(ret, QmpMessage::Return { .. }));

        let err: QmpMessage =
            serde_json::from_str(r#"{"error":{"class":"GenericError","desc":"nope"}}"#).unwrap();
        match err {
            QmpMessage::Error { error } => assert_eq!(error.desc, "nope"),
            other => panic!("expected error, got {:?}", other),
        }

        let event: QmpMessage = serde_json::from_str(
            r#"{"event":"DEVICE_DELETED","data":{"device":"d0"},"timestamp":{"seconds":1,"microseconds":2}}"#,
        )
        .unwrap();
        match event {
            QmpMessage::Event { event, data } => {
                assert_eq!(event, "DEVICE_DELETED");
                assert_eq!(data["device"], "d0");
            }
            other => panic!("expected event, got {:?}", other),
        }
    }
}
