//! QMP driver: the control channel to the QEMU monitor.
//!
//! One connection per VM. The driver performs the capabilities handshake
//! exactly once, serializes command sessions so at most one command is in
//! flight, pairs every reply with its issuing session, and waits for the
//! `DEVICE_DELETED` async event before confirming unplugs. Transport
//! failures surface as a single fatal hub event.

pub mod types;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, watch};

use podlite_shared::{PodliteError, PodliteResult};

use crate::vm::events::VmEvent;
use types::{QmpCommand, QmpMessage};

/// One serialized unit of QMP work: the commands to run, the hub event to
/// post on success, and an optional `DEVICE_DELETED` id to await first.
#[derive(Debug)]
pub struct QmpSession {
    pub commands: Vec<QmpCommand>,
    /// Device id whose `DEVICE_DELETED` event must arrive before the
    /// session completes. Used by unplug sessions.
    pub wait_device_deleted: Option<String>,
    pub outcome: SessionOutcome,
}

/// What to report to the hub when a session finishes.
///
/// Plug failures are fail-fast; unplug failures still count as completions so
/// teardown can drain.
#[derive(Debug)]
pub enum SessionOutcome {
    BlockdevInserted(crate::vm::events::BlockdevInsertedInfo),
    NetdevInserted { index: usize },
    VolumeUnplugged { name: String },
    ImageUnplugged { index: usize },
}

impl SessionOutcome {
    fn success_event(self) -> VmEvent {
        match self {
            SessionOutcome::BlockdevInserted(info) => VmEvent::BlockdevInserted(info),
            SessionOutcome::NetdevInserted { index } => VmEvent::NetdevInserted { index },
            SessionOutcome::VolumeUnplugged { name } => VmEvent::VolumeUnmounted {
                name,
                success: true,
            },
            SessionOutcome::ImageUnplugged { index } => VmEvent::ContainerUnmounted {
                index,
                success: true,
            },
        }
    }

    fn failure_event(self, cause: String) -> VmEvent {
        match self {
            SessionOutcome::BlockdevInserted(info) => VmEvent::PrepFailed {
                target: crate::vm::events::PrepTarget::Blockdev(info.name),
                cause,
            },
            SessionOutcome::NetdevInserted { index } => VmEvent::PrepFailed {
                target: crate::vm::events::PrepTarget::Network(index),
                cause,
            },
            SessionOutcome::VolumeUnplugged { name } => VmEvent::VolumeUnmounted {
                name,
                success: false,
            },
            SessionOutcome::ImageUnplugged { index } => VmEvent::ContainerUnmounted {
                index,
                success: false,
            },
        }
    }
}

/// Accept the QEMU monitor connection and drive sessions until the context
/// closes or the transport dies.
pub async fn qmp_driver(
    listener: UnixListener,
    mut sessions: mpsc::Receiver<QmpSession>,
    hub: mpsc::Sender<VmEvent>,
    mut closed: watch::Receiver<bool>,
) {
    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                let _ = hub.send(VmEvent::QmpFailed { cause: format!("accept failed: {}", e) }).await;
                return;
            }
        },
        _ = closed.changed() => return,
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    if let Err(e) = handshake(&mut reader, &mut write_half).await {
        let _ = hub
            .send(VmEvent::QmpFailed {
                cause: e.to_string(),
            })
            .await;
        return;
    }
    tracing::debug!("qmp capabilities negotiated");
    let _ = hub.send(VmEvent::QmpReady).await;

    // A dedicated reader keeps message parsing out of the select below;
    // dropping a half-read line there would corrupt the stream.
    let (msg_tx, mut msg_rx) = mpsc::channel::<PodliteResult<QmpMessage>>(64);
    tokio::spawn(async move {
        loop {
            let result = read_message(&mut reader).await;
            let failed = result.is_err();
            if msg_tx.send(result).await.is_err() || failed {
                return;
            }
        }
    });

    loop {
        tokio::select! {
            session = sessions.recv() => {
                let Some(session) = session else { return };
                match run_session(&mut msg_rx, &mut write_half, &session).await {
                    Ok(()) => {
                        let _ = hub.send(session.outcome.success_event()).await;
                    }
                    Err(SessionError::Command(cause)) => {
                        tracing::warn!(%cause, "qmp session failed");
                        let _ = hub.send(session.outcome.failure_event(cause)).await;
                    }
                    Err(SessionError::Transport(cause)) => {
                        let _ = hub.send(session.outcome.failure_event(cause.clone())).await;
                        // Queued sessions will never run; fail them so the
                        // teardown drain still converges.
                        while let Ok(queued) = sessions.try_recv() {
                            let _ = hub
                                .send(queued.outcome.failure_event("qmp transport lost".into()))
                                .await;
                        }
                        let _ = hub.send(VmEvent::QmpFailed { cause }).await;
                        return;
                    }
                }
            }
            msg = msg_rx.recv() => {
                match msg {
                    Some(Ok(QmpMessage::Event { event, data })) => {
                        tracing::debug!(%event, ?data, "unsolicited qmp event");
                    }
                    Some(Ok(other)) => {
                        tracing::debug!(?other, "unexpected qmp message outside session");
                    }
                    Some(Err(e)) => {
                        if !*closed.borrow() {
                            let _ = hub.send(VmEvent::QmpFailed { cause: e.to_string() }).await;
                        }
                        return;
                    }
                    None => return,
                }
            }
            _ = closed.changed() => return,
        }
    }
}

/// Consume the greeting and negotiate capabilities.
async fn handshake(
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
) -> PodliteResult<()> {
    match read_message(reader).await? {
        QmpMessage::Greeting { .. } => {}
        other => {
            return Err(PodliteError::Qmp(format!(
                "expected greeting, got {:?}",
                other
            )))
        }
    }

    send_command(writer, &QmpCommand::qmp_capabilities()).await?;
    loop {
        match read_message(reader).await? {
            QmpMessage::Return { .. } => return Ok(()),
            QmpMessage::Error { error } => {
                return Err(PodliteError::Qmp(format!(
                    "qmp_capabilities failed: {}",
                    error.desc
                )))
            }
            QmpMessage::Event { event, .. } => {
                tracing::debug!(%event, "event during handshake");
            }
            QmpMessage::Greeting { .. } => {
                return Err(PodliteError::Qmp("duplicate greeting".into()))
            }
        }
    }
}

enum SessionError {
    /// QEMU rejected a command; the transport is still healthy.
    Command(String),
    /// The connection itself failed.
    Transport(String),
}

async fn run_session(
    messages: &mut mpsc::Receiver<PodliteResult<QmpMessage>>,
    writer: &mut OwnedWriteHalf,
    session: &QmpSession,
) -> Result<(), SessionError> {
    let mut deleted_seen = false;
    let wait_id = session.wait_device_deleted.as_deref();

    for cmd in &session.commands {
        send_command(writer, cmd)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        loop {
            match next_message(messages).await? {
                QmpMessage::Return { .. } => break,
                QmpMessage::Error { error } => {
                    return Err(SessionError::Command(format!(
                        "{} failed: {} ({})",
                        cmd.execute, error.desc, error.class
                    )));
                }
                QmpMessage::Event { event, data } => {
                    if is_device_deleted(&event, &data, wait_id) {
                        deleted_seen = true;
                    }
                }
                QmpMessage::Greeting { .. } => {
                    return Err(SessionError::Transport("unexpected greeting".into()));
                }
            }
        }
    }

    if let Some(id) = wait_id {
        while !deleted_seen {
            match next_message(messages).await? {
                QmpMessage::Event { event, data } => {
                    if is_device_deleted(&event, &data, Some(id)) {
                        deleted_seen = true;
                    }
                }
                other => {
                    tracing::debug!(?other, "message while awaiting DEVICE_DELETED");
                }
            }
        }
    }

    Ok(())
}

async fn next_message(
    messages: &mut mpsc::Receiver<PodliteResult<QmpMessage>>,
) -> Result<QmpMessage, SessionError> {
    match messages.recv().await {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(e)) => Err(SessionError::Transport(e.to_string())),
        None => Err(SessionError::Transport("qmp reader gone".into())),
    }
}

fn is_device_deleted(event: &str, data: &serde_json::Value, wait_id: Option<&str>) -> bool {
    if event != "DEVICE_DELETED" {
        return false;
    }
    match wait_id {
        Some(id) => data.get("device").and_then(|d| d.as_str()) == Some(id),
        None => false,
    }
}

async fn send_command(writer: &mut OwnedWriteHalf, cmd: &QmpCommand) -> PodliteResult<()> {
    let mut buf = serde_json::to_vec(cmd)?;
    buf.push(b'\n');
    writer
        .write_all(&buf)
        .await
        .map_err(|e| PodliteError::Qmp(format!("write failed: {}", e)))?;
    Ok(())
}

/// Read one newline-delimited QMP message.
async fn read_message(reader: &mut BufReader<OwnedReadHalf>) -> PodliteResult<QmpMessage> {
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| PodliteError::Qmp(format!("read failed: {}", e)))?;
        if n == 0 {
            return Err(PodliteError::Qmp("connection closed".into()));
        }
        if line.trim().is_empty() {
            continue;
        }
        return serde_json::from_str(&line)
            .map_err(|e| PodliteError::Qmp(format!("malformed qmp message: {}", e)));
    }
}

/// Guest disk name for a scsi id: 0 -> sda, 25 -> sdz, 26 -> sdaa.
pub fn scsi_device_name(scsi_id: u32) -> String {
    let mut name = String::new();
    let mut n = scsi_id;
    loop {
        name.insert(0, (b'a' + (n % 26) as u8) as char);
        n /= 26;
        if n == 0 {
            break;
        }
        n -= 1;
    }
    format!("sd{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scsi_device_names() {
        assert_eq!(scsi_device_name(0), "sda");
        assert_eq!(scsi_device_name(1), "sdb");
        assert_eq!(scsi_device_name(25), "sdz");
        assert_eq!(scsi_device_name(26), "sdaa");
        assert_eq!(scsi_device_name(27), "sdab");
    }

    #[test]
    fn test_device_deleted_matching() {
        let data = serde_json::json!({"device": "scsi-disk-3", "path": "/machine/..."});
        assert!(is_device_deleted("DEVICE_DELETED", &data, Some("scsi-disk-3")));
        assert!(!is_device_deleted("DEVICE_DELETED", &data, Some("scsi-disk-4")));
        assert!(!is_device_deleted("DEVICE_DELETED", &data, None));
        assert!(!is_device_deleted("SHUTDOWN", &data, Some("scsi-disk-3")));
    }
}
