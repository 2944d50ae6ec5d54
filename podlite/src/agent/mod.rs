//! Guest-agent channel over the virtio-serial Unix socket.
//!
//! QEMU bridges two virtserialports onto the same socket path and therefore
//! opens two client connections. The first accepted stream is the framed
//! control channel; the second carries tty frames. Each stream gets one
//! reader and one writer task; decoded control frames become hub events.
//!
//! A watchdog resets on every received control frame. When it fires, a
//! fatal event is injected into the hub.

use std::time::Duration;

use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use podlite_shared::{ExitPayload, Frame, MessageCode, TtyPayload};

use crate::vm::events::VmEvent;

/// How long the guest may stay silent before the channel is declared dead.
pub const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(60);

/// Accept both virtserialport connections and run the channel until the
/// context closes.
pub async fn agent_channel(
    listener: UnixListener,
    control_rx: mpsc::Receiver<Frame>,
    tty_rx: mpsc::Receiver<Frame>,
    hub: mpsc::Sender<VmEvent>,
    watchdog: Duration,
    mut closed: watch::Receiver<bool>,
) {
    let control = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                let _ = hub.send(VmEvent::TransportError {
                    which: "agent",
                    cause: format!("accept failed: {}", e),
                }).await;
                return;
            }
        },
        _ = closed.changed() => return,
    };

    let tty = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                let _ = hub.send(VmEvent::TransportError {
                    which: "agent-tty",
                    cause: format!("accept failed: {}", e),
                }).await;
                return;
            }
        },
        _ = closed.changed() => return,
    };

    tokio::spawn(channel_io(
        control,
        control_rx,
        hub.clone(),
        Some(watchdog),
        closed.clone(),
        "agent",
    ));
    tokio::spawn(channel_io(tty, tty_rx, hub, None, closed, "agent-tty"));
}

/// Reader + writer loop for one stream. `watchdog` is only armed on the
/// control channel.
async fn channel_io(
    stream: UnixStream,
    mut outbound: mpsc::Receiver<Frame>,
    hub: mpsc::Sender<VmEvent>,
    watchdog: Option<Duration>,
    mut closed: watch::Receiver<bool>,
    which: &'static str,
) {
    let (read_half, write_half) = stream.into_split();
    let mut reader = tokio::io::BufReader::new(read_half);

    let mut writer_closed = closed.clone();
    let writer: tokio::task::JoinHandle<()> = tokio::spawn(async move {
        let mut write_half: OwnedWriteHalf = write_half;
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else { return };
                    if let Err(e) = frame.write_to(&mut write_half).await {
                        tracing::warn!(error = %e, "agent write failed");
                        return;
                    }
                }
                _ = writer_closed.changed() => return,
            }
        }
    });

    loop {
        let frame = if let Some(timeout) = watchdog {
            tokio::select! {
                frame = tokio::time::timeout(timeout, Frame::read_from(&mut reader)) => match frame {
                    Ok(frame) => frame,
                    Err(_) => {
                        let _ = hub.send(VmEvent::WatchdogFired).await;
                        break;
                    }
                },
                _ = closed.changed() => break,
            }
        } else {
            tokio::select! {
                frame = Frame::read_from(&mut reader) => frame,
                _ = closed.changed() => break,
            }
        };

        match frame {
            Ok(frame) => {
                if let Some(event) = decode_frame(frame) {
                    if hub.send(event).await.is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                // A closed context tears the socket down on purpose.
                if !*closed.borrow() {
                    let _ = hub
                        .send(VmEvent::TransportError {
                            which,
                            cause: e.to_string(),
                        })
                        .await;
                }
                break;
            }
        }
    }

    writer.abort();
}

/// Map a decoded frame onto a hub event. Unknown codes are logged and
/// dropped; so are host-to-guest codes echoed back at us.
fn decode_frame(frame: Frame) -> Option<VmEvent> {
    let Some(code) = frame.message_code() else {
        tracing::warn!(code = frame.code, "dropping frame with unknown code");
        return None;
    };

    match code {
        MessageCode::Ready => Some(VmEvent::AgentReady),
        MessageCode::Ack => Some(VmEvent::AgentAck),
        MessageCode::Error => Some(VmEvent::AgentError {
            cause: String::from_utf8_lossy(&frame.message).into_owned(),
        }),
        MessageCode::Exit => {
            let code = serde_json::from_slice::<ExitPayload>(&frame.message)
                .map(|p| p.code)
                .unwrap_or(-1);
            Some(VmEvent::AgentExit { code })
        }
        MessageCode::Finish => Some(VmEvent::AgentFinished),
        MessageCode::WriteTty => match serde_json::from_slice::<TtyPayload>(&frame.message) {
            Ok(payload) => Some(VmEvent::TtyOutput {
                attach_id: payload.tty,
                data: payload.data,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed tty frame");
                None
            }
        },
        MessageCode::CloseTty => match serde_json::from_slice::<TtyPayload>(&frame.message) {
            Ok(payload) => Some(VmEvent::TtyClosed {
                attach_id: payload.tty,
            }),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed close-tty frame");
                None
            }
        },
        MessageCode::RunPod
        | MessageCode::NewContainer
        | MessageCode::KillContainer
        | MessageCode::Shutdown => {
            tracing::warn!(?code, "dropping host-only code received from guest");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_control_frames() {
        assert!(matches!(
            decode_frame(Frame::bare(MessageCode::Ready)),
            Some(VmEvent::AgentReady)
        ));
        assert!(matches!(
            decode_frame(Frame::bare(MessageCode::Ack)),
            Some(VmEvent::AgentAck)
        ));

        let err = decode_frame(Frame::new(MessageCode::Error, b"boom".to_vec()));
        match err {
            Some(VmEvent::AgentError { cause }) => assert_eq!(cause, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_tty_frame() {
        let payload = serde_json::to_vec(&TtyPayload {
            tty: 7,
            data: b"out".to_vec(),
        })
        .unwrap();
        match decode_frame(Frame::new(MessageCode::WriteTty, payload)) {
            Some(VmEvent::TtyOutput { attach_id, data }) => {
                assert_eq!(attach_id, 7);
                assert_eq!(data, b"out");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_host_codes_dropped() {
        assert!(decode_frame(Frame {
            code: 99,
            message: Vec::new()
        })
        .is_none());
        assert!(decode_frame(Frame::bare(MessageCode::RunPod)).is_none());
        assert!(decode_frame(Frame::bare(MessageCode::Shutdown)).is_none());
    }

    #[test]
    fn test_exit_payload_fallback() {
        match decode_frame(Frame::new(MessageCode::Exit, b"not-json".to_vec())) {
            Some(VmEvent::AgentExit { code }) => assert_eq!(code, -1),
            other => panic!("unexpected {:?}", other),
        }
    }
}
