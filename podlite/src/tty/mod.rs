//! TTY multiplexer: maps guest tty sessions onto host attach sessions.
//!
//! Attach ids are allocated per interactive container at spec ingestion.
//! Clients attach under an opaque tag; guest output fans out to every tag
//! bound to the attach id, client input is funneled into write-tty frames.

use std::collections::HashMap;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use podlite_shared::{Frame, MessageCode, TtyPayload};

use crate::vm::events::VmEvent;

/// Per attach-id record: the owning container and the attached clients.
#[derive(Debug, Default)]
pub struct Attachments {
    pub container: usize,
    /// tag -> client output channel.
    outputs: HashMap<String, mpsc::Sender<Vec<u8>>>,
}

/// The tty session state of one VM context.
#[derive(Debug, Default)]
pub struct TtyMultiplexer {
    /// tag -> attach id.
    sessions: HashMap<String, u64>,
    /// attach id -> attachments.
    ttys: HashMap<u64, Attachments>,
}

impl TtyMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an interactive container's attach session at spec ingestion.
    pub fn register(&mut self, attach_id: u64, container: usize) {
        self.ttys.insert(
            attach_id,
            Attachments {
                container,
                outputs: HashMap::new(),
            },
        );
    }

    pub fn session_count(&self) -> usize {
        self.ttys.len()
    }

    /// Bind a client tag to an attach session.
    ///
    /// Fails when the attach id was never registered.
    pub fn attach(&mut self, tag: String, attach_id: u64, output: mpsc::Sender<Vec<u8>>) -> bool {
        let Some(atts) = self.ttys.get_mut(&attach_id) else {
            return false;
        };
        atts.outputs.insert(tag.clone(), output);
        self.sessions.insert(tag, attach_id);
        true
    }

    pub fn detach(&mut self, tag: &str) {
        if tag.is_empty() {
            return;
        }
        if let Some(attach_id) = self.sessions.remove(tag) {
            if let Some(atts) = self.ttys.get_mut(&attach_id) {
                atts.outputs.remove(tag);
            }
        }
    }

    /// Fan guest output out to every client attached to the session.
    pub fn output(&self, attach_id: u64, data: &[u8]) {
        let Some(atts) = self.ttys.get(&attach_id) else {
            tracing::debug!(attach_id, "tty output for unknown session");
            return;
        };
        for (tag, sender) in &atts.outputs {
            if sender.try_send(data.to_vec()).is_err() {
                tracing::debug!(%tag, attach_id, "dropping tty output for slow client");
            }
        }
    }

    /// The guest closed a session: drop all attached clients.
    pub fn close_session(&mut self, attach_id: u64) {
        if let Some(atts) = self.ttys.get_mut(&attach_id) {
            let tags: Vec<String> = atts.outputs.keys().cloned().collect();
            atts.outputs.clear();
            for tag in tags {
                self.sessions.remove(&tag);
            }
        }
    }
}

/// Accept loop for the attach socket.
///
/// A client attaches by sending its attach id (8 bytes big-endian) followed
/// by a length-prefixed opaque tag, then speaks raw bytes both ways.
pub async fn tty_server(
    listener: UnixListener,
    hub: mpsc::Sender<VmEvent>,
    guest_tty: mpsc::Sender<Frame>,
    closed: watch::Receiver<bool>,
) {
    loop {
        let mut closed_accept = closed.clone();
        let stream = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "tty accept failed");
                    return;
                }
            },
            _ = closed_accept.changed() => return,
        };

        tokio::spawn(serve_client(
            stream,
            hub.clone(),
            guest_tty.clone(),
            closed.clone(),
        ));
    }
}

async fn serve_client(
    mut stream: UnixStream,
    hub: mpsc::Sender<VmEvent>,
    guest_tty: mpsc::Sender<Frame>,
    mut closed: watch::Receiver<bool>,
) {
    let (attach_id, tag) = match read_attach_header(&mut stream).await {
        Ok(header) => header,
        Err(e) => {
            tracing::warn!(error = %e, "rejecting tty client with bad header");
            return;
        }
    };

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    if hub
        .send(VmEvent::Attach {
            attach_id,
            tag: tag.clone(),
            output: out_tx,
        })
        .await
        .is_err()
    {
        return;
    }

    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = [0u8; 4096];
    loop {
        tokio::select! {
            read = read_half.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let payload = TtyPayload {
                        tty: attach_id,
                        data: buf[..n].to_vec(),
                    };
                    let frame = match serde_json::to_vec(&payload) {
                        Ok(bytes) => Frame::new(MessageCode::WriteTty, bytes),
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to encode tty input");
                            continue;
                        }
                    };
                    if guest_tty.send(frame).await.is_err() {
                        break;
                    }
                }
            },
            output = out_rx.recv() => match output {
                Some(data) => {
                    if write_half.write_all(&data).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = closed.changed() => break,
        }
    }

    let _ = hub.send(VmEvent::Detach { tag }).await;
}

async fn read_attach_header(stream: &mut UnixStream) -> std::io::Result<(u64, String)> {
    let mut id_buf = [0u8; 8];
    stream.read_exact(&mut id_buf).await?;
    let attach_id = u64::from_be_bytes(id_buf);

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > 256 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "tag too long",
        ));
    }

    let mut tag = vec![0u8; len];
    stream.read_exact(&mut tag).await?;
    Ok((attach_id, String::from_utf8_lossy(&tag).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_requires_registration() {
        let mut mux = TtyMultiplexer::new();
        let (tx, _rx) = mpsc::channel(1);
        assert!(!mux.attach("t".into(), 1, tx));

        mux.register(1, 0);
        let (tx, _rx) = mpsc::channel(1);
        assert!(mux.attach("t".into(), 1, tx));
        assert_eq!(mux.session_count(), 1);
    }

    #[test]
    fn test_output_fans_out_to_all_tags() {
        let mut mux = TtyMultiplexer::new();
        mux.register(1, 0);

        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        assert!(mux.attach("a".into(), 1, tx_a));
        assert!(mux.attach("b".into(), 1, tx_b));

        mux.output(1, b"hi");
        assert_eq!(rx_a.try_recv().unwrap(), b"hi");
        assert_eq!(rx_b.try_recv().unwrap(), b"hi");
    }

    #[test]
    fn test_detach_stops_fanout() {
        let mut mux = TtyMultiplexer::new();
        mux.register(1, 0);

        let (tx, mut rx) = mpsc::channel(4);
        assert!(mux.attach("a".into(), 1, tx));
        mux.detach("a");

        mux.output(1, b"hi");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_session_clears_tags() {
        let mut mux = TtyMultiplexer::new();
        mux.register(1, 0);

        let (tx, _rx) = mpsc::channel(4);
        assert!(mux.attach("a".into(), 1, tx));
        mux.close_session(1);

        // Tag is gone; re-attach works because the session itself survives.
        let (tx, _rx) = mpsc::channel(4);
        assert!(mux.attach("a".into(), 1, tx));
    }
}
