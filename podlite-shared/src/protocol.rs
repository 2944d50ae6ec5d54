//! Wire protocol for the guest-agent channel.
//!
//! Every message is a 4-byte big-endian length prefix followed by a JSON
//! object `{code, message}`. The length covers the JSON payload only.
//! Unknown codes must be tolerated by receivers (logged and dropped), so the
//! frame itself carries a raw `u32` code.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::{PodliteError, PodliteResult};

/// Commands and replies spoken over the guest-agent channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    /// Host -> guest: start the pod described by the payload ([`crate::VmPod`]).
    RunPod,
    /// Host -> guest: add one container to a running pod.
    NewContainer,
    /// Host -> guest: kill a container by id.
    KillContainer,
    /// Both directions: tty data for one attach session.
    WriteTty,
    /// Both directions: close one tty attach session.
    CloseTty,
    /// Host -> guest: orderly shutdown of the whole VM.
    Shutdown,
    /// Guest -> host: agent is up and listening.
    Ready,
    /// Guest -> host: last command succeeded.
    Ack,
    /// Guest -> host: last command failed; payload carries the cause.
    Error,
    /// Guest -> host: a container process exited; payload carries the code.
    Exit,
    /// Guest -> host: the whole pod finished.
    Finish,
}

impl MessageCode {
    pub fn as_u32(self) -> u32 {
        match self {
            MessageCode::RunPod => 1,
            MessageCode::NewContainer => 2,
            MessageCode::KillContainer => 3,
            MessageCode::WriteTty => 4,
            MessageCode::CloseTty => 5,
            MessageCode::Shutdown => 6,
            MessageCode::Ready => 7,
            MessageCode::Ack => 8,
            MessageCode::Error => 9,
            MessageCode::Exit => 10,
            MessageCode::Finish => 11,
        }
    }

    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(MessageCode::RunPod),
            2 => Some(MessageCode::NewContainer),
            3 => Some(MessageCode::KillContainer),
            4 => Some(MessageCode::WriteTty),
            5 => Some(MessageCode::CloseTty),
            6 => Some(MessageCode::Shutdown),
            7 => Some(MessageCode::Ready),
            8 => Some(MessageCode::Ack),
            9 => Some(MessageCode::Error),
            10 => Some(MessageCode::Exit),
            11 => Some(MessageCode::Finish),
            _ => None,
        }
    }
}

/// One framed message on the guest-agent channel.
///
/// `code` stays raw on the wire so receivers can drop unknown codes without
/// tearing the channel down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub code: u32,
    #[serde(default)]
    pub message: Vec<u8>,
}

/// Frames larger than this are treated as a protocol violation.
const MAX_FRAME_LEN: usize = 10 * 1024 * 1024;

impl Frame {
    pub fn new(code: MessageCode, message: Vec<u8>) -> Self {
        Self {
            code: code.as_u32(),
            message,
        }
    }

    /// A frame with no payload.
    pub fn bare(code: MessageCode) -> Self {
        Self::new(code, Vec::new())
    }

    /// The typed code, if this frame carries a known one.
    pub fn message_code(&self) -> Option<MessageCode> {
        MessageCode::from_u32(self.code)
    }

    /// Serialize to the wire form: 4-byte big-endian length + JSON payload.
    pub fn encode(&self) -> PodliteResult<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Read one frame from an async stream.
    pub async fn read_from<R>(reader: &mut R) -> PodliteResult<Self>
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| PodliteError::Channel(format!("failed to read frame header: {}", e)))?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(PodliteError::Channel(format!(
                "frame length {} exceeds limit",
                len
            )));
        }

        let mut payload = vec![0u8; len];
        if len > 0 {
            reader
                .read_exact(&mut payload)
                .await
                .map_err(|e| PodliteError::Channel(format!("failed to read frame body: {}", e)))?;
        }

        serde_json::from_slice(&payload)
            .map_err(|e| PodliteError::Channel(format!("malformed frame: {}", e)))
    }

    /// Write one frame to an async stream.
    pub async fn write_to<W>(&self, writer: &mut W) -> PodliteResult<()>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        let buf = self.encode()?;
        writer
            .write_all(&buf)
            .await
            .map_err(|e| PodliteError::Channel(format!("failed to write frame: {}", e)))?;
        Ok(())
    }

    /// Read one frame from a synchronous stream.
    pub fn read_from_sync<R: std::io::Read>(reader: &mut R) -> PodliteResult<Self> {
        let mut header = [0u8; 4];
        reader
            .read_exact(&mut header)
            .map_err(|e| PodliteError::Channel(format!("failed to read frame header: {}", e)))?;

        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(PodliteError::Channel(format!(
                "frame length {} exceeds limit",
                len
            )));
        }

        let mut payload = vec![0u8; len];
        reader
            .read_exact(&mut payload)
            .map_err(|e| PodliteError::Channel(format!("failed to read frame body: {}", e)))?;

        serde_json::from_slice(&payload)
            .map_err(|e| PodliteError::Channel(format!("malformed frame: {}", e)))
    }
}

/// Payload of `WriteTty` and `CloseTty` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtyPayload {
    pub tty: u64,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Payload of `Exit` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitPayload {
    pub code: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_big_endian_length() {
        let frame = Frame::bare(MessageCode::Ready);
        let bytes = frame.encode().unwrap();

        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);

        let parsed: Frame = serde_json::from_slice(&bytes[4..]).unwrap();
        assert_eq!(parsed.message_code(), Some(MessageCode::Ready));
        assert!(parsed.message.is_empty());
    }

    #[test]
    fn test_roundtrip_sync() {
        let frame = Frame::new(MessageCode::WriteTty, b"hello".to_vec());
        let bytes = frame.encode().unwrap();

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Frame::read_from_sync(&mut cursor).unwrap();
        assert_eq!(decoded, frame);
    }

    #[tokio::test]
    async fn test_roundtrip_async() {
        let frame = Frame::new(MessageCode::RunPod, br#"{"hostname":"p"}"#.to_vec());
        let bytes = frame.encode().unwrap();

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Frame::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_unknown_code_still_decodes() {
        // Receivers drop unknown codes; the codec must not reject them.
        let raw = br#"{"code":99,"message":[]}"#;
        let mut bytes = (raw.len() as u32).to_be_bytes().to_vec();
        bytes.extend_from_slice(raw);

        let mut cursor = std::io::Cursor::new(bytes);
        let frame = Frame::read_from_sync(&mut cursor).unwrap();
        assert_eq!(frame.code, 99);
        assert_eq!(frame.message_code(), None);
    }

    #[test]
    fn test_truncated_frame_is_error() {
        let frame = Frame::bare(MessageCode::Ack);
        let mut bytes = frame.encode().unwrap();
        bytes.truncate(bytes.len() - 2);

        let mut cursor = std::io::Cursor::new(bytes);
        assert!(Frame::read_from_sync(&mut cursor).is_err());
    }

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(MessageCode::RunPod.as_u32(), 1);
        assert_eq!(MessageCode::Shutdown.as_u32(), 6);
        assert_eq!(MessageCode::Finish.as_u32(), 11);
        assert_eq!(MessageCode::from_u32(8), Some(MessageCode::Ack));
        assert_eq!(MessageCode::from_u32(42), None);
    }

    #[test]
    fn test_tty_payload_roundtrip() {
        let payload = TtyPayload {
            tty: 3,
            data: b"ls\n".to_vec(),
        };
        let json = serde_json::to_vec(&payload).unwrap();
        let back: TtyPayload = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, payload);
    }
}
