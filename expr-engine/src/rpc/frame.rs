//! Length-prefixed framing of `bincode` messages on a byte stream.
//!
//! Layout: `u32` little-endian payload length, followed by the payload.

use std::io::{self, Read, Write};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::{Result, RpcError};

const HEADER_LEN: usize = 4;

/// Largest payload accepted from the peer.
pub const MAX_PAYLOAD_LEN: u32 = 1 << 20;

/// Frame under construction.
#[derive(Default)]
pub struct Frame {
    buffer: Vec<u8>,
}

impl Frame {
    /// Encode `message` into a frame with its length header filled in.
    pub fn encode<T: Serialize>(message: &T) -> Result<Frame> {
        let mut frame = Frame {
            buffer: Vec::with_capacity(64),
        };
        frame.emit32(0);
        bincode::serialize_into(&mut frame.buffer, message)?;

        let len = frame.buffer.len() - HEADER_LEN;
        if len > MAX_PAYLOAD_LEN as usize {
            return Err(RpcError::Protocol(format!("outgoing frame of {} bytes is too large", len)));
        }
        frame.emit32_at(0, len as u32);
        Ok(frame)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    fn emit32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    /// # Panics
    ///
    /// Panics if `[offset..offset + 4]` is outside of the buffer.
    fn emit32_at(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + HEADER_LEN].copy_from_slice(&value.to_le_bytes());
    }
}

/// Write one message and flush.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let frame = Frame::encode(message)?;
    trace!(len = frame.bytes().len(), frame = %hex::encode(frame.bytes()), "send");
    writer.write_all(frame.bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read one message.
///
/// # Errors
///
/// [`RpcError::Disconnected`] if the stream ends before the first header byte,
/// [`RpcError::Transport`] if it ends anywhere else.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut header = [0u8; HEADER_LEN];
    match reader.read(&mut header[..1]) {
        Ok(0) => return Err(RpcError::Disconnected),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return Err(RpcError::Disconnected),
        Err(e) => return Err(e.into()),
    }
    reader.read_exact(&mut header[1..])?;

    let len = u32::from_le_bytes(header);
    if len > MAX_PAYLOAD_LEN {
        return Err(RpcError::Protocol(format!("incoming frame of {} bytes is too large", len)));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    trace!(len, frame = %hex::encode(&payload), "receive");

    Ok(bincode::deserialize(&payload)?)
}
