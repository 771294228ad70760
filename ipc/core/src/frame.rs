//! Frame Protocol
//!
//! Wire format for messages after the handshake.
//!
//! # Frame Format
//!
//! ```text
//! +----------------+--------------------------------------------+
//! | Length (4)     | Payload (variable)                         |
//! | big-endian u32 | [Type (4, big-endian i32)][Data]           |
//! +----------------+--------------------------------------------+
//! ```
//!
//! When encryption is active the whole payload (type and data) is sealed and
//! the length describes the sealed bytes.
//!
//! # Security
//!
//! - The length field is checked against the connection's ceiling before a
//!   buffer is allocated

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::crypto::{Cipher, SEAL_OVERHEAD};
use crate::error::IpcError;

/// Size of the length prefix
pub const LENGTH_SIZE: usize = 4;

/// Size of the message type field inside the payload
pub const TYPE_SIZE: usize = 4;

/// Largest amount a payload can exceed the user data size by
pub const FRAME_OVERHEAD: usize = TYPE_SIZE + SEAL_OVERHEAD;

/// Encode a message into a complete frame, length prefix included
pub fn encode(msg_type: i32, data: &[u8], cipher: Option<&dyn Cipher>) -> Result<Vec<u8>, IpcError> {
    let mut payload = Vec::with_capacity(TYPE_SIZE + data.len());
    payload.extend_from_slice(&msg_type.to_be_bytes());
    payload.extend_from_slice(data);

    let payload = match cipher {
        Some(cipher) => cipher.seal(&payload)?,
        None => payload,
    };

    let len = u32::try_from(payload.len())
        .map_err(|_| IpcError::Protocol(format!("payload of {} bytes", payload.len())))?;

    let mut frame = Vec::with_capacity(LENGTH_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode a payload read off the wire into `(type, data)`
pub fn decode(payload: &[u8], cipher: Option<&dyn Cipher>) -> Result<(i32, Vec<u8>), IpcError> {
    let mut plain = match cipher {
        Some(cipher) => cipher.open(payload)?,
        None => payload.to_vec(),
    };

    if plain.len() < TYPE_SIZE {
        return Err(IpcError::Protocol(format!(
            "payload of {} bytes has no type field",
            plain.len()
        )));
    }

    let data = plain.split_off(TYPE_SIZE);
    let msg_type = i32::from_be_bytes([plain[0], plain[1], plain[2], plain[3]]);
    Ok((msg_type, data))
}

/// Outcome of reading one frame
#[derive(Debug)]
pub enum ReadFrame {
    Payload(Vec<u8>),
    /// The peer announced a payload larger than `limit`
    Oversized { len: usize, limit: usize },
}

/// Read one length-prefixed payload
///
/// # Errors
///
/// Returns the underlying I/O error, `UnexpectedEof` when the peer closed the
/// connection.
pub async fn read_frame<R>(reader: &mut R, limit: usize) -> std::io::Result<ReadFrame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > limit {
        return Ok(ReadFrame::Oversized { len, limit });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(ReadFrame::Payload(payload))
}
