//! Connection Handshake
//!
//! Runs once per physical connection before any frame is exchanged.
//!
//! ```text
//! server                                   client
//!   | [version, encryption flag]  ------>    |  validate
//!   |  <------------------------- [reply]    |  0 ok, 1 version, 2 encryption, 3 read failure
//!   | [server public key (32)]    ------>    |  only when encryption is on
//!   |  <------------ [client public key]     |
//!   | [u32 len][max message size] ------>    |  sealed when encryption is on
//!   |  <------------------------- [0]        |
//! ```
//!
//! The whole exchange is bounded by [`HANDSHAKE_TIMEOUT`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::crypto::{Cipher, KeyExchange, PUBLIC_KEY_SIZE, SEAL_OVERHEAD};
use crate::error::HandshakeError;

/// Protocol version spoken by this crate
pub const PROTOCOL_VERSION: u8 = 2;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const REPLY_OK: u8 = 0;
const REPLY_VERSION_MISMATCH: u8 = 1;
const REPLY_ENCRYPTION_MISMATCH: u8 = 2;
const REPLY_READ_FAILED: u8 = 3;

/// Largest max-length payload a client will accept
const MAX_LENGTH_PAYLOAD_LIMIT: usize = 4 + SEAL_OVERHEAD;

/// What the client learns from a successful handshake
pub struct Negotiated {
    pub cipher: Option<Arc<dyn Cipher>>,
    pub max_msg_size: usize,
}

/// Server side of the handshake
///
/// Returns the session cipher when encryption was agreed.
pub async fn server_handshake<S>(
    stream: &mut S,
    encryption: bool,
    max_msg_size: usize,
) -> Result<Option<Arc<dyn Cipher>>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        server_exchange(stream, encryption, max_msg_size),
    )
    .await
    .map_err(|_| HandshakeError::TimedOut)?
}

async fn server_exchange<S>(
    stream: &mut S,
    encryption: bool,
    max_msg_size: usize,
) -> Result<Option<Arc<dyn Cipher>>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[PROTOCOL_VERSION, u8::from(encryption)])
        .await
        .map_err(HandshakeError::SendFailed)?;

    let mut reply = [0u8; 1];
    stream
        .read_exact(&mut reply)
        .await
        .map_err(HandshakeError::ReplyFailed)?;

    match reply[0] {
        REPLY_OK => {}
        REPLY_VERSION_MISMATCH => return Err(HandshakeError::VersionMismatch),
        REPLY_ENCRYPTION_MISMATCH => return Err(HandshakeError::EncryptionMismatch),
        REPLY_READ_FAILED => return Err(HandshakeError::ClientReadFailed),
        other => return Err(HandshakeError::Unknown(other)),
    }

    let cipher: Option<Arc<dyn Cipher>> = if encryption {
        let keys = KeyExchange::new();
        stream
            .write_all(&keys.public_bytes())
            .await
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
        let peer = read_public_key(stream).await?;
        let cipher = keys
            .complete(peer)
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
        Some(Arc::new(cipher))
    } else {
        None
    };

    // Ceilings above u32::MAX cannot be expressed on the wire
    let size = u32::try_from(max_msg_size).unwrap_or(u32::MAX).to_be_bytes();
    let payload = match &cipher {
        Some(cipher) => cipher
            .seal(&size)
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?,
        None => size.to_vec(),
    };
    // Payload is at most 4 + SEAL_OVERHEAD bytes
    let mut message = (payload.len() as u32).to_be_bytes().to_vec();
    message.extend_from_slice(&payload);
    stream
        .write_all(&message)
        .await
        .map_err(HandshakeError::MaxLengthSendFailed)?;

    stream
        .read_exact(&mut reply)
        .await
        .map_err(HandshakeError::MaxLengthReplyFailed)?;

    Ok(cipher)
}

/// Client side of the handshake
pub async fn client_handshake<S>(
    stream: &mut S,
    encryption: bool,
) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, client_exchange(stream, encryption))
        .await
        .map_err(|_| HandshakeError::TimedOut)?
}

async fn client_exchange<S>(stream: &mut S, encryption: bool) -> Result<Negotiated, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 2];
    if let Err(e) = stream.read_exact(&mut hello).await {
        // A busy single-client server drops extra connections unanswered
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(HandshakeError::Refused);
        }
        let _ = stream.write_all(&[REPLY_READ_FAILED]).await;
        return Err(HandshakeError::ReceiveFailed(e));
    }

    let [server_version, server_flag] = hello;
    if server_version != PROTOCOL_VERSION {
        let _ = stream.write_all(&[REPLY_VERSION_MISMATCH]).await;
        return Err(HandshakeError::ServerVersionMismatch {
            server: server_version,
            client: PROTOCOL_VERSION,
        });
    }

    let server_encrypts = server_flag == 1;
    if server_encrypts != encryption {
        let _ = stream.write_all(&[REPLY_ENCRYPTION_MISMATCH]).await;
        return Err(HandshakeError::ServerEncryptionMismatch {
            server: server_encrypts,
            client: encryption,
        });
    }

    stream
        .write_all(&[REPLY_OK])
        .await
        .map_err(HandshakeError::ReplySendFailed)?;

    let cipher: Option<Arc<dyn Cipher>> = if encryption {
        let keys = KeyExchange::new();
        let peer = read_public_key(stream).await?;
        stream
            .write_all(&keys.public_bytes())
            .await
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
        let cipher = keys
            .complete(peer)
            .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
        Some(Arc::new(cipher))
    } else {
        None
    };

    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|_| HandshakeError::MaxLengthReceiveFailed)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_LENGTH_PAYLOAD_LIMIT {
        return Err(HandshakeError::MaxLengthReceiveFailed);
    }

    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|_| HandshakeError::MaxLengthReceiveFailed)?;

    let plain = match &cipher {
        Some(cipher) => cipher
            .open(&payload)
            .map_err(|_| HandshakeError::MaxLengthReceiveFailed)?,
        None => payload,
    };
    let size: [u8; 4] = plain
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::MaxLengthReceiveFailed)?;

    stream
        .write_all(&[REPLY_OK])
        .await
        .map_err(HandshakeError::ReplySendFailed)?;

    Ok(Negotiated {
        cipher,
        max_msg_size: u32::from_be_bytes(size) as usize,
    })
}

async fn read_public_key<S>(stream: &mut S) -> Result<[u8; PUBLIC_KEY_SIZE], HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut key = [0u8; PUBLIC_KEY_SIZE];
    stream
        .read_exact(&mut key)
        .await
        .map_err(|e| HandshakeError::KeyExchange(e.to_string()))?;
    Ok(key)
}
