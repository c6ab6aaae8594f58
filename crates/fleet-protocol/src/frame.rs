//! Length-prefixed framing for hub connections.
//!
//! # Wire Format
//!
//! ```text
//! +--------+--------+------------------+
//! | Length | Type   | Payload          |
//! | 4 bytes| 1 byte | variable         |
//! | BE u32 | u8     | JSON             |
//! +--------+--------+------------------+
//! ```
//!
//! The length covers the type byte and the payload.
//!
//! # Message Types
//!
//! - 0x01: Instance Info (instance -> hub, first frame)
//! - 0x02: Handshake Ack (hub -> instance)
//! - 0x10: Heartbeat (instance -> hub)
//! - 0x20: Command Request (hub -> instance)
//! - 0x21: Command Result (instance -> hub)

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::protocol::{CommandEnvelope, CommandResult, HandshakeAck, Heartbeat, InstanceInfo};
use crate::FleetProtocolError;

/// Message type identifiers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    InstanceInfo = 0x01,
    HandshakeAck = 0x02,
    Heartbeat = 0x10,
    CommandRequest = 0x20,
    CommandResult = 0x21,
}

impl TryFrom<u8> for MessageType {
    type Error = FleetProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(MessageType::InstanceInfo),
            0x02 => Ok(MessageType::HandshakeAck),
            0x10 => Ok(MessageType::Heartbeat),
            0x20 => Ok(MessageType::CommandRequest),
            0x21 => Ok(MessageType::CommandResult),
            _ => Err(FleetProtocolError::InvalidMessage(format!(
                "Unknown message type: 0x{:02x}",
                value
            ))),
        }
    }
}

/// Any message that can travel over a hub connection.
#[derive(Debug, Clone)]
pub enum HubMessage {
    InstanceInfo(InstanceInfo),
    HandshakeAck(HandshakeAck),
    Heartbeat(Heartbeat),
    CommandRequest(CommandEnvelope),
    CommandResult(CommandResult),
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            HubMessage::InstanceInfo(_) => MessageType::InstanceInfo,
            HubMessage::HandshakeAck(_) => MessageType::HandshakeAck,
            HubMessage::Heartbeat(_) => MessageType::Heartbeat,
            HubMessage::CommandRequest(_) => MessageType::CommandRequest,
            HubMessage::CommandResult(_) => MessageType::CommandResult,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, FleetProtocolError> {
        match self {
            HubMessage::InstanceInfo(m) => to_json(m),
            HubMessage::HandshakeAck(m) => to_json(m),
            HubMessage::Heartbeat(m) => to_json(m),
            HubMessage::CommandRequest(m) => to_json(m),
            HubMessage::CommandResult(m) => to_json(m),
        }
    }

    fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, FleetProtocolError> {
        Ok(match msg_type {
            MessageType::InstanceInfo => HubMessage::InstanceInfo(from_json(payload)?),
            MessageType::HandshakeAck => HubMessage::HandshakeAck(from_json(payload)?),
            MessageType::Heartbeat => HubMessage::Heartbeat(from_json(payload)?),
            MessageType::CommandRequest => HubMessage::CommandRequest(from_json(payload)?),
            MessageType::CommandResult => HubMessage::CommandResult(from_json(payload)?),
        })
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>, FleetProtocolError> {
    serde_json::to_vec(value).map_err(|e| FleetProtocolError::Serialization(e.to_string()))
}

fn from_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, FleetProtocolError> {
    serde_json::from_slice(payload).map_err(|e| FleetProtocolError::InvalidMessage(e.to_string()))
}

/// Length prefix for a payload of `payload_len` bytes. The length includes
/// the type byte and must fit both `max_size` and the u32 prefix.
fn frame_length(payload_len: usize, max_size: usize) -> Result<u32, FleetProtocolError> {
    let size = payload_len.saturating_add(1);
    let too_large = || FleetProtocolError::MessageTooLarge {
        size,
        max: max_size,
    };
    if size > max_size {
        return Err(too_large());
    }
    u32::try_from(size).map_err(|_| too_large())
}

/// Write a message to the stream.
pub async fn write_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    msg_type: MessageType,
    payload: &[u8],
    max_size: usize,
) -> Result<(), FleetProtocolError> {
    let total_len = frame_length(payload.len(), max_size)?;
    writer.write_all(&total_len.to_be_bytes()).await?;
    writer.write_all(&[msg_type as u8]).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read a message from the stream.
pub async fn read_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<(MessageType, Vec<u8>), FleetProtocolError> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FleetProtocolError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let total_len = u32::from_be_bytes(len_bytes) as usize;

    if total_len == 0 {
        return Err(FleetProtocolError::InvalidMessage(
            "Zero-length message".to_string(),
        ));
    }

    if total_len > max_size {
        return Err(FleetProtocolError::MessageTooLarge {
            size: total_len,
            max: max_size,
        });
    }

    let mut type_byte = [0u8; 1];
    reader.read_exact(&mut type_byte).await?;
    let msg_type = MessageType::try_from(type_byte[0])?;

    let payload_len = total_len - 1;
    let mut payload = vec![0u8; payload_len];
    if payload_len > 0 {
        reader.read_exact(&mut payload).await?;
    }

    Ok((msg_type, payload))
}

/// Encode and write one [`HubMessage`].
pub async fn send_message<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    message: &HubMessage,
    max_size: usize,
) -> Result<(), FleetProtocolError> {
    let payload = message.encode_payload()?;
    trace!(msg_type = ?message.message_type(), len = payload.len(), "Writing frame");
    write_message(writer, message.message_type(), &payload, max_size).await
}

/// Read and decode one [`HubMessage`].
pub async fn recv_message<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<HubMessage, FleetProtocolError> {
    let (msg_type, payload) = read_message(reader, max_size).await?;
    trace!(msg_type = ?msg_type, len = payload.len(), "Read frame");
    HubMessage::decode(msg_type, &payload)
}

/// Drain `outbound` into `writer` until the channel closes or `shutdown`
/// fires. A write error cancels `shutdown` so the reading side stops too.
pub fn spawn_writer<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<HubMessage>,
    shutdown: CancellationToken,
    max_size: usize,
) -> JoinHandle<()>
where
    W: AsyncWriteExt + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    if let Err(e) = send_message(&mut writer, &message, max_size).await {
                        error!(error = %e, msg_type = ?message.message_type(), "Failed to write frame");
                        shutdown.cancel();
                        break;
                    }
                }
            }
        }
        let _ = writer.shutdown().await;
        debug!("Writer task stopped");
    })
}
