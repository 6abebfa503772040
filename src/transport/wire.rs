use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::core::{DataMessage, Payload};
use crate::error::{HermesError, Result};

/// Upper bound on a single wire frame. Guards the length-prefixed readers
/// against a corrupt or hostile peer.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Control-plane message kinds exchanged between brokers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlKind {
    Announce {
        descriptor: BrokerDescriptor,
    },
    SyncProbe {
        t0_ns: i64,
    },
    SyncReply {
        t0_ns: i64,
        reference_ts_ns: i64,
    },
    SyncOk {
        /// Reference broker this sender elected; a mismatch between peers
        /// means the configuration is split and both must fail.
        elected: String,
    },
    Ready,
    Start {
        session_id: String,
        started_at_reference_ns: i64,
    },
    Drain {
        reason: String,
    },
    Stop,
    Status {
        phase: String,
        detail: String,
    },
    Error {
        message: String,
    },
}

/// Envelope common to every control-plane message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub sender_id: String,
    pub monotonic_ns: i64,
    #[serde(flatten)]
    pub kind: ControlKind,
}

/// What a broker advertises about itself during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerDescriptor {
    pub broker_id: String,
    pub control_addr: String,
    pub data_addr: String,
    pub clock_eligible: bool,
    pub local_nodes: Vec<crate::node::NodeDescriptor>,
}

impl BrokerDescriptor {
    /// Every stream published by this broker's nodes.
    pub fn streams(&self) -> impl Iterator<Item = &crate::core::StreamSpec> + '_ {
        self.local_nodes.iter().flat_map(|n| n.output_streams.iter())
    }
}

/// Writes one length-prefixed JSON control frame.
pub async fn write_control<W: AsyncWrite + Unpin>(writer: &mut W, msg: &ControlMessage) -> Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| HermesError::Transport(e.to_string()))?;
    if body.len() as u32 > MAX_FRAME_BYTES {
        return Err(HermesError::Transport("control frame exceeds size cap".into()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed JSON control frame.
pub async fn read_control<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage> {
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_BYTES {
        return Err(HermesError::Transport(format!(
            "control frame of {} bytes exceeds size cap",
            len
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| HermesError::Transport(e.to_string()))
}

const PAYLOAD_TABULAR: u8 = 0;
const PAYLOAD_FRAME: u8 = 1;

/// Encodes the data-plane envelope:
/// `{topic, publisher_id, seq u64, reference_ts_ns i64, payload_len u32, payload}`.
/// The payload bytes carry the device timestamp channel and the sample body.
pub fn encode_data(msg: &DataMessage) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + msg.payload.len() * 8);
    write_str(&mut buf, &msg.topic)?;
    write_str(&mut buf, &msg.publisher_id)?;
    WriteBytesExt::write_u64::<BigEndian>(&mut buf, msg.seq)
        .map_err(|e| HermesError::Transport(e.to_string()))?;
    WriteBytesExt::write_i64::<BigEndian>(&mut buf, msg.reference_ts_ns)
        .map_err(|e| HermesError::Transport(e.to_string()))?;

    let mut payload = Vec::with_capacity(msg.payload.len() * 8 + 16);
    match msg.device_ts_ns {
        Some(ts) => {
            payload.push(1);
            WriteBytesExt::write_i64::<BigEndian>(&mut payload, ts)
                .map_err(|e| HermesError::Transport(e.to_string()))?;
        }
        None => payload.push(0),
    }
    match &msg.payload {
        Payload::Tabular(values) => {
            payload.push(PAYLOAD_TABULAR);
            WriteBytesExt::write_u32::<BigEndian>(&mut payload, values.len() as u32)
                .map_err(|e| HermesError::Transport(e.to_string()))?;
            for v in values {
                WriteBytesExt::write_f64::<BigEndian>(&mut payload, *v)
                    .map_err(|e| HermesError::Transport(e.to_string()))?;
            }
        }
        Payload::Frame(bytes) => {
            payload.push(PAYLOAD_FRAME);
            WriteBytesExt::write_u32::<BigEndian>(&mut payload, bytes.len() as u32)
                .map_err(|e| HermesError::Transport(e.to_string()))?;
            payload.extend_from_slice(bytes);
        }
    }

    WriteBytesExt::write_u32::<BigEndian>(&mut buf, payload.len() as u32)
        .map_err(|e| HermesError::Transport(e.to_string()))?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

pub fn decode_data(bytes: &[u8]) -> Result<DataMessage> {
    let mut cur = Cursor::new(bytes);
    let topic = read_str(&mut cur)?;
    let publisher_id = read_str(&mut cur)?;
    let seq = ReadBytesExt::read_u64::<BigEndian>(&mut cur)
        .map_err(|e| HermesError::Transport(e.to_string()))?;
    let reference_ts_ns = ReadBytesExt::read_i64::<BigEndian>(&mut cur)
        .map_err(|e| HermesError::Transport(e.to_string()))?;
    let payload_len = ReadBytesExt::read_u32::<BigEndian>(&mut cur)
        .map_err(|e| HermesError::Transport(e.to_string()))? as usize;
    let remaining = bytes.len() - cur.position() as usize;
    if payload_len != remaining {
        return Err(HermesError::Transport(format!(
            "payload length {} does not match remaining {} bytes",
            payload_len, remaining
        )));
    }

    let device_ts_ns = match ReadBytesExt::read_u8(&mut cur)
        .map_err(|e| HermesError::Transport(e.to_string()))?
    {
        0 => None,
        _ => Some(
            ReadBytesExt::read_i64::<BigEndian>(&mut cur)
                .map_err(|e| HermesError::Transport(e.to_string()))?,
        ),
    };
    let tag = ReadBytesExt::read_u8(&mut cur)
        .map_err(|e| HermesError::Transport(e.to_string()))?;
    let count = ReadBytesExt::read_u32::<BigEndian>(&mut cur)
        .map_err(|e| HermesError::Transport(e.to_string()))? as usize;
    let payload = match tag {
        PAYLOAD_TABULAR => {
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                values.push(
                    ReadBytesExt::read_f64::<BigEndian>(&mut cur)
                        .map_err(|e| HermesError::Transport(e.to_string()))?,
                );
            }
            Payload::Tabular(values)
        }
        PAYLOAD_FRAME => {
            let mut frame = vec![0u8; count];
            std::io::Read::read_exact(&mut cur, &mut frame)
                .map_err(|e| HermesError::Transport(e.to_string()))?;
            Payload::Frame(frame)
        }
        other => {
            return Err(HermesError::Transport(format!(
                "unknown payload tag {}",
                other
            )))
        }
    };

    Ok(DataMessage {
        topic,
        publisher_id,
        seq,
        reference_ts_ns,
        device_ts_ns,
        payload,
    })
}

/// Writes one length-prefixed data frame.
pub async fn write_data<W: AsyncWrite + Unpin>(writer: &mut W, msg: &DataMessage) -> Result<()> {
    let body = encode_data(msg)?;
    if body.len() as u32 > MAX_FRAME_BYTES {
        return Err(HermesError::Transport("data frame exceeds size cap".into()));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed data frame. Returns `None` on clean EOF at a
/// frame boundary.
pub async fn read_data<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<DataMessage>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(HermesError::Transport(format!(
            "data frame of {} bytes exceeds size cap",
            len
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_data(&body).map(Some)
}

fn write_str(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(HermesError::Transport("string field too long".into()));
    }
    WriteBytesExt::write_u16::<BigEndian>(buf, bytes.len() as u16)
        .map_err(|e| HermesError::Transport(e.to_string()))?;
    buf.extend_from_slice(bytes);
    Ok(())
}

fn read_str(cur: &mut Cursor<&[u8]>) -> Result<String> {
    let len = ReadBytesExt::read_u16::<BigEndian>(cur)
        .map_err(|e| HermesError::Transport(e.to_string()))? as usize;
    let mut bytes = vec![0u8; len];
    std::io::Read::read_exact(cur, &mut bytes).map_err(|e| HermesError::Transport(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| HermesError::Transport(e.to_string()))
}
