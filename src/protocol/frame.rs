use std::net::SocketAddr;

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::config::ProtocolConfig;
use crate::protocol::error::{ProtocolError, Result};
use crate::protocol::message::{Message, MessageType, Payload};
use crate::protocol::serializer::PayloadSerializer;

/// preamble: signature + separator + flags + type + command + id
pub const MIN_HEADER_SIZE: usize = 15;
pub const SESSION_SIZE: usize = 8;
/// fragment index + fragments total, both u16
pub const FRAGMENT_HEADER_SIZE: usize = 4;
/// fragmenting into less than this much payload per datagram is a misconfiguration
pub const MIN_DATA_FRAGMENT_SIZE: usize = 16;
pub const FRAGMENTS_MAX: usize = 65535;

bitflags! {
    #[derive(Eq, PartialEq, Copy, Clone)]
    pub struct FrameFlags: u16 {
        const WANT_ACK   = 0x0001;
        const IS_ACK     = 0x0002;
        const IS_NACK    = 0x0004;
        const HAS_DATA   = 0x0008;
        const FRAGMENTED = 0x0010;
        const COMPRESSED = 0x0020;
        const ENCRYPTED  = 0x0040;
        const SESSION    = 0x0080;
    }
}

pub fn header_size(has_session: bool, fragmented: bool) -> usize {
    let mut size = MIN_HEADER_SIZE;
    if has_session {
        size += SESSION_SIZE;
    }
    if fragmented {
        size += FRAGMENT_HEADER_SIZE;
    }
    size
}

/// Encode a message into one or more datagram buffers.
///
/// The payload is serialized first (and deflated if the message is marked compressed),
///  flipping `msg.payload` to its encoded form. If `max_packet_size` is positive and the
///  message does not fit into a single datagram, the payload is split into equally sized
///  fragments and one buffer per fragment is returned, sharing the full header except
///  for the fragment index; `msg` is updated to reflect the fragmentation. The encoding
///  is deterministic: identical inputs yield byte-identical buffers.
pub fn encode(
    msg: &mut Message,
    max_packet_size: usize,
    serializer: &dyn PayloadSerializer,
    params: &serde_json::Value,
) -> Result<Vec<Bytes>> {
    msg.command.check()?;

    let payload = match &msg.payload {
        Payload::None => None,
        Payload::Encoded(buf) => Some(buf.clone()),
        Payload::Decoded(value) => {
            let mut raw = serializer.serialize(value, params)?;
            if msg.compressed {
                raw = crate::protocol::serializer::deflate(&raw)?;
            }
            let buf = Bytes::from(raw);
            msg.payload = Payload::Encoded(buf.clone());
            Some(buf)
        }
    };
    msg.check_invariants()?;

    let payload_len = payload.as_ref().map(|p| p.len()).unwrap_or(0);
    let plain_header = header_size(msg.session_id.is_some(), msg.fragmented);

    if msg.fragmented || max_packet_size == 0 || plain_header + payload_len <= max_packet_size {
        // single datagram; a message that already carries a fragment block (e.g. an ack
        //  referring to one fragment) is never re-split
        return Ok(vec![write_frame(
            msg,
            msg.fragmented,
            msg.fragment_index,
            msg.fragments_total,
            payload.as_deref(),
        )]);
    }

    let fragmented_header = header_size(msg.session_id.is_some(), true);
    let max_data = max_packet_size
        .checked_sub(fragmented_header)
        .filter(|max_data| *max_data > MIN_DATA_FRAGMENT_SIZE)
        .ok_or_else(|| {
            ProtocolError::Config(format!(
                "max_packet_size {} leaves no room for fragment data (header is {} bytes)",
                max_packet_size, fragmented_header
            ))
        })?;

    let payload = payload.expect("an empty message always fits into a single datagram");
    let total = payload_len.div_ceil(max_data);
    if total > FRAGMENTS_MAX {
        return Err(ProtocolError::Config(format!(
            "payload of {} bytes needs {} fragments, more than the protocol can number",
            payload_len, total
        )));
    }
    let fragment_size = payload_len.div_ceil(total);

    msg.fragmented = true;
    msg.fragment_index = 0;
    msg.fragments_total = total as u16;

    let mut frames = Vec::with_capacity(total);
    for index in 0..total {
        let from = index * fragment_size;
        let to = ((index + 1) * fragment_size).min(payload_len);
        frames.push(write_frame(
            msg,
            true,
            index as u16,
            total as u16,
            Some(&payload[from..to]),
        ));
    }
    Ok(frames)
}

fn write_frame(
    msg: &Message,
    fragmented: bool,
    fragment_index: u16,
    fragments_total: u16,
    payload: Option<&[u8]>,
) -> Bytes {
    let mut flags = FrameFlags::empty();
    flags.set(FrameFlags::WANT_ACK, msg.want_ack);
    flags.set(FrameFlags::IS_ACK, msg.is_ack);
    flags.set(FrameFlags::IS_NACK, msg.is_nack);
    flags.set(FrameFlags::HAS_DATA, payload.is_some());
    flags.set(FrameFlags::FRAGMENTED, fragmented);
    flags.set(FrameFlags::COMPRESSED, msg.compressed);
    flags.set(FrameFlags::ENCRYPTED, msg.encrypted);
    flags.set(FrameFlags::SESSION, msg.session_id.is_some());

    let header = header_size(msg.session_id.is_some(), fragmented);
    let mut buf = BytesMut::with_capacity(header + payload.map(|p| p.len()).unwrap_or(0));

    buf.put_slice(&msg.signature);
    buf.put_u8(0);
    buf.put_u16(flags.bits());
    buf.put_u8(msg.msg_type.as_byte());
    buf.put_slice(msg.command.as_bytes());
    buf.put_u32(msg.id);
    if let Some(session_id) = &msg.session_id {
        buf.put_slice(session_id);
    }
    if fragmented {
        buf.put_u16(fragment_index);
        buf.put_u16(fragments_total);
    }
    if let Some(payload) = payload {
        buf.put_slice(payload);
    }
    buf.freeze()
}

/// Decode one received datagram into a message, leaving the payload as an opaque buffer.
///
/// Rejection is total: anything that is not a well-formed frame of the expected protocol
///  comes back as [ProtocolError::MalformedFrame] and the caller discards it.
pub fn decode(buf: &[u8], sender: SocketAddr, config: &ProtocolConfig) -> Result<Message> {
    if buf.len() < MIN_HEADER_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "{} bytes is shorter than the minimum header",
            buf.len()
        )));
    }
    if buf[0..3] != config.protocol_signature {
        return Err(ProtocolError::MalformedFrame(format!(
            "signature mismatch: expected {:?}, got {:?}",
            String::from_utf8_lossy(&config.protocol_signature),
            String::from_utf8_lossy(&buf[0..3]),
        )));
    }
    if buf[3] != 0 {
        return Err(ProtocolError::MalformedFrame(format!(
            "separator byte is 0x{:02x}",
            buf[3]
        )));
    }

    let mut b = &buf[4..];
    let flags =
        FrameFlags::from_bits_truncate(b.try_get_u16().map_err(truncated)?);
    let msg_type = MessageType::try_from_byte(b.try_get_u8().map_err(truncated)?)?;
    let command = crate::protocol::message::Command(try_get_array::<4>(&mut b)?);
    command.check().map_err(|_| {
        ProtocolError::MalformedFrame(format!(
            "command {:?} is not 4 alphanumeric ASCII bytes",
            String::from_utf8_lossy(command.as_bytes())
        ))
    })?;
    if let Some(supported) = &config.supported_commands {
        if !supported.contains(&command) {
            return Err(ProtocolError::MalformedFrame(format!(
                "command {} is not supported",
                command
            )));
        }
    }
    let id = b.try_get_u32().map_err(truncated)?;

    let has_data = flags.contains(FrameFlags::HAS_DATA);
    if flags.contains(FrameFlags::WANT_ACK)
        && flags.intersects(FrameFlags::IS_ACK | FrameFlags::IS_NACK)
    {
        return Err(ProtocolError::MalformedFrame(
            "frame requests an ack and is one".into(),
        ));
    }
    if flags.intersects(FrameFlags::IS_ACK | FrameFlags::IS_NACK) && has_data {
        return Err(ProtocolError::MalformedFrame(
            "ack / nack frame carries a payload".into(),
        ));
    }
    if flags.intersects(FrameFlags::COMPRESSED | FrameFlags::ENCRYPTED) && !has_data {
        return Err(ProtocolError::MalformedFrame(
            "data flags set without HAS_DATA".into(),
        ));
    }

    let session_id = if flags.contains(FrameFlags::SESSION) {
        if !config.enable_session {
            return Err(ProtocolError::MalformedFrame(
                "SESSION flag set but sessions are disabled".into(),
            ));
        }
        Some(try_get_array::<8>(&mut b)?)
    } else {
        None
    };

    let fragmented = flags.contains(FrameFlags::FRAGMENTED);
    let (fragment_index, fragments_total) = if fragmented {
        let index = b.try_get_u16().map_err(truncated)?;
        let total = b.try_get_u16().map_err(truncated)?;
        if index >= total {
            return Err(ProtocolError::MalformedFrame(format!(
                "fragment index {} out of range 0..{}",
                index, total
            )));
        }
        (index, total)
    } else {
        (0, 1)
    };

    let expected = header_size(session_id.is_some(), fragmented);
    let payload = if has_data {
        if expected >= buf.len() {
            return Err(ProtocolError::MalformedFrame(
                "HAS_DATA set but no payload bytes follow the header".into(),
            ));
        }
        Payload::Encoded(Bytes::copy_from_slice(&buf[expected..]))
    } else {
        if buf.len() != expected {
            return Err(ProtocolError::MalformedFrame(format!(
                "{} trailing bytes on a message without payload",
                buf.len() - expected
            )));
        }
        Payload::None
    };

    Ok(Message {
        signature: config.protocol_signature,
        msg_type,
        command,
        id,
        want_ack: flags.contains(FrameFlags::WANT_ACK),
        is_ack: flags.contains(FrameFlags::IS_ACK),
        is_nack: flags.contains(FrameFlags::IS_NACK),
        fragmented,
        reassembled: false,
        compressed: flags.contains(FrameFlags::COMPRESSED),
        encrypted: flags.contains(FrameFlags::ENCRYPTED),
        session_id,
        fragment_index,
        fragments_total,
        payload,
        sender: Some(sender),
    })
}

fn truncated<E>(_: E) -> ProtocolError {
    ProtocolError::MalformedFrame("truncated header".into())
}

fn try_get_array<const N: usize>(b: &mut &[u8]) -> Result<[u8; N]> {
    if b.remaining() < N {
        return Err(ProtocolError::MalformedFrame("truncated header".into()));
    }
    let mut out = [0u8; N];
    b.copy_to_slice(&mut out);
    Ok(out)
}
