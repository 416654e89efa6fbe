use crate::error::RelayError;
use crate::message::Message;
use crate::protocol::MAX_MESSAGE_SIZE;

/// Wire format version. Bump this whenever the JSON shape of [`Message`] changes.
pub const WIRE_VERSION: u8 = 1;

/// Encode a message for gossipsub.
///
/// Wire format: `[1-byte version][json payload]`
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, RelayError> {
    let data = serde_json::to_vec(msg).map_err(|e| RelayError::Codec {
        reason: e.to_string(),
    })?;

    if data.len() + 1 > MAX_MESSAGE_SIZE {
        return Err(RelayError::MessageTooLarge {
            size: data.len() + 1,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut out = Vec::with_capacity(1 + data.len());
    out.push(WIRE_VERSION);
    out.extend_from_slice(&data);
    Ok(out)
}

/// Decode a gossipsub payload into a message.
pub fn decode_message(data: &[u8]) -> Result<Message, RelayError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(RelayError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    let (version, payload) = data.split_first().ok_or_else(|| RelayError::Codec {
        reason: "empty payload".to_string(),
    })?;

    if *version != WIRE_VERSION {
        return Err(RelayError::Codec {
            reason: format!(
                "wire version mismatch: peer sent v{}, we run v{}",
                version, WIRE_VERSION
            ),
        });
    }

    serde_json::from_slice(payload).map_err(|e| RelayError::Codec {
        reason: e.to_string(),
    })
}
