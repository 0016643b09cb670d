//! Turns a [`Packet`] into the bytes carried by one transport message, and
//! back. Each transport message (one WebSocket binary frame) carries
//! exactly one encoded packet; the transport itself supplies message
//! boundaries, so framing here is "one bincode record", not a
//! length-prefixed stream.

use crate::{Error, Packet};

/// Largest frame this implementation will accept from a peer. Exceeding
/// this is a fatal, transport-closing protocol error.
pub const MAX_INBOUND_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Largest payload an agent will put in a single outgoing `Data` packet.
/// Larger reads are split into multiple packets sharing the same
/// socket-channel id.
pub const MAX_DATA_FRAGMENT_SIZE: usize = 1024 * 1024;

/// Serializes `packet` to the bytes that should be sent as one transport
/// message.
///
/// # Example
///
/// ```
/// use waypoint_codec::{Packet, framing};
/// use uuid::Uuid;
///
/// let packet = Packet::data(Uuid::new_v4(), b"hello".to_vec());
/// let bytes = framing::encode(&packet).unwrap();
/// let decoded = framing::decode(&bytes).unwrap();
///
/// assert_eq!(decoded.data, b"hello");
/// ```
pub fn encode(packet: &Packet) -> Result<Vec<u8>, Error> {
    Ok(bincode::serialize(packet)?)
}

/// Deserializes one transport message's bytes back into a [`Packet`].
///
/// Rejects frames larger than [`MAX_INBOUND_MESSAGE_SIZE`] with
/// [`Error::ProtocolOverflow`] before attempting to decode them.
pub fn decode(bytes: &[u8]) -> Result<Packet, Error> {
    if bytes.len() > MAX_INBOUND_MESSAGE_SIZE {
        return Err(Error::ProtocolOverflow {
            limit: MAX_INBOUND_MESSAGE_SIZE,
            actual: bytes.len(),
        });
    }

    bincode::deserialize(bytes).map_err(Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PacketType;
    use uuid::Uuid;

    #[test]
    fn round_trips_a_data_packet() {
        let packet = Packet::data(Uuid::new_v4(), vec![1, 2, 3, 4]);
        let bytes = encode(&packet).unwrap();
        let decoded = decode(&bytes).unwrap();

        assert!(matches!(decoded.r#type, PacketType::Data));
        assert_eq!(decoded.data, vec![1, 2, 3, 4]);
        assert_eq!(decoded.chan, packet.chan);
    }

    #[test]
    fn rejects_oversize_frames() {
        let oversized = vec![0u8; MAX_INBOUND_MESSAGE_SIZE + 1];
        let err = decode(&oversized).unwrap_err();
        assert!(matches!(err, Error::ProtocolOverflow { .. }));
    }

}
