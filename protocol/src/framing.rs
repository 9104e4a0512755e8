//! Datagram channels and length-prefix framing
//!
//! Every datagram starts with a [`Channel`] byte. Update datagrams then carry
//! one or more update packets, each prefixed with its `u16` length. Update
//! packets too large for that travel as chunk slices on [`Channel::Slice`].

use crate::codec::PacketWriter;
use crate::error::FramingError;

/// Bytes taken by the channel tag.
pub const CHANNEL_HEADER_SIZE: usize = 1;

/// Largest packet a `u16` length prefix can frame.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Bytes taken by the length prefix of one frame.
pub const LENGTH_PREFIX_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    /// Chunk datagrams for the secure handshake transport
    Handshake = 0,
    /// Framed update packets
    Update = 1,
    /// Chunk datagrams of update packets too large for one datagram
    Slice = 2,
}

impl TryFrom<u8> for Channel {
    type Error = FramingError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Channel::Handshake),
            1 => Ok(Channel::Update),
            2 => Ok(Channel::Slice),
            other => Err(FramingError::UnknownChannel(other)),
        }
    }
}

/// Prepends the channel byte to a payload.
pub fn channel_datagram(channel: Channel, payload: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(CHANNEL_HEADER_SIZE + payload.len());
    datagram.push(channel as u8);
    datagram.extend_from_slice(payload);
    datagram
}

/// Splits a datagram into its channel and payload.
pub fn split_channel(datagram: &[u8]) -> Result<(Channel, &[u8]), FramingError> {
    let (&tag, payload) = datagram.split_first().ok_or(FramingError::EmptyDatagram)?;
    Ok((Channel::try_from(tag)?, payload))
}

/// Appends one length-prefixed frame.
pub fn write_frame(writer: &mut PacketWriter, packet: &[u8]) -> Result<(), FramingError> {
    if packet.len() > MAX_FRAME_SIZE {
        return Err(FramingError::FrameTooLarge {
            size: packet.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_u16(packet.len() as u16);
    writer.write_bytes(packet);
    Ok(())
}

/// Builds an update-channel datagram from encoded packets.
pub fn update_datagram<'a, I>(packets: I) -> Result<Vec<u8>, FramingError>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut writer = PacketWriter::new();
    writer.write_u8(Channel::Update as u8);
    for packet in packets {
        write_frame(&mut writer, packet)?;
    }
    Ok(writer.into_bytes())
}

/// Splits a complete datagram into frames. A datagram cannot continue in the
/// next one, so a trailing partial frame is an error.
pub fn split_frames(bytes: &[u8]) -> Result<Vec<&[u8]>, FramingError> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        match next_frame(rest) {
            Some((frame, tail)) => {
                frames.push(frame);
                rest = tail;
            }
            None => return Err(FramingError::PartialFrame {
                missing: missing_bytes(rest),
            }),
        }
    }
    Ok(frames)
}

fn next_frame(bytes: &[u8]) -> Option<(&[u8], &[u8])> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let length = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    let body = &bytes[LENGTH_PREFIX_SIZE..];
    if body.len() < length {
        return None;
    }
    Some(body.split_at(length))
}

fn missing_bytes(bytes: &[u8]) -> usize {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return LENGTH_PREFIX_SIZE - bytes.len();
    }
    let length = usize::from(u16::from_le_bytes([bytes[0], bytes[1]]));
    length - (bytes.len() - LENGTH_PREFIX_SIZE)
}

/// Stream-side framing: bytes may arrive split anywhere, and an incomplete
/// trailing frame is kept until the rest arrives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    leftover: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes and returns every frame they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.leftover.extend_from_slice(bytes);

        let mut frames = Vec::new();
        let mut consumed = 0;
        while let Some((frame, _)) = next_frame(&self.leftover[consumed..]) {
            frames.push(frame.to_vec());
            consumed += LENGTH_PREFIX_SIZE + frame.len();
        }
        self.leftover.drain(..consumed);
        frames
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn leftover_len(&self) -> usize {
        self.leftover.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(packets: &[&[u8]]) -> Vec<u8> {
        let mut writer = PacketWriter::new();
        for packet in packets {
            write_frame(&mut writer, packet).unwrap();
        }
        writer.into_bytes()
    }

    #[test]
    fn test_split_concatenated_frames() {
        let bytes = framed(&[b"first", b"", b"third"]);
        let frames = split_frames(&bytes).unwrap();
        assert_eq!(frames, vec![&b"first"[..], &b""[..], &b"third"[..]]);
    }

    #[test]
    fn test_partial_frame_in_datagram_is_rejected() {
        let mut bytes = framed(&[b"abc"]);
        bytes.extend_from_slice(&[5, 0, 1]);
        assert_eq!(
            split_frames(&bytes),
            Err(FramingError::PartialFrame { missing: 4 })
        );
        assert_eq!(
            split_frames(&[7]),
            Err(FramingError::PartialFrame { missing: 1 })
        );
    }

    #[test]
    fn test_decoder_keeps_leftover() {
        let bytes = framed(&[b"hello", b"world"]);
        let mut decoder = FrameDecoder::new();

        let frames = decoder.push(&bytes[..9]);
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert_eq!(decoder.leftover_len(), 2);

        let frames = decoder.push(&bytes[9..]);
        assert_eq!(frames, vec![b"world".to_vec()]);
        assert_eq!(decoder.leftover_len(), 0);
    }

    #[test]
    fn test_channel_roundtrip() {
        let datagram = update_datagram([&b"packet"[..]]).unwrap();
        let (channel, payload) = split_channel(&datagram).unwrap();
        assert_eq!(channel, Channel::Update);
        assert_eq!(split_frames(payload).unwrap(), vec![&b"packet"[..]]);

        let handshake = channel_datagram(Channel::Handshake, b"slice");
        assert_eq!(
            split_channel(&handshake).unwrap(),
            (Channel::Handshake, &b"slice"[..])
        );
    }

    #[test]
    fn test_bad_channel_bytes() {
        assert_eq!(split_channel(&[]), Err(FramingError::EmptyDatagram));
        assert_eq!(split_channel(&[9, 1]), Err(FramingError::UnknownChannel(9)));
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let big = vec![0u8; MAX_FRAME_SIZE + 1];
        let mut writer = PacketWriter::new();
        assert!(matches!(
            write_frame(&mut writer, &big),
            Err(FramingError::FrameTooLarge { .. })
        ));
    }
}
