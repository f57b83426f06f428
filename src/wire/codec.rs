use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::error::{FramingError, WireError};
use crate::wire::constants::{HEADER_LEN, MAGIC, MAGIC_BYTES};
use crate::wire::message::{Command, RawMessage};

/// Serializes a complete message frame.
///
/// ```text
/// +------------+--------------+---------------+------------+
/// | magic (4)  | command (12) | length (4 BE) | checksum(4)|
/// +------------+--------------+---------------+------------+
/// | payload (variable)                                ...  |
/// +----------------------------------------------------------
/// ```
///
/// The checksum is the first 4 bytes of `SHA512(SHA512(payload))`.
///
/// # Example
///
/// ```
/// use bitmessage::wire::codec;
/// use bitmessage::wire::message::{Command, RawMessage};
///
/// let bytes = codec::encode(&RawMessage::new(Command::Verack, vec![]));
/// assert_eq!(bytes.len(), 24);
///
/// let (raw, rest) = codec::decode(&bytes, 1024).unwrap();
/// assert_eq!(raw.command, Command::Verack);
/// assert!(rest.is_empty());
/// ```
pub fn encode(msg: &RawMessage) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + msg.payload.len());

    out.extend_from_slice(&msg.magic.to_be_bytes());
    out.extend_from_slice(&msg.command.as_bytes());
    out.extend_from_slice(&(msg.payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&msg.checksum());
    out.extend_from_slice(&msg.payload);

    out
}

/// Decodes one frame from the front of `bytes`, returning it together with
/// the bytes that follow it.
///
/// Checks are applied in order: header present, magic, length bound, payload
/// present, command padding, checksum. On [`FramingError::BadMagic`] the caller
/// should resynchronise with [`find_magic`] rather than give up on the stream.
pub fn decode(bytes: &[u8], max_payload: u32) -> Result<(RawMessage, &[u8]), FramingError> {
    if bytes.len() < HEADER_LEN {
        return Err(FramingError::Truncated {
            needed: HEADER_LEN - bytes.len(),
        });
    }

    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let header = Header::parse(&header, max_payload)?;

    let end = HEADER_LEN + header.length as usize;
    if bytes.len() < end {
        return Err(FramingError::Truncated {
            needed: end - bytes.len(),
        });
    }

    let raw = header.finish(bytes[HEADER_LEN..end].to_vec())?;
    Ok((raw, &bytes[end..]))
}

/// Offset of the next occurrence of the magic sequence in `bytes`.
pub fn find_magic(bytes: &[u8]) -> Option<usize> {
    bytes.windows(MAGIC_BYTES.len()).position(|w| w == MAGIC_BYTES)
}

/// Reads one message frame from an async byte stream.
///
/// Bytes that do not start a frame are skipped until the magic sequence is
/// found. Oversized lengths are refused before any payload is read; the next
/// call resynchronises past them. Frames with bad padding or checksum are
/// consumed in full before the error is returned, so the stream stays aligned
/// and the caller can simply read again.
pub async fn read_message<R>(reader: &mut R, max_payload: u32) -> Result<RawMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header[..4]).await?;

    let mut skipped = 0usize;
    while header[..4] != MAGIC_BYTES {
        header.copy_within(1..4, 0);
        reader.read_exact(&mut header[3..4]).await?;
        skipped += 1;
    }
    if skipped > 0 {
        debug!(skipped, "resynchronised on magic");
    }

    reader.read_exact(&mut header[4..]).await?;
    let header = Header::parse(&header, max_payload)?;

    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload).await?;

    Ok(header.finish(payload)?)
}

/// Writes a complete message frame and flushes it.
pub async fn send_message<W>(writer: &mut W, msg: &RawMessage) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(msg)).await?;
    writer.flush().await
}

/// Header fields that passed the checks possible before the payload is read.
struct Header {
    magic: u32,
    command: [u8; 12],
    length: u32,
    checksum: [u8; 4],
}

impl Header {
    fn parse(header: &[u8; HEADER_LEN], max_payload: u32) -> Result<Self, FramingError> {
        let magic = BigEndian::read_u32(&header[0..4]);
        if magic != MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(&header[0..4]);
            return Err(FramingError::BadMagic { found });
        }

        let length = BigEndian::read_u32(&header[16..20]);
        if length > max_payload {
            return Err(FramingError::Oversized {
                length,
                max: max_payload,
            });
        }

        let mut command = [0u8; 12];
        command.copy_from_slice(&header[4..16]);
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&header[20..24]);

        Ok(Header {
            magic,
            command,
            length,
            checksum,
        })
    }

    fn finish(self, payload: Vec<u8>) -> Result<RawMessage, FramingError> {
        let command = Command::try_from(&self.command)?;

        let raw = RawMessage {
            magic: self.magic,
            command,
            payload,
        };

        let actual = raw.checksum();
        if actual != self.checksum {
            return Err(FramingError::BadChecksum {
                command: raw.command.to_string(),
                expected: self.checksum,
                actual,
            });
        }

        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::constants::MAX_PAYLOAD_LEN;

    fn frame(command: Command, payload: &[u8]) -> Vec<u8> {
        encode(&RawMessage::new(command, payload.to_vec()))
    }

    #[test]
    fn encode_lays_out_header_big_endian() {
        let bytes = frame(Command::Inv, &[1, 2, 3]);

        assert_eq!(&bytes[..4], &[0xE9, 0xBE, 0xB4, 0xD9]);
        assert_eq!(&bytes[4..16], b"inv\0\0\0\0\0\0\0\0\0");
        assert_eq!(&bytes[16..20], &[0, 0, 0, 3]);
        assert_eq!(&bytes[20..24], &crate::pow::checksum(&[1, 2, 3]));
        assert_eq!(&bytes[24..], &[1, 2, 3]);
    }

    #[test]
    fn decode_returns_remaining_bytes() {
        let mut bytes = frame(Command::Verack, &[]);
        bytes.extend(frame(Command::Inv, &[0]));

        let (first, rest) = decode(&bytes, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(first.command, Command::Verack);

        let (second, rest) = decode(rest, MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(second.command, Command::Inv);
        assert_eq!(second.payload, vec![0]);
        assert!(rest.is_empty());
    }

    #[test]
    fn decode_rejects_any_flipped_payload_bit() {
        let payload = b"some object payload".to_vec();
        let clean = frame(Command::Msg, &payload);

        for bit in 0..payload.len() * 8 {
            let mut bytes = clean.clone();
            bytes[HEADER_LEN + bit / 8] ^= 1 << (bit % 8);

            let err = decode(&bytes, MAX_PAYLOAD_LEN).unwrap_err();
            assert!(
                matches!(err, FramingError::BadChecksum { ref command, .. } if command == "msg"),
                "bit {bit}: {err:?}"
            );
        }
    }

    #[test]
    fn decode_rejects_bad_padding() {
        let mut bytes = frame(Command::Verack, &[]);
        bytes[4 + 11] = b'!';

        assert!(matches!(
            decode(&bytes, MAX_PAYLOAD_LEN),
            Err(FramingError::BadPadding { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_length_before_payload() {
        let mut bytes = frame(Command::Msg, &[]);
        bytes[16..20].copy_from_slice(&2_000_000u32.to_be_bytes());

        assert_eq!(
            decode(&bytes, MAX_PAYLOAD_LEN).unwrap_err(),
            FramingError::Oversized {
                length: 2_000_000,
                max: MAX_PAYLOAD_LEN
            }
        );
    }

    #[test]
    fn decode_reports_truncation() {
        let bytes = frame(Command::Inv, &[1, 2, 3, 4]);

        assert_eq!(
            decode(&bytes[..10], MAX_PAYLOAD_LEN).unwrap_err(),
            FramingError::Truncated { needed: 14 }
        );
        assert_eq!(
            decode(&bytes[..26], MAX_PAYLOAD_LEN).unwrap_err(),
            FramingError::Truncated { needed: 2 }
        );
    }

    #[test]
    fn garbage_then_frame_decodes_after_resync() {
        let mut bytes = vec![0x00, 0xE9, 0xBE, 0x13, 0x37, 0xFF];
        bytes.extend(frame(Command::Verack, &[]));

        assert!(matches!(
            decode(&bytes, MAX_PAYLOAD_LEN),
            Err(FramingError::BadMagic { .. })
        ));

        let offset = find_magic(&bytes).unwrap();
        assert_eq!(offset, 6);

        let (raw, rest) = decode(&bytes[offset..], MAX_PAYLOAD_LEN).unwrap();
        assert_eq!(raw.command, Command::Verack);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn read_message_skips_leading_garbage() {
        let mut bytes = vec![0xE9, 0xBE, 0x00, 0x42];
        bytes.extend(frame(Command::Inv, &[0]));

        let mut reader = bytes.as_slice();
        let raw = read_message(&mut reader, MAX_PAYLOAD_LEN).await.unwrap();
        assert_eq!(raw.command, Command::Inv);
    }

    #[tokio::test]
    async fn read_message_stays_aligned_after_corrupt_frame() {
        let mut corrupt = frame(Command::Msg, &[9, 9, 9]);
        corrupt[HEADER_LEN] ^= 0x01;

        let mut bytes = corrupt;
        bytes.extend(frame(Command::Verack, &[]));

        let mut reader = bytes.as_slice();
        let err = read_message(&mut reader, MAX_PAYLOAD_LEN).await.unwrap_err();
        assert!(matches!(
            err,
            WireError::Framing(FramingError::BadChecksum { .. })
        ));

        let raw = read_message(&mut reader, MAX_PAYLOAD_LEN).await.unwrap();
        assert_eq!(raw.command, Command::Verack);
    }

    #[tokio::test]
    async fn read_message_resyncs_past_oversized_frame() {
        let mut oversized = frame(Command::Msg, &[]);
        oversized[16..20].copy_from_slice(&u32::MAX.to_be_bytes());

        let mut bytes = oversized;
        bytes.extend(frame(Command::Verack, &[]));

        let mut reader = bytes.as_slice();
        let err = read_message(&mut reader, MAX_PAYLOAD_LEN).await.unwrap_err();
        assert!(matches!(
            err,
            WireError::Framing(FramingError::Oversized { .. })
        ));

        let raw = read_message(&mut reader, MAX_PAYLOAD_LEN).await.unwrap();
        assert_eq!(raw.command, Command::Verack);
    }

    #[tokio::test]
    async fn read_message_eof_is_io_error() {
        let bytes = frame(Command::Verack, &[]);
        let mut reader = &bytes[..10];

        let err = read_message(&mut reader, MAX_PAYLOAD_LEN).await.unwrap_err();
        assert!(matches!(
            err,
            WireError::Io(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof
        ));
    }

    #[tokio::test]
    async fn send_message_writes_encoded_frame() {
        let raw = RawMessage::new(Command::Verack, vec![]);
        let mut out = Vec::new();
        send_message(&mut out, &raw).await.unwrap();
        assert_eq!(out, encode(&raw));
    }
}
