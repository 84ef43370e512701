//! # Framed Transport
//!
//! Each direction on the wire carries framed messages. A frame is a fixed
//! 17-byte big-endian header, a JSON-RPC text payload, and an optional raw
//! binary tail:
//!
//! ```text
//! ┌────────┬─────────┬──────────────┬────────────┬─────────────────────┐
//! │ magic  │ version │ payload_size │ has_binary │ binary_payload_size │
//! │ u32    │ u32     │ u32          │ u8         │ u32                 │
//! └────────┴─────────┴──────────────┴────────────┴─────────────────────┘
//! ```
//!
//! The binary tail exists so blob reads can stream: the JSON-RPC payload
//! carries a null result and the bytes follow the frame raw, with no base64
//! inflation and no buffering of the whole blob on either side.

use crate::error::{ProtocolError, Result};
use std::io::{Read, Write};

pub const FRAME_MAGIC: u32 = 0x1234_5678;
pub const FRAME_VERSION: u32 = 1;
pub const HEADER_LEN: usize = 17;

/// Maximum write size when draining a binary tail.
pub const STREAM_CHUNK: usize = 16 * 1024;

/// Packs a frame header. `binary_size` of `None` means no binary tail;
/// `Some(0)` declares a present-but-empty tail and is distinct from `None`.
pub fn pack_header(payload_size: u32, binary_size: Option<u32>) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..4].copy_from_slice(&FRAME_MAGIC.to_be_bytes());
    buf[4..8].copy_from_slice(&FRAME_VERSION.to_be_bytes());
    buf[8..12].copy_from_slice(&payload_size.to_be_bytes());
    buf[12] = u8::from(binary_size.is_some());
    buf[13..17].copy_from_slice(&binary_size.unwrap_or(0).to_be_bytes());
    buf
}

/// Decodes and validates a frame header.
pub fn unpack_header(buf: &[u8; HEADER_LEN]) -> Result<(u32, Option<u32>)> {
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::BadMagic(magic).into());
    }
    let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != FRAME_VERSION {
        return Err(ProtocolError::BadVersion(version).into());
    }
    let payload_size = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let binary_size = u32::from_be_bytes([buf[13], buf[14], buf[15], buf[16]]);
    let binary = match buf[12] {
        0 if binary_size == 0 => None,
        0 => return Err(ProtocolError::BadBinaryFlag(0).into()),
        1 => Some(binary_size),
        flag => return Err(ProtocolError::BadBinaryFlag(flag).into()),
    };
    Ok((payload_size, binary))
}

/// Reads one frame header from the stream. Returns `None` on a clean
/// connection close at a frame boundary; a close mid-header is `Truncated`.
pub fn read_header(reader: &mut impl Read) -> Result<Option<(u32, Option<u32>)>> {
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProtocolError::Truncated.into());
        }
        filled += n;
    }
    unpack_header(&buf).map(Some)
}

/// Reads exactly `size` payload bytes.
pub fn read_payload(reader: &mut impl Read, size: u32) -> Result<Vec<u8>> {
    let mut payload = vec![0u8; size as usize];
    reader
        .read_exact(&mut payload)
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::Truncated.into(),
            _ => crate::error::VaultError::Io(e),
        })?;
    Ok(payload)
}

/// Writes a header plus text payload. A declared binary tail must be
/// streamed by the caller immediately afterwards.
pub fn write_frame(writer: &mut impl Write, payload: &[u8], binary_size: Option<u32>) -> Result<()> {
    let payload_size: u32 = payload
        .len()
        .try_into()
        .map_err(|_| anyhow::anyhow!("payload of {} bytes exceeds frame limit", payload.len()))?;
    writer.write_all(&pack_header(payload_size, binary_size))?;
    writer.write_all(payload)?;
    Ok(())
}

/// Drains exactly `size` bytes from `source` to `writer` in chunks of at
/// most [`STREAM_CHUNK`] bytes.
pub fn write_binary_stream(
    writer: &mut impl Write,
    source: &mut impl Read,
    size: u64,
) -> Result<()> {
    let mut remaining = size;
    let mut buf = vec![0u8; STREAM_CHUNK];
    while remaining > 0 {
        let want = remaining.min(STREAM_CHUNK as u64) as usize;
        let n = source.read(&mut buf[..want])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "binary source ended before its declared size",
            )
            .into());
        }
        writer.write_all(&buf[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VaultError;
    use std::io::Cursor;

    #[test]
    fn header_round_trips() {
        for (payload, binary) in [
            (0u32, None),
            (17, None),
            (1000, Some(0u32)),
            (5, Some(7)),
            (u32::MAX, Some(u32::MAX)),
        ] {
            let packed = pack_header(payload, binary);
            assert_eq!(packed.len(), HEADER_LEN);
            assert_eq!(unpack_header(&packed).unwrap(), (payload, binary));
        }
    }

    #[test]
    fn absent_tail_differs_from_empty_tail() {
        assert_ne!(pack_header(9, None), pack_header(9, Some(0)));
    }

    #[test]
    fn header_layout_is_big_endian() {
        let packed = pack_header(0x0102, Some(0x0304));
        assert_eq!(&packed[0..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(&packed[4..8], &[0, 0, 0, 1]);
        assert_eq!(&packed[8..12], &[0, 0, 0x01, 0x02]);
        assert_eq!(packed[12], 1);
        assert_eq!(&packed[13..17], &[0, 0, 0x03, 0x04]);
    }

    #[test]
    fn bad_magic_and_version_rejected() {
        let mut h = pack_header(0, None);
        h[0] = 0xff;
        assert!(matches!(
            unpack_header(&h).unwrap_err(),
            VaultError::Protocol(ProtocolError::BadMagic(_))
        ));

        let mut h = pack_header(0, None);
        h[7] = 9;
        assert!(matches!(
            unpack_header(&h).unwrap_err(),
            VaultError::Protocol(ProtocolError::BadVersion(9))
        ));
    }

    #[test]
    fn inconsistent_binary_flag_rejected() {
        let mut h = pack_header(0, Some(4));
        h[12] = 0; // size says 4, flag says none
        assert!(matches!(
            unpack_header(&h).unwrap_err(),
            VaultError::Protocol(ProtocolError::BadBinaryFlag(0))
        ));
        let mut h = pack_header(0, None);
        h[12] = 2;
        assert!(matches!(
            unpack_header(&h).unwrap_err(),
            VaultError::Protocol(ProtocolError::BadBinaryFlag(2))
        ));
    }

    #[test]
    fn read_header_distinguishes_clean_close_from_truncation() {
        let mut empty = Cursor::new(Vec::new());
        assert!(read_header(&mut empty).unwrap().is_none());

        let mut short = Cursor::new(pack_header(3, None)[..10].to_vec());
        assert!(matches!(
            read_header(&mut short).unwrap_err(),
            VaultError::Protocol(ProtocolError::Truncated)
        ));
    }

    #[test]
    fn frame_write_read_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{\"x\":1}", Some(3)).unwrap();
        wire.extend_from_slice(b"abc");

        let mut cursor = Cursor::new(wire);
        let (payload_size, binary) = read_header(&mut cursor).unwrap().unwrap();
        assert_eq!(binary, Some(3));
        let payload = read_payload(&mut cursor, payload_size).unwrap();
        assert_eq!(payload, b"{\"x\":1}");
        let mut tail = Vec::new();
        cursor.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, b"abc");
    }

    #[test]
    fn truncated_payload_is_detected() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"{\"method\":\"ping\"}", None).unwrap();
        wire.truncate(wire.len() - 4);
        let mut cursor = Cursor::new(wire);
        let (payload_size, _) = read_header(&mut cursor).unwrap().unwrap();
        assert!(matches!(
            read_payload(&mut cursor, payload_size).unwrap_err(),
            VaultError::Protocol(ProtocolError::Truncated)
        ));
    }

    /// Writer that records the size of every write call.
    struct ChunkRecorder {
        chunks: Vec<usize>,
        data: Vec<u8>,
    }

    impl Write for ChunkRecorder {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.chunks.push(buf.len());
            self.data.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn binary_stream_drains_in_bounded_chunks() {
        let data: Vec<u8> = (0..40_000u32).map(|i| i as u8).collect();
        let mut recorder = ChunkRecorder {
            chunks: Vec::new(),
            data: Vec::new(),
        };
        write_binary_stream(&mut recorder, &mut Cursor::new(&data), data.len() as u64).unwrap();
        assert_eq!(recorder.data, data);
        assert!(recorder.chunks.iter().all(|&n| n <= STREAM_CHUNK));
        assert!(recorder.chunks.len() >= 3);
    }

    #[test]
    fn binary_stream_detects_short_source() {
        let mut out = Vec::new();
        let err = write_binary_stream(&mut out, &mut Cursor::new(b"abc"), 10).unwrap_err();
        assert!(matches!(err, VaultError::Io(_)));
    }
}
