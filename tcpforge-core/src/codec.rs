//! Length-prefixed wire codec.
//!
//! Every frame on the wire is an 8-byte little-endian header followed by the
//! payload:
//!
//! ```text
//! 0               4               8
//! +---------------+---------------+---------------------------+
//! | payload len   | message type  | payload (len bytes)       |
//! | u32 LE        | u32 LE        |                           |
//! +---------------+---------------+---------------------------+
//! ```
//!
//! There is no checksum, magic number or version field. The decoder only
//! parses the header; reading the payload is left to the caller so that an
//! oversized declaration can abort the connection before any buffer is
//! allocated. [`DataPack::read_message`] is that caller for async readers.
//!
//! # Examples
//!
//! ```
//! use tcpforge_core::codec::{DataPack, HEADER_LEN};
//!
//! let pack = DataPack::new(4096);
//! let frame = pack.encode(3, b"hello").unwrap();
//! assert_eq!(frame.len(), HEADER_LEN + 5);
//!
//! let header = pack.decode_header(&frame[..HEADER_LEN]).unwrap();
//! assert_eq!(header.data_len, 5);
//! assert_eq!(header.msg_id, 3);
//! ```

use crate::error::{Error, Result};
use crate::message::Message;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// A decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Number of payload bytes that follow the header.
    pub data_len: u32,
    /// Application-defined message type.
    pub msg_id: u32,
}

/// Packs and unpacks frames, bounded by a maximum payload size.
///
/// `DataPack` is a plain value; it is cheap to copy into every connection.
#[derive(Debug, Clone, Copy)]
pub struct DataPack {
    max_packet_size: u32,
}

impl DataPack {
    /// Creates a codec that rejects payloads longer than `max_packet_size`.
    pub fn new(max_packet_size: u32) -> Self {
        Self { max_packet_size }
    }

    /// Returns the header length, always [`HEADER_LEN`].
    pub fn header_len(&self) -> usize {
        HEADER_LEN
    }

    /// Returns the configured maximum payload size.
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// Encodes a message type and payload into a complete frame.
    ///
    /// The outbound path is not bounded by `max_packet_size`; only payloads
    /// whose length does not fit the 32-bit length field are refused.
    pub fn encode(&self, msg_id: u32, data: &[u8]) -> Result<Bytes> {
        let data_len = u32::try_from(data.len()).map_err(|_| Error::OversizedMessage {
            declared: data.len() as u64,
            max: u64::from(u32::MAX),
        })?;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + data.len());
        buf.put_u32_le(data_len);
        buf.put_u32_le(msg_id);
        buf.put_slice(data);
        Ok(buf.freeze())
    }

    /// Encodes an already assembled [`Message`].
    pub fn encode_message(&self, message: &Message) -> Result<Bytes> {
        self.encode(message.id(), message.data())
    }

    /// Decodes the header at the start of `buf`.
    ///
    /// Bytes past the first [`HEADER_LEN`] are ignored.
    ///
    /// # Errors
    ///
    /// - [`Error::Frame`] if fewer than [`HEADER_LEN`] bytes are supplied.
    /// - [`Error::OversizedMessage`] if the declared payload length exceeds
    ///   the configured maximum, whether or not the payload is present.
    pub fn decode_header(&self, buf: &[u8]) -> Result<FrameHeader> {
        let Some(header) = buf.get(..HEADER_LEN) else {
            return Err(Error::frame(format!(
                "header needs {} bytes, got {}",
                HEADER_LEN,
                buf.len()
            )));
        };

        let data_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let msg_id = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        if data_len > self.max_packet_size {
            return Err(Error::OversizedMessage {
                declared: u64::from(data_len),
                max: u64::from(self.max_packet_size),
            });
        }

        Ok(FrameHeader { data_len, msg_id })
    }

    /// Reads one complete frame from `reader`.
    ///
    /// Reads exactly [`HEADER_LEN`] bytes, validates the header, then reads
    /// exactly `data_len` payload bytes. Partial reads are reassembled, so a
    /// frame split across any number of socket reads decodes the same way.
    pub async fn read_message<R>(&self, reader: &mut R) -> Result<Message>
    where
        R: AsyncRead + Unpin,
    {
        let mut head = [0u8; HEADER_LEN];
        reader.read_exact(&mut head).await?;
        let header = self.decode_header(&head)?;

        if header.data_len == 0 {
            return Ok(Message::new(header.msg_id, Bytes::new()));
        }

        let mut data = vec![0u8; header.data_len as usize];
        reader.read_exact(&mut data).await?;
        Ok(Message::new(header.msg_id, data))
    }
}

impl Default for DataPack {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_PACKET_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[test]
    fn test_encode_layout() {
        let pack = DataPack::new(64);
        let frame = pack.encode(0x0102_0304, &[0xAA, 0xBB]).unwrap();
        assert_eq!(
            &frame[..],
            &[2, 0, 0, 0, 0x04, 0x03, 0x02, 0x01, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_header_roundtrip() {
        let pack = DataPack::new(4096);
        for msg_id in [0, 200, u32::MAX] {
            for len in [0usize, 1, 4096] {
                let payload = vec![7u8; len];
                let frame = pack.encode(msg_id, &payload).unwrap();
                assert_eq!(frame.len(), HEADER_LEN + len);

                let header = pack.decode_header(&frame[..HEADER_LEN]).unwrap();
                assert_eq!(
                    header,
                    FrameHeader {
                        data_len: len as u32,
                        msg_id
                    }
                );
                assert_eq!(&frame[HEADER_LEN..], &payload[..]);
            }
        }
    }

    #[test]
    fn test_short_header_is_frame_error() {
        let pack = DataPack::new(4096);
        let err = pack.decode_header(&[1, 0, 0, 0, 2, 0, 0]).unwrap_err();
        assert!(matches!(err, Error::Frame(_)));
    }

    #[test]
    fn test_oversized_header_without_payload() {
        let pack = DataPack::new(16);
        let mut header = Vec::new();
        header.extend_from_slice(&17u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());

        let err = pack.decode_header(&header).unwrap_err();
        assert!(matches!(
            err,
            Error::OversizedMessage {
                declared: 17,
                max: 16
            }
        ));
    }

    #[test]
    fn test_max_size_is_inclusive() {
        let pack = DataPack::new(16);
        let frame = pack.encode(1, &[0u8; 16]).unwrap();
        assert!(pack.decode_header(&frame).is_ok());
    }

    #[tokio::test]
    async fn test_read_message_split_reads() {
        let pack = DataPack::new(4096);
        let frame = pack.encode(3, b"split across reads").unwrap();

        for cut in 1..frame.len() {
            let (first, rest) = frame.split_at(cut);
            let mut reader = Builder::new().read(first).read(rest).build();
            let msg = pack.read_message(&mut reader).await.unwrap();
            assert_eq!(msg.id(), 3);
            assert_eq!(msg.data(), b"split across reads");
        }
    }

    #[tokio::test]
    async fn test_read_message_byte_at_a_time() {
        let pack = DataPack::new(4096);
        let frame = pack.encode(9, &[1, 2, 3]).unwrap();

        let mut builder = Builder::new();
        for byte in frame.iter() {
            builder.read(std::slice::from_ref(byte));
        }
        let mut reader = builder.build();

        let msg = pack.read_message(&mut reader).await.unwrap();
        assert_eq!(msg.id(), 9);
        assert_eq!(msg.len(), 3);
    }

    #[tokio::test]
    async fn test_read_empty_payload() {
        let pack = DataPack::new(4096);
        let frame = pack.encode(5, &[]).unwrap();
        let mut reader = Builder::new().read(&frame).build();

        let msg = pack.read_message(&mut reader).await.unwrap();
        assert_eq!(msg.id(), 5);
        assert!(msg.is_empty());
    }

    #[tokio::test]
    async fn test_read_oversized_aborts_before_payload() {
        let pack = DataPack::new(4);
        let mut header = Vec::new();
        header.extend_from_slice(&1000u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());
        let mut reader = Builder::new().read(&header).build();

        let err = pack.read_message(&mut reader).await.unwrap_err();
        assert!(matches!(err, Error::OversizedMessage { .. }));
    }

    #[tokio::test]
    async fn test_truncated_payload_is_io_error() {
        let pack = DataPack::new(4096);
        let frame = pack.encode(1, b"abcdef").unwrap();
        let mut reader = Builder::new().read(&frame[..HEADER_LEN + 2]).build();

        let err = pack.read_message(&mut reader).await.unwrap_err();
        assert!(err.is_disconnect());
    }
}
