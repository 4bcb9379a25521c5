//! Command/Response framing.
//!
//! Wire format: `[4-byte index][4-byte code or status][4-byte length][payload]`,
//! all big-endian.

use crate::error::{status, RpcError, RpcResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = 12;

/// Largest payload length a frame can declare.
pub const MAX_DATA_LEN: u32 = i32::MAX as u32;

/// One frame on the wire. For a Command `code` is the command code, for a
/// Response it is the status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub index: u32,
    pub code: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn new(index: u32, code: u32, data: Vec<u8>) -> Self {
        Self { index, code, data }
    }
}

/// A Command is a frame whose second word is a command code.
pub type Command = Frame;

/// A frame read as a Response: the second word is a status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub index: u32,
    pub status: u32,
    pub data: Vec<u8>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.status == status::OK
    }

    /// Payload on success, the decoded error otherwise.
    pub fn into_result(self) -> RpcResult<Vec<u8>> {
        if self.is_ok() {
            Ok(self.data)
        } else {
            Err(RpcError::from_status(self.status, &self.data))
        }
    }
}

impl From<Frame> for Response {
    fn from(frame: Frame) -> Self {
        Self {
            index: frame.index,
            status: frame.code,
            data: frame.data,
        }
    }
}

/// Encode a frame into a single buffer.
pub fn encode(frame: &Frame) -> RpcResult<Vec<u8>> {
    let len = data_len(&frame.data)?;
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.data.len());
    buf.extend_from_slice(&header(frame.index, frame.code, len));
    buf.extend_from_slice(&frame.data);
    Ok(buf)
}

/// Decode a frame occupying exactly `bytes`.
pub fn decode(bytes: &[u8]) -> RpcResult<Frame> {
    if bytes.len() < HEADER_LEN {
        return Err(RpcError::Format(format!(
            "frame too short: {} bytes",
            bytes.len()
        )));
    }
    let (index, code, len) = parse_header(&bytes[..HEADER_LEN]);
    let remaining = bytes.len() - HEADER_LEN;
    if len > MAX_DATA_LEN || len as usize != remaining {
        return Err(RpcError::Format(format!(
            "declared length {len} does not match {remaining} remaining bytes"
        )));
    }
    Ok(Frame::new(index, code, bytes[HEADER_LEN..].to_vec()))
}

/// Outcome of reading one frame from a stream.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    /// The declared payload exceeded the caller's limit. The payload was
    /// read and discarded so the stream stays aligned on frame boundaries.
    Oversized { index: u32, code: u32, len: u32 },
}

/// Read one frame from `reader`, refusing to buffer more than `limit`
/// payload bytes.
///
/// Returns `Ok(None)` on a clean EOF before the first header byte.
pub async fn read_frame<R>(reader: &mut R, limit: u32) -> RpcResult<Option<Inbound>>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; HEADER_LEN];
    let first = reader.read(&mut head).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut head[first..]).await?;

    let (index, code, len) = parse_header(&head);
    if len > MAX_DATA_LEN {
        return Err(RpcError::Format(format!("declared length {len} out of range")));
    }
    if len > limit {
        let mut payload = (&mut *reader).take(u64::from(len));
        let drained = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        if drained != u64::from(len) {
            return Err(RpcError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        return Ok(Some(Inbound::Oversized { index, code, len }));
    }

    let mut data = vec![0u8; len as usize];
    reader.read_exact(&mut data).await?;
    Ok(Some(Inbound::Frame(Frame::new(index, code, data))))
}

/// Write one frame to `writer` and flush it.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> RpcResult<()>
where
    W: AsyncWrite + Unpin,
{
    let len = data_len(&frame.data)?;
    writer.write_all(&header(frame.index, frame.code, len)).await?;
    writer.write_all(&frame.data).await?;
    writer.flush().await?;
    Ok(())
}

fn data_len(data: &[u8]) -> RpcResult<u32> {
    u32::try_from(data.len())
        .ok()
        .filter(|len| *len <= MAX_DATA_LEN)
        .ok_or_else(|| RpcError::Format(format!("payload of {} bytes too large", data.len())))
}

fn header(index: u32, code: u32, len: u32) -> [u8; HEADER_LEN] {
    let mut head = [0u8; HEADER_LEN];
    head[0..4].copy_from_slice(&index.to_be_bytes());
    head[4..8].copy_from_slice(&code.to_be_bytes());
    head[8..12].copy_from_slice(&len.to_be_bytes());
    head
}

fn parse_header(head: &[u8]) -> (u32, u32, u32) {
    let word = |at: usize| u32::from_be_bytes([head[at], head[at + 1], head[at + 2], head[at + 3]]);
    (word(0), word(4), word(8))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_frames() {
        for len in [0usize, 1, 12, 4096] {
            let frame = Frame::new(0xFFFF_FFFF, 0xCDD0_0004, vec![0x5A; len]);
            let bytes = encode(&frame).unwrap();
            assert_eq!(bytes.len(), HEADER_LEN + len);
            assert_eq!(decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn header_is_big_endian() {
        let bytes = encode(&Frame::new(1, 0xC000_0001, vec![9, 8])).unwrap();
        assert_eq!(
            bytes,
            vec![0, 0, 0, 1, 0xC0, 0, 0, 1, 0, 0, 0, 2, 9, 8]
        );
    }

    #[test]
    fn short_buffer_fails() {
        for len in 0..HEADER_LEN {
            assert!(matches!(decode(&vec![0u8; len]), Err(RpcError::Format(_))));
        }
    }

    #[test]
    fn length_mismatch_fails() {
        let mut bytes = encode(&Frame::new(1, 2, vec![1, 2, 3])).unwrap();
        bytes.push(4);
        assert!(matches!(decode(&bytes), Err(RpcError::Format(_))));

        bytes.truncate(HEADER_LEN + 2);
        assert!(matches!(decode(&bytes), Err(RpcError::Format(_))));
    }

    #[test]
    fn out_of_range_length_fails() {
        let mut bytes = vec![0u8; HEADER_LEN];
        bytes[8..12].copy_from_slice(&0x8000_0000u32.to_be_bytes());
        assert!(matches!(decode(&bytes), Err(RpcError::Format(_))));
    }

    #[tokio::test]
    async fn stream_read_and_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frame = Frame::new(7, 3, b"hello".to_vec());
        write_frame(&mut a, &frame).await.unwrap();
        drop(a);

        match read_frame(&mut b, 64).await.unwrap() {
            Some(Inbound::Frame(got)) => assert_eq!(got, frame),
            other => panic!("unexpected {other:?}"),
        }
        assert!(read_frame(&mut b, 64).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_payload_is_skipped() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        write_frame(&mut a, &Frame::new(1, 2, vec![0; 100])).await.unwrap();
        write_frame(&mut a, &Frame::new(2, 2, vec![1; 4])).await.unwrap();

        match read_frame(&mut b, 10).await.unwrap() {
            Some(Inbound::Oversized { index, len, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(len, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
        match read_frame(&mut b, 10).await.unwrap() {
            Some(Inbound::Frame(got)) => assert_eq!(got.data, vec![1; 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_header_is_io_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        tokio::io::AsyncWriteExt::write_all(&mut a, &[0, 0, 0]).await.unwrap();
        drop(a);
        assert!(matches!(read_frame(&mut b, 10).await, Err(RpcError::Io(_))));
    }
}
