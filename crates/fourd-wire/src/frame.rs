//! Length-prefixed framing.
//!
//! ```text
//! +----------------+--------+---------------------+
//! | len: u32 (LE)  | flag:u8| body: len bytes     |
//! +----------------+--------+---------------------+
//! ```
//!
//! `flag` is reserved and always written as [`FLAG_TEXT`]; readers ignore it.

use crate::error::FrameError;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bytes in the fixed header.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a frame body (64 MiB).
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// The only flag value currently defined.
pub const FLAG_TEXT: u8 = 0;

/// Frame a body into a new buffer.
pub fn encode(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
    encode_into(body, &mut buf)?;
    Ok(buf)
}

/// Append a framed body to `buf`, reusing its allocation.
pub fn encode_into(body: &[u8], buf: &mut Vec<u8>) -> Result<(), FrameError> {
    let len = check_len(body.len() as u64)?;
    buf.reserve(HEADER_LEN + body.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.push(FLAG_TEXT);
    buf.extend_from_slice(body);
    Ok(())
}

/// Parse a header into `(body_len, flag)`, enforcing the size cap.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(u32, u8), FrameError> {
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    check_len(u64::from(len))?;
    Ok((len, header[4]))
}

/// Decode one frame from the front of `buf`.
///
/// Returns the body and the number of bytes consumed.
pub fn decode(buf: &[u8]) -> Result<(&[u8], usize), FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(truncated(HEADER_LEN, buf.len()));
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&buf[..HEADER_LEN]);
    let (len, _flag) = parse_header(&header)?;
    let end = HEADER_LEN + len as usize;
    if buf.len() < end {
        return Err(truncated(len as usize, buf.len() - HEADER_LEN));
    }
    Ok((&buf[HEADER_LEN..end], end))
}

/// Read exactly one frame body from a stream.
///
/// Short reads are retried until the header and body are complete or the
/// stream ends. An oversized length is rejected before any body byte is read.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let got = read_full(reader, &mut header).await?;
    if got == 0 {
        return Err(FrameError::Closed);
    }
    if got < HEADER_LEN {
        return Err(truncated(HEADER_LEN, got));
    }

    let (len, _flag) = parse_header(&header)?;
    let mut body = vec![0u8; len as usize];
    let got = read_full(reader, &mut body).await?;
    if got < body.len() {
        return Err(truncated(body.len(), got));
    }
    Ok(body)
}

/// Fill `buf` as far as the stream allows; returns bytes read.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut got = 0;
    while got < buf.len() {
        let n = reader.read(&mut buf[got..]).await?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

fn check_len(len: u64) -> Result<u32, FrameError> {
    if len > u64::from(MAX_FRAME_LEN) {
        return Err(FrameError::TooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len as u32)
}

fn truncated(expected: usize, got: usize) -> FrameError {
    FrameError::Truncated { expected, got }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let bytes = encode(b"hello").unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 5);
        assert_eq!(&bytes[..4], &5u32.to_le_bytes());
        assert_eq!(bytes[4], FLAG_TEXT);
        assert_eq!(&bytes[5..], b"hello");
    }

    #[tokio::test]
    async fn test_roundtrip_boundary_lengths() {
        for len in [0usize, 1, MAX_FRAME_LEN as usize] {
            let body = vec![b'x'; len];
            let bytes = encode(&body).unwrap();
            let mut stream: &[u8] = &bytes;
            let decoded = read_frame(&mut stream).await.unwrap();
            assert_eq!(decoded.len(), len);
            assert_eq!(decoded, body);
            assert!(stream.is_empty());
        }
    }

    #[test]
    fn test_encode_rejects_over_cap() {
        let body = vec![0u8; MAX_FRAME_LEN as usize + 1];
        assert!(matches!(
            encode(&body),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_rejects_over_cap_header() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.push(FLAG_TEXT);
        bytes.extend_from_slice(b"trailing");
        let mut stream: &[u8] = &bytes;
        match read_frame(&mut stream).await {
            Err(FrameError::TooLarge { len, max }) => {
                assert_eq!(len, u64::from(MAX_FRAME_LEN) + 1);
                assert_eq!(max, MAX_FRAME_LEN);
            }
            other => panic!("expected TooLarge, got {other:?}"),
        }
        // Body bytes are left unread.
        assert_eq!(stream, b"trailing");
    }

    #[tokio::test]
    async fn test_clean_eof_is_closed() {
        let mut stream: &[u8] = &[];
        assert!(matches!(read_frame(&mut stream).await, Err(FrameError::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_header_and_body() {
        let mut stream: &[u8] = &[3, 0];
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(FrameError::Truncated { expected: 5, got: 2 })
        ));

        let bytes = encode(b"abcdef").unwrap();
        let mut stream: &[u8] = &bytes[..bytes.len() - 2];
        assert!(matches!(
            read_frame(&mut stream).await,
            Err(FrameError::Truncated { expected: 6, got: 4 })
        ));
    }

    #[tokio::test]
    async fn test_partial_reads_are_reassembled() {
        let bytes = encode(b"{\"k\":1}").unwrap();
        let mut builder = tokio_test::io::Builder::new();
        for chunk in bytes.chunks(2) {
            builder.read(chunk);
        }
        let mut mock = builder.build();
        assert_eq!(read_frame(&mut mock).await.unwrap(), b"{\"k\":1}");
    }

    #[test]
    fn test_decode_from_slice_consumes_one_frame() {
        let mut buf = encode(b"one").unwrap();
        buf.extend_from_slice(&encode(b"two").unwrap());
        let (body, used) = decode(&buf).unwrap();
        assert_eq!(body, b"one");
        let (body, _) = decode(&buf[used..]).unwrap();
        assert_eq!(body, b"two");
    }

    #[test]
    fn test_encode_into_reuses_buffer() {
        let mut buf = Vec::with_capacity(64);
        encode_into(b"first", &mut buf).unwrap();
        buf.clear();
        encode_into(b"second", &mut buf).unwrap();
        assert_eq!(decode(&buf).unwrap().0, b"second");
        assert!(buf.capacity() >= 64);
    }
}
