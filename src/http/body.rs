use bytes::{Buf, Bytes, BytesMut};

use super::head::ResponseHead;
use crate::error::{BridgeError, Result};

/// Longest chunk-size or trailer line we are willing to buffer
const MAX_LINE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Waiting for a `<hex-size>[;ext]\r\n` line
    Size,
    /// Inside chunk data with this many bytes left
    Data(u64),
    /// Expecting the CRLF that closes a chunk's data
    DataEnd,
    /// After the zero-size chunk, skipping trailer lines until a blank one
    Trailer,
    Done,
}

/// Incremental decoder for `Transfer-Encoding: chunked`
///
/// Feed it whatever bytes have arrived; it hands back chunk payload as soon as
/// any of it is available, so a single chunk split across reads yields several
/// pieces. Concatenating every piece reproduces the original body.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
        }
    }

    /// Pull the next payload piece out of `src`.
    ///
    /// `Ok(None)` means more input is needed, or the body is complete (check
    /// [`is_done`](Self::is_done)).
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data(size)
                    };
                }
                ChunkState::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(src.len() as u64) as usize;
                    let piece = src.split_to(take).freeze();
                    let left = remaining - take as u64;
                    self.state = if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    };
                    return Ok(Some(piece));
                }
                ChunkState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(BridgeError::Protocol(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    src.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let Some(line) = take_line(src)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Reset the decoder state (useful for connection reuse)
    pub fn reset(&mut self) {
        self.state = ChunkState::Size;
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Split one CRLF-terminated line off the front of `src`, without the CRLF
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>> {
    match src.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = src.split_to(pos);
            src.advance(2);
            Ok(Some(line))
        }
        None if src.len() > MAX_LINE => Err(BridgeError::Protocol(format!(
            "chunk framing line exceeds {} bytes",
            MAX_LINE
        ))),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    // extensions after `;` are ignored
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map(|s| s.trim_matches(|c| c == ' ' || c == '\t'))
        .map_err(|_| BridgeError::Protocol("chunk size is not ASCII".to_string()))?;
    if size.is_empty() {
        return Err(BridgeError::Protocol("empty chunk size".to_string()));
    }
    if !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BridgeError::Protocol(format!(
            "invalid chunk size `{}`",
            size
        )));
    }
    u64::from_str_radix(size, 16)
        .map_err(|e| BridgeError::Protocol(format!("invalid chunk size `{}`: {}", size, e)))
}

/// Body framing selected from a response head
#[derive(Debug)]
pub enum BodyDecoder {
    Chunked(ChunkedDecoder),
    Length(u64),
    /// Body runs until the peer closes the connection
    UntilClose { closed: bool },
}

impl BodyDecoder {
    pub fn for_head(head: &ResponseHead) -> Self {
        if head.status < 200 || head.status == 204 || head.status == 304 {
            BodyDecoder::Length(0)
        } else if head.is_chunked() {
            BodyDecoder::Chunked(ChunkedDecoder::new())
        } else if let Some(len) = head.content_length() {
            BodyDecoder::Length(len)
        } else {
            BodyDecoder::UntilClose { closed: false }
        }
    }

    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        match self {
            BodyDecoder::Chunked(decoder) => decoder.decode(src),
            BodyDecoder::Length(remaining) => {
                if *remaining == 0 || src.is_empty() {
                    return Ok(None);
                }
                let take = (*remaining).min(src.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Some(src.split_to(take).freeze()))
            }
            BodyDecoder::UntilClose { .. } => {
                if src.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(src.split().freeze()))
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            BodyDecoder::Chunked(decoder) => decoder.is_done(),
            BodyDecoder::Length(remaining) => *remaining == 0,
            BodyDecoder::UntilClose { closed } => *closed,
        }
    }

    /// The peer closed the connection; only a close-delimited body may end this way
    pub fn on_eof(&mut self) -> Result<()> {
        if let BodyDecoder::UntilClose { closed } = self {
            *closed = true;
            return Ok(());
        }
        if self.is_done() {
            Ok(())
        } else {
            Err(BridgeError::Protocol(
                "connection closed before the response body was complete".to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(decoder: &mut ChunkedDecoder, buf: &mut BytesMut) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(piece) = decoder.decode(buf).unwrap() {
            out.extend_from_slice(&piece);
        }
        out
    }

    #[test]
    fn test_decode_complete_body() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"[..]);
        assert_eq!(decode_all(&mut decoder, &mut buf), b"hello world");
        assert!(decoder.is_done());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let raw = b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();

        for byte in raw {
            buf.extend_from_slice(&[*byte]);
            while let Some(piece) = decoder.decode(&mut buf).unwrap() {
                out.extend_from_slice(&piece);
            }
        }

        assert_eq!(out, b"Wikipedia in\r\n\r\nchunks.");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_chunk_extensions_and_trailers() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(
            &b"3;name=value\r\nabc\r\n0\r\nX-Trailer: yes\r\n\r\n"[..],
        );
        assert_eq!(decode_all(&mut decoder, &mut buf), b"abc");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_uppercase_hex_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"A\r\n0123456789\r\n0\r\n\r\n"[..]);
        assert_eq!(decode_all(&mut decoder, &mut buf), b"0123456789");
    }

    #[test]
    fn test_invalid_size_is_protocol_error() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"zz\r\nabc\r\n"[..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(BridgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_signed_size_is_rejected() {
        let cases: [&[u8]; 3] = [b"+2\r\nhi\r\n0\r\n\r\n", b"-0\r\n\r\n", b"0x2\r\nhi\r\n"];
        for raw in cases {
            let mut decoder = ChunkedDecoder::new();
            let mut buf = BytesMut::from(raw);
            assert!(matches!(
                decoder.decode(&mut buf),
                Err(BridgeError::Protocol(_))
            ));
        }
    }

    #[test]
    fn test_missing_data_crlf() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"3\r\nabcXY"[..]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"abc");
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn test_reset() {
        let mut decoder = ChunkedDecoder::new();
        let mut buf = BytesMut::from(&b"0\r\n\r\n"[..]);
        decode_all(&mut decoder, &mut buf);
        assert!(decoder.is_done());

        decoder.reset();
        assert!(!decoder.is_done());
    }

    #[test]
    fn test_length_body() {
        let head = ResponseHead {
            status: 200,
            reason: "OK".into(),
            headers: vec![("content-length".into(), "5".into())],
        };
        let mut decoder = BodyDecoder::for_head(&head);
        let mut buf = BytesMut::from(&b"hel"[..]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"hel");
        assert!(!decoder.is_done());
        assert!(decoder.on_eof().is_err());

        buf.extend_from_slice(b"lo");
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"lo");
        assert!(decoder.is_done());
    }

    #[test]
    fn test_close_delimited_body() {
        let head = ResponseHead {
            status: 200,
            reason: "OK".into(),
            headers: vec![],
        };
        let mut decoder = BodyDecoder::for_head(&head);
        let mut buf = BytesMut::from(&b"anything"[..]);
        assert_eq!(&decoder.decode(&mut buf).unwrap().unwrap()[..], b"anything");
        assert!(!decoder.is_done());
        decoder.on_eof().unwrap();
        assert!(decoder.is_done());
    }

    #[test]
    fn test_no_content_has_empty_body() {
        let head = ResponseHead {
            status: 204,
            reason: "No Content".into(),
            headers: vec![("transfer-encoding".into(), "chunked".into())],
        };
        assert!(BodyDecoder::for_head(&head).is_done());
    }
}
