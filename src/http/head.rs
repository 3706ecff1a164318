use crate::error::{BridgeError, Result};

/// Upper bound on a buffered response head
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Parsed status line and headers of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
    /// Header names are stored lower-cased, in arrival order
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Try to parse a complete head from the front of `buf`.
    ///
    /// Returns the head and the number of bytes it occupied, or `None` when the
    /// terminating blank line has not arrived yet.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        let Some(end) = find_head_end(buf) else {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(BridgeError::Protocol(format!(
                    "response head exceeds {} bytes",
                    MAX_HEAD_SIZE
                )));
            }
            return Ok(None);
        };

        let mut lines = buf[..end].split(|b| *b == b'\n').map(trim_cr);

        let status_line = lines.next().unwrap_or_default();
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            headers.push(parse_header_line(line)?);
        }

        Ok(Some((
            ResponseHead {
                status,
                reason,
                headers,
            },
            end + 4,
        )))
    }

    /// First value of a header, matched case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_values(name).next()
    }

    /// Every value of a (possibly repeated) header
    pub fn header_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header_values("transfer-encoding")
            .flat_map(|v| v.split(','))
            .any(|v| v.trim().eq_ignore_ascii_case("chunked"))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// Informational 1xx head that precedes the final one. `101` is final.
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.status) && self.status != 101
    }

    /// Fail with `UnexpectedStatus` unless the status matches
    pub fn expect_status(&self, expected: u16) -> Result<()> {
        if self.status == expected {
            Ok(())
        } else {
            Err(BridgeError::UnexpectedStatus {
                code: self.status,
                reason: self.reason.clone(),
            })
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn parse_status_line(line: &[u8]) -> Result<(u16, String)> {
    let mut parts = line.splitn(3, |b| *b == b' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with(b"HTTP/1.") {
        return Err(BridgeError::Protocol(format!(
            "bad status line: {}",
            String::from_utf8_lossy(line)
        )));
    }
    let status = parts
        .next()
        .and_then(|s| std::str::from_utf8(s).ok())
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|s| (100..1000).contains(s))
        .ok_or_else(|| {
            BridgeError::Protocol(format!(
                "bad status code in: {}",
                String::from_utf8_lossy(line)
            ))
        })?;
    // reason phrases may carry obs-text
    let reason = String::from_utf8_lossy(parts.next().unwrap_or_default())
        .trim()
        .to_string();
    Ok((status, reason))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String)> {
    let malformed = || {
        BridgeError::Protocol(format!(
            "malformed header line: {}",
            String::from_utf8_lossy(line)
        ))
    };

    let colon = line.iter().position(|b| *b == b':').ok_or_else(malformed)?;
    let name = line[..colon].trim_ascii();
    if name.is_empty() || !name.iter().all(|b| b.is_ascii_graphic()) {
        return Err(malformed());
    }
    let name = String::from_utf8_lossy(name).to_ascii_lowercase();
    let value = String::from_utf8_lossy(line[colon + 1..].trim_ascii()).into_owned();
    Ok((name, value))
}
