//! Minimal DNS wire-format inspection
//!
//! The tunnel treats query and response payloads as opaque bytes; the only
//! thing it ever reads out of them is the queried name(s), for logging.
//! Nothing here validates a message beyond what that walk requires.

use thiserror::Error;

/// Fixed DNS header size (RFC 1035)
const HEADER_LEN: usize = 12;

/// Maximum compression pointer jumps before a packet is declared cyclic
const MAX_POINTER_JUMPS: usize = 16;

/// Maximum length of a presentation-format name
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Error)]
pub enum DnsParseError {
    #[error("packet too short: {0} bytes")]
    TooShort(usize),

    #[error("no questions in packet")]
    NoQuestions,

    #[error("truncated name at offset {0}")]
    TruncatedName(usize),

    #[error("name exceeds {MAX_NAME_LEN} bytes")]
    NameTooLong,

    #[error("compression pointer loop")]
    PointerLoop,

    #[error("invalid label type {0:#04x}")]
    InvalidLabel(u8),
}

/// Extract the queried name(s) from a raw DNS message.
///
/// Walks the question section only and returns the names joined with a
/// single space, each with a trailing dot (`"example.com. "` style, matching
/// presentation format). Answer sections are never touched.
pub fn query_names(packet: &[u8]) -> Result<String, DnsParseError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsParseError::TooShort(packet.len()));
    }

    let qdcount = u16::from_be_bytes([packet[4], packet[5]]) as usize;
    if qdcount == 0 {
        return Err(DnsParseError::NoQuestions);
    }

    let mut names = String::new();
    let mut pos = HEADER_LEN;

    for _ in 0..qdcount {
        let (name, next) = read_name(packet, pos)?;
        names.push_str(&name);
        names.push(' ');

        // QTYPE + QCLASS
        if next + 4 > packet.len() {
            return Err(DnsParseError::TruncatedName(next));
        }
        pos = next + 4;
    }

    Ok(names)
}

/// Read one domain name starting at `start`, following compression pointers.
///
/// Returns the name in presentation format and the offset just past the name
/// as it appears at `start` (pointers do not move that offset forward).
fn read_name(packet: &[u8], start: usize) -> Result<(String, usize), DnsParseError> {
    let mut name = String::new();
    let mut pos = start;
    let mut jumps = 0usize;
    // Offset past the name in the original (unjumped) position
    let mut end = None;

    loop {
        if pos >= packet.len() {
            return Err(DnsParseError::TruncatedName(pos));
        }

        let len = packet[pos];
        match len {
            0 => {
                if name.is_empty() {
                    name.push('.'); // root
                }
                return Ok((name, end.unwrap_or(pos + 1)));
            }
            l if l & 0xc0 == 0xc0 => {
                if pos + 1 >= packet.len() {
                    return Err(DnsParseError::TruncatedName(pos));
                }
                if jumps >= MAX_POINTER_JUMPS {
                    return Err(DnsParseError::PointerLoop);
                }
                let target = (((l & 0x3f) as usize) << 8) | packet[pos + 1] as usize;
                if end.is_none() {
                    end = Some(pos + 2);
                }
                pos = target;
                jumps += 1;
            }
            l if l & 0xc0 != 0 => {
                // 0x40/0x80 label types were never standardized
                return Err(DnsParseError::InvalidLabel(l));
            }
            l => {
                let l = l as usize;
                if pos + 1 + l > packet.len() {
                    return Err(DnsParseError::TruncatedName(pos));
                }
                if name.len() + l + 1 > MAX_NAME_LEN + 1 {
                    return Err(DnsParseError::NameTooLong);
                }
                name.push_str(&String::from_utf8_lossy(&packet[pos + 1..pos + 1 + l]));
                name.push('.');
                pos += 1 + l;
            }
        }
    }
}
