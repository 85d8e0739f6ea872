//! TLS ClientHello parsing.
//!
//! Two pure functions over a byte buffer:
//! - [`parse_record`] decides whether the buffer holds (the start of) a TLS
//!   handshake record, and whether enough of it has arrived to parse.
//! - [`extract_sni`] walks a ClientHello handshake body and returns the
//!   first `host_name` entry of the `server_name` extension.
//!
//! Neither function performs I/O or mutates its input, so both can be called
//! repeatedly on a growing buffer.
//!
//! TLS Record structure:
//! - byte 0: record type (0x16 = Handshake)
//! - bytes 1-2: version
//! - bytes 3-4: record length
//! - bytes 5+: handshake message

use std::fmt;

/// Record content type for handshake messages.
pub const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// Length of the TLS record header (type + version + length).
pub const RECORD_HEADER_LEN: usize = 5;

/// Record versions accepted as TLS (1.0 through 1.3).
pub const TLS_VERSIONS: [u16; 4] = [0x0301, 0x0302, 0x0303, 0x0304];

/// Extension type of `server_name` (RFC 6066).
const EXTENSION_SERVER_NAME: u16 = 0x0000;

/// `NameType` of a `host_name` entry in the `server_name` list.
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Handshake type (1) + length (3) + client version (2) + random (32).
const CLIENT_HELLO_FIXED_PREFIX: usize = 4 + 2 + 32;

/// One TLS record borrowed from the capture buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsRecord<'a> {
    /// Record content type, always [`CONTENT_TYPE_HANDSHAKE`] once parsed.
    pub content_type: u8,
    /// Record-layer protocol version.
    pub version: u16,
    /// Exactly the number of bytes declared by the record length field.
    pub body: &'a [u8],
}

/// Why a buffer was rejected as not being a TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// First byte is not the handshake content type.
    NotHandshake(u8),
    /// Version field is not one of [`TLS_VERSIONS`].
    UnsupportedVersion(u16),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotHandshake(content_type) => {
                write!(f, "record type {content_type:#04x} is not a handshake")
            }
            RejectReason::UnsupportedVersion(version) => {
                write!(f, "record version {version:#06x} is not a TLS version")
            }
        }
    }
}

/// Verdict of [`parse_record`] on the bytes accumulated so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome<'a> {
    /// The buffer is a valid prefix but incomplete.
    NeedMore {
        /// Total buffer length required before the next attempt can succeed.
        needed: usize,
    },
    /// A complete handshake record is available.
    Parsed(TlsRecord<'a>),
    /// The stream is not a TLS handshake.
    Rejected(RejectReason),
}

/// Parse the TLS record at the start of `buf`.
///
/// Rejects as soon as the bytes already present prove the stream is not TLS,
/// even when the header itself is still incomplete. Any further bytes past
/// the first record are ignored.
pub fn parse_record(buf: &[u8]) -> RecordOutcome<'_> {
    let Some(&content_type) = buf.first() else {
        return RecordOutcome::NeedMore {
            needed: RECORD_HEADER_LEN,
        };
    };
    if content_type != CONTENT_TYPE_HANDSHAKE {
        return RecordOutcome::Rejected(RejectReason::NotHandshake(content_type));
    }

    if buf.len() < 3 {
        return RecordOutcome::NeedMore {
            needed: RECORD_HEADER_LEN,
        };
    }
    let version = u16::from_be_bytes([buf[1], buf[2]]);
    if !TLS_VERSIONS.contains(&version) {
        return RecordOutcome::Rejected(RejectReason::UnsupportedVersion(version));
    }

    if buf.len() < RECORD_HEADER_LEN {
        return RecordOutcome::NeedMore {
            needed: RECORD_HEADER_LEN,
        };
    }
    let size = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let end = RECORD_HEADER_LEN + size;
    if buf.len() < end {
        return RecordOutcome::NeedMore { needed: end };
    }

    RecordOutcome::Parsed(TlsRecord {
        content_type,
        version,
        body: &buf[RECORD_HEADER_LEN..end],
    })
}

/// Extract the SNI hostname from a handshake record body.
///
/// Returns an empty string when the body holds no `server_name` extension,
/// no `host_name` entry, a hostname that is not UTF-8, or when any length
/// field points past the end of `body`. Absence of SNI is a routing outcome,
/// not an error.
///
/// Handshake ClientHello:
/// - byte 0: handshake type (0x01 = ClientHello)
/// - bytes 1-3: length
/// - bytes 4-5: client version
/// - bytes 6-37: random (32 bytes)
/// - byte 38: session ID length
/// - variable: session ID
/// - 2 bytes: cipher suites length
/// - variable: cipher suites
/// - 1 byte: compression methods length
/// - variable: compression methods
/// - 2 bytes: extensions length
/// - variable: extensions
pub fn extract_sni(body: &[u8]) -> String {
    find_host_name(body)
        .and_then(|name| std::str::from_utf8(name).ok())
        .map(str::to_owned)
        .unwrap_or_default()
}

fn find_host_name(body: &[u8]) -> Option<&[u8]> {
    let mut hello = ByteReader::new(body);
    hello.skip(CLIENT_HELLO_FIXED_PREFIX)?;

    let session_id_len = hello.read_u8()? as usize;
    hello.skip(session_id_len)?;

    let cipher_suites_len = hello.read_u16()? as usize;
    hello.skip(cipher_suites_len)?;

    let compression_len = hello.read_u8()? as usize;
    hello.skip(compression_len)?;

    let extensions_len = hello.read_u16()? as usize;
    let mut extensions = ByteReader::new(hello.take_clamped(extensions_len));

    while !extensions.is_empty() {
        let ext_type = extensions.read_u16()?;
        let ext_len = extensions.read_u16()? as usize;
        let data = extensions.take(ext_len)?;

        if ext_type == EXTENSION_SERVER_NAME {
            return first_host_name(data);
        }
    }

    None
}

/// Parse the `server_name` extension value.
///
/// SNI extension structure:
/// - 2 bytes: list length
/// - for each entry:
///   - 1 byte: name type (0 = hostname)
///   - 2 bytes: name length
///   - variable: name
fn first_host_name(data: &[u8]) -> Option<&[u8]> {
    let mut ext = ByteReader::new(data);
    let list_len = ext.read_u16()? as usize;
    let mut list = ByteReader::new(ext.take(list_len)?);

    while !list.is_empty() {
        let name_type = list.read_u8()?;
        let name_len = list.read_u16()? as usize;
        let name = list.take(name_len)?;

        if name_type == NAME_TYPE_HOST_NAME {
            return Some(name);
        }
    }

    None
}

/// Bounds-checked big-endian cursor. Every accessor returns `None` instead of
/// reading past the end of the slice.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.remaining() {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Like [`ByteReader::take`], but shortens `n` to what is left.
    fn take_clamped(&mut self, n: usize) -> &'a [u8] {
        let n = n.min(self.remaining());
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        slice
    }

    fn skip(&mut self, n: usize) -> Option<()> {
        self.take(n).map(|_| ())
    }

    fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn read_u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }
}
