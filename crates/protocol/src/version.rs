//! Version identification lines.
//!
//! Each side opens the connection with a single text line:
//!
//! ```text
//! SHELLWIRE-<protoversion>-<softwareversion>[ <comments>]\r\n
//! ```
//!
//! The line is at most 255 bytes including the terminator. A peer may send
//! other lines before it; those are skipped. A bare `\n` terminator is
//! tolerated.

use crate::error::{ProtocolError, Result};

/// Prefix of every identification line.
pub const VERSION_PREFIX: &str = "SHELLWIRE-";

/// Protocol version we speak.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Older protocol version string accepted as equivalent.
pub const COMPAT_PROTOCOL_VERSION: &str = "1.99";

/// Maximum identification line length, terminator included.
pub const MAX_VERSION_LINE: usize = 255;

/// A parsed identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    /// Protocol version, `2.0` or `1.99`.
    pub protocol: String,
    /// Software version.
    pub software: String,
    /// Optional free-form comments.
    pub comments: Option<String>,
    /// The full line without its terminator, as bound into the key exchange.
    pub line: String,
}

/// Result of scanning buffered input for an identification line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineScan {
    /// No complete line yet.
    Incomplete,
    /// A preamble line of the given length (terminator included) was skipped.
    Skipped(usize),
    /// The identification line was found; the count is the bytes consumed.
    Found(VersionInfo, usize),
}

/// Build our identification line, terminator included.
pub fn identification_line(software: &str) -> String {
    format!("{}{}-{}\r\n", VERSION_PREFIX, PROTOCOL_VERSION, software)
}

/// Scan the start of `data` for one line.
pub fn scan_version_line(data: &[u8]) -> Result<LineScan> {
    let window = &data[..data.len().min(MAX_VERSION_LINE)];
    let Some(newline) = window.iter().position(|&b| b == b'\n') else {
        if data.len() >= MAX_VERSION_LINE {
            return Err(ProtocolError::InvalidVersion(format!(
                "no line terminator within {} bytes",
                MAX_VERSION_LINE
            )));
        }
        return Ok(LineScan::Incomplete);
    };

    let consumed = newline + 1;
    let mut line = &data[..newline];
    if let Some((&b'\r', rest)) = line.split_last() {
        line = rest;
    }

    if !line.starts_with(VERSION_PREFIX.as_bytes()) {
        return Ok(LineScan::Skipped(consumed));
    }

    let info = parse_version_line(line)?;
    Ok(LineScan::Found(info, consumed))
}

/// Parse an identification line without its terminator.
pub fn parse_version_line(line: &[u8]) -> Result<VersionInfo> {
    if line.iter().any(|&b| !(0x20..0x7f).contains(&b)) {
        return Err(ProtocolError::InvalidVersion(
            "identification line contains non-printable bytes".to_string(),
        ));
    }
    let line = std::str::from_utf8(line)
        .map_err(|e| ProtocolError::InvalidVersion(e.to_string()))?;

    let rest = line
        .strip_prefix(VERSION_PREFIX)
        .ok_or_else(|| ProtocolError::InvalidVersion(format!("missing prefix: {:?}", line)))?;

    let (protocol, software_and_comments) = rest
        .split_once('-')
        .ok_or_else(|| ProtocolError::InvalidVersion(format!("missing software version: {:?}", line)))?;

    if protocol != PROTOCOL_VERSION && protocol != COMPAT_PROTOCOL_VERSION {
        return Err(ProtocolError::InvalidVersion(format!(
            "unsupported protocol version {:?}",
            protocol
        )));
    }

    let (software, comments) = match software_and_comments.split_once(' ') {
        Some((software, comments)) => (software, Some(comments.to_string())),
        None => (software_and_comments, None),
    };
    if software.is_empty() {
        return Err(ProtocolError::InvalidVersion(
            "empty software version".to_string(),
        ));
    }

    Ok(VersionInfo {
        protocol: protocol.to_string(),
        software: software.to_string(),
        comments,
        line: line.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identification_line_format() {
        let line = identification_line("test");
        assert_eq!(line, "SHELLWIRE-2.0-test\r\n");
        assert!(line.ends_with("2.0-test\r\n"));
    }

    #[test]
    fn test_scan_finds_line() {
        let data = b"SHELLWIRE-2.0-test\r\nrest";
        match scan_version_line(data).unwrap() {
            LineScan::Found(info, consumed) => {
                assert_eq!(info.protocol, "2.0");
                assert_eq!(info.software, "test");
                assert_eq!(info.comments, None);
                assert_eq!(info.line, "SHELLWIRE-2.0-test");
                assert_eq!(consumed, 20);
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn test_scan_incomplete() {
        assert_eq!(
            scan_version_line(b"SHELLWIRE-2.0-te").unwrap(),
            LineScan::Incomplete
        );
        assert_eq!(scan_version_line(b"").unwrap(), LineScan::Incomplete);
    }

    #[test]
    fn test_scan_skips_preamble() {
        let data = b"welcome to the box\r\nSHELLWIRE-2.0-x\r\n";
        assert_eq!(scan_version_line(data).unwrap(), LineScan::Skipped(20));
    }

    #[test]
    fn test_bare_newline_and_comments() {
        match scan_version_line(b"SHELLWIRE-1.99-srv_1.2 built today\n").unwrap() {
            LineScan::Found(info, _) => {
                assert_eq!(info.protocol, "1.99");
                assert_eq!(info.software, "srv_1.2");
                assert_eq!(info.comments.as_deref(), Some("built today"));
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn test_unsupported_protocol_version() {
        assert!(matches!(
            scan_version_line(b"SHELLWIRE-1.5-old\r\n"),
            Err(ProtocolError::InvalidVersion(_))
        ));
    }

    #[test]
    fn test_overlong_line_rejected() {
        let data = vec![b'a'; MAX_VERSION_LINE + 10];
        assert!(scan_version_line(&data).is_err());
    }

    #[test]
    fn test_empty_software_rejected() {
        assert!(parse_version_line(b"SHELLWIRE-2.0-").is_err());
    }

    #[test]
    fn test_control_bytes_rejected() {
        assert!(parse_version_line(b"SHELLWIRE-2.0-a\x07b").is_err());
    }
}
