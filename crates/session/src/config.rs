//! Per-connection settings.
//!
//! `SessionConfig` deserializes with every field optional, so it can be
//! embedded as a `[session]` table in a daemon configuration file.

use protocol::kex::{validate_names, Algorithm};
use protocol::version::{identification_line, parse_version_line, MAX_VERSION_LINE};
use protocol::{CipherAlgorithm, CompressionAlgorithm, KexAlgorithm};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::MAX_CHANNEL_DATA;

/// Default advertised receive window.
pub const DEFAULT_WINDOW_SIZE: u32 = 1024 * 1024;

/// Default advertised maximum packet size.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 32 * 1024;

/// Smallest maximum packet size we advertise.
pub const MIN_MAX_PACKET_SIZE: u32 = 1024;

/// Largest accepted `window_size`; each channel allocates this much up front.
pub const MAX_WINDOW_SIZE: u32 = 64 * 1024 * 1024;

/// Default authentication attempt limit.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 6;

/// Default high-water mark: 1 GiB minus 32 KiB.
pub const DEFAULT_HIGHWATER_MARK: u64 = (1 << 30) - 32 * 1024;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("software_version must be printable ASCII without spaces and fit the identification line, got {0:?}")]
    InvalidSoftwareVersion(String),

    #[error("max_packet_size must be between {min} and {max}, got {value}")]
    InvalidMaxPacketSize { value: u32, min: u32, max: u32 },

    #[error("window_size must be at least max_packet_size ({max_packet}), got {value}")]
    InvalidWindowSize { value: u32, max_packet: u32 },

    #[error("window_size must be at most {max}, got {value}")]
    WindowSizeTooLarge { value: u32, max: u32 },

    #[error("invalid algorithm list: {0}")]
    InvalidAlgorithms(String),

    #[error("max_auth_attempts must be at least 1, got {0}")]
    InvalidMaxAuthAttempts(u32),

    #[error("max_channels must be at least 1, got {0}")]
    InvalidMaxChannels(usize),

    #[error("highwater_mark must be greater than 0")]
    InvalidHighwaterMark,

    #[error("expected_host_key must be a SHA256 fingerprint, got {0:?}")]
    InvalidHostKeyFingerprint(String),
}

/// Settings for one connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Software version sent in the identification line.
    pub software_version: String,

    /// Banner the responder sends after accepting the authentication service.
    pub banner: Option<String>,

    /// Receive window advertised for each channel; also the channel's
    /// inbound buffer capacity.
    pub window_size: u32,

    /// Largest channel data payload we accept.
    pub max_packet_size: u32,

    /// Key exchange algorithms, most preferred first.
    pub kex_algorithms: Vec<String>,

    /// Ciphers, most preferred first.
    pub cipher_algorithms: Vec<String>,

    /// Compression algorithms, most preferred first.
    pub compression_algorithms: Vec<String>,

    /// Rejected authentication attempts before the responder disconnects.
    pub max_auth_attempts: u32,

    /// Channels the responder accepts at once.
    pub max_channels: usize,

    /// Whether the initiator asks for a shell once the channel is open.
    pub request_shell: bool,

    /// Byte count at which the high-water callback first fires.
    pub highwater_mark: u64,

    /// Fingerprint the responder's host key must match (initiator only).
    pub expected_host_key: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            software_version: default_software_version(),
            banner: None,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            kex_algorithms: KexAlgorithm::default_names(),
            cipher_algorithms: CipherAlgorithm::default_names(),
            compression_algorithms: CompressionAlgorithm::default_names(),
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            max_channels: 1,
            request_shell: true,
            highwater_mark: DEFAULT_HIGHWATER_MARK,
            expected_host_key: None,
        }
    }
}

fn default_software_version() -> String {
    format!("shellwire_{}", env!("CARGO_PKG_VERSION"))
}

impl SessionConfig {
    /// Validate every field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let software = &self.software_version;
        let line = identification_line(software);
        let printable = software.bytes().all(|b| b.is_ascii_graphic());
        if software.is_empty()
            || !printable
            || line.len() > MAX_VERSION_LINE
            || parse_version_line(line.trim_end().as_bytes()).is_err()
        {
            return Err(ConfigError::InvalidSoftwareVersion(software.clone()));
        }

        let max_packet_limit = MAX_CHANNEL_DATA as u32;
        if self.max_packet_size < MIN_MAX_PACKET_SIZE || self.max_packet_size > max_packet_limit {
            return Err(ConfigError::InvalidMaxPacketSize {
                value: self.max_packet_size,
                min: MIN_MAX_PACKET_SIZE,
                max: max_packet_limit,
            });
        }

        if self.window_size < self.max_packet_size {
            return Err(ConfigError::InvalidWindowSize {
                value: self.window_size,
                max_packet: self.max_packet_size,
            });
        }

        if self.window_size > MAX_WINDOW_SIZE {
            return Err(ConfigError::WindowSizeTooLarge {
                value: self.window_size,
                max: MAX_WINDOW_SIZE,
            });
        }

        validate_names::<KexAlgorithm>(&self.kex_algorithms)
            .and_then(|_| validate_names::<CipherAlgorithm>(&self.cipher_algorithms))
            .and_then(|_| validate_names::<CompressionAlgorithm>(&self.compression_algorithms))
            .map_err(|e| ConfigError::InvalidAlgorithms(e.to_string()))?;

        if self.max_auth_attempts == 0 {
            return Err(ConfigError::InvalidMaxAuthAttempts(self.max_auth_attempts));
        }

        if self.max_channels == 0 {
            return Err(ConfigError::InvalidMaxChannels(self.max_channels));
        }

        if self.highwater_mark == 0 {
            return Err(ConfigError::InvalidHighwaterMark);
        }

        if let Some(fingerprint) = &self.expected_host_key {
            let digest = fingerprint
                .strip_prefix(protocol::FINGERPRINT_PREFIX)
                .unwrap_or(fingerprint);
            let base64 = digest
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='));
            if digest.is_empty() || !base64 {
                return Err(ConfigError::InvalidHostKeyFingerprint(fingerprint.clone()));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.window_size, 1024 * 1024);
        assert_eq!(config.max_packet_size, 32 * 1024);
        assert_eq!(config.max_auth_attempts, 6);
        assert_eq!(config.highwater_mark, (1 << 30) - 32 * 1024);
        assert!(config.software_version.starts_with("shellwire_"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: SessionConfig = toml::from_str(
            r#"
            software_version = "test"
            window_size = 32768
            cipher_algorithms = ["aes256-gcm"]
            "#,
        )
        .unwrap();
        assert_eq!(config.software_version, "test");
        assert_eq!(config.window_size, 32768);
        assert_eq!(config.cipher_algorithms, vec!["aes256-gcm".to_string()]);
        assert_eq!(config.max_packet_size, DEFAULT_MAX_PACKET_SIZE);
        assert!(config.request_shell);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_software_version() {
        let long = "x".repeat(300);
        for bad in ["", "has space", "tab\there", long.as_str()] {
            let config = SessionConfig {
                software_version: bad.to_string(),
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidSoftwareVersion(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_invalid_max_packet_size() {
        let config = SessionConfig {
            max_packet_size: 100,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxPacketSize { value: 100, .. })
        ));

        let config = SessionConfig {
            max_packet_size: 65536,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_window_smaller_than_packet() {
        let config = SessionConfig {
            window_size: 2048,
            max_packet_size: 4096,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidWindowSize {
                value: 2048,
                max_packet: 4096
            })
        );
    }

    #[test]
    fn test_window_size_upper_bound() {
        let config = SessionConfig {
            window_size: u32::MAX,
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ConfigError::WindowSizeTooLarge {
                value: u32::MAX,
                max: MAX_WINDOW_SIZE
            })
        );

        let config = SessionConfig {
            window_size: MAX_WINDOW_SIZE,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let config = SessionConfig {
            kex_algorithms: vec!["diffie-hellman-group1-sha1".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidAlgorithms(_))
        ));

        let config = SessionConfig {
            compression_algorithms: vec![],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let config = SessionConfig {
            max_auth_attempts: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxAuthAttempts(0)));

        let config = SessionConfig {
            max_channels: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxChannels(0)));

        let config = SessionConfig {
            highwater_mark: 0,
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::InvalidHighwaterMark));
    }

    #[test]
    fn test_host_key_fingerprint_format() {
        let config = SessionConfig {
            expected_host_key: Some("SHA256:abc+/def".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = SessionConfig {
            expected_host_key: Some("SHA256:not valid!".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHostKeyFingerprint(_))
        ));
    }

    #[test]
    fn test_roundtrip_through_toml() {
        let config = SessionConfig {
            banner: Some("authorized use only".to_string()),
            expected_host_key: Some("SHA256:abcd".to_string()),
            ..Default::default()
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: SessionConfig = toml::from_str(&text).unwrap();
        assert_eq!(config, parsed);
    }
}
