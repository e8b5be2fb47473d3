//! Call configuration

use crate::types::FacingMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Public STUN endpoints used when no configuration is supplied
///
/// No TURN relay is configured, so peers behind symmetric NATs may fail to
/// connect.
pub const DEFAULT_STUN_URLS: [&str; 3] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
];

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Document could not be parsed
    #[error("Invalid configuration document: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds an unusable value
    #[error("Invalid configuration value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// One ICE server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServerConfig {
    /// `stun:` or `turn:` URLs
    pub urls: Vec<String>,
    /// Username, TURN only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential, TURN only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// Entry for a credential-less STUN server
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Camera capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoConstraints {
    /// Preferred width in pixels
    pub ideal_width: u32,
    /// Preferred height in pixels
    pub ideal_height: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// Microphone processing constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioConstraints {
    /// Echo cancellation
    pub echo_cancellation: bool,
    /// Noise suppression
    pub noise_suppression: bool,
    /// Automatic gain control
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Call controller configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// ICE servers handed to every peer connection
    pub ice_servers: Vec<IceServerConfig>,
    /// Pause between "media and connection ready" and sending the offer
    pub offer_delay_ms: u64,
    /// Camera constraints for the first acquisition tier
    pub video: VideoConstraints,
    /// Microphone constraints for both acquisition tiers
    pub audio: AudioConstraints,
    /// Camera used when a call starts
    pub default_facing: FacingMode,
    /// Events buffered per subscriber
    pub event_capacity: usize,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_URLS
                .iter()
                .map(|url| IceServerConfig::stun(*url))
                .collect(),
            offer_delay_ms: 100,
            video: VideoConstraints::default(),
            audio: AudioConstraints::default(),
            default_facing: FacingMode::Front,
            event_capacity: 100,
        }
    }
}

impl CallConfig {
    /// Parse and validate a JSON document; missing fields take defaults
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Offer delay as a duration
    pub fn offer_delay(&self) -> Duration {
        Duration::from_millis(self.offer_delay_ms)
    }

    /// Check field values
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "ice_servers",
                    reason: "server entry without urls".to_string(),
                });
            }
            for url in &server.urls {
                let known_scheme = ["stun:", "stuns:", "turn:", "turns:"]
                    .iter()
                    .any(|scheme| url.starts_with(scheme));
                if !known_scheme {
                    return Err(ConfigError::Invalid {
                        field: "ice_servers",
                        reason: format!("unsupported url {url}"),
                    });
                }
            }
        }
        if self.video.ideal_width == 0 || self.video.ideal_height == 0 {
            return Err(ConfigError::Invalid {
                field: "video",
                reason: "resolution must be non-zero".to_string(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "event_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers.len(), 3);
        assert!(config.ice_servers[0].urls[0].starts_with("stun:"));
        assert_eq!(config.video.ideal_width, 1280);
        assert_eq!(config.video.ideal_height, 720);
        assert!(config.audio.echo_cancellation);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_takes_defaults() {
        let config = CallConfig::from_json_str(r#"{"offer_delay_ms": 5}"#).unwrap();
        assert_eq!(config.offer_delay(), Duration::from_millis(5));
        assert_eq!(config.ice_servers, CallConfig::default().ice_servers);
    }

    #[test]
    fn test_rejects_unknown_scheme() {
        let err = CallConfig::from_json_str(r#"{"ice_servers": [{"urls": ["http://x"]}]}"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "ice_servers", .. }));
    }

    #[test]
    fn test_rejects_malformed_document() {
        assert!(matches!(
            CallConfig::from_json_str("{"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let config = CallConfig {
            event_capacity: 0,
            ..CallConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
