//! Chat-line wire format for signaling messages
//!
//! Every message is one chat line: a literal prefix, followed by a JSON body
//! for descriptions and candidates. Decoding is purely syntactic and never
//! panics; lines that are not signaling come back as
//! [`DecodeError::NotSignaling`] so ordinary chat text can be skipped cheaply.

use crate::peer::{IceCandidate, SdpType, SessionDescription};
use crate::signaling::SignalingMessage;
use crate::types::{CallId, StrategyKind};
use thiserror::Error;

/// Offer prefix, JSON body
pub const OFFER_PREFIX: &str = "VIDEO_CALL_OFFER:";
/// Answer prefix, JSON body
pub const ANSWER_PREFIX: &str = "VIDEO_CALL_ANSWER:";
/// ICE candidate prefix, JSON body
pub const ICE_PREFIX: &str = "VIDEO_CALL_ICE:";
/// Call ended
pub const END: &str = "VIDEO_CALL_END";
/// Call declined, peer-to-peer dialect
pub const DECLINED: &str = "VIDEO_CALL_DECLINED";
/// Hosted call invite prefix, call id body
pub const INVITE_PREFIX: &str = "STREAM_VIDEO_CALL_INVITE:";
/// Hosted call accepted
pub const ACCEPTED: &str = "STREAM_VIDEO_CALL_ACCEPTED";
/// Call declined, hosted dialect
pub const HOSTED_DECLINED: &str = "STREAM_VIDEO_CALL_DECLINED";

/// Decode failures
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Ordinary chat text
    #[error("Not a signaling message")]
    NotSignaling,

    /// Prefix present, body missing
    #[error("Empty body after {prefix}")]
    EmptyBody {
        /// Matched prefix
        prefix: &'static str,
    },

    /// Body is not valid JSON for the message
    #[error("Malformed {prefix} body: {source}")]
    Malformed {
        /// Matched prefix
        prefix: &'static str,
        /// Parser error
        #[source]
        source: serde_json::Error,
    },

    /// Description type does not match the prefix
    #[error("Expected {expected:?} description, found {found:?}")]
    KindMismatch {
        /// Type implied by the prefix
        expected: SdpType,
        /// Type in the body
        found: SdpType,
    },
}

/// Converts signaling messages to and from transport payloads
pub trait SignalingCodec: Send + Sync {
    /// Encode a message as one payload
    fn encode(&self, message: &SignalingMessage) -> String;

    /// Decode a payload
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not a well-formed signaling message
    fn decode(&self, payload: &str) -> Result<SignalingMessage, DecodeError>;
}

/// The chat-line codec
///
/// `Declined` is written with the literal of the flow it rejects, so a hosted
/// session never sees the peer-to-peer spelling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChatTextCodec;

fn body<'a>(prefix: &'static str, rest: &'a str) -> Result<&'a str, DecodeError> {
    let rest = rest.trim();
    if rest.is_empty() {
        return Err(DecodeError::EmptyBody { prefix });
    }
    Ok(rest)
}

fn description(
    prefix: &'static str,
    rest: &str,
    expected: SdpType,
) -> Result<String, DecodeError> {
    let parsed: SessionDescription = serde_json::from_str(body(prefix, rest)?)
        .map_err(|source| DecodeError::Malformed { prefix, source })?;
    if parsed.kind != expected {
        return Err(DecodeError::KindMismatch {
            expected,
            found: parsed.kind,
        });
    }
    Ok(parsed.sdp)
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    // Plain structs of strings and integers always serialize
    serde_json::to_string(value).unwrap_or_default()
}

impl SignalingCodec for ChatTextCodec {
    fn encode(&self, message: &SignalingMessage) -> String {
        match message {
            SignalingMessage::Invite { call_id } => format!("{INVITE_PREFIX}{call_id}"),
            SignalingMessage::Offer { sdp } => {
                format!("{OFFER_PREFIX}{}", to_json(&SessionDescription::offer(sdp.clone())))
            }
            SignalingMessage::Answer { sdp } => {
                format!("{ANSWER_PREFIX}{}", to_json(&SessionDescription::answer(sdp.clone())))
            }
            SignalingMessage::IceCandidate { candidate } => {
                format!("{ICE_PREFIX}{}", to_json(candidate))
            }
            SignalingMessage::Accepted => ACCEPTED.to_string(),
            SignalingMessage::Declined { strategy } => match strategy {
                StrategyKind::PeerToPeer => DECLINED.to_string(),
                StrategyKind::Hosted => HOSTED_DECLINED.to_string(),
            },
            SignalingMessage::Ended => END.to_string(),
        }
    }

    fn decode(&self, payload: &str) -> Result<SignalingMessage, DecodeError> {
        let line = payload.trim();

        if let Some(rest) = line.strip_prefix(OFFER_PREFIX) {
            let sdp = description(OFFER_PREFIX, rest, SdpType::Offer)?;
            return Ok(SignalingMessage::Offer { sdp });
        }
        if let Some(rest) = line.strip_prefix(ANSWER_PREFIX) {
            let sdp = description(ANSWER_PREFIX, rest, SdpType::Answer)?;
            return Ok(SignalingMessage::Answer { sdp });
        }
        if let Some(rest) = line.strip_prefix(ICE_PREFIX) {
            let candidate: IceCandidate = serde_json::from_str(body(ICE_PREFIX, rest)?)
                .map_err(|source| DecodeError::Malformed {
                    prefix: ICE_PREFIX,
                    source,
                })?;
            return Ok(SignalingMessage::IceCandidate { candidate });
        }
        if let Some(rest) = line.strip_prefix(INVITE_PREFIX) {
            let call_id = CallId::from_wire(body(INVITE_PREFIX, rest)?);
            return Ok(SignalingMessage::Invite { call_id });
        }

        match line {
            END => Ok(SignalingMessage::Ended),
            DECLINED => Ok(SignalingMessage::Declined {
                strategy: StrategyKind::PeerToPeer,
            }),
            HOSTED_DECLINED => Ok(SignalingMessage::Declined {
                strategy: StrategyKind::Hosted,
            }),
            ACCEPTED => Ok(SignalingMessage::Accepted),
            _ => Err(DecodeError::NotSignaling),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn codec() -> ChatTextCodec {
        ChatTextCodec::default()
    }

    #[test]
    fn test_offer_wire_format() {
        let line = codec().encode(&SignalingMessage::Offer {
            sdp: "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n".to_string(),
        });
        assert!(line.starts_with("VIDEO_CALL_OFFER:{"));
        let body: serde_json::Value =
            serde_json::from_str(line.strip_prefix(OFFER_PREFIX).unwrap()).unwrap();
        assert_eq!(body["type"], "offer");
        assert_eq!(body["sdp"], "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n");
    }

    #[test]
    fn test_decodes_browser_candidate() {
        let line = r#"VIDEO_CALL_ICE:{"candidate":"candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"ab12"}"#;
        let decoded = codec().decode(line).unwrap();
        assert_eq!(
            decoded,
            SignalingMessage::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:842163049 1 udp 1677729535 203.0.113.7 46154 typ srflx"
                        .to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_mline_index: Some(0),
                    username_fragment: Some("ab12".to_string()),
                }
            }
        );
    }

    #[test]
    fn test_bare_literals() {
        let c = codec();
        assert_eq!(c.decode("VIDEO_CALL_END").unwrap(), SignalingMessage::Ended);
        assert_eq!(
            c.decode(" VIDEO_CALL_DECLINED\n").unwrap(),
            SignalingMessage::Declined {
                strategy: StrategyKind::PeerToPeer
            }
        );
        assert_eq!(
            c.decode("STREAM_VIDEO_CALL_DECLINED").unwrap(),
            SignalingMessage::Declined {
                strategy: StrategyKind::Hosted
            }
        );
        assert_eq!(
            c.decode("STREAM_VIDEO_CALL_ACCEPTED").unwrap(),
            SignalingMessage::Accepted
        );
        assert_eq!(
            c.decode("STREAM_VIDEO_CALL_INVITE:call_a_b_17").unwrap(),
            SignalingMessage::Invite {
                call_id: CallId::from_wire("call_a_b_17")
            }
        );
    }

    #[test]
    fn test_declined_literal_follows_the_flow() {
        let c = codec();
        let hosted = SignalingMessage::Declined {
            strategy: StrategyKind::Hosted,
        };
        let direct = SignalingMessage::Declined {
            strategy: StrategyKind::PeerToPeer,
        };
        assert_eq!(c.encode(&hosted), HOSTED_DECLINED);
        assert_eq!(c.encode(&direct), DECLINED);
    }

    #[test]
    fn test_decode_errors() {
        let c = codec();
        assert!(matches!(c.decode("hello there"), Err(DecodeError::NotSignaling)));
        assert!(matches!(c.decode("VIDEO_CALL_END please"), Err(DecodeError::NotSignaling)));
        assert!(matches!(
            c.decode("VIDEO_CALL_OFFER:"),
            Err(DecodeError::EmptyBody { .. })
        ));
        assert!(matches!(
            c.decode("VIDEO_CALL_ICE:{not json"),
            Err(DecodeError::Malformed { .. })
        ));
        assert!(matches!(
            c.decode(r#"VIDEO_CALL_ANSWER:{"type":"offer","sdp":"v=0"}"#),
            Err(DecodeError::KindMismatch {
                expected: SdpType::Answer,
                found: SdpType::Offer
            })
        ));
        assert!(matches!(
            c.decode("STREAM_VIDEO_CALL_INVITE:   "),
            Err(DecodeError::EmptyBody { .. })
        ));
    }

    #[test]
    fn test_every_variant_survives_the_wire() {
        let c = codec();
        let messages = vec![
            SignalingMessage::Invite {
                call_id: CallId::from_wire("call_x_y_1"),
            },
            SignalingMessage::Offer {
                sdp: "v=0 offer".to_string(),
            },
            SignalingMessage::Answer {
                sdp: "v=0 answer".to_string(),
            },
            SignalingMessage::IceCandidate {
                candidate: IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 9 typ host"),
            },
            SignalingMessage::Accepted,
            SignalingMessage::Declined {
                strategy: StrategyKind::PeerToPeer,
            },
            SignalingMessage::Declined {
                strategy: StrategyKind::Hosted,
            },
            SignalingMessage::Ended,
        ];
        for message in messages {
            assert_eq!(c.decode(&c.encode(&message)).unwrap(), message);
        }
    }

    proptest! {
        #[test]
        fn decode_never_panics(payload in ".*") {
            let _ = codec().decode(&payload);
        }

        #[test]
        fn decode_never_panics_after_prefix(
            prefix in prop::sample::select(vec![OFFER_PREFIX, ANSWER_PREFIX, ICE_PREFIX, INVITE_PREFIX]),
            rest in ".*",
        ) {
            let _ = codec().decode(&format!("{prefix}{rest}"));
        }
    }
}
