use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEvent {
    PartnerConnected,
    PartnerDisconnected,
}

impl PresenceEvent {
    fn wire_name(self) -> &'static str {
        match self {
            PresenceEvent::PartnerConnected => "partner_connected",
            PresenceEvent::PartnerDisconnected => "partner_disconnected",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "partner_connected" => Some(PresenceEvent::PartnerConnected),
            "partner_disconnected" => Some(PresenceEvent::PartnerDisconnected),
            _ => None,
        }
    }

    /// Legacy relays only say who came or went in prose. "disconnected"
    /// contains "connected", so it has to be tested first.
    pub fn from_text(text: &str) -> Option<Self> {
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("disconnected") {
            Some(PresenceEvent::PartnerDisconnected)
        } else if lowered.contains("connected") {
            Some(PresenceEvent::PartnerConnected)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub event: PresenceEvent,
    /// Absent on the wire means the relay did not elect us, so we answer.
    pub initiator: bool,
    pub message: Option<String>,
    /// Set when the message text implies a different event than the
    /// structured field carried.
    pub text_disagrees: Option<PresenceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Chat(String),
    Presence(Presence),
    Notice(String),
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
}

/// How outgoing chat is written to the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatWireFormat {
    #[default]
    Envelope,
    /// Raw text frame; the relay wraps it into a chat envelope itself.
    Bare,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("payload is not json: {0}")]
    NotJson(#[source] serde_json::Error),
    #[error("payload is a plain json string")]
    BareString,
    #[error("payload has no type field")]
    MissingType,
    #[error("unknown envelope type `{0}`")]
    UnknownType(String),
    #[error("malformed `{kind}` envelope: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireMessage {
    Chat {
        message: String,
    },
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        initiator: Option<bool>,
    },
    Offer {
        sdp: SessionDescription,
    },
    Answer {
        sdp: SessionDescription,
    },
    IceCandidate {
        candidate: IceCandidate,
    },
}

const KNOWN_TYPES: [&str; 5] = ["chat", "system", "offer", "answer", "ice-candidate"];

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(text).map_err(ParseError::NotJson)?;
        let kind = match &value {
            Value::String(_) => return Err(ParseError::BareString),
            Value::Object(map) => match map.get("type").and_then(Value::as_str) {
                Some(kind) => kind.to_string(),
                None => return Err(ParseError::MissingType),
            },
            _ => return Err(ParseError::MissingType),
        };
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ParseError::UnknownType(kind));
        }
        let wire: WireMessage = serde_json::from_value(value)
            .map_err(|source| ParseError::Malformed { kind, source })?;
        Ok(Self::from_wire(wire))
    }

    fn from_wire(wire: WireMessage) -> Self {
        match wire {
            WireMessage::Chat { message } => Envelope::Chat(message),
            WireMessage::System {
                message,
                event,
                initiator,
            } => system_envelope(message, event, initiator),
            WireMessage::Offer { sdp } => Envelope::Offer(sdp),
            WireMessage::Answer { sdp } => Envelope::Answer(sdp),
            WireMessage::IceCandidate { candidate } => Envelope::IceCandidate(candidate),
        }
    }

    /// Serializes the envelope for the relay. Chat honours `chat_format`;
    /// every other kind is always a JSON envelope.
    pub fn encode(&self, chat_format: ChatWireFormat) -> Result<String, serde_json::Error> {
        let wire = match self {
            Envelope::Chat(text) => match chat_format {
                ChatWireFormat::Bare => return Ok(text.clone()),
                ChatWireFormat::Envelope => WireMessage::Chat {
                    message: text.clone(),
                },
            },
            Envelope::Presence(presence) => WireMessage::System {
                message: presence.message.clone(),
                event: Some(presence.event.wire_name().to_string()),
                initiator: Some(presence.initiator),
            },
            Envelope::Notice(text) => WireMessage::System {
                message: Some(text.clone()),
                event: None,
                initiator: None,
            },
            Envelope::Offer(sdp) => WireMessage::Offer { sdp: sdp.clone() },
            Envelope::Answer(sdp) => WireMessage::Answer { sdp: sdp.clone() },
            Envelope::IceCandidate(candidate) => WireMessage::IceCandidate {
                candidate: candidate.clone(),
            },
        };
        serde_json::to_string(&wire)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Chat(_) => "chat",
            Envelope::Presence(_) => "presence",
            Envelope::Notice(_) => "notice",
            Envelope::Offer(_) => "offer",
            Envelope::Answer(_) => "answer",
            Envelope::IceCandidate(_) => "ice-candidate",
        }
    }
}

fn system_envelope(
    message: Option<String>,
    event: Option<String>,
    initiator: Option<bool>,
) -> Envelope {
    let structured = event.as_deref().and_then(PresenceEvent::from_wire);
    if let (Some(name), None) = (event.as_deref(), structured) {
        tracing::debug!(
            target = "room404::protocol",
            event = %name,
            "ignoring unknown presence event name"
        );
    }
    let textual = message.as_deref().and_then(PresenceEvent::from_text);

    let (event, text_disagrees) = match (structured, textual) {
        (Some(event), Some(text)) if text != event => (event, Some(text)),
        (Some(event), _) => (event, None),
        (None, Some(text)) => (text, None),
        (None, None) => return Envelope::Notice(message.unwrap_or_default()),
    };

    Envelope::Presence(Presence {
        event,
        initiator: initiator.unwrap_or(false),
        message,
        text_disagrees,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_chat() {
        let envelope = Envelope::parse(r#"{"type":"chat","message":"hi"}"#).unwrap();
        assert_eq!(envelope, Envelope::Chat("hi".into()));
    }

    #[test]
    fn structured_presence_wins() {
        let envelope = Envelope::parse(
            r#"{"type":"system","event":"partner_connected","initiator":true}"#,
        )
        .unwrap();
        match envelope {
            Envelope::Presence(presence) => {
                assert_eq!(presence.event, PresenceEvent::PartnerConnected);
                assert!(presence.initiator);
                assert!(presence.text_disagrees.is_none());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn legacy_disconnect_text_is_not_read_as_connect() {
        let envelope = Envelope::parse(
            r#"{"type":"system","message":"Stranger disconnected. Click 'New' to find someone else."}"#,
        )
        .unwrap();
        match envelope {
            Envelope::Presence(presence) => {
                assert_eq!(presence.event, PresenceEvent::PartnerDisconnected);
                assert!(!presence.initiator);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn legacy_connect_text_defaults_to_responder() {
        let envelope =
            Envelope::parse(r#"{"type":"system","message":"Stranger connected!"}"#).unwrap();
        match envelope {
            Envelope::Presence(presence) => {
                assert_eq!(presence.event, PresenceEvent::PartnerConnected);
                assert!(!presence.initiator);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn disagreement_is_reported_and_structured_value_kept() {
        let envelope = Envelope::parse(
            r#"{"type":"system","event":"partner_connected","message":"Stranger disconnected."}"#,
        )
        .unwrap();
        match envelope {
            Envelope::Presence(presence) => {
                assert_eq!(presence.event, PresenceEvent::PartnerConnected);
                assert_eq!(
                    presence.text_disagrees,
                    Some(PresenceEvent::PartnerDisconnected)
                );
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn system_without_presence_is_a_notice() {
        let envelope =
            Envelope::parse(r#"{"type":"system","message":"Waiting for a partner..."}"#).unwrap();
        assert_eq!(envelope, Envelope::Notice("Waiting for a partner...".into()));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Envelope::parse("hello there"),
            Err(ParseError::NotJson(_))
        ));
        assert!(matches!(
            Envelope::parse(r#""just a string""#),
            Err(ParseError::BareString)
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":"dance"}"#),
            Err(ParseError::UnknownType(kind)) if kind == "dance"
        ));
        assert!(matches!(
            Envelope::parse(r#"{"type":"offer","sdp":42}"#),
            Err(ParseError::Malformed { .. })
        ));
        assert!(matches!(
            Envelope::parse(r#"{"message":"x"}"#),
            Err(ParseError::MissingType)
        ));
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let mut candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");
        candidate.sdp_mid = Some("0".into());
        candidate.sdp_mline_index = Some(0);
        let text = Envelope::IceCandidate(candidate.clone())
            .encode(ChatWireFormat::Envelope)
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "ice-candidate");
        assert_eq!(value["candidate"]["sdpMid"], "0");
        assert_eq!(value["candidate"]["sdpMLineIndex"], 0);
        assert_eq!(
            Envelope::parse(&text).unwrap(),
            Envelope::IceCandidate(candidate)
        );
    }

    #[test]
    fn offer_nests_session_description() {
        let text = Envelope::Offer(SessionDescription::offer("v=0"))
            .encode(ChatWireFormat::Envelope)
            .unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["sdp"]["type"], "offer");
        assert_eq!(value["sdp"]["sdp"], "v=0");
    }

    #[test]
    fn bare_chat_is_raw_text() {
        let text = Envelope::Chat("hello".into())
            .encode(ChatWireFormat::Bare)
            .unwrap();
        assert_eq!(text, "hello");
    }
}
