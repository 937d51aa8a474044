use thiserror::Error;

use super::PresenceEvent;

/// A well-formed envelope that arrived at the wrong moment. Never fatal:
/// the controller logs it, emits it, and carries on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("duplicate offer discarded (generation {generation})")]
    DuplicateOffer { generation: u64 },
    #[error("offer arrived while a previous offer was still in flight (generation {generation})")]
    OfferWhileNegotiating { generation: u64 },
    #[error("offer sent to the initiating side (generation {generation})")]
    OfferToInitiator { generation: u64 },
    #[error("answer arrived with no outstanding offer (generation {generation})")]
    AnswerWithoutOffer { generation: u64 },
    #[error("answer sent to the responding side (generation {generation})")]
    AnswerToResponder { generation: u64 },
    #[error("{kind} arrived with no negotiation session")]
    NoSession { kind: &'static str },
    #[error("presence event {structured:?} disagrees with message text implying {textual:?}")]
    PresenceDisagreement {
        structured: PresenceEvent,
        textual: PresenceEvent,
    },
}
