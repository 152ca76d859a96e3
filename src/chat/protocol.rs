#![forbid(unsafe_code)]

// Chat protocol - frames delivered by the chat transport and their typed projections

use crate::stage::types::StageMode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Named event carrying PK/VS vote totals
pub const EVENT_VOTE: &str = "VOTE";
/// Named event marking the start of a PK/VS round
pub const EVENT_VOTE_START: &str = "VOTE_START";

const ATTR_MODE: &str = "mode";
const ATTR_SEATS: &str = "seats";
const ATTR_MESSAGE: &str = "message";
const ATTR_NOTICE: &str = "notice";
const ATTR_CREATOR_VOTES: &str = "creatorVotes";
const ATTR_PARTICIPANT_VOTES: &str = "participantVotes";
const ATTR_SHOULD_RESET: &str = "shouldResetScore";
const ATTR_STARTED_AT: &str = "startedAt";
const ATTR_REACTION: &str = "reaction";

/// Frame as handed over by the chat transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatFrame {
    /// Generic or named event with string attributes
    #[serde(rename_all = "camelCase")]
    Event {
        name: String,
        #[serde(default)]
        attributes: HashMap<String, String>,
    },
    /// Direct chat message; reactions are messages tagged with a `reaction` attribute
    #[serde(rename_all = "camelCase")]
    Message {
        id: String,
        sender_id: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        attributes: HashMap<String, String>,
    },
    /// A message was deleted by a moderator
    #[serde(rename_all = "camelCase")]
    MessageDeleted {
        message_id: String,
    },
    /// A user was disconnected from the chat room
    #[serde(rename_all = "camelCase")]
    UserDisconnected {
        user_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
}

/// Chat message shown in the UI
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub content: String,
}

/// Typed chat event consumed by the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    ModeChanged(StageMode),
    SeatsChanged(Vec<Option<String>>),
    Message(ChatMessage),
    Notice(String),
    Reaction { sender_id: String, reaction: String },
    Vote {
        creator_score: u32,
        participant_score: u32,
        should_reset_score: bool,
    },
    VoteStart { started_at_ms: i64 },
    MessageDeleted { message_id: String },
    UserDisconnected { user_id: String, reason: Option<String> },
}

/// Projects one transport frame into zero or more typed events. Malformed
/// attributes are logged and skipped; they never fail the whole frame.
pub fn parse_frame(frame: ChatFrame) -> Vec<ChatEvent> {
    match frame {
        ChatFrame::Event { name, attributes } => match name.as_str() {
            EVENT_VOTE => parse_vote(&attributes).into_iter().collect(),
            EVENT_VOTE_START => parse_vote_start(&attributes).into_iter().collect(),
            _ => parse_attributes(&name, &attributes),
        },
        ChatFrame::Message { id, sender_id, content, attributes } => {
            if let Some(reaction) = attributes.get(ATTR_REACTION) {
                vec![ChatEvent::Reaction {
                    sender_id,
                    reaction: reaction.clone(),
                }]
            } else {
                vec![ChatEvent::Message(ChatMessage { id, sender_id, content })]
            }
        }
        ChatFrame::MessageDeleted { message_id } => vec![ChatEvent::MessageDeleted { message_id }],
        ChatFrame::UserDisconnected { user_id, reason } => {
            vec![ChatEvent::UserDisconnected { user_id, reason }]
        }
    }
}

fn parse_attributes(name: &str, attributes: &HashMap<String, String>) -> Vec<ChatEvent> {
    let mut events = Vec::new();

    if let Some(raw) = attributes.get(ATTR_MODE) {
        match StageMode::parse(raw) {
            Some(mode) => events.push(ChatEvent::ModeChanged(mode)),
            None => warn!("Ignoring unknown mode '{}' in chat event {}", raw, name),
        }
    }

    if let Some(raw) = attributes.get(ATTR_SEATS) {
        match serde_json::from_str::<Vec<String>>(raw) {
            Ok(ids) => events.push(ChatEvent::SeatsChanged(
                ids.into_iter()
                    .map(|id| if id.is_empty() { None } else { Some(id) })
                    .collect(),
            )),
            Err(e) => warn!("Ignoring malformed seats in chat event {}: {}", name, e),
        }
    }

    if let Some(message) = attributes.get(ATTR_MESSAGE) {
        events.push(ChatEvent::Message(ChatMessage {
            id: String::new(),
            sender_id: String::new(),
            content: message.clone(),
        }));
    }

    if let Some(notice) = attributes.get(ATTR_NOTICE) {
        events.push(ChatEvent::Notice(notice.clone()));
    }

    if events.is_empty() {
        debug!("Chat event {} carried no known attributes", name);
    }
    events
}

fn parse_vote(attributes: &HashMap<String, String>) -> Option<ChatEvent> {
    let creator_score = attributes.get(ATTR_CREATOR_VOTES)?.parse().ok()?;
    let participant_score = attributes.get(ATTR_PARTICIPANT_VOTES)?.parse().ok()?;
    let should_reset_score = attributes
        .get(ATTR_SHOULD_RESET)
        .map_or(false, |v| v.eq_ignore_ascii_case("true"));
    Some(ChatEvent::Vote {
        creator_score,
        participant_score,
        should_reset_score,
    })
}

fn parse_vote_start(attributes: &HashMap<String, String>) -> Option<ChatEvent> {
    let started_at_ms = attributes.get(ATTR_STARTED_AT)?.parse().ok()?;
    Some(ChatEvent::VoteStart { started_at_ms })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_generic_event_with_mode_and_seats() {
        let events = parse_frame(ChatFrame::Event {
            name: "STAGE_UPDATE".to_string(),
            attributes: attrs(&[("mode", "PK"), ("seats", r#"["alice","","bob"]"#)]),
        });
        assert_eq!(events.len(), 2);
        assert!(events.contains(&ChatEvent::ModeChanged(StageMode::Pk)));
        assert!(events.contains(&ChatEvent::SeatsChanged(vec![
            Some("alice".to_string()),
            None,
            Some("bob".to_string()),
        ])));
    }

    #[test]
    fn test_malformed_seats_are_skipped() {
        let events = parse_frame(ChatFrame::Event {
            name: "STAGE_UPDATE".to_string(),
            attributes: attrs(&[("seats", "alice,bob"), ("notice", "welcome")]),
        });
        assert_eq!(events, vec![ChatEvent::Notice("welcome".to_string())]);
    }

    #[test]
    fn test_vote_events() {
        let events = parse_frame(ChatFrame::Event {
            name: EVENT_VOTE.to_string(),
            attributes: attrs(&[("creatorVotes", "4"), ("participantVotes", "7"), ("shouldResetScore", "true")]),
        });
        assert_eq!(
            events,
            vec![ChatEvent::Vote { creator_score: 4, participant_score: 7, should_reset_score: true }]
        );

        let events = parse_frame(ChatFrame::Event {
            name: EVENT_VOTE_START.to_string(),
            attributes: attrs(&[("startedAt", "1700000000000")]),
        });
        assert_eq!(events, vec![ChatEvent::VoteStart { started_at_ms: 1_700_000_000_000 }]);

        let events = parse_frame(ChatFrame::Event {
            name: EVENT_VOTE.to_string(),
            attributes: attrs(&[("creatorVotes", "lots")]),
        });
        assert!(events.is_empty());
    }

    #[test]
    fn test_reaction_vs_message() {
        let reaction = parse_frame(ChatFrame::Message {
            id: "m1".to_string(),
            sender_id: "carol".to_string(),
            content: String::new(),
            attributes: attrs(&[("reaction", "like")]),
        });
        assert_eq!(
            reaction,
            vec![ChatEvent::Reaction { sender_id: "carol".to_string(), reaction: "like".to_string() }]
        );

        let message = parse_frame(ChatFrame::Message {
            id: "m2".to_string(),
            sender_id: "carol".to_string(),
            content: "hi".to_string(),
            attributes: HashMap::new(),
        });
        assert!(matches!(&message[0], ChatEvent::Message(m) if m.content == "hi"));
    }

    #[test]
    fn test_frame_json_shape() {
        let json = r#"{"type":"userDisconnected","userId":"dave"}"#;
        let frame: ChatFrame = serde_json::from_str(json).unwrap();
        assert_eq!(
            parse_frame(frame),
            vec![ChatEvent::UserDisconnected { user_id: "dave".to_string(), reason: None }]
        );
    }
}
