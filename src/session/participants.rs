#![forbid(unsafe_code)]

// Participant registry - id-keyed table of everyone on the current engine session

use super::engine::{EngineParticipant, StreamInfo, StreamKind};

/// Participant on the current session
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Participant {
    /// Engine-assigned id; only meaningful within one join
    pub participant_id: String,
    /// Stable identity across rejoins
    pub user_id: Option<String>,
    pub avatar: Option<String>,
    pub audio_muted: bool,
    pub video_off: bool,
    pub speaking: bool,
    pub is_local: bool,
    /// Placeholder created from a chat seat push, not yet seen by the engine
    pub placeholder: bool,
    pub streams: Vec<StreamInfo>,
}

impl Participant {
    fn from_engine(participant: &EngineParticipant) -> Self {
        Self {
            participant_id: participant.participant_id.clone(),
            user_id: participant.user_id().map(str::to_string),
            avatar: participant.avatar().map(str::to_string),
            is_local: participant.is_local,
            video_off: true,
            ..Self::default()
        }
    }

    /// Re-derives the mute/video flags from the stream list
    fn derive_media_flags(&mut self) {
        let audio = self.streams.iter().find(|s| s.kind == StreamKind::Audio);
        let video = self.streams.iter().find(|s| s.kind == StreamKind::Video);
        self.audio_muted = audio.map_or(true, |s| s.muted);
        self.video_off = video.map_or(true, |s| s.muted);
        if self.audio_muted {
            self.speaking = false;
        }
    }
}

/// Registry of participants, updated only from the session's serialized
/// dispatch path.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRegistry {
    participants: Vec<Participant>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the participant or refreshes its identity fields, keeping
    /// streams and speaking state. Returns the stored entry.
    pub fn upsert(&mut self, participant: &EngineParticipant) -> &Participant {
        let index = self.upsert_index(participant);
        &self.participants[index]
    }

    fn upsert_index(&mut self, participant: &EngineParticipant) -> usize {
        match self
            .participants
            .iter()
            .position(|p| p.participant_id == participant.participant_id)
        {
            Some(index) => {
                let existing = &mut self.participants[index];
                if let Some(user_id) = participant.user_id() {
                    existing.user_id = Some(user_id.to_string());
                }
                if let Some(avatar) = participant.avatar() {
                    existing.avatar = Some(avatar.to_string());
                }
                existing.is_local = participant.is_local;
                existing.placeholder = false;
                index
            }
            None => {
                self.participants.push(Participant::from_engine(participant));
                self.participants.len() - 1
            }
        }
    }

    /// Adds a placeholder for an id seen only in a seat list. No-op if known.
    pub fn ensure_placeholder(&mut self, participant_id: &str) {
        if self.get(participant_id).is_none() {
            self.participants.push(Participant {
                participant_id: participant_id.to_string(),
                placeholder: true,
                audio_muted: true,
                video_off: true,
                ..Participant::default()
            });
        }
    }

    /// Adds or replaces streams (matched by stream id)
    pub fn add_streams(&mut self, participant: &EngineParticipant, streams: &[StreamInfo]) -> &Participant {
        let index = self.upsert_index(participant);
        let entry = &mut self.participants[index];
        for stream in streams {
            match entry.streams.iter_mut().find(|s| s.stream_id == stream.stream_id) {
                Some(existing) => *existing = stream.clone(),
                None => entry.streams.push(stream.clone()),
            }
        }
        entry.derive_media_flags();
        entry
    }

    pub fn remove_streams(&mut self, participant: &EngineParticipant, streams: &[StreamInfo]) -> &Participant {
        let index = self.upsert_index(participant);
        let entry = &mut self.participants[index];
        entry
            .streams
            .retain(|s| !streams.iter().any(|r| r.stream_id == s.stream_id));
        entry.derive_media_flags();
        entry
    }

    /// Updates the mute flag of known streams
    pub fn mute_streams(&mut self, participant: &EngineParticipant, streams: &[StreamInfo]) -> &Participant {
        let index = self.upsert_index(participant);
        let entry = &mut self.participants[index];
        for stream in streams {
            match entry.streams.iter_mut().find(|s| s.stream_id == stream.stream_id) {
                Some(existing) => existing.muted = stream.muted,
                None => entry.streams.push(stream.clone()),
            }
        }
        entry.derive_media_flags();
        entry
    }

    /// Sets the speaking flag. Returns true if it changed.
    pub fn set_speaking(&mut self, participant_id: &str, speaking: bool) -> bool {
        match self.participants.iter_mut().find(|p| p.participant_id == participant_id) {
            Some(p) if p.speaking != speaking => {
                p.speaking = speaking;
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, participant_id: &str) -> Option<Participant> {
        let index = self
            .participants
            .iter()
            .position(|p| p.participant_id == participant_id)?;
        Some(self.participants.remove(index))
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.participant_id == participant_id)
    }

    pub fn find_stream_owner(&self, stream_id: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.streams.iter().any(|s| s.stream_id == stream_id))
    }

    pub fn local(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.is_local)
    }

    pub fn remote(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| !p.is_local && !p.placeholder)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::engine::{ATTR_AVATAR, ATTR_USER_ID};
    use std::collections::HashMap;

    fn engine_participant(id: &str, user: &str) -> EngineParticipant {
        EngineParticipant {
            participant_id: id.to_string(),
            is_local: false,
            attributes: HashMap::from([
                (ATTR_USER_ID.to_string(), user.to_string()),
                (ATTR_AVATAR.to_string(), format!("{user}.png")),
            ]),
        }
    }

    fn audio(id: &str, muted: bool) -> StreamInfo {
        StreamInfo { stream_id: id.to_string(), kind: StreamKind::Audio, muted }
    }

    #[test]
    fn test_no_duplicate_participants() {
        let mut registry = ParticipantRegistry::new();
        let bob = engine_participant("p-bob", "bob");
        registry.upsert(&bob);
        registry.add_streams(&bob, &[audio("a1", false)]);
        registry.upsert(&bob);
        registry.add_streams(&bob, &[audio("a1", false)]);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("p-bob").unwrap().streams.len(), 1);
    }

    #[test]
    fn test_media_flags_follow_streams() {
        let mut registry = ParticipantRegistry::new();
        let bob = engine_participant("p-bob", "bob");
        let entry = registry.add_streams(&bob, &[audio("a1", false)]);
        assert!(!entry.audio_muted);
        assert!(entry.video_off);

        registry.set_speaking("p-bob", true);
        let entry = registry.mute_streams(&bob, &[audio("a1", true)]);
        assert!(entry.audio_muted);
        assert!(!entry.speaking);

        let entry = registry.remove_streams(&bob, &[audio("a1", true)]);
        assert!(entry.streams.is_empty());
        assert!(entry.audio_muted);
    }

    #[test]
    fn test_placeholder_is_replaced_by_engine_participant() {
        let mut registry = ParticipantRegistry::new();
        registry.ensure_placeholder("p-bob");
        registry.ensure_placeholder("p-bob");
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.remote().count(), 0);

        let entry = registry.upsert(&engine_participant("p-bob", "bob"));
        assert!(!entry.placeholder);
        assert_eq!(entry.avatar.as_deref(), Some("bob.png"));
        assert_eq!(registry.remote().count(), 1);
    }

    #[test]
    fn test_speaking_reports_changes_only() {
        let mut registry = ParticipantRegistry::new();
        registry.upsert(&engine_participant("p-bob", "bob"));
        assert!(registry.set_speaking("p-bob", true));
        assert!(!registry.set_speaking("p-bob", true));
        assert!(registry.set_speaking("p-bob", false));
        assert!(!registry.set_speaking("unknown", true));
    }
}
