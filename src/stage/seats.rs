#![forbid(unsafe_code)]

// Seat assignment table for audio rooms

use crate::session::participants::ParticipantRegistry;

/// One seat of an audio room. Everything but the binding is derived from the
/// participant registry on each reconciliation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Seat {
    pub index: usize,
    pub participant_id: Option<String>,
    pub avatar: Option<String>,
    pub muted: bool,
    pub speaking: bool,
}

impl Seat {
    fn empty(index: usize) -> Self {
        Self {
            index,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.participant_id.is_none()
    }
}

/// Outcome of a local seat click
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatClick {
    /// The local participant took the seat
    Took(usize),
    /// The local participant left its seat
    Left(usize),
    /// The seat was taken by someone else; nothing changed
    Occupied(usize),
    /// Index outside the table
    OutOfRange(usize),
}

/// Fixed-size ordered seat list
#[derive(Debug, Clone, PartialEq)]
pub struct SeatTable {
    seats: Vec<Seat>,
}

impl SeatTable {
    pub fn new(count: usize) -> Self {
        Self {
            seats: (0..count).map(Seat::empty).collect(),
        }
    }

    pub fn seats(&self) -> &[Seat] {
        &self.seats
    }

    pub fn len(&self) -> usize {
        self.seats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seats.is_empty()
    }

    /// Seat bindings in index order, as sent to the REST API
    pub fn assignments(&self) -> Vec<Option<String>> {
        self.seats.iter().map(|s| s.participant_id.clone()).collect()
    }

    pub fn seat_of(&self, participant_id: &str) -> Option<usize> {
        self.seats
            .iter()
            .position(|s| s.participant_id.as_deref() == Some(participant_id))
    }

    /// Replaces every binding with `assignments` (missing trailing entries are
    /// empty, extra entries are ignored), then re-derives the seat fields from
    /// the registry. Ids unknown to the registry get a placeholder entry.
    pub fn apply_assignments(&mut self, assignments: &[Option<String>], registry: &mut ParticipantRegistry) {
        for (index, seat) in self.seats.iter_mut().enumerate() {
            seat.participant_id = assignments
                .get(index)
                .cloned()
                .flatten()
                .filter(|id| !id.is_empty());
        }
        for id in self.seats.iter().filter_map(|s| s.participant_id.as_deref()) {
            registry.ensure_placeholder(id);
        }
        self.refresh(registry);
    }

    /// Re-derives avatar/mute/speaking for every bound seat
    pub fn refresh(&mut self, registry: &ParticipantRegistry) {
        for seat in &mut self.seats {
            match seat.participant_id.as_deref().and_then(|id| registry.get(id)) {
                Some(participant) => {
                    seat.avatar = participant.avatar.clone();
                    seat.muted = participant.audio_muted;
                    seat.speaking = participant.speaking;
                }
                None => {
                    seat.avatar = None;
                    seat.muted = false;
                    seat.speaking = false;
                }
            }
        }
    }

    /// Optimistic local click. Clicking one's own seat leaves it; otherwise the
    /// local participant is cleared from any seat and bound to `index` if that
    /// seat is free.
    pub fn click(&mut self, index: usize, local_participant_id: &str, registry: &ParticipantRegistry) -> SeatClick {
        if index >= self.seats.len() {
            return SeatClick::OutOfRange(index);
        }

        let current = self.seat_of(local_participant_id);
        if current == Some(index) {
            self.seats[index].participant_id = None;
            self.refresh(registry);
            return SeatClick::Left(index);
        }

        if !self.seats[index].is_empty() {
            return SeatClick::Occupied(index);
        }

        if let Some(previous) = current {
            self.seats[previous].participant_id = None;
        }
        self.seats[index].participant_id = Some(local_participant_id.to_string());
        self.refresh(registry);
        SeatClick::Took(index)
    }
}
