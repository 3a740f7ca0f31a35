//! Presence tracking: who else is in the presentation and what they have
//! selected.
//!
//! ## Architecture
//!
//! ```text
//! user_joined / user_left / user_selection   (from transport)
//!       │
//!       ▼
//! PresenceTracker::join() / leave() / update_selection()
//!       │
//!       ▼
//! roster: ParticipantId → Participant { name, color, selection, last_active }
//!
//! local selection change
//!       │
//!       ▼
//! PresenceTracker::announce_selection() ──► Envelope::UserSelection ──► transport
//! ```
//!
//! Entries are removed on an explicit leave or when the transport closes.
//! Idle eviction only happens when an idle timeout is configured.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use deck_core::{ElementId, FrameId, ParticipantId};

use crate::protocol::Envelope;

/// Stable display color for a participant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticipantColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
}

impl ParticipantColor {
    /// Derive a vivid, stable color from the participant id.
    ///
    /// Consecutive ids are spread around the hue circle by stepping 137°
    /// (close to the golden angle).
    pub fn from_id(id: ParticipantId) -> Self {
        let hue = (id.0.wrapping_mul(137).rem_euclid(360)) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b }
    }

    /// `#RRGGBB` form for UI layers.
    pub fn to_hex(&self) -> String {
        let channel = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
        format!("#{:02X}{:02X}{:02X}", channel(self.r), channel(self.g), channel(self.b))
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 {
        l * (1.0 + s)
    } else {
        l + s - l * s
    };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
    pub color: ParticipantColor,
    pub current_frame_id: Option<FrameId>,
    pub current_element_id: Option<ElementId>,
    pub last_active: Instant,
}

impl Participant {
    pub fn new(id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            color: ParticipantColor::from_id(id),
            current_frame_id: None,
            current_element_id: None,
            last_active: Instant::now(),
        }
    }

    pub fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) > timeout
    }
}

/// Roster of remote participants.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    local_id: ParticipantId,
    participants: HashMap<ParticipantId, Participant>,
    idle_timeout: Option<Duration>,
}

impl PresenceTracker {
    pub fn new(local_id: ParticipantId) -> Self {
        Self {
            local_id,
            participants: HashMap::new(),
            idle_timeout: None,
        }
    }

    /// Enable eviction of participants silent for longer than `timeout`.
    pub fn with_idle_timeout(local_id: ParticipantId, timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(timeout),
            ..Self::new(local_id)
        }
    }

    pub fn local_id(&self) -> ParticipantId {
        self.local_id
    }

    /// Add or refresh a participant. Returns `true` when the id was not
    /// yet on the roster. A repeated join only updates the display name.
    pub fn join(&mut self, id: ParticipantId, display_name: &str) -> bool {
        if id == self.local_id {
            return false;
        }
        match self.participants.get_mut(&id) {
            Some(existing) => {
                existing.display_name = display_name.to_string();
                existing.last_active = Instant::now();
                false
            }
            None => {
                log::info!("{display_name} ({id}) joined");
                self.participants.insert(id, Participant::new(id, display_name));
                true
            }
        }
    }

    pub fn leave(&mut self, id: ParticipantId) -> Option<Participant> {
        let left = self.participants.remove(&id);
        if let Some(p) = &left {
            log::info!("{} ({id}) left", p.display_name);
        }
        left
    }

    /// Record a remote selection. Unknown senders are added with
    /// `display_name`, or a placeholder when none was sent.
    pub fn update_selection(
        &mut self,
        id: ParticipantId,
        display_name: Option<&str>,
        frame_id: Option<FrameId>,
        element_id: Option<ElementId>,
    ) {
        if id == self.local_id {
            return;
        }
        let participant = self.participants.entry(id).or_insert_with(|| {
            let name = display_name
                .map(str::to_owned)
                .unwrap_or_else(|| format!("User {id}"));
            Participant::new(id, name)
        });
        participant.current_frame_id = frame_id;
        participant.current_element_id = element_id;
        participant.last_active = Instant::now();
    }

    /// Drop everyone; the transport closed and the roster is stale.
    pub fn clear(&mut self) -> usize {
        let count = self.participants.len();
        self.participants.clear();
        count
    }

    /// Outbound envelope announcing the local selection.
    pub fn announce_selection(
        &self,
        frame_id: Option<FrameId>,
        element_id: Option<ElementId>,
    ) -> Envelope {
        Envelope::UserSelection { frame_id, element_id }
    }

    /// Evict participants idle past the configured timeout. Does nothing
    /// when no timeout is configured.
    pub fn evict_idle_at(&mut self, now: Instant) -> Vec<ParticipantId> {
        let Some(timeout) = self.idle_timeout else {
            return Vec::new();
        };
        let idle: Vec<ParticipantId> = self
            .participants
            .values()
            .filter(|p| p.is_idle(timeout, now))
            .map(|p| p.id)
            .collect();
        for id in &idle {
            self.participants.remove(id);
            log::debug!("Evicted idle participant {id}");
        }
        idle
    }

    pub fn evict_idle(&mut self) -> Vec<ParticipantId> {
        self.evict_idle_at(Instant::now())
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.get(&id)
    }

    /// Roster sorted by participant id.
    pub fn participants(&self) -> Vec<&Participant> {
        let mut all: Vec<&Participant> = self.participants.values().collect();
        all.sort_by_key(|p| p.id);
        all
    }

    /// Who currently has `element_id` selected.
    pub fn participants_on_element(&self, element_id: ElementId) -> Vec<&Participant> {
        let mut on: Vec<&Participant> = self
            .participants
            .values()
            .filter(|p| p.current_element_id == Some(element_id))
            .collect();
        on.sort_by_key(|p| p.id);
        on
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: ParticipantId = ParticipantId(1);

    #[test]
    fn test_join_then_leave_empties_roster() {
        let mut tracker = PresenceTracker::new(LOCAL);
        assert!(tracker.join(ParticipantId(7), "Ana"));
        assert_eq!(tracker.len(), 1);
        tracker.leave(ParticipantId(7));
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_rejoin_updates_name_without_duplicate() {
        let mut tracker = PresenceTracker::new(LOCAL);
        tracker.join(ParticipantId(7), "Ana");
        tracker.update_selection(ParticipantId(7), None, Some(FrameId(1)), Some(ElementId(3)));
        assert!(!tracker.join(ParticipantId(7), "Ana Maria"));

        assert_eq!(tracker.len(), 1);
        let ana = tracker.participant(ParticipantId(7)).unwrap();
        assert_eq!(ana.display_name, "Ana Maria");
        assert_eq!(ana.current_element_id, Some(ElementId(3)));
    }

    #[test]
    fn test_local_participant_ignored() {
        let mut tracker = PresenceTracker::new(LOCAL);
        assert!(!tracker.join(LOCAL, "Me"));
        tracker.update_selection(LOCAL, Some("Me"), None, None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_selection_from_unknown_sender() {
        let mut tracker = PresenceTracker::new(LOCAL);
        tracker.update_selection(ParticipantId(9), None, Some(FrameId(2)), None);
        let p = tracker.participant(ParticipantId(9)).unwrap();
        assert_eq!(p.display_name, "User 9");
        assert_eq!(p.current_frame_id, Some(FrameId(2)));

        tracker.update_selection(ParticipantId(10), Some("Bo"), None, Some(ElementId(4)));
        assert_eq!(tracker.participants_on_element(ElementId(4))[0].display_name, "Bo");
    }

    #[test]
    fn test_clear_on_transport_close() {
        let mut tracker = PresenceTracker::new(LOCAL);
        tracker.join(ParticipantId(2), "A");
        tracker.join(ParticipantId(3), "B");
        assert_eq!(tracker.clear(), 2);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_no_eviction_without_timeout() {
        let mut tracker = PresenceTracker::new(LOCAL);
        tracker.join(ParticipantId(2), "A");
        let later = Instant::now() + Duration::from_secs(3600);
        assert!(tracker.evict_idle_at(later).is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_eviction_with_timeout() {
        let mut tracker = PresenceTracker::with_idle_timeout(LOCAL, Duration::from_secs(30));
        tracker.join(ParticipantId(2), "A");
        assert!(tracker.evict_idle_at(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(tracker.evict_idle_at(later), vec![ParticipantId(2)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_roster_sorted() {
        let mut tracker = PresenceTracker::new(LOCAL);
        tracker.join(ParticipantId(30), "C");
        tracker.join(ParticipantId(4), "A");
        tracker.join(ParticipantId(12), "B");
        let names: Vec<&str> = tracker.participants().iter().map(|p| p.display_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_color_stable_and_distinct() {
        let a = ParticipantColor::from_id(ParticipantId(7));
        assert_eq!(a, ParticipantColor::from_id(ParticipantId(7)));
        assert_ne!(a, ParticipantColor::from_id(ParticipantId(8)));
        let hex = a.to_hex();
        assert_eq!(hex.len(), 7);
        assert!(hex.starts_with('#'));
    }

    #[test]
    fn test_hsl_to_rgb_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 1e-5);
        assert!(g.abs() < 1e-5);
        assert!(b.abs() < 1e-5);
    }

    #[test]
    fn test_announce_selection() {
        let tracker = PresenceTracker::new(LOCAL);
        let envelope = tracker.announce_selection(Some(FrameId(1)), None);
        assert_eq!(envelope.type_name(), "user_selection");
    }
}
