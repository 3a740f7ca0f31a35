//! Remote reconciler: applies inbound envelopes to the Document Store and
//! the Presence Tracker.
//!
//! Envelopes are applied in arrival order (the transport is FIFO per
//! connection) and merged field by field, so the last write to a field
//! wins. A bad envelope never fails the caller: it is logged and reported
//! as [`ReconcileOutcome::Ignored`].

use deck_core::{DocumentStore, StoreError};

use crate::presence::PresenceTracker;
use crate::protocol::{Envelope, Inbound, ProtocolError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Not JSON, not an object, no `type`, or a payload of the wrong shape.
    Malformed,
    UnknownType,
    /// An `{error}` frame from the server.
    ServerError,
    /// The element or frame it refers to is not in the store.
    UnknownTarget,
    /// A presence envelope without sender attribution.
    MissingSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Document,
    Presence,
    Ignored(IgnoreReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub document: u64,
    pub presence: u64,
    pub ignored: u64,
}

#[derive(Debug, Default)]
pub struct RemoteReconciler {
    stats: ReconcileStats,
}

impl RemoteReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats
    }

    /// Decode a raw text frame and apply it.
    pub fn apply(
        &mut self,
        store: &mut DocumentStore,
        presence: &mut PresenceTracker,
        raw: &str,
    ) -> ReconcileOutcome {
        let outcome = match Envelope::decode(raw) {
            Ok(inbound) => return self.apply_inbound(store, presence, inbound),
            Err(ProtocolError::UnknownType(type_name)) => {
                log::debug!("Ignoring envelope of unknown type `{type_name}`");
                ReconcileOutcome::Ignored(IgnoreReason::UnknownType)
            }
            Err(ProtocolError::ServerError(message)) => {
                log::warn!("Server rejected a message: {message}");
                ReconcileOutcome::Ignored(IgnoreReason::ServerError)
            }
            Err(e) => {
                log::warn!("Ignoring malformed envelope: {e}");
                ReconcileOutcome::Ignored(IgnoreReason::Malformed)
            }
        };
        self.count(outcome)
    }

    pub fn apply_inbound(
        &mut self,
        store: &mut DocumentStore,
        presence: &mut PresenceTracker,
        inbound: Inbound,
    ) -> ReconcileOutcome {
        let Inbound { envelope, sender } = inbound;
        let type_name = envelope.type_name();

        let outcome = match envelope {
            Envelope::ElementUpdate { element_id, changes } => {
                document(type_name, store.apply_element_change(element_id, &changes))
            }
            Envelope::ElementCreate { element } => match element.hydrate(None) {
                Ok(element) => document(type_name, store.add_element(element)),
                Err(e) => {
                    log::warn!("Ignoring element_create: {e}");
                    ReconcileOutcome::Ignored(IgnoreReason::Malformed)
                }
            },
            Envelope::ElementDelete { element_id } => match store.remove_element(element_id) {
                Some(_) => ReconcileOutcome::Document,
                None => {
                    log::debug!("element_delete for unknown element {element_id}");
                    ReconcileOutcome::Ignored(IgnoreReason::UnknownTarget)
                }
            },
            Envelope::FrameUpdate { frame_id, changes } => {
                document(type_name, store.apply_frame_change(frame_id, &changes))
            }
            Envelope::FrameCreate { frame } => match frame.hydrate() {
                Ok(frame) => {
                    store.add_frame(frame);
                    ReconcileOutcome::Document
                }
                Err(e) => {
                    log::warn!("Ignoring frame_create: {e}");
                    ReconcileOutcome::Ignored(IgnoreReason::Malformed)
                }
            },
            Envelope::FrameDelete { frame_id } => match store.remove_frame(frame_id) {
                Some(_) => ReconcileOutcome::Document,
                None => {
                    log::debug!("frame_delete for unknown frame {frame_id}");
                    ReconcileOutcome::Ignored(IgnoreReason::UnknownTarget)
                }
            },
            Envelope::UserSelection { frame_id, element_id } => match sender {
                Some(sender) => {
                    presence.update_selection(
                        sender.user_id,
                        sender.username.as_deref(),
                        frame_id,
                        element_id,
                    );
                    ReconcileOutcome::Presence
                }
                None => {
                    log::debug!("user_selection without sender");
                    ReconcileOutcome::Ignored(IgnoreReason::MissingSender)
                }
            },
            Envelope::UserJoined { user_id, username } => {
                let name = if username.is_empty() {
                    format!("User {user_id}")
                } else {
                    username
                };
                presence.join(user_id, &name);
                ReconcileOutcome::Presence
            }
            Envelope::UserLeft { user_id, .. } => {
                presence.leave(user_id);
                ReconcileOutcome::Presence
            }
        };
        self.count(outcome)
    }

    fn count(&mut self, outcome: ReconcileOutcome) -> ReconcileOutcome {
        match outcome {
            ReconcileOutcome::Document => self.stats.document += 1,
            ReconcileOutcome::Presence => self.stats.presence += 1,
            ReconcileOutcome::Ignored(_) => self.stats.ignored += 1,
        }
        outcome
    }
}

fn document(type_name: &str, result: Result<(), StoreError>) -> ReconcileOutcome {
    match result {
        Ok(()) => ReconcileOutcome::Document,
        Err(e) => {
            log::warn!("Ignoring {type_name}: {e}");
            ReconcileOutcome::Ignored(IgnoreReason::UnknownTarget)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_core::{
        Element, ElementChanges, ElementId, ElementKind, Frame, FrameId, ParticipantId, Permission,
        Position, Presentation, PresentationId, PresentationInfo, Selection,
    };
    use serde_json::json;

    const LOCAL: ParticipantId = ParticipantId(1);

    fn setup() -> (DocumentStore, PresenceTracker, RemoteReconciler) {
        let mut f1 = Frame::new(FrameId(1), "F1", 0);
        f1.elements.push(Element::new(
            ElementId(10),
            FrameId(1),
            ElementKind::Text,
            Position::new(100.0, 100.0, 400.0, 100.0),
        ));
        let store = DocumentStore::from_presentation(Presentation {
            info: PresentationInfo {
                permission: Permission::Editor,
                ..DocumentStore::new(PresentationId(1)).info().clone()
            },
            frames: vec![f1, Frame::new(FrameId(2), "F2", 1)],
        });
        (store, PresenceTracker::new(LOCAL), RemoteReconciler::new())
    }

    fn update(id: i64, position: Position) -> String {
        Envelope::ElementUpdate {
            element_id: ElementId(id),
            changes: ElementChanges::position(&position),
        }
        .encode()
        .unwrap()
    }

    #[test]
    fn test_element_update_idempotent() {
        let (mut store, mut presence, mut reconciler) = setup();
        let raw = update(10, Position::new(150.0, 130.0, 400.0, 100.0));

        assert_eq!(reconciler.apply(&mut store, &mut presence, &raw), ReconcileOutcome::Document);
        let once = store.element(ElementId(10)).unwrap().clone();
        reconciler.apply(&mut store, &mut presence, &raw);
        assert_eq!(store.element(ElementId(10)).unwrap(), &once);
        assert_eq!(once.position.x, 150.0);
        assert_eq!(once.position.y, 130.0);
    }

    #[test]
    fn test_last_write_wins_in_arrival_order() {
        let (mut store, mut presence, mut reconciler) = setup();
        reconciler.apply(&mut store, &mut presence, &update(10, Position::new(1.0, 1.0, 400.0, 100.0)));
        reconciler.apply(&mut store, &mut presence, &update(10, Position::new(2.0, 2.0, 400.0, 100.0)));
        assert_eq!(store.element(ElementId(10)).unwrap().position.x, 2.0);
    }

    #[test]
    fn test_element_create_hydrates_defaults() {
        let (mut store, mut presence, mut reconciler) = setup();
        let raw = json!({
            "type": "element_create",
            "element": {"id": 30, "frame": 2, "element_type": "SHAPE"},
            "user_id": 7
        })
        .to_string();

        assert_eq!(reconciler.apply(&mut store, &mut presence, &raw), ReconcileOutcome::Document);
        let element = store.element(ElementId(30)).unwrap();
        assert_eq!(element.position, Position::default());
        assert_eq!(element.content.kind(), ElementKind::Shape);
    }

    #[test]
    fn test_element_create_into_unknown_frame() {
        let (mut store, mut presence, mut reconciler) = setup();
        let raw = json!({
            "type": "element_create",
            "element": {"id": 30, "frame": 99, "element_type": "TEXT"}
        })
        .to_string();
        assert_eq!(
            reconciler.apply(&mut store, &mut presence, &raw),
            ReconcileOutcome::Ignored(IgnoreReason::UnknownTarget)
        );
    }

    #[test]
    fn test_element_delete_clears_selection() {
        let (mut store, mut presence, mut reconciler) = setup();
        store.select_element(ElementId(10)).unwrap();
        let raw = json!({"type": "element_delete", "element_id": 10}).to_string();

        assert_eq!(reconciler.apply(&mut store, &mut presence, &raw), ReconcileOutcome::Document);
        assert!(store.element(ElementId(10)).is_none());
        assert_eq!(store.selection().element_id, None);

        assert_eq!(
            reconciler.apply(&mut store, &mut presence, &raw),
            ReconcileOutcome::Ignored(IgnoreReason::UnknownTarget)
        );
    }

    #[test]
    fn test_frame_create_update_delete() {
        let (mut store, mut presence, mut reconciler) = setup();
        let create = json!({"type": "frame_create", "frame": {"id": 5, "title": "New", "order": 2}});
        let update = json!({"type": "frame_update", "frame_id": 5, "changes": {"title": "Renamed"}});
        let delete = json!({"type": "frame_delete", "frame_id": 1});

        store.select_element(ElementId(10)).unwrap();
        for raw in [create, update, delete] {
            assert_eq!(
                reconciler.apply(&mut store, &mut presence, &raw.to_string()),
                ReconcileOutcome::Document
            );
        }
        assert_eq!(store.frame(FrameId(5)).unwrap().title, "Renamed");
        assert!(store.frame(FrameId(1)).is_none());
        assert!(store.element(ElementId(10)).is_none());
        assert_eq!(store.selection(), Selection::default());
    }

    #[test]
    fn test_bad_envelopes_ignored() {
        let (mut store, mut presence, mut reconciler) = setup();
        let before = store.to_presentation();

        let cases = [
            ("not json", IgnoreReason::Malformed),
            ("[1,2]", IgnoreReason::Malformed),
            (r#"{"element_id": 10}"#, IgnoreReason::Malformed),
            (r#"{"type": "cursor_move", "x": 1}"#, IgnoreReason::UnknownType),
            (r#"{"type": "element_update", "element_id": "ten"}"#, IgnoreReason::Malformed),
            (r#"{"error": "Permission denied"}"#, IgnoreReason::ServerError),
            (r#"{"type": "element_update", "element_id": 99, "changes": {}}"#, IgnoreReason::UnknownTarget),
            (r#"{"type": "user_selection", "element_id": 10}"#, IgnoreReason::MissingSender),
        ];
        for (raw, reason) in cases {
            assert_eq!(
                reconciler.apply(&mut store, &mut presence, raw),
                ReconcileOutcome::Ignored(reason),
                "{raw}"
            );
        }
        assert_eq!(store.to_presentation(), before);
        assert_eq!(reconciler.stats().ignored, cases.len() as u64);
    }

    #[test]
    fn test_malformed_position_blob_keeps_previous() {
        let (mut store, mut presence, mut reconciler) = setup();
        let raw = json!({
            "type": "element_update",
            "element_id": 10,
            "changes": {"position": "{broken", "link_url": "https://x"}
        })
        .to_string();
        assert_eq!(reconciler.apply(&mut store, &mut presence, &raw), ReconcileOutcome::Document);
        let element = store.element(ElementId(10)).unwrap();
        assert_eq!(element.position.x, 100.0);
        assert_eq!(element.link_url, "https://x");
    }

    #[test]
    fn test_presence_envelopes_do_not_touch_document() {
        let (mut store, mut presence, mut reconciler) = setup();
        let before = store.to_presentation();

        let joined = json!({"type": "user_joined", "user_id": 7, "username": "Ana"}).to_string();
        let selected = json!({"type": "user_selection", "element_id": 10, "frame_id": 1, "user_id": 7}).to_string();
        let left = json!({"type": "user_left", "user_id": 7}).to_string();

        assert_eq!(reconciler.apply(&mut store, &mut presence, &joined), ReconcileOutcome::Presence);
        assert_eq!(reconciler.apply(&mut store, &mut presence, &selected), ReconcileOutcome::Presence);
        let ana = presence.participant(ParticipantId(7)).unwrap();
        assert_eq!(ana.display_name, "Ana");
        assert_eq!(ana.current_element_id, Some(ElementId(10)));

        reconciler.apply(&mut store, &mut presence, &left);
        assert!(presence.is_empty());
        assert_eq!(store.to_presentation(), before);
        assert_eq!(store.selection(), Selection::default());
        assert_eq!(reconciler.stats().presence, 3);
    }
}
