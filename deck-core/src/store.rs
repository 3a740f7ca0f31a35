//! The Document Store: canonical in-memory frames and elements.
//!
//! Single writer, no locking. The owning session serialises every mutation
//! (local interaction, remote envelopes, snapshot loads) through `&mut self`.
//! Observers registered with [`DocumentStore::subscribe`] are called
//! synchronously after each mutation.

use std::collections::HashMap;

use thiserror::Error;

use crate::changes::{ElementChanges, FrameChanges};
use crate::model::{
    CanvasSettings, Element, ElementId, Frame, FrameId, Permission, Position, Presentation,
    PresentationId, PresentationInfo,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("frame {0} not found")]
    FrameNotFound(FrameId),
    #[error("element {0} not found")]
    ElementNotFound(ElementId),
}

/// Locally selected frame and element. Never persisted or broadcast as
/// document state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Selection {
    pub frame_id: Option<FrameId>,
    pub element_id: Option<ElementId>,
}

/// Notification delivered to store observers.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    SnapshotLoaded,
    FrameAdded(FrameId),
    FrameChanged(FrameId),
    FrameRemoved(FrameId),
    ElementAdded { element_id: ElementId, frame_id: FrameId },
    ElementChanged { element_id: ElementId, frame_id: FrameId },
    ElementRemoved { element_id: ElementId, frame_id: FrameId },
    SelectionChanged(Selection),
}

pub type SubscriptionId = u64;

type Listener = Box<dyn FnMut(&StoreEvent) + Send>;

pub struct DocumentStore {
    info: PresentationInfo,
    /// Sorted by `order` (stable).
    frames: Vec<Frame>,
    element_frames: HashMap<ElementId, FrameId>,
    selection: Selection,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: SubscriptionId,
}

impl DocumentStore {
    /// Empty, read-only store for `id`, waiting for its snapshot.
    pub fn new(id: PresentationId) -> Self {
        Self {
            info: PresentationInfo {
                id,
                title: String::new(),
                description: String::new(),
                canvas: CanvasSettings::default(),
                permission: Permission::Viewer,
            },
            frames: Vec::new(),
            element_frames: HashMap::new(),
            selection: Selection::default(),
            listeners: Vec::new(),
            next_subscription: 1,
        }
    }

    pub fn from_presentation(presentation: Presentation) -> Self {
        let mut store = Self::new(presentation.info.id);
        store.load_snapshot(presentation);
        store
    }

    // ───────────────────────────────────────────────────────────────
    // Observers
    // ───────────────────────────────────────────────────────────────

    pub fn subscribe<F>(&mut self, listener: F) -> SubscriptionId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        let id = self.next_subscription;
        self.next_subscription += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(sub, _)| *sub != id);
        self.listeners.len() != before
    }

    fn emit(&mut self, event: StoreEvent) {
        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Snapshot
    // ───────────────────────────────────────────────────────────────

    /// Replace the whole document. A selection that still resolves
    /// afterwards is kept; anything else is cleared.
    pub fn load_snapshot(&mut self, presentation: Presentation) {
        let Presentation { info, mut frames } = presentation;

        frames.sort_by_key(|f| f.order);
        self.element_frames.clear();
        for frame in frames.iter_mut() {
            frame.position = frame.position.clamped();
            for element in frame.elements.iter_mut() {
                element.frame_id = frame.id;
                element.position = element.position.clamped();
                self.element_frames.insert(element.id, frame.id);
            }
        }

        self.info = info;
        self.frames = frames;
        log::info!(
            "Loaded presentation {} ({} frames, {} elements)",
            self.info.id,
            self.frames.len(),
            self.element_frames.len()
        );
        self.emit(StoreEvent::SnapshotLoaded);

        let mut selection = self.selection;
        if selection.frame_id.is_some_and(|id| self.frame(id).is_none()) {
            selection.frame_id = None;
        }
        if selection.element_id.is_some_and(|id| !self.element_frames.contains_key(&id)) {
            selection.element_id = None;
        }
        self.set_selection(selection);
    }

    // ───────────────────────────────────────────────────────────────
    // Reads
    // ───────────────────────────────────────────────────────────────

    pub fn info(&self) -> &PresentationInfo {
        &self.info
    }

    pub fn presentation_id(&self) -> PresentationId {
        self.info.id
    }

    pub fn permission(&self) -> Permission {
        self.info.permission
    }

    pub fn set_permission(&mut self, permission: Permission) {
        self.info.permission = permission;
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame(&self, id: FrameId) -> Option<&Frame> {
        self.frames.iter().find(|f| f.id == id)
    }

    pub fn element(&self, id: ElementId) -> Option<&Element> {
        let frame_id = self.element_frames.get(&id)?;
        self.frame(*frame_id)?.element(id)
    }

    pub fn element_count(&self) -> usize {
        self.element_frames.len()
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    /// Largest frame order in use, if any.
    pub fn max_order(&self) -> Option<i64> {
        self.frames.iter().map(|f| f.order).max()
    }

    pub fn to_presentation(&self) -> Presentation {
        Presentation {
            info: self.info.clone(),
            frames: self.frames.clone(),
        }
    }

    fn frame_mut(&mut self, id: FrameId) -> Option<&mut Frame> {
        self.frames.iter_mut().find(|f| f.id == id)
    }

    fn element_mut(&mut self, id: ElementId) -> Option<&mut Element> {
        let frame_id = *self.element_frames.get(&id)?;
        self.frame_mut(frame_id)?
            .elements
            .iter_mut()
            .find(|e| e.id == id)
    }

    // ───────────────────────────────────────────────────────────────
    // Element mutations
    // ───────────────────────────────────────────────────────────────

    /// Field-merge `changes` into an element, moving it to `changes.frame`
    /// when that names a different frame.
    ///
    /// The target frame is validated before anything is touched, so a
    /// change naming an unknown frame is rejected as a whole.
    pub fn apply_element_change(
        &mut self,
        id: ElementId,
        changes: &ElementChanges,
    ) -> Result<(), StoreError> {
        let current_frame = *self
            .element_frames
            .get(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        let target_frame = match changes.frame {
            Some(target) if target != current_frame => {
                if self.frame(target).is_none() {
                    return Err(StoreError::FrameNotFound(target));
                }
                Some(target)
            }
            _ => None,
        };

        let element = self
            .element_mut(id)
            .ok_or(StoreError::ElementNotFound(id))?;
        element.merge_changes(changes);

        let frame_id = match target_frame {
            Some(target) => {
                self.relocate(id, current_frame, target);
                target
            }
            None => current_frame,
        };
        self.emit(StoreEvent::ElementChanged { element_id: id, frame_id });
        Ok(())
    }

    fn relocate(&mut self, id: ElementId, from: FrameId, to: FrameId) {
        let moved = self.frame_mut(from).and_then(|frame| {
            let index = frame.elements.iter().position(|e| e.id == id)?;
            Some(frame.elements.remove(index))
        });
        let Some(mut element) = moved else {
            return;
        };
        element.frame_id = to;
        if let Some(target) = self.frame_mut(to) {
            target.elements.push(element);
            self.element_frames.insert(id, to);
            log::debug!("Moved element {id} from frame {from} to {to}");
        }
    }

    /// Set an element's geometry directly, clamped to the minimum size.
    /// Returns the position actually stored.
    pub fn set_element_position(
        &mut self,
        id: ElementId,
        position: Position,
    ) -> Result<Position, StoreError> {
        let element = self
            .element_mut(id)
            .ok_or(StoreError::ElementNotFound(id))?;
        element.position = position.clamped();
        let (stored, frame_id) = (element.position, element.frame_id);
        self.emit(StoreEvent::ElementChanged { element_id: id, frame_id });
        Ok(stored)
    }

    /// Insert an element into its frame. An element whose id is already
    /// present is replaced (a repeated create is an upsert).
    pub fn add_element(&mut self, mut element: Element) -> Result<(), StoreError> {
        let frame_id = element.frame_id;
        if self.frame(frame_id).is_none() {
            return Err(StoreError::FrameNotFound(frame_id));
        }
        element.position = element.position.clamped();
        let id = element.id;

        let existed = match self.element_frames.get(&id).copied() {
            Some(old_frame) => {
                if let Some(frame) = self.frame_mut(old_frame) {
                    frame.elements.retain(|e| e.id != id);
                }
                log::debug!("Element {id} already present, replacing");
                true
            }
            None => false,
        };

        if let Some(frame) = self.frame_mut(frame_id) {
            frame.elements.push(element);
        }
        self.element_frames.insert(id, frame_id);

        self.emit(if existed {
            StoreEvent::ElementChanged { element_id: id, frame_id }
        } else {
            StoreEvent::ElementAdded { element_id: id, frame_id }
        });
        Ok(())
    }

    /// Remove an element. Unknown ids are a no-op returning `None`.
    pub fn remove_element(&mut self, id: ElementId) -> Option<Element> {
        let frame_id = self.element_frames.remove(&id)?;
        let frame = self.frame_mut(frame_id)?;
        let index = frame.elements.iter().position(|e| e.id == id)?;
        let removed = frame.elements.remove(index);

        self.emit(StoreEvent::ElementRemoved { element_id: id, frame_id });
        if self.selection.element_id == Some(id) {
            self.set_selection(Selection {
                element_id: None,
                ..self.selection
            });
        }
        Some(removed)
    }

    // ───────────────────────────────────────────────────────────────
    // Frame mutations
    // ───────────────────────────────────────────────────────────────

    pub fn apply_frame_change(&mut self, id: FrameId, changes: &FrameChanges) -> Result<(), StoreError> {
        let frame = self.frame_mut(id).ok_or(StoreError::FrameNotFound(id))?;
        frame.merge_changes(changes);
        if changes.order.is_some() {
            self.frames.sort_by_key(|f| f.order);
            self.warn_duplicate_order(id);
        }
        self.emit(StoreEvent::FrameChanged(id));
        Ok(())
    }

    /// Insert a frame at its order position. A frame whose id is already
    /// present is replaced together with its elements.
    pub fn add_frame(&mut self, mut frame: Frame) {
        let id = frame.id;
        frame.position = frame.position.clamped();

        let existed = match self.frames.iter().position(|f| f.id == id) {
            Some(index) => {
                let old = self.frames.remove(index);
                for element in &old.elements {
                    self.element_frames.remove(&element.id);
                }
                true
            }
            None => false,
        };

        for element in frame.elements.iter_mut() {
            element.frame_id = id;
            element.position = element.position.clamped();
            self.element_frames.insert(element.id, id);
        }

        let index = self.frames.partition_point(|f| f.order <= frame.order);
        self.frames.insert(index, frame);
        self.warn_duplicate_order(id);

        self.emit(if existed {
            StoreEvent::FrameChanged(id)
        } else {
            StoreEvent::FrameAdded(id)
        });
    }

    /// Remove a frame and every element it contains, clearing any
    /// selection that referenced them.
    pub fn remove_frame(&mut self, id: FrameId) -> Option<Frame> {
        let index = self.frames.iter().position(|f| f.id == id)?;
        let frame = self.frames.remove(index);

        let mut selection = self.selection;
        if selection.frame_id == Some(id) {
            selection.frame_id = None;
        }
        for element in &frame.elements {
            self.element_frames.remove(&element.id);
            if selection.element_id == Some(element.id) {
                selection.element_id = None;
            }
            self.emit(StoreEvent::ElementRemoved {
                element_id: element.id,
                frame_id: id,
            });
        }
        self.emit(StoreEvent::FrameRemoved(id));
        self.set_selection(selection);

        log::debug!("Removed frame {id} with {} elements", frame.elements.len());
        Some(frame)
    }

    fn warn_duplicate_order(&self, id: FrameId) {
        let Some(order) = self.frame(id).map(|f| f.order) else {
            return;
        };
        if self.frames.iter().filter(|f| f.order == order).count() > 1 {
            log::warn!("Frame order {order} is used by more than one frame");
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Selection
    // ───────────────────────────────────────────────────────────────

    /// Select a frame; the element selection is cleared.
    pub fn select_frame(&mut self, id: FrameId) -> Result<(), StoreError> {
        if self.frame(id).is_none() {
            return Err(StoreError::FrameNotFound(id));
        }
        self.set_selection(Selection {
            frame_id: Some(id),
            element_id: None,
        });
        Ok(())
    }

    /// Select an element and its owning frame.
    pub fn select_element(&mut self, id: ElementId) -> Result<(), StoreError> {
        let frame_id = *self
            .element_frames
            .get(&id)
            .ok_or(StoreError::ElementNotFound(id))?;
        self.set_selection(Selection {
            frame_id: Some(frame_id),
            element_id: Some(id),
        });
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.set_selection(Selection::default());
    }

    fn set_selection(&mut self, selection: Selection) {
        if selection != self.selection {
            self.selection = selection;
            self.emit(StoreEvent::SelectionChanged(selection));
        }
    }
}
