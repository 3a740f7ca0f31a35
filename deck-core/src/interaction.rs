//! Drag/resize interaction state machine.
//!
//! ```text
//!            begin_drag                 pointer_up / cancel
//!   Idle ───────────────► Dragging ─────────────────────────► Idle
//!     │                                                        ▲
//!     │ begin_resize                                           │
//!     └─────────────────► Resizing ────────────────────────────┘
//! ```
//!
//! Pointer coordinates are in viewport space; deltas are divided by the
//! zoom factor before they touch document geometry. Every move is applied
//! to the store immediately. Only the last applied position is handed back
//! as a [`Commit`] when the interaction ends.

use serde::{Deserialize, Serialize};

use crate::model::{clamp_size, ElementId, Point, Position};
use crate::store::DocumentStore;

pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 5.0;

/// Corner handle used for resizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResizeHandle {
    Nw,
    Ne,
    Sw,
    Se,
}

impl ResizeHandle {
    pub const ALL: [ResizeHandle; 4] = [
        ResizeHandle::Nw,
        ResizeHandle::Ne,
        ResizeHandle::Sw,
        ResizeHandle::Se,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResizeHandle::Nw => "nw",
            ResizeHandle::Ne => "ne",
            ResizeHandle::Sw => "sw",
            ResizeHandle::Se => "se",
        }
    }
}

/// Geometry after dragging `handle` by a document-space delta.
///
/// The corner opposite the handle stays fixed: handles on the left or top
/// edge shift the origin by however much the size actually changed, which
/// accounts for clamping.
pub fn resize_position(handle: ResizeHandle, start: &Position, dx: f64, dy: f64) -> Position {
    let mut next = *start;
    match handle {
        ResizeHandle::Nw => {
            next.width = clamp_size(start.width - dx);
            next.height = clamp_size(start.height - dy);
            next.x = start.x + (start.width - next.width);
            next.y = start.y + (start.height - next.height);
        }
        ResizeHandle::Ne => {
            next.width = clamp_size(start.width + dx);
            next.height = clamp_size(start.height - dy);
            next.y = start.y + (start.height - next.height);
        }
        ResizeHandle::Sw => {
            next.width = clamp_size(start.width - dx);
            next.height = clamp_size(start.height + dy);
            next.x = start.x + (start.width - next.width);
        }
        ResizeHandle::Se => {
            next.width = clamp_size(start.width + dx);
            next.height = clamp_size(start.height + dy);
        }
    }
    next
}

pub fn drag_position(start: &Position, dx: f64, dy: f64) -> Position {
    start.translated(dx, dy)
}

/// Canvas area in viewport space. Leaving it cancels an interaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Bounds {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, point: Point) -> bool {
        point.x >= self.x
            && point.y >= self.y
            && point.x <= self.x + self.width
            && point.y <= self.y + self.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    zoom: f64,
    pub pan: Point,
    pub bounds: Option<Bounds>,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan: Point::ZERO,
            bounds: None,
        }
    }
}

impl Viewport {
    pub fn with_zoom(zoom: f64) -> Self {
        let mut viewport = Self::default();
        viewport.set_zoom(zoom);
        viewport
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    /// Set the zoom factor, clamped to `[MIN_ZOOM, MAX_ZOOM]`.
    pub fn set_zoom(&mut self, zoom: f64) {
        self.zoom = if zoom.is_finite() {
            zoom.clamp(MIN_ZOOM, MAX_ZOOM)
        } else {
            1.0
        };
    }

    /// Document-space delta between two viewport points.
    pub fn to_document_delta(&self, from: Point, to: Point) -> (f64, f64) {
        ((to.x - from.x) / self.zoom, (to.y - from.y) / self.zoom)
    }

    pub fn contains(&self, point: Point) -> bool {
        self.bounds.map_or(true, |b| b.contains(point))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InteractionState {
    Idle,
    Dragging {
        element_id: ElementId,
        start_pointer: Point,
        start_position: Position,
        last_position: Option<Position>,
    },
    Resizing {
        element_id: ElementId,
        handle: ResizeHandle,
        start_pointer: Point,
        start_position: Position,
        last_position: Option<Position>,
    },
}

impl InteractionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, InteractionState::Idle)
    }

    pub fn element_id(&self) -> Option<ElementId> {
        match self {
            InteractionState::Idle => None,
            InteractionState::Dragging { element_id, .. }
            | InteractionState::Resizing { element_id, .. } => Some(*element_id),
        }
    }

    fn last_position(&self) -> Option<Position> {
        match self {
            InteractionState::Idle => None,
            InteractionState::Dragging { last_position, .. }
            | InteractionState::Resizing { last_position, .. } => *last_position,
        }
    }
}

/// Final geometry to persist once an interaction ends.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Commit {
    pub element_id: ElementId,
    pub position: Position,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MoveOutcome {
    /// No interaction in progress.
    Ignored,
    /// Position applied to the store.
    Applied(Position),
    /// The interaction ended early; commit the last confirmed position if any.
    Cancelled(Option<Commit>),
}

#[derive(Debug, Clone)]
pub struct InteractionController {
    state: InteractionState,
    pub viewport: Viewport,
}

impl Default for InteractionController {
    fn default() -> Self {
        Self::new(Viewport::default())
    }
}

impl InteractionController {
    pub fn new(viewport: Viewport) -> Self {
        Self {
            state: InteractionState::Idle,
            viewport,
        }
    }

    pub fn state(&self) -> &InteractionState {
        &self.state
    }

    /// Start dragging. Returns `false`, leaving the state untouched, when
    /// the participant cannot edit, another interaction is running, or the
    /// element does not exist.
    pub fn begin_drag(&mut self, store: &DocumentStore, element_id: ElementId, pointer: Point) -> bool {
        let Some(start_position) = self.startable(store, element_id) else {
            return false;
        };
        self.state = InteractionState::Dragging {
            element_id,
            start_pointer: pointer,
            start_position,
            last_position: None,
        };
        log::debug!("Drag started on element {element_id}");
        true
    }

    pub fn begin_resize(
        &mut self,
        store: &DocumentStore,
        element_id: ElementId,
        handle: ResizeHandle,
        pointer: Point,
    ) -> bool {
        let Some(start_position) = self.startable(store, element_id) else {
            return false;
        };
        self.state = InteractionState::Resizing {
            element_id,
            handle,
            start_pointer: pointer,
            start_position,
            last_position: None,
        };
        log::debug!("Resize ({}) started on element {element_id}", handle.as_str());
        true
    }

    fn startable(&self, store: &DocumentStore, element_id: ElementId) -> Option<Position> {
        if !store.permission().can_edit() {
            log::debug!("Ignoring pointer-down on {element_id}: read-only");
            return None;
        }
        if !self.state.is_idle() {
            return None;
        }
        store.element(element_id).map(|e| e.position)
    }

    /// Apply a pointer move optimistically to the store.
    pub fn pointer_move(&mut self, store: &mut DocumentStore, pointer: Point) -> MoveOutcome {
        let (element_id, next) = match &self.state {
            InteractionState::Idle => return MoveOutcome::Ignored,
            InteractionState::Dragging {
                element_id,
                start_pointer,
                start_position,
                ..
            } => {
                let (dx, dy) = self.viewport.to_document_delta(*start_pointer, pointer);
                (*element_id, drag_position(start_position, dx, dy))
            }
            InteractionState::Resizing {
                element_id,
                handle,
                start_pointer,
                start_position,
                ..
            } => {
                let (dx, dy) = self.viewport.to_document_delta(*start_pointer, pointer);
                (*element_id, resize_position(*handle, start_position, dx, dy))
            }
        };

        if !self.viewport.contains(pointer) {
            log::debug!("Pointer left the canvas, cancelling interaction on {element_id}");
            return MoveOutcome::Cancelled(self.cancel());
        }

        match store.set_element_position(element_id, next) {
            Ok(stored) => {
                log::trace!("Element {element_id} -> ({}, {})", stored.x, stored.y);
                match &mut self.state {
                    InteractionState::Dragging { last_position, .. }
                    | InteractionState::Resizing { last_position, .. } => {
                        *last_position = Some(stored);
                    }
                    InteractionState::Idle => {}
                }
                MoveOutcome::Applied(stored)
            }
            Err(e) => {
                log::debug!("Interaction target vanished: {e}");
                self.state = InteractionState::Idle;
                MoveOutcome::Cancelled(None)
            }
        }
    }

    /// Finish the interaction. Returns `None` when the pointer never moved
    /// or the element was removed meanwhile.
    pub fn pointer_up(&mut self, store: &DocumentStore) -> Option<Commit> {
        let commit = self.finish();
        commit.filter(|c| store.element(c.element_id).is_some())
    }

    /// Abort the interaction, keeping what was already applied.
    pub fn cancel(&mut self) -> Option<Commit> {
        self.finish()
    }

    pub fn pointer_leave(&mut self) -> Option<Commit> {
        self.cancel()
    }

    fn finish(&mut self) -> Option<Commit> {
        let state = std::mem::replace(&mut self.state, InteractionState::Idle);
        let element_id = state.element_id()?;
        let position = state.last_position()?;
        Some(Commit { element_id, position })
    }
}
