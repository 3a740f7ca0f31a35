//! # deck-core: Document model and local editing for Deck
//!
//! Synchronous building blocks shared by every participant of a
//! collaborative presentation. Nothing in this crate performs I/O.
//!
//! ## Architecture
//!
//! ```text
//!  pointer events                  remote changes
//!       │                                │
//!       ▼                                ▼
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │ InteractionController│   │ ElementChanges /     │
//! │ (drag / resize)      │   │ FrameChanges         │
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            │                          │
//!            ▼                          ▼
//!        ┌──────────────────────────────────┐
//!        │ DocumentStore (frames, elements, │──► StoreEvent observers
//!        │ local selection)                 │
//!        └──────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: presentations, frames, elements and typed content
//! - [`codec`]: text-blob encoding of sub-structures
//! - [`changes`]: partial changes and field-level merge
//! - [`record`]: wire records with default hydration
//! - [`store`]: the Document Store
//! - [`interaction`]: drag/resize state machine and viewport math

pub mod changes;
pub mod codec;
pub mod interaction;
pub mod model;
pub mod record;
pub mod store;

pub use changes::{ElementChanges, FrameChanges};
pub use codec::CodecError;
pub use interaction::{
    Bounds, Commit, InteractionController, InteractionState, MoveOutcome, ResizeHandle, Viewport,
};
pub use model::{
    AnimationSettings, CanvasSettings, Element, ElementContent, ElementId, ElementKind, Frame,
    FrameId, FramePosition, ImageContent, ParticipantId, PdfContent, Permission, Point, Position,
    Presentation, PresentationId, PresentationInfo, ShapeContent, TextContent, TransitionSettings,
    VideoContent, MIN_SIZE,
};
pub use record::{ElementRecord, FrameRecord, PresentationRecord, RecordError};
pub use store::{DocumentStore, Selection, StoreError, StoreEvent, SubscriptionId};
