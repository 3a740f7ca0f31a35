//! Document session: one open presentation for one participant.
//!
//! ## Architecture
//!
//! ```text
//!  pointer / inspector input              transport events
//!          │                                     │
//!          ▼                                     ▼
//!  InteractionController              RemoteReconciler ──► PresenceTracker
//!          │  optimistic apply                   │
//!          ▼                                     ▼
//!  ┌───────────────────────── DocumentStore ─────────────────────────┐
//!  └─────────────────────────────────────────────────────────────────┘
//!          │ commit
//!          ├──► EnvelopeSink (element_update, ...)  ──► peers
//!          └──► PersistenceGateway (spawned write)  ──► server of record
//! ```
//!
//! The session owns the store, so every mutation (local, remote, snapshot)
//! goes through `&mut self` on a single task. Network work is spawned and
//! never awaited on the pointer path.

use std::sync::Arc;
use std::time::Duration;

use deck_core::{
    DocumentStore, ElementChanges, ElementContent, ElementId, ElementRecord, FrameChanges, FrameId,
    FrameRecord, InteractionController, MoveOutcome, Permission, Point, Position, ResizeHandle,
    Selection, StoreError,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::config::{ConfigError, SessionConfig};
use crate::persistence::{
    Credentials, HttpBackend, PersistError, PersistEvent, PersistenceGateway,
};
use crate::presence::PresenceTracker;
use crate::protocol::Envelope;
use crate::reconciler::{ReconcileOutcome, ReconcileStats, RemoteReconciler};
use crate::transport::{EnvelopeSink, SyncTransport, TransportError, TransportEvent};

pub use deck_core::Commit;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("the local participant cannot edit this presentation")]
    ReadOnly,
    #[error("element {0} is not a text element")]
    NotText(ElementId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// How a local update travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Apply to the local store right away.
    pub optimistic: bool,
    /// Broadcast to peers.
    pub emit: bool,
    /// Write to the server of record.
    pub persist: bool,
    /// Coalesce the write with later edits of the same target.
    pub debounced: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            optimistic: true,
            emit: true,
            persist: true,
            debounced: false,
        }
    }
}

impl UpdateOptions {
    /// In-progress geometry: local and optionally broadcast, never written.
    pub fn live() -> Self {
        Self {
            persist: false,
            ..Self::default()
        }
    }

    /// End of an interaction whose geometry is already in the store.
    pub fn commit() -> Self {
        Self {
            optimistic: false,
            ..Self::default()
        }
    }

    /// High-frequency edits such as typing.
    pub fn typing() -> Self {
        Self {
            debounced: true,
            ..Self::default()
        }
    }
}

pub struct DocumentSession {
    config: SessionConfig,
    store: DocumentStore,
    presence: PresenceTracker,
    interaction: InteractionController,
    reconciler: RemoteReconciler,
    gateway: Arc<PersistenceGateway>,
    persist_events: Option<mpsc::Receiver<PersistEvent>>,
    sink: Box<dyn EnvelopeSink>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    connected: bool,
    writes: JoinSet<()>,
}

impl DocumentSession {
    /// Fetch the snapshot over REST and connect the transport.
    pub async fn open(config: SessionConfig, credentials: Credentials) -> Result<Self, SessionError> {
        let backend = HttpBackend::new(&config.api_base_url, config.request_timeout())?;
        let gateway = PersistenceGateway::new(Arc::new(backend), credentials, config.debounce_delay());
        Self::connect(config, gateway).await
    }

    /// Like [`open`](Self::open) with a caller-supplied gateway.
    pub async fn connect(config: SessionConfig, gateway: PersistenceGateway) -> Result<Self, SessionError> {
        let presentation = gateway.fetch_presentation(config.presentation_id).await?;
        let store = DocumentStore::from_presentation(presentation);
        let transport = config.transport(store.permission())?;
        let (handle, events) = SyncTransport::spawn(transport)?;
        log::info!(
            "Opened presentation {} as {} ({})",
            config.presentation_id,
            config.username,
            store.permission().as_str()
        );
        Ok(Self::from_parts(config, store, gateway, Box::new(handle), Some(events)))
    }

    /// Assemble a session from already-built parts.
    pub fn from_parts(
        config: SessionConfig,
        store: DocumentStore,
        mut gateway: PersistenceGateway,
        sink: Box<dyn EnvelopeSink>,
        transport_events: Option<mpsc::Receiver<TransportEvent>>,
    ) -> Self {
        let presence = match config.presence_idle_timeout() {
            Some(timeout) => PresenceTracker::with_idle_timeout(config.user_id, timeout),
            None => PresenceTracker::new(config.user_id),
        };
        let persist_events = gateway.take_event_rx();
        Self {
            config,
            store,
            presence,
            interaction: InteractionController::default(),
            reconciler: RemoteReconciler::new(),
            gateway: Arc::new(gateway),
            persist_events,
            sink,
            transport_events,
            connected: false,
            writes: JoinSet::new(),
        }
    }

    // ───────────────────────────────────────────────────────────────
    // Accessors
    // ───────────────────────────────────────────────────────────────

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Mutable store access, for observers and view-only state.
    pub fn store_mut(&mut self) -> &mut DocumentStore {
        &mut self.store
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn interaction(&self) -> &InteractionController {
        &self.interaction
    }

    /// Viewport zoom, pan and canvas bounds used by the pointer pipeline.
    pub fn interaction_mut(&mut self) -> &mut InteractionController {
        &mut self.interaction
    }

    pub fn permission(&self) -> Permission {
        self.store.permission()
    }

    pub fn credentials(&self) -> &Credentials {
        self.gateway.credentials()
    }

    /// Persistence notifications (re-authentication requests, failed writes).
    pub fn take_persist_events(&mut self) -> Option<mpsc::Receiver<PersistEvent>> {
        self.persist_events.take()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn reconcile_stats(&self) -> ReconcileStats {
        self.reconciler.stats()
    }

    // ───────────────────────────────────────────────────────────────
    // Inbound
    // ───────────────────────────────────────────────────────────────

    /// Receive and handle one transport event. Returns `false` once the
    /// transport is gone.
    pub async fn pump(&mut self) -> bool {
        let Some(events) = self.transport_events.as_mut() else {
            return false;
        };
        let event = events.recv().await;
        match event {
            Some(event) => {
                self.handle_transport_event(event);
                true
            }
            None => false,
        }
    }

    /// Pump events until `done` holds or `limit` elapses.
    pub async fn pump_until<F>(&mut self, limit: Duration, mut done: F) -> bool
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if done(&*self) {
                return true;
            }
            match tokio::time::timeout_at(deadline, self.pump()).await {
                Ok(true) => {}
                _ => return done(&*self),
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) -> Option<ReconcileOutcome> {
        let outcome = match event {
            TransportEvent::Connected => {
                self.connected = true;
                None
            }
            TransportEvent::Disconnected => {
                self.connected = false;
                let dropped = self.presence.clear();
                log::info!("Transport disconnected, cleared {dropped} participants");
                None
            }
            TransportEvent::GaveUp => {
                self.connected = false;
                self.presence.clear();
                log::error!(
                    "Transport for presentation {} gave up; call reload() to recover",
                    self.config.presentation_id
                );
                None
            }
            TransportEvent::Message(text) => Some(self.apply_remote(&text)),
        };
        self.presence.evict_idle();
        outcome
    }

    /// Apply one inbound text frame.
    pub fn apply_remote(&mut self, raw: &str) -> ReconcileOutcome {
        self.reconciler.apply(&mut self.store, &mut self.presence, raw)
    }

    // ───────────────────────────────────────────────────────────────
    // Pointer pipeline
    // ───────────────────────────────────────────────────────────────

    /// Begin dragging an element. A no-op returning `false` for read-only
    /// participants.
    pub fn pointer_down(&mut self, element_id: ElementId, pointer: Point) -> bool {
        self.interaction.begin_drag(&self.store, element_id, pointer)
    }

    /// Begin resizing an element from one of its corner handles.
    pub fn resize_down(&mut self, element_id: ElementId, handle: ResizeHandle, pointer: Point) -> bool {
        self.interaction
            .begin_resize(&self.store, element_id, handle, pointer)
    }

    pub fn pointer_move(&mut self, pointer: Point) -> MoveOutcome {
        let outcome = self.interaction.pointer_move(&mut self.store, pointer);
        match outcome {
            MoveOutcome::Applied(position) if self.config.broadcast_live_moves => {
                if let Some(element_id) = self.interaction.state().element_id() {
                    self.sink.send_envelope(&Envelope::ElementUpdate {
                        element_id,
                        changes: ElementChanges::position(&position),
                    });
                }
            }
            MoveOutcome::Cancelled(Some(commit)) => self.commit(commit),
            _ => {}
        }
        outcome
    }

    pub fn pointer_up(&mut self) -> Option<Commit> {
        let commit = self.interaction.pointer_up(&self.store)?;
        self.commit(commit);
        Some(commit)
    }

    pub fn pointer_leave(&mut self) -> Option<Commit> {
        let commit = self.interaction.pointer_leave()?;
        self.commit(commit);
        Some(commit)
    }

    /// Broadcast and persist geometry already applied to the store.
    fn commit(&mut self, commit: Commit) {
        let changes = ElementChanges::position(&commit.position);
        log::debug!(
            "Committing element {} at ({}, {})",
            commit.element_id,
            commit.position.x,
            commit.position.y
        );
        self.emit_and_persist(commit.element_id, changes, UpdateOptions::commit());
    }

    // ───────────────────────────────────────────────────────────────
    // Explicit edits
    // ───────────────────────────────────────────────────────────────

    fn ensure_editable(&self) -> Result<(), SessionError> {
        if self.store.permission().can_edit() {
            Ok(())
        } else {
            Err(SessionError::ReadOnly)
        }
    }

    pub fn update_element(
        &mut self,
        id: ElementId,
        changes: ElementChanges,
        options: UpdateOptions,
    ) -> Result<(), SessionError> {
        self.ensure_editable()?;
        if self.store.element(id).is_none() {
            return Err(StoreError::ElementNotFound(id).into());
        }
        if changes.is_empty() {
            return Ok(());
        }
        if options.optimistic {
            self.store.apply_element_change(id, &changes)?;
        }
        self.emit_and_persist(id, changes, options);
        Ok(())
    }

    fn emit_and_persist(&mut self, id: ElementId, changes: ElementChanges, options: UpdateOptions) {
        if options.emit {
            self.sink.send_envelope(&Envelope::ElementUpdate {
                element_id: id,
                changes: changes.clone(),
            });
        }
        if !options.persist {
            return;
        }
        if options.debounced {
            self.gateway.update_element_debounced(id, changes);
        } else {
            let gateway = self.gateway.clone();
            self.spawn_write(async move {
                let _ = gateway.update_element(id, changes).await;
            });
        }
    }

    pub fn update_frame(
        &mut self,
        id: FrameId,
        changes: FrameChanges,
        options: UpdateOptions,
    ) -> Result<(), SessionError> {
        self.ensure_editable()?;
        if self.store.frame(id).is_none() {
            return Err(StoreError::FrameNotFound(id).into());
        }
        if changes.is_empty() {
            return Ok(());
        }
        if options.optimistic {
            self.store.apply_frame_change(id, &changes)?;
        }
        if options.emit {
            self.sink.send_envelope(&Envelope::FrameUpdate {
                frame_id: id,
                changes: changes.clone(),
            });
        }
        if options.persist {
            if options.debounced {
                self.gateway.update_frame_debounced(id, changes);
            } else {
                let gateway = self.gateway.clone();
                self.spawn_write(async move {
                    let _ = gateway.update_frame(id, changes).await;
                });
            }
        }
        Ok(())
    }

    /// Replace the text of a text element. The store and peers see every
    /// keystroke; the write is debounced.
    pub fn edit_text(&mut self, id: ElementId, text: &str) -> Result<(), SessionError> {
        self.ensure_editable()?;
        let element = self
            .store
            .element(id)
            .ok_or(StoreError::ElementNotFound(id))?;
        let ElementContent::Text(current) = &element.content else {
            return Err(SessionError::NotText(id));
        };
        let mut content = current.clone();
        content.text = text.to_string();
        let changes = ElementChanges::content(&ElementContent::Text(content));
        self.update_element(id, changes, UpdateOptions::typing())
    }

    /// Create an element on the server, then add and announce it.
    pub async fn create_element(
        &mut self,
        frame_id: FrameId,
        content: ElementContent,
        position: Position,
    ) -> Result<ElementId, SessionError> {
        self.ensure_editable()?;
        if self.store.frame(frame_id).is_none() {
            return Err(StoreError::FrameNotFound(frame_id).into());
        }
        let draft = ElementRecord::draft(frame_id, &content, &position);
        let element = self.gateway.create_element(draft).await?;
        let id = element.id;
        let record = ElementRecord::from_element(&element);
        self.store.add_element(element)?;
        self.sink.send_envelope(&Envelope::ElementCreate { element: record });
        log::info!("Created element {id} in frame {frame_id}");
        Ok(id)
    }

    /// Create a frame after the last one.
    pub async fn create_frame(&mut self, title: &str) -> Result<FrameId, SessionError> {
        self.ensure_editable()?;
        let order = self.store.max_order().map_or(0, |max| max + 1);
        let draft = FrameRecord::draft(self.store.presentation_id(), title, order);
        let frame = self.gateway.create_frame(draft).await?;
        let id = frame.id;
        let record = FrameRecord::from_frame(&frame);
        self.store.add_frame(frame);
        self.sink.send_envelope(&Envelope::FrameCreate { frame: record });
        log::info!("Created frame {id} at order {order}");
        Ok(id)
    }

    /// Delete on the server, then remove locally and announce.
    pub async fn delete_element(&mut self, id: ElementId) -> Result<(), SessionError> {
        self.ensure_editable()?;
        if self.store.element(id).is_none() {
            return Err(StoreError::ElementNotFound(id).into());
        }
        self.gateway.delete_element(id).await?;
        if self.interaction.state().element_id() == Some(id) {
            self.interaction.cancel();
        }
        self.store.remove_element(id);
        self.sink.send_envelope(&Envelope::ElementDelete { element_id: id });
        Ok(())
    }

    pub async fn delete_frame(&mut self, id: FrameId) -> Result<(), SessionError> {
        self.ensure_editable()?;
        if self.store.frame(id).is_none() {
            return Err(StoreError::FrameNotFound(id).into());
        }
        self.gateway.delete_frame(id).await?;
        let dragged_here = self
            .interaction
            .state()
            .element_id()
            .and_then(|e| self.store.element(e))
            .is_some_and(|e| e.frame_id == id);
        if dragged_here {
            self.interaction.cancel();
        }
        self.store.remove_frame(id);
        self.sink.send_envelope(&Envelope::FrameDelete { frame_id: id });
        Ok(())
    }

    // ───────────────────────────────────────────────────────────────
    // Selection
    // ───────────────────────────────────────────────────────────────

    pub fn select_element(&mut self, id: ElementId) -> Result<(), SessionError> {
        self.store.select_element(id)?;
        self.announce_selection();
        Ok(())
    }

    pub fn select_frame(&mut self, id: FrameId) -> Result<(), SessionError> {
        self.store.select_frame(id)?;
        self.announce_selection();
        Ok(())
    }

    pub fn clear_selection(&mut self) {
        self.store.clear_selection();
        self.announce_selection();
    }

    fn announce_selection(&self) {
        let Selection { frame_id, element_id } = self.store.selection();
        self.sink
            .send_envelope(&self.presence.announce_selection(frame_id, element_id));
    }

    // ───────────────────────────────────────────────────────────────
    // Lifecycle
    // ───────────────────────────────────────────────────────────────

    /// Re-fetch the snapshot, e.g. after the transport gave up. Any
    /// in-progress interaction is abandoned.
    pub async fn reload(&mut self) -> Result<(), SessionError> {
        let presentation = self
            .gateway
            .fetch_presentation(self.store.presentation_id())
            .await?;
        self.interaction.cancel();
        self.store.load_snapshot(presentation);
        Ok(())
    }

    /// Number of debounced writes not yet sent.
    pub fn pending_writes(&self) -> usize {
        self.gateway.pending_count()
    }

    /// Commit any running interaction, wait for in-flight writes, flush
    /// debounced ones and close the transport.
    pub async fn close(mut self) {
        if let Some(commit) = self.interaction.cancel() {
            self.commit(commit);
        }
        while self.writes.join_next().await.is_some() {}
        self.gateway.flush().await;
        self.sink.shutdown();
        self.presence.clear();
        log::info!("Closed presentation {}", self.config.presentation_id);
    }

    fn spawn_write<F>(&mut self, write: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        while self.writes.try_join_next().is_some() {}
        self.writes.spawn(write);
    }
}
