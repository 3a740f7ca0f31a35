//! Persistence gateway: authenticated create/update/delete against the
//! server of record.
//!
//! ```text
//! session ──► PersistenceGateway ──► RecordBackend ──► REST API
//!                 │   ▲                (HttpBackend: reqwest + bearer)
//!                 │   └── pending debounced writes (per element / frame)
//!                 ▼
//!            PersistEvent (auth required, write failed)
//! ```
//!
//! Writes are fire-and-forget from the document's point of view: the store
//! has already been updated and nothing is rolled back on failure. A 401
//! clears the credential and asks the embedding application to
//! re-authenticate; every other non-2xx is logged and reported as
//! recoverable.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use deck_core::{
    Element, ElementChanges, ElementId, ElementRecord, Frame, FrameChanges, FrameId, FrameRecord,
    Presentation, PresentationId, PresentationRecord,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("no credential available")]
    MissingCredential,
    #[error("credential rejected (401)")]
    Unauthorized,
    #[error("server rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("request failed: {0}")]
    Network(String),
    #[error("unexpected response body: {0}")]
    Decode(String),
}

impl PersistError {
    /// Whether retrying later (or doing nothing) is acceptable.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PersistError::MissingCredential | PersistError::Unauthorized)
    }
}

/// Notifications for the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistEvent {
    /// The credential is missing or was rejected; sign in again.
    AuthenticationRequired,
    WriteFailed { request: String, status: Option<u16> },
}

/// Shared bearer credential. Cleared on a 401.
#[derive(Debug, Clone, Default)]
pub struct Credentials(Arc<RwLock<Option<String>>>);

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(Some(token.into()))))
    }

    pub fn get(&self) -> Option<String> {
        match self.0.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set(&self, token: impl Into<String>) {
        self.replace(Some(token.into()));
    }

    pub fn clear(&self) {
        self.replace(None);
    }

    pub fn is_present(&self) -> bool {
        self.get().is_some()
    }

    fn replace(&self, value: Option<String>) {
        match self.0.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// One REST call against the server of record.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistRequest {
    FetchPresentation(PresentationId),
    CreateFrame(FrameRecord),
    CreateElement(ElementRecord),
    UpdateFrame(FrameId, FrameChanges),
    UpdateElement(ElementId, ElementChanges),
    DeleteFrame(FrameId),
    DeleteElement(ElementId),
}

impl PersistRequest {
    pub fn method(&self) -> HttpMethod {
        match self {
            PersistRequest::FetchPresentation(_) => HttpMethod::Get,
            PersistRequest::CreateFrame(_) | PersistRequest::CreateElement(_) => HttpMethod::Post,
            PersistRequest::UpdateFrame(..) | PersistRequest::UpdateElement(..) => HttpMethod::Patch,
            PersistRequest::DeleteFrame(_) | PersistRequest::DeleteElement(_) => HttpMethod::Delete,
        }
    }

    /// Path relative to the API root, always with a trailing slash.
    pub fn path(&self) -> String {
        match self {
            PersistRequest::FetchPresentation(id) => format!("/presentations/{id}/"),
            PersistRequest::CreateFrame(_) => "/frames/".to_string(),
            PersistRequest::CreateElement(_) => "/elements/".to_string(),
            PersistRequest::UpdateFrame(id, _) | PersistRequest::DeleteFrame(id) => {
                format!("/frames/{id}/")
            }
            PersistRequest::UpdateElement(id, _) | PersistRequest::DeleteElement(id) => {
                format!("/elements/{id}/")
            }
        }
    }

    pub fn body(&self) -> Option<Value> {
        let body = match self {
            PersistRequest::CreateFrame(record) => serde_json::to_value(record),
            PersistRequest::CreateElement(record) => serde_json::to_value(record),
            PersistRequest::UpdateFrame(_, changes) => Ok(changes.to_json()),
            PersistRequest::UpdateElement(_, changes) => Ok(changes.to_json()),
            _ => return None,
        };
        body.ok()
    }
}

impl fmt::Display for PersistRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method().as_str(), self.path())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub status: u16,
    /// Parsed JSON body; `Null` when empty.
    pub body: Value,
}

/// Executes requests against the server of record.
#[async_trait]
pub trait RecordBackend: Send + Sync {
    async fn execute(
        &self,
        request: &PersistRequest,
        credential: &str,
    ) -> Result<BackendResponse, PersistError>;
}

/// REST backend over `reqwest`.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, PersistError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PersistError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl RecordBackend for HttpBackend {
    async fn execute(
        &self,
        request: &PersistRequest,
        credential: &str,
    ) -> Result<BackendResponse, PersistError> {
        let url = format!("{}{}", self.base_url, request.path());
        let builder = match request.method() {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };
        let builder = builder.bearer_auth(credential);
        let builder = match request.body() {
            Some(body) => builder.json(&body),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| PersistError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| PersistError::Network(e.to_string()))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        Ok(BackendResponse { status, body })
    }
}

struct PendingWrite<C> {
    changes: C,
    generation: u64,
}

#[derive(Default)]
struct Pending {
    elements: HashMap<ElementId, PendingWrite<ElementChanges>>,
    frames: HashMap<FrameId, PendingWrite<FrameChanges>>,
    generation: u64,
}

struct GatewayInner {
    backend: Arc<dyn RecordBackend>,
    credentials: Credentials,
    events: mpsc::Sender<PersistEvent>,
    pending: Mutex<Pending>,
}

impl GatewayInner {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn notify(&self, event: PersistEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::debug!("Persistence event not delivered: {e}");
        }
    }

    async fn send(&self, request: PersistRequest) -> Result<Value, PersistError> {
        let Some(token) = self.credentials.get() else {
            log::error!("{request} skipped: not authenticated");
            self.notify(PersistEvent::AuthenticationRequired);
            return Err(PersistError::MissingCredential);
        };

        let response = match self.backend.execute(&request, &token).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("{request} failed: {e}");
                self.notify(PersistEvent::WriteFailed {
                    request: request.to_string(),
                    status: None,
                });
                return Err(e);
            }
        };

        match response.status {
            200..=299 => {
                log::debug!("{request} -> {}", response.status);
                Ok(response.body)
            }
            401 => {
                log::warn!("{request} unauthorized, clearing credential");
                self.credentials.clear();
                self.notify(PersistEvent::AuthenticationRequired);
                Err(PersistError::Unauthorized)
            }
            status => {
                log::warn!("{request} rejected with {status}: {}", response.body);
                self.notify(PersistEvent::WriteFailed {
                    request: request.to_string(),
                    status: Some(status),
                });
                Err(PersistError::Rejected {
                    status,
                    body: response.body.to_string(),
                })
            }
        }
    }

    async fn flush_element(&self, id: ElementId, generation: u64) {
        let changes = {
            let mut pending = self.pending();
            match pending.elements.get(&id) {
                Some(write) if write.generation == generation => {
                    pending.elements.remove(&id).map(|w| w.changes)
                }
                // Superseded by a newer edit or already flushed.
                _ => None,
            }
        };
        if let Some(changes) = changes {
            let _ = self.send(PersistRequest::UpdateElement(id, changes)).await;
        }
    }

    async fn flush_frame(&self, id: FrameId, generation: u64) {
        let changes = {
            let mut pending = self.pending();
            match pending.frames.get(&id) {
                Some(write) if write.generation == generation => {
                    pending.frames.remove(&id).map(|w| w.changes)
                }
                _ => None,
            }
        };
        if let Some(changes) = changes {
            let _ = self.send(PersistRequest::UpdateFrame(id, changes)).await;
        }
    }
}

pub struct PersistenceGateway {
    inner: Arc<GatewayInner>,
    debounce: Duration,
    event_rx: Option<mpsc::Receiver<PersistEvent>>,
}

impl PersistenceGateway {
    pub fn new(backend: Arc<dyn RecordBackend>, credentials: Credentials, debounce: Duration) -> Self {
        let (events, event_rx) = mpsc::channel(64);
        Self {
            inner: Arc::new(GatewayInner {
                backend,
                credentials,
                events,
                pending: Mutex::new(Pending::default()),
            }),
            debounce,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<PersistEvent>> {
        self.event_rx.take()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub async fn fetch_presentation(&self, id: PresentationId) -> Result<Presentation, PersistError> {
        let body = self.inner.send(PersistRequest::FetchPresentation(id)).await?;
        let record: PresentationRecord =
            serde_json::from_value(body).map_err(|e| PersistError::Decode(e.to_string()))?;
        record.hydrate().map_err(|e| PersistError::Decode(e.to_string()))
    }

    pub async fn create_element(&self, draft: ElementRecord) -> Result<Element, PersistError> {
        let body = self.inner.send(PersistRequest::CreateElement(draft)).await?;
        let record: ElementRecord =
            serde_json::from_value(body).map_err(|e| PersistError::Decode(e.to_string()))?;
        record.hydrate(None).map_err(|e| PersistError::Decode(e.to_string()))
    }

    pub async fn create_frame(&self, draft: FrameRecord) -> Result<Frame, PersistError> {
        let body = self.inner.send(PersistRequest::CreateFrame(draft)).await?;
        let record: FrameRecord =
            serde_json::from_value(body).map_err(|e| PersistError::Decode(e.to_string()))?;
        record.hydrate().map_err(|e| PersistError::Decode(e.to_string()))
    }

    /// Write immediately. Pending debounced fields for the same element are
    /// folded in underneath `changes` so they are not lost.
    pub async fn update_element(&self, id: ElementId, changes: ElementChanges) -> Result<(), PersistError> {
        let merged = match self.inner.pending().elements.remove(&id) {
            Some(mut pending) => {
                pending.changes.merge(changes);
                pending.changes
            }
            None => changes,
        };
        self.inner.send(PersistRequest::UpdateElement(id, merged)).await.map(|_| ())
    }

    pub async fn update_frame(&self, id: FrameId, changes: FrameChanges) -> Result<(), PersistError> {
        let merged = match self.inner.pending().frames.remove(&id) {
            Some(mut pending) => {
                pending.changes.merge(changes);
                pending.changes
            }
            None => changes,
        };
        self.inner.send(PersistRequest::UpdateFrame(id, merged)).await.map(|_| ())
    }

    /// Coalesce `changes` with other pending edits of the element and write
    /// them once no further edit arrived for the debounce delay.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn update_element_debounced(&self, id: ElementId, changes: ElementChanges) {
        let generation = {
            let mut pending = self.inner.pending();
            pending.generation += 1;
            let generation = pending.generation;
            match pending.elements.get_mut(&id) {
                Some(write) => {
                    write.changes.merge(changes);
                    write.generation = generation;
                }
                None => {
                    pending.elements.insert(id, PendingWrite { changes, generation });
                }
            }
            generation
        };

        let inner = self.inner.clone();
        let delay = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_element(id, generation).await;
        });
    }

    pub fn update_frame_debounced(&self, id: FrameId, changes: FrameChanges) {
        let generation = {
            let mut pending = self.inner.pending();
            pending.generation += 1;
            let generation = pending.generation;
            match pending.frames.get_mut(&id) {
                Some(write) => {
                    write.changes.merge(changes);
                    write.generation = generation;
                }
                None => {
                    pending.frames.insert(id, PendingWrite { changes, generation });
                }
            }
            generation
        };

        let inner = self.inner.clone();
        let delay = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.flush_frame(id, generation).await;
        });
    }

    pub async fn delete_element(&self, id: ElementId) -> Result<(), PersistError> {
        self.inner.pending().elements.remove(&id);
        self.inner.send(PersistRequest::DeleteElement(id)).await.map(|_| ())
    }

    pub async fn delete_frame(&self, id: FrameId) -> Result<(), PersistError> {
        self.inner.pending().frames.remove(&id);
        self.inner.send(PersistRequest::DeleteFrame(id)).await.map(|_| ())
    }

    /// Write every pending debounced edit now.
    pub async fn flush(&self) -> usize {
        let (elements, frames) = {
            let mut pending = self.inner.pending();
            (
                pending.elements.drain().collect::<Vec<_>>(),
                pending.frames.drain().collect::<Vec<_>>(),
            )
        };
        let count = elements.len() + frames.len();
        for (id, write) in elements {
            let _ = self.inner.send(PersistRequest::UpdateElement(id, write.changes)).await;
        }
        for (id, write) in frames {
            let _ = self.inner.send(PersistRequest::UpdateFrame(id, write.changes)).await;
        }
        if count > 0 {
            log::info!("Flushed {count} pending writes");
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        let pending = self.inner.pending();
        pending.elements.len() + pending.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deck_core::{ElementContent, ElementKind, Position, TextContent};
    use serde_json::json;

    /// Records requests and answers with a fixed status.
    struct ScriptedBackend {
        status: u16,
        body: Value,
        seen: Mutex<Vec<(PersistRequest, String)>>,
    }

    impl ScriptedBackend {
        fn new(status: u16, body: Value) -> Arc<Self> {
            Arc::new(Self {
                status,
                body,
                seen: Mutex::new(Vec::new()),
            })
        }

        fn requests(&self) -> Vec<(PersistRequest, String)> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RecordBackend for ScriptedBackend {
        async fn execute(
            &self,
            request: &PersistRequest,
            credential: &str,
        ) -> Result<BackendResponse, PersistError> {
            self.seen
                .lock()
                .unwrap()
                .push((request.clone(), credential.to_string()));
            Ok(BackendResponse {
                status: self.status,
                body: self.body.clone(),
            })
        }
    }

    fn text_changes(text: &str) -> ElementChanges {
        ElementChanges::content(&ElementContent::Text(TextContent {
            text: text.to_string(),
            ..TextContent::default()
        }))
    }

    #[test]
    fn test_request_paths() {
        assert_eq!(PersistRequest::FetchPresentation(PresentationId(3)).path(), "/presentations/3/");
        assert_eq!(PersistRequest::DeleteFrame(FrameId(4)).to_string(), "DELETE /frames/4/");
        assert_eq!(
            PersistRequest::UpdateElement(ElementId(5), ElementChanges::default()).method(),
            HttpMethod::Patch
        );
        assert!(PersistRequest::DeleteElement(ElementId(1)).body().is_none());
    }

    #[tokio::test]
    async fn test_bearer_credential_sent() {
        let backend = ScriptedBackend::new(200, Value::Null);
        let gateway = PersistenceGateway::new(backend.clone(), Credentials::new("tok"), Duration::from_millis(500));

        gateway.delete_element(ElementId(1)).await.unwrap();
        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "tok");
    }

    #[tokio::test]
    async fn test_unauthorized_clears_credential() {
        let backend = ScriptedBackend::new(401, json!({"detail": "expired"}));
        let credentials = Credentials::new("tok");
        let mut gateway = PersistenceGateway::new(backend, credentials.clone(), Duration::from_millis(500));
        let mut events = gateway.take_event_rx().unwrap();

        let err = gateway
            .update_element(ElementId(1), text_changes("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Unauthorized));
        assert!(!err.is_recoverable());
        assert!(!credentials.is_present());
        assert_eq!(events.recv().await, Some(PersistEvent::AuthenticationRequired));

        // Nothing is sent without a credential.
        let err = gateway.delete_frame(FrameId(1)).await.unwrap_err();
        assert!(matches!(err, PersistError::MissingCredential));
    }

    #[tokio::test]
    async fn test_server_error_is_recoverable() {
        let backend = ScriptedBackend::new(500, json!("boom"));
        let credentials = Credentials::new("tok");
        let mut gateway = PersistenceGateway::new(backend, credentials.clone(), Duration::from_millis(500));
        let mut events = gateway.take_event_rx().unwrap();

        let err = gateway
            .update_frame(FrameId(1), FrameChanges::title("T"))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Rejected { status: 500, .. }));
        assert!(err.is_recoverable());
        assert!(credentials.is_present());
        assert_eq!(
            events.recv().await,
            Some(PersistEvent::WriteFailed {
                request: "PATCH /frames/1/".to_string(),
                status: Some(500)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_edits() {
        let backend = ScriptedBackend::new(200, Value::Null);
        let gateway = PersistenceGateway::new(backend.clone(), Credentials::new("tok"), Duration::from_millis(800));

        gateway.update_element_debounced(ElementId(1), text_changes("H"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        gateway.update_element_debounced(ElementId(1), text_changes("He"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        gateway.update_element_debounced(ElementId(1), text_changes("Hey"));
        assert_eq!(gateway.pending_count(), 1);
        assert!(backend.requests().is_empty());

        tokio::time::sleep(Duration::from_millis(1000)).await;

        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        match &seen[0].0 {
            PersistRequest::UpdateElement(id, changes) => {
                assert_eq!(*id, ElementId(1));
                assert_eq!(changes, &text_changes("Hey"));
            }
            other => panic!("Expected element update, got {other:?}"),
        }
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_update_absorbs_pending() {
        let backend = ScriptedBackend::new(200, Value::Null);
        let gateway = PersistenceGateway::new(backend.clone(), Credentials::new("tok"), Duration::from_millis(800));

        gateway.update_element_debounced(ElementId(1), text_changes("typed"));
        gateway
            .update_element(ElementId(1), ElementChanges::position(&Position::new(1.0, 2.0, 300.0, 50.0)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1000)).await;

        let seen = backend.requests();
        assert_eq!(seen.len(), 1);
        match &seen[0].0 {
            PersistRequest::UpdateElement(_, changes) => {
                assert!(changes.content.is_some());
                assert!(changes.position.is_some());
            }
            other => panic!("Expected element update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_flush_writes_pending() {
        let backend = ScriptedBackend::new(200, Value::Null);
        let gateway = PersistenceGateway::new(backend.clone(), Credentials::new("tok"), Duration::from_secs(1));

        gateway.update_element_debounced(ElementId(1), text_changes("a"));
        gateway.update_frame_debounced(FrameId(2), FrameChanges::title("b"));
        assert_eq!(gateway.flush().await, 2);
        assert_eq!(backend.requests().len(), 2);
        assert_eq!(gateway.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_create_element_hydrates_response() {
        let backend = ScriptedBackend::new(
            201,
            json!({"id": 77, "frame": 3, "element_type": "TEXT", "position": null}),
        );
        let gateway = PersistenceGateway::new(backend.clone(), Credentials::new("tok"), Duration::from_millis(500));

        let draft = ElementRecord::draft(
            FrameId(3),
            &ElementContent::default_for(ElementKind::Text),
            &Position::new(100.0, 100.0, 400.0, 100.0),
        );
        let element = gateway.create_element(draft).await.unwrap();
        assert_eq!(element.id, ElementId(77));
        assert_eq!(element.position, Position::default());
        assert!(matches!(backend.requests()[0].0, PersistRequest::CreateElement(_)));
    }
}
