//! Integration tests for participant presence.
//!
//! These tests start a real relay and connect sessions and raw clients,
//! verifying join/leave announcements, roster bootstrap for newcomers and
//! selection sync through the full network stack.

use std::sync::Arc;

use async_trait::async_trait;
use deck_collab::persistence::{
    BackendResponse, Credentials, PersistError, PersistRequest, PersistenceGateway, RecordBackend,
};
use deck_collab::{DocumentSession, RelayConfig, RelayServer, RoomManager, SessionConfig};
use deck_core::{ElementId, FrameId, ParticipantId, PresentationId};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Serves one presentation with a single frame holding element 10.
struct SnapshotBackend;

#[async_trait]
impl RecordBackend for SnapshotBackend {
    async fn execute(&self, request: &PersistRequest, _: &str) -> Result<BackendResponse, PersistError> {
        let body = match request {
            PersistRequest::FetchPresentation(_) => json!({
                "id": 1,
                "title": "Roadmap",
                "current_user_permission": "EDITOR",
                "frames": [{
                    "id": 1,
                    "title": "Intro",
                    "order": 0,
                    "elements": [{
                        "id": 10,
                        "element_type": "TEXT",
                        "position": "{\"x\":0,\"y\":0,\"width\":200,\"height\":50}"
                    }]
                }]
            }),
            _ => Value::Null,
        };
        Ok(BackendResponse { status: 200, body })
    }
}

async fn start_relay() -> String {
    let (addr, _task) = RelayServer::new(RelayConfig::new("127.0.0.1:0"))
        .spawn()
        .await
        .unwrap();
    format!("ws://{addr}")
}

async fn join(ws: &str, user: i64, name: &str) -> DocumentSession {
    let config = SessionConfig::for_testing(
        "http://127.0.0.1:1/api",
        ws,
        PresentationId(1),
        ParticipantId(user),
        name,
    );
    let gateway = PersistenceGateway::new(
        Arc::new(SnapshotBackend),
        Credentials::new("token"),
        config.debounce_delay(),
    );
    let mut session = DocumentSession::connect(config, gateway).await.unwrap();
    assert!(
        session.pump_until(Duration::from_secs(3), |s| s.is_connected()).await,
        "{name} should connect"
    );
    session
}

fn knows(id: i64) -> impl FnMut(&DocumentSession) -> bool {
    move |s| s.presence().participant(ParticipantId(id)).is_some()
}

// ─── Join / leave ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_join_announced_to_existing_peer() {
    let ws = start_relay().await;
    let mut ana = join(&ws, 1, "Ana").await;
    let _bo = join(&ws, 2, "Bo").await;

    assert!(ana.pump_until(Duration::from_secs(3), knows(2)).await);
    let bo = ana.presence().participant(ParticipantId(2)).unwrap();
    assert_eq!(bo.display_name, "Bo");
    assert!(ana.presence().participant(ParticipantId(1)).is_none(), "local user is not listed");
}

#[tokio::test]
async fn test_newcomer_bootstrapped_with_roster() {
    let ws = start_relay().await;
    let _ana = join(&ws, 1, "Ana").await;
    let _bo = join(&ws, 2, "Bo").await;
    let mut cy = join(&ws, 3, "Cy").await;

    assert!(
        cy.pump_until(Duration::from_secs(3), |s| s.presence().len() == 2)
            .await
    );
    let names: Vec<&str> = cy
        .presence()
        .participants()
        .into_iter()
        .map(|p| p.display_name.as_str())
        .collect();
    assert_eq!(names, vec!["Ana", "Bo"]);
}

#[tokio::test]
async fn test_leave_removes_participant() {
    let ws = start_relay().await;
    let mut ana = join(&ws, 1, "Ana").await;
    let bo = join(&ws, 2, "Bo").await;
    assert!(ana.pump_until(Duration::from_secs(3), knows(2)).await);

    bo.close().await;
    assert!(
        ana.pump_until(Duration::from_secs(3), |s| s.presence().is_empty())
            .await
    );
}

#[tokio::test]
async fn test_rejoin_after_leave() {
    let ws = start_relay().await;
    let mut ana = join(&ws, 1, "Ana").await;
    let bo = join(&ws, 2, "Bo").await;
    assert!(ana.pump_until(Duration::from_secs(3), knows(2)).await);

    bo.close().await;
    assert!(
        ana.pump_until(Duration::from_secs(3), |s| s.presence().is_empty())
            .await
    );

    let _bo = join(&ws, 2, "Bo").await;
    assert!(ana.pump_until(Duration::from_secs(3), knows(2)).await);
    assert_eq!(ana.presence().len(), 1);
}

#[tokio::test]
async fn test_second_tab_keeps_participant_present() {
    let ws = start_relay().await;
    let mut ana = join(&ws, 1, "Ana").await;
    let first_tab = join(&ws, 2, "Bo").await;
    let _second_tab = join(&ws, 2, "Bo").await;
    assert!(ana.pump_until(Duration::from_secs(3), knows(2)).await);

    first_tab.close().await;
    ana.pump_until(Duration::from_millis(400), |_| false).await;
    assert!(
        ana.presence().participant(ParticipantId(2)).is_some(),
        "Bo still has an open connection"
    );
}

#[tokio::test]
async fn test_abrupt_disconnects_leave_no_ghosts() {
    let server = RelayServer::new(RelayConfig::new("127.0.0.1:0"));
    let rooms: Arc<RoomManager> = server.rooms().clone();
    let (addr, _task) = server.spawn().await.unwrap();
    let ws = format!("ws://{addr}");
    let mut ana = join(&ws, 1, "Ana").await;

    // Each client is dropped right after the handshake, while the relay is
    // still sending it the roster.
    for user in 20..25 {
        let url = format!("{ws}/ws/presentations/1/?user_id={user}&username=Gone&permission=EDITOR");
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
        drop(socket);
    }

    let settled = timeout(Duration::from_secs(3), async {
        loop {
            if let Some(room) = rooms.room(PresentationId(1)).await {
                if room.peer_count().await == 1 {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(settled.is_ok(), "dropped connections should be unregistered");
    assert_eq!(rooms.room_count().await, 1);
    assert!(
        ana.pump_until(Duration::from_secs(3), |s| s.presence().is_empty())
            .await
    );

    let mut cy = join(&ws, 3, "Cy").await;
    assert!(cy.pump_until(Duration::from_secs(3), knows(1)).await);
    cy.pump_until(Duration::from_millis(200), |_| false).await;
    assert_eq!(cy.presence().len(), 1, "only Ana is announced to the newcomer");
}

// ─── Selection ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_selection_sync() {
    let ws = start_relay().await;
    let mut ana = join(&ws, 1, "Ana").await;
    let mut bo = join(&ws, 2, "Bo").await;
    assert!(ana.pump_until(Duration::from_secs(3), knows(2)).await);

    bo.select_element(ElementId(10)).unwrap();
    assert!(
        ana.pump_until(Duration::from_secs(3), |s| {
            s.presence()
                .participant(ParticipantId(2))
                .is_some_and(|p| p.current_element_id == Some(ElementId(10)))
        })
        .await
    );
    let bo_view = ana.presence().participant(ParticipantId(2)).unwrap();
    assert_eq!(bo_view.current_frame_id, Some(FrameId(1)));
    assert_eq!(ana.presence().participants_on_element(ElementId(10)).len(), 1);
    assert_eq!(ana.store().selection().element_id, None, "remote selection is not local");

    bo.clear_selection();
    assert!(
        ana.pump_until(Duration::from_secs(3), |s| {
            s.presence()
                .participant(ParticipantId(2))
                .is_some_and(|p| p.current_element_id.is_none())
        })
        .await
    );
}

#[tokio::test]
async fn test_raw_client_sees_attributed_selection() {
    let ws = start_relay().await;
    let mut ana = join(&ws, 1, "Ana").await;

    let url = format!("{ws}/ws/presentations/1/?user_id=7&username=Obs&permission=VIEWER");
    let (mut observer, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    assert!(ana.pump_until(Duration::from_secs(3), knows(7)).await);

    ana.select_frame(FrameId(1)).unwrap();

    let mut attributed = None;
    while let Ok(Some(Ok(msg))) = timeout(Duration::from_secs(2), observer.next()).await {
        if let Message::Text(text) = msg {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == "user_selection" {
                attributed = Some(value);
                break;
            }
        }
    }
    let value = attributed.expect("observer should see the selection");
    assert_eq!(value["frame_id"], 1);
    assert_eq!(value["user_id"], 1);
    assert_eq!(value["username"], "Ana");
}
