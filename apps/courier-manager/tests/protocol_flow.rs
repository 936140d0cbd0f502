use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Request, StatusCode},
    Router,
};
use courier_manager::{
    build_router, clock::ManualClock, config::AppConfig, store::MemoryStore, AppState,
};
use courier_proto::{DEVICE_CREDENTIAL_HEADER, LEASE_TOKEN_HEADER};
use serde_json::{json, Value};
use tower::util::ServiceExt;
use uuid::Uuid;

struct Harness {
    app: Router,
    clock: ManualClock,
}

struct Agent {
    device_id: String,
    credential: String,
    lease_id: String,
    lease_token: String,
}

impl Harness {
    fn new() -> Self {
        let clock = ManualClock::new(1_000_000);
        let state = AppState::with_store(
            AppConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(clock.clone()),
        );
        Self {
            app: build_router(state),
            clock,
        }
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    async fn agent_call(
        &self,
        agent: &Agent,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(DEVICE_CREDENTIAL_HEADER, &agent.credential)
            .header(LEASE_TOKEN_HEADER, &agent.lease_token);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        };
        self.send(request.unwrap()).await
    }

    async fn pair(&self, moderator_id: i64, device_id: &str) -> Agent {
        let (status, issued) = self
            .post(&format!("/moderators/{moderator_id}/pairing-codes"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, paired) = self
            .post(
                "/pairing/complete",
                json!({
                    "pairing_code": issued["pairing_code"],
                    "device_id": device_id,
                    "device_name": format!("{device_id} browser"),
                    "client_version": "0.1.0",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        Agent {
            device_id: device_id.to_string(),
            credential: paired["device_credential"].as_str().unwrap().to_string(),
            lease_id: String::new(),
            lease_token: String::new(),
        }
    }

    async fn acquire(&self, agent: &mut Agent, force: bool) -> StatusCode {
        let (status, grant) = self
            .send(
                Request::builder()
                    .method("POST")
                    .uri("/leases")
                    .header("content-type", "application/json")
                    .header(DEVICE_CREDENTIAL_HEADER, &agent.credential)
                    .body(Body::from(
                        json!({ "device_id": agent.device_id, "force_takeover": force })
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await;
        if status == StatusCode::OK {
            agent.lease_id = grant["lease_id"].as_str().unwrap().to_string();
            agent.lease_token = grant["lease_token"].as_str().unwrap().to_string();
        }
        status
    }

    async fn heartbeat(&self, agent: &Agent, observed: &str) -> StatusCode {
        let uri = format!("/leases/{}/heartbeat", agent.lease_id);
        self.agent_call(
            agent,
            "POST",
            &uri,
            Some(json!({ "observed_status": observed })),
        )
        .await
        .0
    }

    async fn poll(&self, agent: &Agent) -> (StatusCode, Vec<Value>) {
        let (status, body) = self
            .agent_call(agent, "GET", "/commands/pending", None)
            .await;
        let commands = body.as_array().cloned().unwrap_or_default();
        (status, commands)
    }

    async fn complete(&self, agent: &Agent, command_id: &str, result: Value) -> StatusCode {
        let uri = format!("/commands/{command_id}/complete");
        self.agent_call(agent, "POST", &uri, Some(json!({ "result": result })))
            .await
            .0
    }

    async fn submit(&self, moderator_id: i64, session_id: Uuid) -> Value {
        let (status, message) = self
            .post(
                &format!("/moderators/{moderator_id}/messages"),
                json!({
                    "session_id": session_id,
                    "recipient": "+15551234567",
                    "content": "Your appointment is confirmed.",
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        message
    }
}

#[tokio::test]
async fn message_is_sent_once_and_quota_charged_once() {
    let h = Harness::new();
    let mut agent = h.pair(11, "desk-1").await;
    assert_eq!(h.acquire(&mut agent, false).await, StatusCode::OK);
    assert_eq!(h.heartbeat(&agent, "connected").await, StatusCode::OK);

    let message = h.submit(11, Uuid::new_v4()).await;
    assert_eq!(message["status"], "dispatched");

    let (status, pending) = h.poll(&agent).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.len(), 1);
    let command_id = pending[0]["id"].as_str().unwrap().to_string();
    assert_eq!(pending[0]["command_type"], "send_message");

    // Still pending until acked.
    let (_, again) = h.poll(&agent).await;
    assert_eq!(again.len(), 1);
    let (status, _) = h
        .agent_call(&agent, "POST", &format!("/commands/{command_id}/ack"), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, after_ack) = h.poll(&agent).await;
    assert!(after_ack.is_empty());

    let sent = json!({ "status": "sent", "attempts": 1, "data": { "marker": "double" } });
    assert_eq!(h.complete(&agent, &command_id, sent.clone()).await, StatusCode::OK);
    // A retried completion is accepted but changes nothing.
    let failed = json!({ "status": "failed", "failure": "timeout", "attempts": 1 });
    assert_eq!(h.complete(&agent, &command_id, failed).await, StatusCode::OK);

    let (_, quota) = h.get("/moderators/11/quota").await;
    assert_eq!(quota["used"], 1);
    let (_, message) = h
        .get(&format!("/messages/{}", message["id"].as_str().unwrap()))
        .await;
    assert_eq!(message["status"], "sent");

    let (_, view) = h
        .get(&format!("/moderators/11/commands/{command_id}"))
        .await;
    assert_eq!(view["state"], "completed");
    assert_eq!(view["result"]["status"], "sent");
}

#[tokio::test]
async fn takeover_fences_the_old_device() {
    let h = Harness::new();
    let mut first = h.pair(12, "laptop").await;
    let mut second = h.pair(12, "tablet").await;
    assert_eq!(h.acquire(&mut first, false).await, StatusCode::OK);

    let message = h.submit(12, Uuid::new_v4()).await;
    let (_, pending) = h.poll(&first).await;
    assert_eq!(pending.len(), 1);
    let stale_command = pending[0]["id"].as_str().unwrap().to_string();

    assert_eq!(h.acquire(&mut second, false).await, StatusCode::CONFLICT);
    assert_eq!(h.acquire(&mut second, true).await, StatusCode::OK);

    let (status, _) = h.poll(&first).await;
    assert_eq!(status, StatusCode::GONE);
    assert_eq!(h.heartbeat(&first, "connected").await, StatusCode::GONE);
    let late = json!({ "status": "sent", "attempts": 1 });
    assert_eq!(
        h.complete(&first, &stale_command, late).await,
        StatusCode::GONE
    );

    let (_, message) = h
        .get(&format!("/messages/{}", message["id"].as_str().unwrap()))
        .await;
    assert_eq!(message["attempts"], 1);

    let (status, pending) = h.poll(&second).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0]["id"].as_str().unwrap(), stale_command);

    let (_, events) = h.get("/moderators/12/lease-events?limit=10").await;
    let kinds: Vec<_> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|event| event["kind"].as_str().unwrap_or_default().to_string())
        .collect();
    assert!(kinds.iter().any(|kind| kind == "taken_over"));
}

#[tokio::test]
async fn pending_qr_pauses_until_the_surface_reconnects() {
    let h = Harness::new();
    let mut agent = h.pair(13, "kiosk").await;
    assert_eq!(h.acquire(&mut agent, false).await, StatusCode::OK);
    assert_eq!(h.heartbeat(&agent, "connected").await, StatusCode::OK);

    let message = h.submit(13, Uuid::new_v4()).await;
    let (_, pending) = h.poll(&agent).await;
    let command_id = pending[0]["id"].as_str().unwrap().to_string();
    let qr = json!({ "status": "pending_qr", "attempts": 0, "detail": "qr code shown" });
    assert_eq!(h.complete(&agent, &command_id, qr).await, StatusCode::OK);

    let (status, pause) = h.get("/moderators/13/pause").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pause["reason"], "pending_qr");
    let (status, body) = h.post("/moderators/13/resume", json!({})).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_resumable");

    let (_, queued) = h
        .get(&format!("/messages/{}", message["id"].as_str().unwrap()))
        .await;
    assert_eq!(queued["status"], "queued");
    assert_eq!(queued["attempts"], 0);

    assert_eq!(h.heartbeat(&agent, "qr_pending").await, StatusCode::OK);
    assert_eq!(h.heartbeat(&agent, "connected").await, StatusCode::OK);
    let (status, _) = h.get("/moderators/13/pause").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, pending) = h.poll(&agent).await;
    assert_eq!(pending.len(), 1);
    assert_ne!(pending[0]["id"].as_str().unwrap(), command_id);
}

#[tokio::test]
async fn pending_qr_clears_on_an_unchanged_connected_heartbeat() {
    let h = Harness::new();
    let mut agent = h.pair(14, "kiosk").await;
    assert_eq!(h.acquire(&mut agent, false).await, StatusCode::OK);
    assert_eq!(h.heartbeat(&agent, "connected").await, StatusCode::OK);

    h.submit(14, Uuid::new_v4()).await;
    let (_, pending) = h.poll(&agent).await;
    let command_id = pending[0]["id"].as_str().unwrap().to_string();
    let qr = json!({ "status": "pending_qr", "attempts": 0, "detail": "qr code shown" });
    assert_eq!(h.complete(&agent, &command_id, qr).await, StatusCode::OK);
    let (status, _) = h.get("/moderators/14/pause").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(h.heartbeat(&agent, "connected").await, StatusCode::OK);
    let (status, _) = h.get("/moderators/14/pause").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, pending) = h.poll(&agent).await;
    assert_eq!(pending.len(), 1);
}

#[tokio::test]
async fn silent_agent_loses_its_lease() {
    let h = Harness::new();
    let mut agent = h.pair(14, "desk").await;
    assert_eq!(h.acquire(&mut agent, false).await, StatusCode::OK);
    let (status, lease) = h.get("/moderators/14/lease").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(lease["device_id"], "desk");

    h.clock.advance_ms(AppConfig::default().lease_ttl_ms as i64 + 1);
    assert_eq!(h.heartbeat(&agent, "connected").await, StatusCode::GONE);
    let (status, _) = h.get("/moderators/14/lease").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Any device of the moderator may now acquire without forcing.
    let mut other = h.pair(14, "spare").await;
    assert_eq!(h.acquire(&mut other, false).await, StatusCode::OK);
}

#[tokio::test]
async fn revoked_device_cannot_come_back() {
    let h = Harness::new();
    let mut agent = h.pair(15, "lost-phone").await;
    assert_eq!(h.acquire(&mut agent, false).await, StatusCode::OK);

    let (status, _) = h
        .post("/devices/lost-phone/revoke", json!({ "reason": "stolen" }))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = h.poll(&agent).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.is_empty());
    assert_eq!(h.acquire(&mut agent, false).await, StatusCode::UNAUTHORIZED);

    let (_, devices) = h.get("/moderators/15/devices").await;
    assert_eq!(devices[0]["revoked"], true);
    assert!(devices[0].get("credential_hash").is_none());
}
