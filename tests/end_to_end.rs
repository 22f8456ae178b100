use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceExt;

use soulbrowser_agent_link::{CallbackClient, CallbackPayload, EnvelopeIntake};
use soulbrowser_control::control::{ChannelLink, CommandState};
use soulbrowser_control::{build_router, ControlConfig, ControlPlane};
use soulbrowser_core_types::{ClientId, CommandId, TabId};
use soulbrowser_envelope::{
    CommandEnvelope, JwksCache, SigningKey, StaticJwksSource, Verifier, DEFAULT_CLOCK_SKEW_MS,
};
use soulbrowser_registry::{ClientLink, ClientMeta};

fn plane() -> Arc<ControlPlane> {
    ControlPlane::new(ControlConfig::default(), SigningKey::generate().unwrap())
}

fn intake_for(plane: &ControlPlane) -> EnvelopeIntake {
    let cache = JwksCache::new(
        Arc::new(StaticJwksSource::new(plane.jwks())),
        Duration::from_secs(300),
    );
    EnvelopeIntake::new(Verifier::new(cache, DEFAULT_CLOCK_SKEW_MS), DEFAULT_CLOCK_SKEW_MS)
        .with_audience("browser-extension")
}

async fn call(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    call_with_bearer(router, method, uri, body, None).await
}

async fn call_with_bearer(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
    bearer: Option<&str>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

/// Next command published for `client`, verified the way an agent would.
async fn next_envelope(
    subscription: &mut soulbrowser_event_bus::TopicSubscription<soulbrowser_agent_link::StreamCommand>,
    intake: &EnvelopeIntake,
) -> CommandEnvelope {
    let event = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, "control.command");
    intake.accept(&event.jws).await.unwrap().payload
}

#[tokio::test]
async fn dispatch_runs_ack_then_callback_and_replays_from_cache() {
    let plane = plane();
    plane.start();
    let router = build_router(plane.clone());

    let (link, mut outbound) = ChannelLink::new();
    plane.attach_agent(
        link.clone() as Arc<dyn ClientLink>,
        ClientMeta {
            client_id: Some(ClientId("ext-1".into())),
            tab_id: Some(TabId(7)),
            client_type: "extension".into(),
        },
    );

    let intake = intake_for(&plane);
    let agent = {
        let plane = plane.clone();
        let link = link.clone();
        tokio::spawn(async move {
            let frame = outbound.recv().await.unwrap();
            assert_eq!(frame["type"], "command");
            assert_eq!(frame["tabId"], 7);
            let ack_id = frame["ackId"].as_str().unwrap().to_string();
            assert!(link.resolve_ack(&ack_id, json!({"received": true})));

            let envelope = intake.accept(frame["jws"].as_str().unwrap()).await.unwrap().payload;
            assert_eq!(envelope.op["method"], "Page.navigate");
            let token = envelope.reply.callback_token.clone();
            let payload = CallbackPayload::ok(&envelope, json!({"frameId": "F1"}));
            plane.handle_callback(Some(token.as_str()), payload).unwrap();
            envelope.command_id
        })
    };

    let request = json!({
        "tabId": 7,
        "taskId": "task-1",
        "actionId": "act-1",
        "op": {"kind": "cdp.send", "method": "Page.navigate", "params": {"url": "https://example.com"}},
    });
    let (status, body) = call(&router, "POST", "/control/dispatch", Some(request.clone())).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["ok"], true);
    assert_eq!(body["cached"], false);
    assert_eq!(body["result"], json!({"frameId": "F1"}));

    let command_id = agent.await.unwrap();
    assert_eq!(body["commandId"], command_id.0.as_str());
    assert_eq!(plane.command(&command_id).unwrap().state, CommandState::Done);

    let (status, replay) = call(&router, "POST", "/control/dispatch", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replay["cached"], true);
    assert_eq!(replay["commandId"], body["commandId"]);

    let (status, record) = call(
        &router,
        "GET",
        &format!("/control/commands/{}", command_id.0),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(record["command"]["state"], "done");
    assert_eq!(record["command"]["lastCallback"]["status"], "ok");

    plane.stop().await;
}

#[tokio::test]
async fn dispatch_without_clients_fails_fast_and_leaves_nothing_pending() {
    let plane = plane();
    let router = build_router(plane.clone());

    let (status, body) = call(
        &router,
        "POST",
        "/control/dispatch",
        Some(json!({"tabId": 7, "op": {"kind": "cdp.send", "method": "Page.reload"}})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ok"], false);
    assert_eq!(body["code"], "NO_CLIENT");
    assert_eq!(plane.router().pending_count(), 0);
    assert!(plane.ledger().is_empty());
}

#[tokio::test]
async fn batch_reports_per_item_errors_and_publishes_the_rest() {
    let plane = plane();
    let router = build_router(plane.clone());
    let intake = intake_for(&plane);
    let mut stream = plane.subscribe_stream(&ClientId("ext-1".into()));

    let (status, body) = call(
        &router,
        "POST",
        "/control/enqueue-batch",
        Some(json!({
            "extensionId": "ext-1",
            "replyUrl": "http://127.0.0.1:8801/control/callback",
            "ttlMs": 5_000,
            "items": [
                {"method": "Page.enable", "tabId": 3},
                {"params": {}},
                {"method": "Runtime.evaluate", "ttlMs": 10},
            ],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["count"], 3);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results[0]["ok"], true);
    assert_eq!(results[0]["method"], "Page.enable");
    assert_eq!(
        results[1],
        json!({"ok": false, "method": "", "error": "Missing item.method"})
    );
    assert_eq!(results[2]["ok"], true);

    let first = next_envelope(&mut stream, &intake).await;
    assert_eq!(first.command_id.0, results[0]["commandId"].as_str().unwrap());
    assert_eq!(first.ttl_ms, 5_000);
    assert_eq!(first.target.tab_id, Some(TabId(3)));
    assert_eq!(first.op["kind"], "cdp.send");
    let second = next_envelope(&mut stream, &intake).await;
    assert_eq!(second.ttl_ms, 1_000);

    let (status, body) = call(
        &router,
        "POST",
        "/control/enqueue-batch",
        Some(json!({"extensionId": "ext-1", "items": []})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing body.items[]");
}

#[tokio::test]
async fn callback_token_only_authorises_its_own_command() {
    let plane = plane();
    let router = build_router(plane.clone());
    let intake = intake_for(&plane);
    let client = ClientId("ext-2".into());
    let mut stream = plane.subscribe_stream(&client);

    for method in ["Page.enable", "DOM.enable"] {
        let (status, _) = call(
            &router,
            "POST",
            "/control/enqueue",
            Some(json!({"extensionId": "ext-2", "op": {"kind": "cdp.send", "method": method}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    let first = next_envelope(&mut stream, &intake).await;
    let second = next_envelope(&mut stream, &intake).await;

    let foreign = serde_json::to_value(CallbackPayload::ok(&second, json!({}))).unwrap();
    let (status, body) = call_with_bearer(
        &router,
        "POST",
        "/control/callback",
        Some(foreign.clone()),
        Some(first.reply.callback_token.as_str()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid callback token");

    let (status, body) = call(&router, "POST", "/control/callback", Some(foreign.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED, "{body}");

    let mut unknown = foreign.clone();
    unknown["commandId"] = json!("cmd_unknown");
    let (status, body) = call_with_bearer(
        &router,
        "POST",
        "/control/callback",
        Some(unknown),
        Some(second.reply.callback_token.as_str()),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Unknown commandId");

    let (status, body) = call_with_bearer(
        &router,
        "POST",
        "/control/callback",
        Some(foreign),
        Some(second.reply.callback_token.as_str()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["state"], "done");
    assert_eq!(
        plane.command(&first.command_id).unwrap().state,
        CommandState::Pending
    );
}

#[tokio::test]
async fn agent_callback_client_reaches_a_live_server() {
    let plane = plane();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(plane.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await
    });

    let intake = intake_for(&plane);
    let client = ClientId("ext-3".into());
    let mut stream = plane.subscribe_stream(&client);
    let receipt = plane
        .enqueue(
            serde_json::from_value(json!({
                "extensionId": "ext-3",
                "op": {"kind": "cdp.send", "method": "Page.captureScreenshot"},
                "replyUrl": format!("http://{addr}/control/callback"),
            }))
            .unwrap(),
        )
        .unwrap();
    assert_eq!(receipt.delivered, 1);

    let envelope = next_envelope(&mut stream, &intake).await;
    let payload = CallbackPayload::error(
        &envelope,
        soulbrowser_agent_link::CallbackError {
            message: "No node with given id".into(),
            name: Some("CdpError".into()),
        },
    );
    CallbackClient::default()
        .post(&envelope.reply, &payload)
        .await
        .unwrap();

    let record = plane.command(&receipt.command_id).unwrap();
    assert_eq!(record.state, CommandState::Done);
    let last = record.last_callback.unwrap();
    assert!(!last.is_ok());
    assert_eq!(last.error.unwrap().message, "No node with given id");

    server.abort();
}

#[tokio::test]
async fn cdp_events_drive_the_session_tree_until_the_tab_closes() {
    let plane = plane();
    let router = build_router(plane.clone());

    let (status, body) = call(
        &router,
        "POST",
        "/control/events",
        Some(json!({
            "tabId": 7,
            "method": "Target.attachedToTarget",
            "params": {
                "sessionId": "S1",
                "targetInfo": {"targetId": "T1", "type": "iframe", "url": "https://ads.example/frame"},
            },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["change"], "attached");

    let (_, tab) = call(&router, "GET", "/control/sessions?tabId=7", None).await;
    assert_eq!(tab["tab"]["children"][0]["sessionId"], "S1");

    let (_, found) = call(&router, "GET", "/control/sessions?tabId=7&url=ads.example", None).await;
    assert_eq!(found["session"]["targetId"], "T1");

    let (_, frames) = call(&router, "GET", "/control/sessions?tabId=7&type=iframe", None).await;
    assert_eq!(frames["sessions"].as_array().unwrap().len(), 1);

    let (_, summary) = call(&router, "GET", "/control/sessions?summary=1", None).await;
    assert_eq!(summary["summary"][0]["childCount"], 1);

    let (_, events) = call(&router, "GET", "/control/events?tabId=7&method=attached", None).await;
    assert_eq!(events["count"], 1);

    let (status, closed) = call(&router, "POST", "/control/tabs/7/closed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(closed["removedSessions"], 1);
    let (status, _) = call(&router, "GET", "/control/sessions?tabId=7", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn published_key_set_matches_the_signing_key() {
    let plane = plane();
    let router = build_router(plane.clone());

    let (status, jwks) = call(&router, "GET", "/.well-known/jwks.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let key = &jwks["keys"][0];
    assert_eq!(key["kty"], "EC");
    assert_eq!(key["crv"], "P-256");
    assert_eq!(key["alg"], "ES256");
    assert_eq!(
        key["kid"].as_str(),
        plane.jwks().keys[0].kid.as_deref()
    );

    let (status, _) = call(&router, "GET", "/control/commands/cmd_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(plane.command(&CommandId("cmd_missing".into())).is_none());
}

#[tokio::test]
async fn broadcast_reaches_connected_agents() {
    let plane = plane();
    let router = build_router(plane.clone());

    let (status, body) = call(&router, "POST", "/control/broadcast", Some(json!({"data": 1}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Missing body.event");

    let (link, mut outbound) = ChannelLink::new();
    plane.attach_agent(
        link as Arc<dyn ClientLink>,
        ClientMeta {
            client_id: None,
            tab_id: Some(TabId(2)),
            client_type: "extension".into(),
        },
    );
    let (status, body) = call(
        &router,
        "POST",
        "/control/broadcast",
        Some(json!({"event": "config_changed", "data": {"debug": true}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivered"], 1);
    assert_eq!(
        outbound.recv().await.unwrap(),
        json!({"type": "config_changed", "data": {"debug": true}})
    );
}
