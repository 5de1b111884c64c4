//! WebSocket RPC listener
//!
//! Serves `GET /ws` for the frame protocol and `GET /health` for probes.
//! Each connection: handshake, scope resolution, event fan-out from the
//! bus, request dispatch with a per-request timeout, and a heartbeat that
//! declares the peer dead after two missed ticks.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{ErrorBody, ErrorCode};
use crate::events::GatewayEvent;
use crate::security::{self, ScopeSet};
use crate::{Error, Result};

use super::frames::{
    event_frame, protocol_compatible, AuthGrant, ConnectionPolicy, Features, Frame, HelloFrame,
    HelloOkFrame, ResFrame, ServerInfo, PROTOCOL_VERSION,
};
use super::{methods, GatewayState};

/// Per-request dispatch ceiling
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the axum router
pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(http_health))
        .with_state(state)
}

/// Serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error when the listener cannot bind.
pub async fn serve(
    state: Arc<GatewayState>,
    shutdown: crate::cancel::CancelToken,
) -> Result<()> {
    let port = state.config.snapshot().rpc.port;
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "rpc listener bound");
    state.logs.push(format!("rpc listener bound on {addr}"));

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn http_health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let scopes = ScopeSet::admin();
    match methods::dispatch(&state, &scopes, "health", None).await {
        Ok(payload) => (axum::http::StatusCode::OK, axum::Json(payload)),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(serde_json::to_value(e.to_body()).unwrap_or_default()),
        ),
    }
}

async fn ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let max_payload = state.config.snapshot().rpc.max_payload;
    ws.max_message_size(max_payload)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<GatewayState>) {
    let (mut writer, mut reader) = socket.split();
    let conn_id = Uuid::new_v4().to_string();

    // -- Handshake: the first frame must be `hello` --
    let hello = match read_hello(&mut reader).await {
        Ok(hello) => hello,
        Err(body) => {
            send_frame(&mut writer, &Frame::Error { error: body }).await;
            return;
        }
    };

    if !protocol_compatible(hello.min_protocol, hello.max_protocol) {
        let body = ErrorBody::new(
            ErrorCode::InvalidRequest,
            format!(
                "protocol mismatch: server speaks {PROTOCOL_VERSION}, client offers {}..={}",
                hello.min_protocol, hello.max_protocol
            ),
        );
        send_frame(&mut writer, &Frame::Error { error: body }).await;
        return;
    }

    let (scopes, role) = match authenticate(&state, &hello) {
        Ok(grant) => grant,
        Err(e) => {
            send_frame(&mut writer, &Frame::Error { error: e.to_body() }).await;
            return;
        }
    };

    let policy = {
        let config = state.config.snapshot();
        ConnectionPolicy {
            max_payload: config.rpc.max_payload,
            max_buffered: config.rpc.max_buffered,
            tick_interval_ms: config.rpc.tick_interval_ms,
        }
    };

    let hello_ok = HelloOkFrame {
        protocol: PROTOCOL_VERSION,
        server: ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            commit: option_env!("SWITCHBOARD_COMMIT").map(String::from),
            conn_id: conn_id.clone(),
        },
        features: Features {
            methods: methods::method_names(),
            events: vec![
                "agent".to_string(),
                "chat".to_string(),
                "tick".to_string(),
                "shutdown".to_string(),
                "snapshot".to_string(),
                "gap".to_string(),
            ],
        },
        snapshot: snapshot_payload(&state),
        auth: AuthGrant {
            device_token: None,
            role,
            scopes: scopes.as_slice().to_vec(),
        },
        policy: policy.clone(),
    };
    send_frame(&mut writer, &Frame::HelloOk(hello_ok)).await;
    tracing::info!(conn = %conn_id, client = %hello.client.id, "rpc client connected");

    // -- Fan-out: bus subscription plus response channel --
    let subscription = state
        .bus
        .subscribe(conn_id.clone(), scopes.clone(), policy.max_buffered);
    // Snapshot is per-connection; it goes through the subscription queue so
    // it gets a seq like everything else
    state.bus.publish_to(
        &conn_id,
        GatewayEvent::Snapshot {
            payload: snapshot_payload(&state),
        },
    );

    let (res_tx, mut res_rx) = mpsc::channel::<Frame>(64);

    // Liveness: the writer pings every tick interval; the reader stamps
    // every inbound message. Two missed intervals mark the peer dead.
    let last_seen = Arc::new(std::sync::atomic::AtomicU64::new(now_millis()));

    let sub_for_writer = subscription.clone();
    let tick_interval = Duration::from_millis(policy.tick_interval_ms.max(1000));
    let seen_for_writer = Arc::clone(&last_seen);
    let writer_conn = conn_id.clone();
    let mut write_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(tick_interval);
        heartbeat.tick().await;
        loop {
            tokio::select! {
                event = sub_for_writer.next() => match event {
                    Some(sequenced) => {
                        let frame = event_frame(&sequenced);
                        if !send_frame(&mut writer, &frame).await {
                            break;
                        }
                    }
                    None => break,
                },
                res = res_rx.recv() => match res {
                    Some(frame) => {
                        if !send_frame(&mut writer, &frame).await {
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    let silent = now_millis()
                        .saturating_sub(seen_for_writer.load(std::sync::atomic::Ordering::Relaxed));
                    if silent > 2 * tick_interval.as_millis() as u64 {
                        tracing::info!(conn = %writer_conn, "peer missed two heartbeats, closing");
                        break;
                    }
                    if writer.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // -- Read loop: dispatch requests --
    let read_state = Arc::clone(&state);
    let read_scopes = scopes.clone();
    let seen_for_reader = Arc::clone(&last_seen);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(message)) = reader.next().await {
            seen_for_reader.store(now_millis(), std::sync::atomic::Ordering::Relaxed);
            match message {
                Message::Text(text) => {
                    let frame: Frame = match serde_json::from_str(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            let body = ErrorBody::new(
                                ErrorCode::InvalidRequest,
                                format!("bad frame: {e}"),
                            );
                            let _ = res_tx.send(Frame::Error { error: body }).await;
                            continue;
                        }
                    };
                    match frame {
                        Frame::Req(req) => {
                            let res = handle_request(&read_state, &read_scopes, req).await;
                            if res_tx.send(Frame::Res(res)).await.is_err() {
                                break;
                            }
                        }
                        Frame::Hello(_) => {
                            let body = ErrorBody::new(
                                ErrorCode::InvalidRequest,
                                "duplicate hello",
                            );
                            let _ = res_tx.send(Frame::Error { error: body }).await;
                        }
                        // Clients do not send these
                        Frame::HelloOk(_) | Frame::Res(_) | Frame::Event(_)
                        | Frame::Error { .. } => {}
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // First task to finish tears the connection down
    tokio::select! {
        _ = &mut write_task => { read_task.abort(); }
        _ = &mut read_task => { write_task.abort(); }
    }
    state.bus.unsubscribe(&conn_id);
    tracing::info!(conn = %conn_id, "rpc client disconnected");
}

/// Read frames until the hello arrives; anything else is a protocol error
async fn read_hello(
    reader: &mut futures::stream::SplitStream<WebSocket>,
) -> std::result::Result<HelloFrame, ErrorBody> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let message = tokio::time::timeout_at(deadline, reader.next())
            .await
            .map_err(|_| ErrorBody::new(ErrorCode::InvalidRequest, "handshake timeout"))?;
        match message {
            Some(Ok(Message::Text(text))) => {
                return match serde_json::from_str::<Frame>(&text) {
                    Ok(Frame::Hello(hello)) => Ok(hello),
                    Ok(_) => Err(ErrorBody::new(
                        ErrorCode::InvalidRequest,
                        "first frame must be hello",
                    )),
                    Err(e) => Err(ErrorBody::new(
                        ErrorCode::InvalidRequest,
                        format!("bad hello: {e}"),
                    )),
                };
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ErrorBody::new(ErrorCode::InvalidRequest, "closed before hello"))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(ErrorBody::new(
                    ErrorCode::InvalidRequest,
                    format!("socket error: {e}"),
                ))
            }
        }
    }
}

/// Resolve the hello's credentials to scopes.
///
/// With no tokens configured the gateway is in local-open mode and grants
/// admin to loopback clients; otherwise a valid token or a trusted, freshly
/// signed device identity is required.
fn authenticate(state: &GatewayState, hello: &HelloFrame) -> Result<(ScopeSet, String)> {
    let config = state.config.snapshot();

    if config.tokens.is_empty() {
        return Ok((ScopeSet::admin(), "local".to_string()));
    }

    if let Some(auth) = &hello.auth {
        if let Some(token) = &auth.token {
            if let Some(scopes) = security::resolve_token(&config, token) {
                return Ok((scopes, "token".to_string()));
            }
            return Err(Error::Unauthorized("token rejected".to_string()));
        }
        if let Some(device) = &auth.device {
            security::device::verify_handshake(device, Utc::now())?;
            // Trusted devices (key pinned at pairing) get working scopes;
            // a valid signature alone only opens the pairing surface
            if state.devices.is_trusted_key(&device.id, &device.public_key) {
                return Ok((
                    ScopeSet::new(vec![
                        crate::security::Scope::Read,
                        crate::security::Scope::Write,
                        crate::security::Scope::Approvals,
                    ]),
                    "device".to_string(),
                ));
            }
            return Ok((
                ScopeSet::new(vec![crate::security::Scope::Pairing]),
                "device-unpaired".to_string(),
            ));
        }
    }

    Err(Error::Unauthorized("credentials required".to_string()))
}

/// Dispatch a request with the standard timeout
async fn handle_request(
    state: &GatewayState,
    scopes: &ScopeSet,
    req: super::frames::ReqFrame,
) -> ResFrame {
    let dispatched = tokio::time::timeout(
        REQUEST_TIMEOUT,
        methods::dispatch(state, scopes, &req.method, req.params),
    )
    .await;

    match dispatched {
        Ok(Ok(payload)) => ResFrame::ok(req.id, payload),
        Ok(Err(error)) => ResFrame::err(req.id, error.to_body()),
        Err(_) => ResFrame::err(
            req.id,
            ErrorBody::new(ErrorCode::AgentTimeout, "request timed out"),
        ),
    }
}

/// State snapshot sent in the handshake and as the first event
fn snapshot_payload(state: &GatewayState) -> serde_json::Value {
    let sessions = state.sessions.list().unwrap_or_default();
    serde_json::json!({
        "sessions": sessions.len(),
        "channels": state.channels.ids(),
        "active_runs": state.scheduler.active_run_ids().len(),
        "started_at": state.started_at,
    })
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}

async fn send_frame(
    writer: &mut futures::stream::SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> bool {
    match serde_json::to_string(frame) {
        Ok(text) => writer.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "frame serialization failed");
            false
        }
    }
}
