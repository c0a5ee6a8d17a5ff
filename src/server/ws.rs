//! `/ws/trigger` — the bidirectional control plane for UI clients.
//!
//! Inbound messages are `{type, data}` JSON. Clients trigger workflows,
//! register session ids for multi-tab deduplication, subscribe to specific
//! workflows, ping for latency, and relay ticket notifications. Outbound
//! traffic rides the per-connection frame channel owned by the connection
//! manager, drained here by the socket's write task.

use std::sync::atomic::Ordering;

use axum::{
    extract::{
        State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::events::{ErrorEnvelope, Event, EventPayload, WorkflowLog};
use crate::launcher::{WorkflowTriggerRequest, validate_trigger};

use super::api::{SharedState, send_status_update};
use super::connections::Frame;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: SharedState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let connection_id = state.connections.connect(tx, json!({}));

    // Write half: drain the frame channel into the socket.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Frame::Close(reason) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1000,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    // Read half: dispatch client messages until the socket closes.
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state.connections.touch(&connection_id);
                handle_message(&state, &connection_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // binary / ping / pong frames are ignored
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "websocket error");
                break;
            }
        }
    }

    state.connections.disconnect(&connection_id);
    writer.abort();
}

async fn handle_message(state: &SharedState, connection_id: &str, raw: &str) {
    let message: Value = match serde_json::from_str(raw) {
        Ok(message) => message,
        Err(e) => {
            state.connections.send_error(
                connection_id,
                ErrorEnvelope::validation(format!("Invalid JSON format: {}", e)),
            );
            return;
        }
    };

    let message_type = message
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let data = message.get("data").cloned().unwrap_or(Value::Null);

    match message_type {
        "trigger_workflow" => handle_trigger(state, connection_id, data).await,
        "ping" => handle_ping(state, connection_id, &message),
        "register_session" => handle_register_session(state, connection_id, data),
        "subscribe_to_adw" => handle_subscribe(state, connection_id, data, true),
        "unsubscribe_from_adw" => handle_subscribe(state, connection_id, data, false),
        "ticket_notification" => handle_ticket_notification(state, connection_id, data),
        "workflow_log" => handle_workflow_log(state, connection_id, data),
        other => {
            state.connections.send_error(
                connection_id,
                ErrorEnvelope::validation(format!("Unknown message type: {}", other)),
            );
        }
    }
}

async fn handle_trigger(state: &SharedState, connection_id: &str, data: Value) {
    if let Err(message) = state.connections.check_rate_limit(connection_id) {
        state
            .connections
            .send_error(connection_id, ErrorEnvelope::rate_limit(message));
        return;
    }

    let mut request: WorkflowTriggerRequest = match serde_json::from_value(data) {
        Ok(request) => request,
        Err(e) => {
            state.connections.send_error(
                connection_id,
                ErrorEnvelope::validation(format!("Invalid request format: {}", e)),
            );
            return;
        }
    };

    if let Err(message) = validate_trigger(&request) {
        state
            .connections
            .send_error(connection_id, ErrorEnvelope::validation(message));
        return;
    }

    // Pin the effective id now so the early status update can name it.
    let adw_id = request.adw_id.clone().unwrap_or_else(crate::launcher::make_adw_id);
    request.adw_id = Some(adw_id.clone());

    send_status_update(
        &state.connections,
        connection_id,
        &adw_id,
        &request.workflow_type,
        "started",
        &format!(
            "Starting {} workflow with ID {}",
            request.workflow_type, adw_id
        ),
    );

    let response = match state.launcher.launch(&state.db, &request).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "trigger failed in the store");
            state
                .connections
                .send_error(connection_id, ErrorEnvelope::system(e.to_string()));
            return;
        }
    };

    if response.status == "accepted" {
        state.workflows_triggered.fetch_add(1, Ordering::Relaxed);
        state.streamer.start_monitoring(&response.adw_id);
        send_status_update(
            &state.connections,
            connection_id,
            &response.adw_id,
            &response.workflow_name,
            "in_progress",
            &format!(
                "Workflow {} is running in background",
                response.workflow_name
            ),
        );
        info!(
            adw_id = %response.adw_id,
            workflow = %response.workflow_name,
            "workflow trigger accepted"
        );
    } else {
        send_status_update(
            &state.connections,
            connection_id,
            &response.adw_id,
            &response.workflow_name,
            "failed",
            response.error.as_deref().unwrap_or("Failed to start workflow"),
        );
    }

    state.connections.send_to(
        connection_id,
        &Event::new(EventPayload::TriggerResponse(response)),
    );
}

fn handle_ping(state: &SharedState, connection_id: &str, message: &Value) {
    let client_timestamp = message
        .get("timestamp")
        .and_then(Value::as_str)
        .map(str::to_string);
    state.connections.send_to(
        connection_id,
        &Event::new(EventPayload::Pong {
            connection_id: connection_id.to_string(),
            client_timestamp,
        }),
    );
}

fn handle_register_session(state: &SharedState, connection_id: &str, data: Value) {
    let session_id = data.get("session_id").and_then(Value::as_str);
    let Some(session_id) = session_id.filter(|s| !s.is_empty()) else {
        state.connections.send_error(
            connection_id,
            ErrorEnvelope::validation("session_id is required for session registration"),
        );
        return;
    };
    let client_info = data.get("client_info").cloned().unwrap_or(Value::Null);
    state
        .connections
        .register_session(connection_id, session_id, client_info);
    state.connections.send_to(
        connection_id,
        &Event::new(EventPayload::SessionRegistered {
            session_id: session_id.to_string(),
            message: "Session registered successfully".to_string(),
        }),
    );
}

fn handle_subscribe(state: &SharedState, connection_id: &str, data: Value, subscribe: bool) {
    let Some(adw_id) = data.get("adw_id").and_then(Value::as_str) else {
        state.connections.send_error(
            connection_id,
            ErrorEnvelope::validation("adw_id is required for subscription"),
        );
        return;
    };
    if subscribe {
        state.connections.subscribe_to_adw(connection_id, adw_id);
    } else {
        state
            .connections
            .unsubscribe_from_adw(connection_id, adw_id);
    }
}

fn handle_ticket_notification(state: &SharedState, connection_id: &str, data: Value) {
    let ticket_id = data
        .get("id")
        .or_else(|| data.get("ticket_id"))
        .map(|id| match id {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        })
        .filter(|s| !s.is_empty() && s != "null");

    let payload = match ticket_id {
        Some(ticket_id) => {
            let title = data.get("title").and_then(Value::as_str).unwrap_or("");
            info!(ticket_id = %ticket_id, title, "received ticket notification");
            EventPayload::TicketNotificationResponse {
                status: "received".to_string(),
                ticket_id,
                message: format!("Ticket notification '{}' received successfully", title),
                error: None,
            }
        }
        None => EventPayload::TicketNotificationResponse {
            status: "error".to_string(),
            ticket_id: format!("error_{}", chrono::Utc::now().timestamp_millis()),
            message: "Failed to process ticket notification".to_string(),
            error: Some("ticket is missing an id".to_string()),
        },
    };

    state
        .connections
        .send_to(connection_id, &Event::new(payload));
}

fn handle_workflow_log(state: &SharedState, connection_id: &str, data: Value) {
    let log: WorkflowLog = match serde_json::from_value(data) {
        Ok(log) => log,
        Err(e) => {
            state.connections.send_error(
                connection_id,
                ErrorEnvelope::validation(format!(
                    "Missing required fields for workflow_log: {}",
                    e
                )),
            );
            return;
        }
    };
    state
        .connections
        .broadcast(&Event::new(EventPayload::WorkflowLog(log)), true);
}
