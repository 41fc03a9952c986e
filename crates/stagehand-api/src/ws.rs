//! Live socket channel.
//!
//! Clients subscribe to `live:<entity>` channels and receive every bus event
//! on them as `{ "event", "action", "result" }`. Nothing is replayed: a
//! client fetches a snapshot over HTTP, then applies deltas.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::{extract::State, response::Response};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use stagehand_core::events::{Action, Entity, LiveEvent};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
    Ping,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Event {
        event: &'static str,
        action: Action,
        result: serde_json::Value,
    },
    Subscribed {
        subscribed: Vec<&'static str>,
    },
    Unsubscribed {
        unsubscribed: Vec<&'static str>,
    },
    Pong {
        pong: bool,
    },
    Error {
        error: String,
    },
}

/// Per-socket subscription state.
#[derive(Debug, Default)]
pub struct Subscriptions {
    entities: BTreeSet<Entity>,
}

impl Subscriptions {
    pub fn handle(&mut self, text: &str) -> ServerMessage {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                return ServerMessage::Error {
                    error: format!("Invalid message: {}", e),
                };
            }
        };

        match message {
            ClientMessage::Subscribe { channels } => match parse_channels(&channels) {
                Ok(entities) => {
                    self.entities.extend(entities);
                    ServerMessage::Subscribed {
                        subscribed: self.channels(),
                    }
                }
                Err(error) => ServerMessage::Error { error },
            },
            ClientMessage::Unsubscribe { channels } => match parse_channels(&channels) {
                Ok(entities) => {
                    for entity in &entities {
                        self.entities.remove(entity);
                    }
                    ServerMessage::Unsubscribed {
                        unsubscribed: entities.iter().map(Entity::channel).collect(),
                    }
                }
                Err(error) => ServerMessage::Error { error },
            },
            ClientMessage::Ping => ServerMessage::Pong { pong: true },
        }
    }

    /// Outgoing frame for a bus event, if the socket subscribed to it.
    pub fn forward(&self, event: LiveEvent) -> Option<ServerMessage> {
        self.entities
            .contains(&event.entity)
            .then(|| ServerMessage::Event {
                event: event.channel(),
                action: event.action,
                result: event.result,
            })
    }

    pub fn channels(&self) -> Vec<&'static str> {
        self.entities.iter().map(Entity::channel).collect()
    }
}

fn parse_channels(channels: &[String]) -> Result<Vec<Entity>, String> {
    channels
        .iter()
        .map(|c| Entity::from_channel(c).ok_or_else(|| format!("Unknown channel: {}", c)))
        .collect()
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut events = match state.event_bus.subscribe(&Entity::ALL).await {
        Ok(events) => events,
        Err(e) => {
            warn!(error = %e, "Live socket could not subscribe to the event bus");
            let _ = send(
                &mut socket,
                &ServerMessage::Error {
                    error: e.to_string(),
                },
            )
            .await;
            return;
        }
    };
    let mut subscriptions = Subscriptions::default();
    debug!("Live socket connected");

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let reply = match incoming {
                    Some(Ok(Message::Text(text))) => subscriptions.handle(text.as_str()),
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                };
                if !send(&mut socket, &reply).await {
                    break;
                }
            }
            event = events.next() => {
                match event {
                    Some(Ok(event)) => {
                        if let Some(frame) = subscriptions.forward(event) {
                            if !send(&mut socket, &frame).await {
                                break;
                            }
                        }
                    }
                    Some(Err(e)) => debug!(error = %e, "Skipping undecodable live event"),
                    None => break,
                }
            }
        }
    }
    debug!("Live socket closed");
}

async fn send(socket: &mut WebSocket, message: &ServerMessage) -> bool {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "Failed to encode live socket frame");
            return true;
        }
    };
    socket.send(Message::Text(text.into())).await.is_ok()
}
