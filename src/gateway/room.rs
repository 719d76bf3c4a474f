//! # Room WebSocket Gateway
//!
//! `/ws/rooms/{room}`: live view of one chat room.
//!
//! ## WebSocket Protocol:
//! - **Server → Client**: `{"type": "messages", "room_id", "messages": [...]}`
//!   on connect and after every change (always the full list)
//! - **Client → Server**: `{"type": "send", "message": {"text", "senderId",
//!   "senderName", "type"?, "imageUrl"?}}`; answered with `sent` or `error`

use crate::rooms::store::{ChangeListener, NewMessage, RoomMessage, Subscription};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomClientMessage {
    Send { message: NewMessage },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomServerMessage {
    Messages {
        room_id: String,
        messages: Vec<RoomMessage>,
    },
    Sent {
        message: RoomMessage,
    },
    Error {
        code: String,
        message: String,
    },
}

/// Latest contents of the room, pushed by the store listener.
#[derive(Message)]
#[rtype(result = "()")]
struct RoomSnapshot(Vec<RoomMessage>);

pub struct RoomWebSocket {
    state: web::Data<AppState>,
    room_id: String,
    subscription: Option<Subscription>,
    last_heartbeat: Instant,
}

impl RoomWebSocket {
    pub fn new(state: web::Data<AppState>, room_id: String) -> Self {
        Self {
            state,
            room_id,
            subscription: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &RoomServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!("Failed to encode room message: {}", e),
        }
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!("Room gateway error {}: {}", code, message);
        Self::send(
            ctx,
            &RoomServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn publish(&mut self, message: NewMessage, ctx: &mut ws::WebsocketContext<Self>) {
        let publish = self.state.rooms.publish(&self.room_id, message);
        ctx.spawn(publish.into_actor(self).map(|result, _act, ctx| match result {
            Ok(message) => Self::send(ctx, &RoomServerMessage::Sent { message }),
            Err(e) => Self::send_error(ctx, "publish_error", &e.to_string()),
        }));
    }
}

impl Actor for RoomWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(room = %self.room_id, "Room WebSocket connection started");

        let addr = ctx.address();
        let listener: ChangeListener = Arc::new(move |messages: &[RoomMessage]| {
            addr.do_send(RoomSnapshot(messages.to_vec()));
        });
        let subscription = self.state.rooms.subscribe(&self.room_id, listener);
        if !subscription.is_attached() {
            Self::send_error(ctx, "invalid_room", "room id cannot be empty");
        }
        self.subscription = Some(subscription);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Room WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(subscription) = self.subscription.take() {
            subscription.cancel();
        }
        info!(room = %self.room_id, "Room WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RoomWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<RoomClientMessage>(&text) {
                Ok(RoomClientMessage::Send { message }) => self.publish(message, ctx),
                Err(err) => Self::send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                Self::send_error(ctx, "unsupported", "binary messages are not supported on rooms");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Room WebSocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Room WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<RoomSnapshot> for RoomWebSocket {
    type Result = ();

    fn handle(&mut self, msg: RoomSnapshot, ctx: &mut Self::Context) {
        debug!(room = %self.room_id, count = msg.0.len(), "Pushing room snapshot");
        Self::send(
            ctx,
            &RoomServerMessage::Messages {
                room_id: self.room_id.clone(),
                messages: msg.0,
            },
        );
    }
}

/// WebSocket endpoint handler for `/ws/rooms/{room}`.
pub async fn room_websocket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    let room_id = path.into_inner();
    info!(
        room = %room_id,
        "New room WebSocket connection request from: {:?}",
        req.connection_info().peer_addr()
    );
    ws::start(RoomWebSocket::new(state, room_id), &req, stream)
}
