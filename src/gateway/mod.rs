//! # WebSocket Gateways
//!
//! - **call**: `/ws/call`, a browser acting as microphone and speaker of a call
//! - **room**: `/ws/rooms/{room}`, live chat room updates and publishing

pub mod call;
pub mod room;

pub use call::call_websocket;
pub use room::room_websocket;
