//! # Chat Rooms
//!
//! - **store**: the `RoomStore` interface, message types and `fetch_messages`
//! - **memory**: the in-process implementation used by the server

pub mod memory;
pub mod store;
