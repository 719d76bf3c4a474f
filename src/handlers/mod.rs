pub mod calls;
pub mod config;
pub mod rooms;

pub use calls::*;
pub use config::*;
pub use rooms::*;
