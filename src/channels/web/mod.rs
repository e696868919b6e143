//! HTTP gateway for the board UI.

pub mod auth;
pub mod server;
pub mod types;
