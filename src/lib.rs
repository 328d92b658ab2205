//! echorelay: an authenticated WebSocket echo relay.
//!
//! Clients register a username and password, log in for a bearer token, and
//! present that token when opening `/ws`. Every text or binary frame sent on
//! an authenticated session is echoed back unchanged.

pub mod auth;
pub mod config;
pub mod gateway;
