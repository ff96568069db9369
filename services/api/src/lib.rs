//! Concierge API Library Crate
//!
//! This library contains the voice relay web service: configuration, the
//! session manager and relay loops, the HTTP status handlers and routing. The
//! `api` binary is a thin wrapper around this library.

pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
