//! HTTP surface for webhook delivery of Telegram updates.

pub mod auth;
pub mod server;

pub use server::{AppState, router, run};
