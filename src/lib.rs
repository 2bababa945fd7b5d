pub mod agent;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod gateway;
pub mod router;
pub mod secrets;
pub mod store;
pub mod types;
