//! Notification outbox and disaggregation pipeline
//!
//! Business facts are appended to a transactional outbox, published to
//! per-audience broker queues, and expanded by audience listeners into
//! per-recipient, per-channel notification rows.

pub mod config;
pub mod db;
pub mod http;
pub mod listener;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod outbox;
pub mod repos;
pub mod shared_read;
pub mod store;
