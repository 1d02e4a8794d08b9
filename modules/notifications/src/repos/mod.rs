//! Postgres implementations of the storage seams

pub mod notification_repo;
pub mod outbox_repo;
pub mod processed_repo;
pub mod recipient_repo;

pub use notification_repo::PgNotificationStore;
pub use outbox_repo::{append_in_tx, PgOutboxStore};
pub use processed_repo::PgProcessedEvents;
pub use recipient_repo::PgRecipientDirectory;
