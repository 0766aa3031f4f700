pub mod database;
pub mod devices;
pub mod error;
pub mod events;
pub mod migrations;
pub mod row_helpers;

pub use database::Database;
pub use devices::{DeviceRecord, DeviceRepo};
pub use error::StoreError;
pub use events::EventStore;
pub use migrations::{apply_migrations, ChangeSet, MigrationError};
