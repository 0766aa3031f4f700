use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use hearth_core::DeviceId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// A registered thermostat. Metadata only: the event log is the source of
/// truth and accepts events for unregistered device ids too.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub brand: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

pub struct DeviceRepo {
    db: Database,
}

impl DeviceRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a new device with a generated id.
    #[instrument(skip(self), fields(name, location))]
    pub fn register(
        &self,
        name: &str,
        brand: &str,
        location: &str,
    ) -> Result<DeviceRecord, StoreError> {
        let id = DeviceId::new();
        let created_at = Utc::now().trunc_subsecs(6);

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO devices (id, name, brand, location, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.as_str(),
                    name,
                    brand,
                    location,
                    row_helpers::format_timestamp(&created_at),
                ],
            )?;

            Ok(DeviceRecord {
                id,
                name: name.to_string(),
                brand: brand.to_string(),
                location: location.to_string(),
                created_at,
            })
        })
    }

    /// Get a device by id.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn get(&self, id: &DeviceId) -> Result<DeviceRecord, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, brand, location, created_at FROM devices WHERE id = ?1",
            )?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => row_to_device(row),
                None => Err(StoreError::NotFound(format!("device {id}"))),
            }
        })
    }

    /// List all registered devices, oldest first.
    #[instrument(skip(self))]
    pub fn list(&self) -> Result<Vec<DeviceRecord>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, brand, location, created_at FROM devices ORDER BY created_at ASC, id ASC",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_device(row)?);
            }
            Ok(results)
        })
    }

    /// Delete a device's registry row. Its events are never deleted.
    #[instrument(skip(self), fields(device_id = %id))]
    pub fn delete(&self, id: &DeviceId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            let affected = conn.execute("DELETE FROM devices WHERE id = ?1", [id.as_str()])?;
            if affected == 0 {
                return Err(StoreError::NotFound(format!("device {id}")));
            }
            Ok(())
        })
    }
}

fn row_to_device(row: &rusqlite::Row<'_>) -> Result<DeviceRecord, StoreError> {
    let created_str: String = row_helpers::get(row, 4, "devices", "created_at")?;
    Ok(DeviceRecord {
        id: DeviceId::from_raw(row_helpers::get::<String>(row, 0, "devices", "id")?),
        name: row_helpers::get(row, 1, "devices", "name")?,
        brand: row_helpers::get(row, 2, "devices", "brand")?,
        location: row_helpers::get(row, 3, "devices", "location")?,
        created_at: row_helpers::parse_timestamp(&created_str, "devices", "created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;

    fn setup() -> DeviceRepo {
        let db = Database::in_memory().unwrap();
        migrations::apply_migrations(&db).unwrap();
        DeviceRepo::new(db)
    }

    #[test]
    fn register_and_get() {
        let repo = setup();
        let registered = repo.register("Hallway", "Nest", "upstairs").unwrap();
        assert!(registered.id.as_str().starts_with("dev_"));

        let fetched = repo.get(&registered.id).unwrap();
        assert_eq!(fetched, registered);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let repo = setup();
        let result = repo.get(&DeviceId::from_raw("ghost"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn list_returns_registered_devices() {
        let repo = setup();
        assert!(repo.list().unwrap().is_empty());

        repo.register("Hallway", "Nest", "upstairs").unwrap();
        repo.register("Living Room", "Ecobee", "downstairs").unwrap();

        let devices = repo.list().unwrap();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn delete_removes_record() {
        let repo = setup();
        let registered = repo.register("Hallway", "Nest", "upstairs").unwrap();

        repo.delete(&registered.id).unwrap();
        assert!(matches!(
            repo.get(&registered.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn delete_unknown_is_not_found() {
        let repo = setup();
        let result = repo.delete(&DeviceId::from_raw("ghost"));
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
