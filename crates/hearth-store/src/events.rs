use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use tracing::{instrument, warn};

use hearth_core::{Deadline, DeviceEvent, DeviceId, EventKind};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// Sequence conflicts are retried this many times before surfacing as an
/// I/O-level failure. With the per-device lock held they indicate another
/// writer outside this process.
const MAX_APPEND_RETRIES: u32 = 3;

/// Per-device append lock for sequence assignment.
/// Locks are created on demand; unrelated devices never share one.
struct DeviceLocks {
    locks: HashMap<String, Arc<Mutex<()>>>,
}

impl DeviceLocks {
    fn new() -> Self {
        Self {
            locks: HashMap::new(),
        }
    }

    fn get(&mut self, device_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Append-only store of device events.
///
/// The store is the single authority for sequence numbers: per device they
/// are unique, contiguous from 1, and strictly increasing. Events are never
/// mutated or deleted, and no deduplication by payload content is performed.
pub struct EventStore {
    db: Database,
    device_locks: Mutex<DeviceLocks>,
}

impl EventStore {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            device_locks: Mutex::new(DeviceLocks::new()),
        }
    }

    /// Append an event, assigning the next sequence number for the device
    /// (1 if none exist yet). Sequence assignment happens under the
    /// per-device lock and inside the same connection boundary that makes
    /// the row durable; the `(device_id, sequence)` primary key backstops
    /// the lock, and a constraint conflict is retried before failing.
    ///
    /// An expired deadline abandons the append before any row is written.
    #[instrument(skip(self, kind), fields(device_id = %device_id, event_type = kind.kind()))]
    pub fn append(
        &self,
        device_id: &DeviceId,
        kind: EventKind,
        occurred_at: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<DeviceEvent, StoreError> {
        let lock = self.device_locks.lock().get(device_id.as_str());
        let _guard = match deadline.instant() {
            Some(t) => lock
                .try_lock_until(t)
                .ok_or_else(|| StoreError::Timeout(format!("append lock for {device_id}")))?,
            None => lock.lock(),
        };

        let mut attempt = 0;
        loop {
            match self.try_append(device_id, &kind, occurred_at, deadline) {
                Err(StoreError::Conflict(detail)) => {
                    attempt += 1;
                    if attempt >= MAX_APPEND_RETRIES {
                        return Err(StoreError::Io(format!(
                            "append for {device_id} still conflicting after {MAX_APPEND_RETRIES} attempts: {detail}"
                        )));
                    }
                    warn!(attempt, "sequence conflict, retrying append");
                }
                other => return other,
            }
        }
    }

    fn try_append(
        &self,
        device_id: &DeviceId,
        kind: &EventKind,
        occurred_at: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<DeviceEvent, StoreError> {
        if deadline.expired() {
            return Err(StoreError::Timeout(format!("append for {device_id}")));
        }

        // Timestamps are stored at microsecond precision; truncate so the
        // returned event equals what a later read yields.
        let occurred_at = occurred_at.trunc_subsecs(6);
        let recorded_at = Utc::now().trunc_subsecs(6);

        self.db.with_conn(|conn| {
            let sequence: i64 = conn.query_row(
                "SELECT COALESCE(MAX(sequence), 0) + 1 FROM device_events WHERE device_id = ?1",
                [device_id.as_str()],
                |row| row.get(0),
            )?;

            conn.execute(
                "INSERT INTO device_events (device_id, sequence, type, payload, occurred_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    device_id.as_str(),
                    sequence,
                    kind.kind(),
                    serde_json::to_string(kind)?,
                    row_helpers::format_timestamp(&occurred_at),
                    row_helpers::format_timestamp(&recorded_at),
                ],
            )
            .map_err(classify_insert_error)?;

            Ok(DeviceEvent {
                device_id: device_id.clone(),
                sequence,
                kind: kind.clone(),
                occurred_at,
                recorded_at,
            })
        })
    }

    /// Events with `sequence > since_sequence`, ascending. Re-queries on
    /// every call; an empty result is not an error.
    #[instrument(skip(self), fields(device_id = %device_id, since_sequence))]
    pub fn read_from(
        &self,
        device_id: &DeviceId,
        since_sequence: i64,
        deadline: Deadline,
    ) -> Result<Vec<DeviceEvent>, StoreError> {
        if deadline.expired() {
            return Err(StoreError::Timeout(format!("read_from for {device_id}")));
        }
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, sequence, payload, occurred_at, recorded_at
                 FROM device_events WHERE device_id = ?1 AND sequence > ?2
                 ORDER BY sequence ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![device_id.as_str(), since_sequence])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Events with `occurred_at` in `[from, to)`, ordered by occurred_at
    /// with sequence as tie-break.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn read_range(
        &self,
        device_id: &DeviceId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<Vec<DeviceEvent>, StoreError> {
        if deadline.expired() {
            return Err(StoreError::Timeout(format!("read_range for {device_id}")));
        }
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, sequence, payload, occurred_at, recorded_at
                 FROM device_events
                 WHERE device_id = ?1 AND occurred_at >= ?2 AND occurred_at < ?3
                 ORDER BY occurred_at ASC, sequence ASC",
            )?;
            let mut rows = stmt.query(rusqlite::params![
                device_id.as_str(),
                row_helpers::format_timestamp(&from),
                row_helpers::format_timestamp(&to),
            ])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_event(row)?);
            }
            Ok(results)
        })
    }

    /// Count events for a device.
    #[instrument(skip(self), fields(device_id = %device_id))]
    pub fn count(&self, device_id: &DeviceId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM device_events WHERE device_id = ?1",
                [device_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

/// A primary-key violation on insert means the computed sequence was taken
/// by a writer outside the per-device lock; classified Conflict so the
/// append loop can retry.
fn classify_insert_error(e: rusqlite::Error) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(format!("sequence already assigned: {e}"))
        }
        _ => StoreError::Database(e.to_string()),
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<DeviceEvent, StoreError> {
    let payload_str: String = row_helpers::get(row, 2, "device_events", "payload")?;
    let occurred_str: String = row_helpers::get(row, 3, "device_events", "occurred_at")?;
    let recorded_str: String = row_helpers::get(row, 4, "device_events", "recorded_at")?;

    Ok(DeviceEvent {
        device_id: DeviceId::from_raw(row_helpers::get::<String>(row, 0, "device_events", "device_id")?),
        sequence: row_helpers::get(row, 1, "device_events", "sequence")?,
        kind: row_helpers::parse_json(&payload_str, "device_events", "payload")?,
        occurred_at: row_helpers::parse_timestamp(&occurred_str, "device_events", "occurred_at")?,
        recorded_at: row_helpers::parse_timestamp(&recorded_str, "device_events", "recorded_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use hearth_core::ThermostatMode;
    use std::time::Duration;

    fn setup() -> EventStore {
        let db = Database::in_memory().unwrap();
        migrations::apply_migrations(&db).unwrap();
        EventStore::new(db)
    }

    fn setpoint(v: f64) -> EventKind {
        EventKind::SetpointChanged { setpoint: v }
    }

    #[test]
    fn append_assigns_sequence_from_one() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");

        let e1 = store
            .append(&d1, setpoint(20.0), Utc::now(), Deadline::none())
            .unwrap();
        let e2 = store
            .append(&d1, setpoint(21.0), Utc::now(), Deadline::none())
            .unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
    }

    #[test]
    fn sequences_are_per_device() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");
        let d2 = DeviceId::from_raw("d2");

        store
            .append(&d1, setpoint(20.0), Utc::now(), Deadline::none())
            .unwrap();
        let e = store
            .append(&d2, setpoint(19.0), Utc::now(), Deadline::none())
            .unwrap();

        assert_eq!(e.sequence, 1);
    }

    #[test]
    fn append_roundtrips_through_read() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");
        let occurred = Utc.with_ymd_and_hms(2026, 8, 6, 9, 30, 0).unwrap();

        let appended = store
            .append(
                &d1,
                EventKind::ModeChanged {
                    mode: ThermostatMode::Heat,
                },
                occurred,
                Deadline::none(),
            )
            .unwrap();

        let read = store.read_from(&d1, 0, Deadline::none()).unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0], appended);
        assert_eq!(read[0].occurred_at, occurred);
    }

    #[test]
    fn read_from_filters_and_orders() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");

        for i in 1..=3 {
            store
                .append(&d1, setpoint(i as f64), Utc::now(), Deadline::none())
                .unwrap();
        }

        let all = store.read_from(&d1, 0, Deadline::none()).unwrap();
        assert_eq!(all.len(), 3);
        for (i, event) in all.iter().enumerate() {
            assert_eq!(event.sequence, i as i64 + 1);
        }

        let tail = store.read_from(&d1, 2, Deadline::none()).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].sequence, 3);
    }

    #[test]
    fn read_from_unknown_device_is_empty() {
        let store = setup();
        let events = store
            .read_from(&DeviceId::from_raw("ghost"), 0, Deadline::none())
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn read_range_half_open_with_tiebreak() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");
        let base = Utc.with_ymd_and_hms(2026, 8, 6, 12, 0, 0).unwrap();

        // Two events share an occurred_at; sequence breaks the tie
        store
            .append(&d1, setpoint(18.0), base, Deadline::none())
            .unwrap();
        store
            .append(&d1, setpoint(19.0), base, Deadline::none())
            .unwrap();
        store
            .append(
                &d1,
                setpoint(20.0),
                base + ChronoDuration::minutes(5),
                Deadline::none(),
            )
            .unwrap();

        let range = store
            .read_range(
                &d1,
                base,
                base + ChronoDuration::minutes(5),
                Deadline::none(),
            )
            .unwrap();
        // `to` is exclusive: the third event falls outside
        assert_eq!(range.len(), 2);
        assert_eq!(range[0].sequence, 1);
        assert_eq!(range[1].sequence, 2);

        let wider = store
            .read_range(
                &d1,
                base,
                base + ChronoDuration::minutes(6),
                Deadline::none(),
            )
            .unwrap();
        assert_eq!(wider.len(), 3);
        assert_eq!(wider[2].sequence, 3);
    }

    #[test]
    fn no_dedup_by_payload() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");

        let e1 = store
            .append(&d1, setpoint(20.0), Utc::now(), Deadline::none())
            .unwrap();
        let e2 = store
            .append(&d1, setpoint(20.0), Utc::now(), Deadline::none())
            .unwrap();

        assert_eq!(e1.sequence, 1);
        assert_eq!(e2.sequence, 2);
        assert_eq!(store.count(&d1).unwrap(), 2);
    }

    #[test]
    fn concurrent_appends_same_device_gapless() {
        let store = Arc::new(setup());
        let d1 = DeviceId::from_raw("d1");

        let mut handles = vec![];
        for i in 0..10 {
            let store = Arc::clone(&store);
            let id = d1.clone();
            handles.push(std::thread::spawn(move || {
                store
                    .append(&id, setpoint(i as f64), Utc::now(), Deadline::none())
                    .unwrap()
            }));
        }

        let mut sequences: Vec<i64> = handles
            .into_iter()
            .map(|h| h.join().unwrap().sequence)
            .collect();
        sequences.sort();
        assert_eq!(sequences, (1..=10).collect::<Vec<i64>>());
    }

    #[test]
    fn concurrent_appends_different_devices_independent() {
        let store = Arc::new(setup());

        let mut handles = vec![];
        for d in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let id = DeviceId::from_raw(format!("d{d}"));
                for i in 0..5 {
                    store
                        .append(&id, setpoint(i as f64), Utc::now(), Deadline::none())
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for d in 0..4 {
            let id = DeviceId::from_raw(format!("d{d}"));
            let events = store.read_from(&id, 0, Deadline::none()).unwrap();
            let sequences: Vec<i64> = events.iter().map(|e| e.sequence).collect();
            assert_eq!(sequences, (1..=5).collect::<Vec<i64>>());
        }
    }

    #[test]
    fn expired_deadline_leaves_no_side_effects() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");

        let result = store.append(
            &d1,
            setpoint(20.0),
            Utc::now(),
            Deadline::after(Duration::ZERO),
        );
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_eq!(store.count(&d1).unwrap(), 0);
    }

    #[test]
    fn contended_lock_times_out() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");

        let lock = store.device_locks.lock().get(d1.as_str());
        let guard = lock.lock();

        let result = store.append(
            &d1,
            setpoint(20.0),
            Utc::now(),
            Deadline::after(Duration::from_millis(20)),
        );
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        drop(guard);

        // Released lock: same append now succeeds
        let event = store
            .append(&d1, setpoint(20.0), Utc::now(), Deadline::none())
            .unwrap();
        assert_eq!(event.sequence, 1);
    }

    #[test]
    fn reads_observe_durable_appends() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");

        store
            .append(&d1, setpoint(20.0), Utc::now(), Deadline::none())
            .unwrap();
        assert_eq!(store.read_from(&d1, 0, Deadline::none()).unwrap().len(), 1);

        store
            .append(&d1, setpoint(21.0), Utc::now(), Deadline::none())
            .unwrap();
        assert_eq!(store.read_from(&d1, 0, Deadline::none()).unwrap().len(), 2);
    }

    #[test]
    fn malformed_payload_surfaces_corrupt_row() {
        let store = setup();
        let d1 = DeviceId::from_raw("d1");
        store
            .db
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO device_events (device_id, sequence, type, payload, occurred_at, recorded_at)
                     VALUES ('d1', 1, 'setpoint_changed', 'not valid json', '2026-08-06T00:00:00.000000Z', '2026-08-06T00:00:00.000000Z')",
                    [],
                )
                .map_err(StoreError::from)?;
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let result = store.read_from(&d1, 0, Deadline::none());
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
