use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use hearth_core::{Deadline, DeviceEvent, DeviceId, DeviceState, EventKind};
use hearth_store::{DeviceRecord, DeviceRepo, EventStore, StoreError};

use crate::error::{ReconcileError, ServiceError};
use crate::reconciler::StateReconciler;

/// A history slice request.
#[derive(Clone, Copy, Debug)]
pub enum HistoryQuery {
    /// Events with sequence greater than the given watermark.
    Since(i64),
    /// Events with occurred_at in `[from, to)`.
    Range {
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },
}

/// Transport-facing facade over the event store, reconciler, and device
/// registry. Applies the per-request deadline and translates store errors
/// into the stable domain taxonomy; no business logic of its own.
pub struct QueryService {
    events: Arc<EventStore>,
    reconciler: StateReconciler,
    devices: DeviceRepo,
    request_timeout: Duration,
}

impl QueryService {
    pub fn new(
        events: Arc<EventStore>,
        reconciler: StateReconciler,
        devices: DeviceRepo,
        request_timeout: Duration,
    ) -> Self {
        Self {
            events,
            reconciler,
            devices,
            request_timeout,
        }
    }

    fn deadline(&self) -> Deadline {
        Deadline::after(self.request_timeout)
    }

    pub fn record_event(
        &self,
        device_id: &DeviceId,
        kind: EventKind,
        occurred_at: DateTime<Utc>,
    ) -> Result<DeviceEvent, ServiceError> {
        self.events
            .append(device_id, kind, occurred_at, self.deadline())
            .map_err(into_service_error)
    }

    pub fn current_state(&self, device_id: &DeviceId) -> Result<DeviceState, ServiceError> {
        self.reconciler
            .current_state(device_id, self.deadline())
            .map_err(|e| match e {
                ReconcileError::NotFound(_) => ServiceError::NotFound,
                ReconcileError::Store(e) => into_service_error(e),
            })
    }

    /// History slice for a device. A device with zero recorded events is
    /// NotFound; within an existing history, an empty slice is a valid
    /// result.
    pub fn history(
        &self,
        device_id: &DeviceId,
        query: HistoryQuery,
    ) -> Result<Vec<DeviceEvent>, ServiceError> {
        let deadline = self.deadline();

        let recorded = self.events.count(device_id).map_err(into_service_error)?;
        if recorded == 0 {
            return Err(ServiceError::NotFound);
        }

        let events = match query {
            HistoryQuery::Since(since) => self.events.read_from(device_id, since, deadline),
            HistoryQuery::Range { from, to } => self.events.read_range(device_id, from, to, deadline),
        };
        events.map_err(into_service_error)
    }

    pub fn register_device(
        &self,
        name: &str,
        brand: &str,
        location: &str,
    ) -> Result<DeviceRecord, ServiceError> {
        self.devices
            .register(name, brand, location)
            .map_err(into_service_error)
    }

    pub fn get_device(&self, device_id: &DeviceId) -> Result<DeviceRecord, ServiceError> {
        self.devices.get(device_id).map_err(into_service_error)
    }

    pub fn list_devices(&self) -> Result<Vec<DeviceRecord>, ServiceError> {
        self.devices.list().map_err(into_service_error)
    }

    pub fn delete_device(&self, device_id: &DeviceId) -> Result<(), ServiceError> {
        self.devices.delete(device_id).map_err(into_service_error)
    }
}

fn into_service_error(e: StoreError) -> ServiceError {
    match e {
        StoreError::NotFound(_) => ServiceError::NotFound,
        StoreError::Timeout(_) => ServiceError::Timeout,
        other => {
            warn!(error = %other, "storage failure");
            ServiceError::Unavailable
        }
    }
}
