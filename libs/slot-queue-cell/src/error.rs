use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{OrderStatus, QueueStatus, TimePeriod};
use shared_models::error::AppError;

#[derive(Error, Debug)]
pub enum SlotQueueError {
    #[error("Slot {0} is unavailable")]
    SlotUnavailable(i64),

    #[error("Slot not found: {0}")]
    SlotNotFound(i64),

    #[error("Order not found: {0}")]
    OrderNotFound(i64),

    #[error("Queue entry not found: {0}")]
    QueueEntryNotFound(i64),

    #[error("System busy: lock {key} not acquired")]
    SystemBusy { key: String },

    #[error("Order {order_id} is {status}, operation not allowed")]
    InvalidOrderState { order_id: i64, status: OrderStatus },

    #[error("Queue status error: entry {entry_id} is {status}")]
    InvalidQueueState { entry_id: i64, status: QueueStatus },

    #[error("Queue for doctor {0} is empty")]
    QueueEmpty(i64),

    #[error("No patient to call for doctor {0}")]
    NoPatientToCall(i64),

    #[error("Patient {patient_id} already holds an order for slot {slot_id}")]
    DuplicateOrder { patient_id: i64, slot_id: i64 },

    #[error("Patient {patient_id} already registered for {date} {period}")]
    DuplicateRegistration {
        patient_id: i64,
        date: NaiveDate,
        period: TimePeriod,
    },

    #[error("Doctor {doctor_id} already has a slot on {date} {period}")]
    SlotAlreadyExists {
        doctor_id: i64,
        date: NaiveDate,
        period: TimePeriod,
    },

    #[error("Slot {slot_id} has {booked} bookings")]
    SlotHasBookings { slot_id: i64, booked: u32 },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SlotQueueError {
    pub fn busy(key: impl ToString) -> Self {
        SlotQueueError::SystemBusy { key: key.to_string() }
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        SlotQueueError::Persistence(err.to_string())
    }

    /// Only lock contention is worth retrying as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SlotQueueError::SystemBusy { .. })
    }

    pub fn is_cache_failure(&self) -> bool {
        matches!(self, SlotQueueError::Cache(_) | SlotQueueError::Serialization(_))
    }
}

impl From<anyhow::Error> for SlotQueueError {
    fn from(err: anyhow::Error) -> Self {
        SlotQueueError::Persistence(err.to_string())
    }
}

impl From<SlotQueueError> for AppError {
    fn from(err: SlotQueueError) -> Self {
        use SlotQueueError::*;
        match err {
            SlotUnavailable(_) => AppError::Conflict("slot unavailable".to_string()),
            SlotNotFound(_) | OrderNotFound(_) | QueueEntryNotFound(_) => {
                AppError::NotFound(err.to_string())
            }
            SystemBusy { .. } => AppError::Busy("system busy, please retry".to_string()),
            InvalidOrderState { .. } => AppError::BadRequest("order status error".to_string()),
            InvalidQueueState { .. } => AppError::BadRequest("queue status error".to_string()),
            QueueEmpty(_) => AppError::NotFound("queue empty".to_string()),
            NoPatientToCall(_) => AppError::NotFound("no patient to call".to_string()),
            DuplicateOrder { .. } | DuplicateRegistration { .. } | SlotAlreadyExists { .. } => {
                AppError::Conflict(err.to_string())
            }
            SlotHasBookings { .. } => AppError::Conflict(err.to_string()),
            Validation(msg) => AppError::ValidationError(msg),
            PermissionDenied(msg) => AppError::Auth(msg),
            Persistence(msg) => AppError::Database(msg),
            Cache(e) => AppError::Internal(e.to_string()),
            Serialization(e) => AppError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_maps_to_retryable_busy() {
        let err = SlotQueueError::busy("lock:slot_operation:1");
        assert!(err.is_retryable());
        let app: AppError = err.into();
        assert!(app.is_retryable());
        assert_eq!(app.user_message(), "system busy, please retry");
    }

    #[test]
    fn infrastructure_errors_are_not_shown_raw() {
        let app: AppError = SlotQueueError::persistence("connection reset by peer").into();
        assert_eq!(app.user_message(), "internal error, please try again later");
    }

    #[test]
    fn booking_failure_reads_slot_unavailable() {
        let app: AppError = SlotQueueError::SlotUnavailable(3).into();
        assert_eq!(app.user_message(), "slot unavailable");
    }
}
