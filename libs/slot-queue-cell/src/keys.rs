//! Cache and lock key layout. Other services read these keys directly, so the
//! formats must not change.

use std::fmt;

pub fn slot(slot_id: i64) -> String {
    format!("slot:{}", slot_id)
}

pub fn booked_count(slot_id: i64) -> String {
    format!("slot_inventory::bookedCount::{}", slot_id)
}

pub fn total_count(slot_id: i64) -> String {
    format!("slot_inventory::totalCount::{}", slot_id)
}

pub fn doctor_queue(doctor_id: i64) -> String {
    format!("queue_doctor::{}", doctor_id)
}

/// Named locks. When several are needed they are taken in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKey {
    SlotOperation(i64),
    QueueMissed(i64),
    QueueStartTreatment(i64),
    QueueCompleteTreatment(i64),
    /// Doctor-wide queue lock guarding every mutation of the cached queue.
    QueueCall(i64),
    QueueNumber(i64),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::SlotOperation(id) => write!(f, "lock:slot_operation:{}", id),
            LockKey::QueueMissed(id) => write!(f, "lock:queue_missed:{}", id),
            LockKey::QueueStartTreatment(id) => write!(f, "lock:queue_start_treatment:{}", id),
            LockKey::QueueCompleteTreatment(id) => write!(f, "lock:queue_complete_treatment:{}", id),
            LockKey::QueueCall(id) => write!(f, "lock:queue_call:{}", id),
            LockKey::QueueNumber(id) => write!(f, "lock:queue_number:{}", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_formats() {
        assert_eq!(slot(9), "slot:9");
        assert_eq!(booked_count(9), "slot_inventory::bookedCount::9");
        assert_eq!(total_count(9), "slot_inventory::totalCount::9");
        assert_eq!(doctor_queue(4), "queue_doctor::4");
        assert_eq!(LockKey::SlotOperation(9).to_string(), "lock:slot_operation:9");
        assert_eq!(LockKey::QueueCall(4).to_string(), "lock:queue_call:4");
        assert_eq!(LockKey::QueueNumber(4).to_string(), "lock:queue_number:4");
        assert_eq!(LockKey::QueueMissed(4).to_string(), "lock:queue_missed:4");
        assert_eq!(
            LockKey::QueueStartTreatment(4).to_string(),
            "lock:queue_start_treatment:4"
        );
        assert_eq!(
            LockKey::QueueCompleteTreatment(4).to_string(),
            "lock:queue_complete_treatment:4"
        );
    }
}
