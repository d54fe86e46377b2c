use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Admin,
    Doctor,
    Patient,
    /// Scheduled jobs and internal tooling.
    System,
}

/// Identity of the caller, resolved by the auth layer and passed
/// explicitly into every core operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub actor_id: i64,
    pub role: ActorRole,
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(actor_id: i64, role: ActorRole) -> Self {
        Self {
            actor_id,
            role,
            request_id: Uuid::new_v4(),
        }
    }

    pub fn patient(patient_id: i64) -> Self {
        Self::new(patient_id, ActorRole::Patient)
    }

    pub fn doctor(doctor_id: i64) -> Self {
        Self::new(doctor_id, ActorRole::Doctor)
    }

    pub fn admin(admin_id: i64) -> Self {
        Self::new(admin_id, ActorRole::Admin)
    }

    pub fn system() -> Self {
        Self::new(0, ActorRole::System)
    }

    /// Admins and system jobs may act on anyone's records.
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, ActorRole::Admin | ActorRole::System)
    }

    pub fn is_patient(&self, patient_id: i64) -> bool {
        self.role == ActorRole::Patient && self.actor_id == patient_id
    }

    pub fn is_doctor(&self, doctor_id: i64) -> bool {
        self.role == ActorRole::Doctor && self.actor_id == doctor_id
    }

    /// Lock holder identity, unique per request.
    pub fn lock_holder(&self) -> String {
        format!("{}:{}", self.request_id, self.actor_id)
    }
}
