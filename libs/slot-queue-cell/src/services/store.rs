use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

use crate::models::{Order, QueueEntry, Slot, SlotStatus, TimePeriod};
use crate::SlotQueueError;
use shared_database::SupabaseClient;

/// Durable system of record for slots, orders and queue entries.
///
/// Inserts ignore the `id` of the record passed in and return the stored
/// row with its assigned id.
#[async_trait]
pub trait SlotQueueStore: Send + Sync {
    async fn get_slot(&self, slot_id: i64) -> Result<Option<Slot>, SlotQueueError>;

    async fn find_slot(
        &self,
        doctor_id: i64,
        date: NaiveDate,
        period: TimePeriod,
    ) -> Result<Option<Slot>, SlotQueueError>;

    async fn insert_slot(&self, slot: &Slot) -> Result<Slot, SlotQueueError>;

    async fn update_slot_counts(
        &self,
        slot_id: i64,
        booked_count: u32,
        status: SlotStatus,
    ) -> Result<Slot, SlotQueueError>;

    async fn update_slot_status(&self, slot_id: i64, status: SlotStatus) -> Result<Slot, SlotQueueError>;

    async fn update_slot_terms(
        &self,
        slot_id: i64,
        fee_amount: i64,
        total_count: u32,
        status: SlotStatus,
    ) -> Result<Slot, SlotQueueError>;

    /// The doctor's slots on `date`, ordered by id.
    async fn list_doctor_slots(&self, doctor_id: i64, date: NaiveDate) -> Result<Vec<Slot>, SlotQueueError>;

    /// Slots scheduled within `[from, to]`, ordered by id.
    async fn list_slots_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Slot>, SlotQueueError>;

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, SlotQueueError>;

    /// The patient's order for the slot that is not cancelled, if any.
    async fn find_active_order(&self, patient_id: i64, slot_id: i64) -> Result<Option<Order>, SlotQueueError>;

    /// Pending and paid orders of the patient.
    async fn list_open_orders(&self, patient_id: i64) -> Result<Vec<Order>, SlotQueueError>;

    async fn insert_order(&self, order: &Order) -> Result<Order, SlotQueueError>;

    async fn update_order(&self, order: &Order) -> Result<Order, SlotQueueError>;

    async fn get_queue_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, SlotQueueError>;

    async fn find_queue_entry_by_order(&self, order_id: i64) -> Result<Option<QueueEntry>, SlotQueueError>;

    /// Waiting, calling and treating entries, priority first then by number.
    async fn list_active_queue_entries(&self, doctor_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError>;

    async fn list_patient_queue_entries(&self, patient_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError>;

    /// Highest number ever recorded for the doctor, finished entries included.
    async fn max_queue_number(&self, doctor_id: i64) -> Result<Option<u32>, SlotQueueError>;

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, SlotQueueError>;

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, SlotQueueError>;

    /// Returns whether a row was deleted.
    async fn delete_queue_entry(&self, entry_id: i64) -> Result<bool, SlotQueueError>;

    async fn list_doctors_with_active_queue(&self) -> Result<Vec<i64>, SlotQueueError>;
}

const ACTIVE_QUEUE_FILTER: &str = "status=in.(waiting,calling,treating)";
const RETURN_REPRESENTATION: (&str, &str) = ("Prefer", "return=representation");

#[derive(Debug, Deserialize)]
struct QueueNumberRow {
    queue_number: u32,
}

#[derive(Debug, Deserialize)]
struct DoctorRow {
    doctor_id: i64,
}

/// [`SlotQueueStore`] over Supabase PostgREST tables `slots`, `orders` and
/// `queue_entries`.
pub struct SupabaseStore {
    supabase: Arc<SupabaseClient>,
}

impl SupabaseStore {
    pub fn new(supabase: Arc<SupabaseClient>) -> Self {
        Self { supabase }
    }

    async fn select<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, SlotQueueError> {
        debug!("Store query {}", path);
        let rows: Vec<T> = self
            .supabase
            .request(Method::GET, path, None, None)
            .await
            .map_err(|e| SlotQueueError::persistence(format!("query {} failed: {}", path, e)))?;
        Ok(rows)
    }

    async fn select_one<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, SlotQueueError> {
        Ok(self.select(path).await?.into_iter().next())
    }

    async fn write<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Vec<T>, SlotQueueError> {
        let rows: Vec<T> = self
            .supabase
            .request_with_headers(method, path, None, body, &[RETURN_REPRESENTATION])
            .await
            .map_err(|e| SlotQueueError::persistence(format!("write {} failed: {}", path, e)))?;
        Ok(rows)
    }

    async fn write_one<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Value,
    ) -> Result<T, SlotQueueError> {
        self.write(method, path, Some(body))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SlotQueueError::persistence(format!("write {} returned no rows", path)))
    }
}

/// Row body for inserts and full updates; the id is never written.
fn row_body<T: Serialize>(record: &T) -> Result<Value, SlotQueueError> {
    let mut body = serde_json::to_value(record)?;
    if let Some(fields) = body.as_object_mut() {
        fields.remove("id");
    }
    Ok(body)
}

#[async_trait]
impl SlotQueueStore for SupabaseStore {
    async fn get_slot(&self, slot_id: i64) -> Result<Option<Slot>, SlotQueueError> {
        self.select_one(&format!("/rest/v1/slots?id=eq.{}&limit=1", slot_id)).await
    }

    async fn find_slot(
        &self,
        doctor_id: i64,
        date: NaiveDate,
        period: TimePeriod,
    ) -> Result<Option<Slot>, SlotQueueError> {
        self.select_one(&format!(
            "/rest/v1/slots?doctor_id=eq.{}&schedule_date=eq.{}&time_period=eq.{}&limit=1",
            doctor_id,
            date.format("%Y-%m-%d"),
            period.as_str()
        ))
        .await
    }

    async fn insert_slot(&self, slot: &Slot) -> Result<Slot, SlotQueueError> {
        self.write_one(Method::POST, "/rest/v1/slots", row_body(slot)?).await
    }

    async fn update_slot_counts(
        &self,
        slot_id: i64,
        booked_count: u32,
        status: SlotStatus,
    ) -> Result<Slot, SlotQueueError> {
        let body = json!({
            "booked_count": booked_count,
            "status": status.as_str(),
            "updated_at": Utc::now().to_rfc3339(),
        });
        self.write_one(Method::PATCH, &format!("/rest/v1/slots?id=eq.{}", slot_id), body)
            .await
    }

    async fn update_slot_status(&self, slot_id: i64, status: SlotStatus) -> Result<Slot, SlotQueueError> {
        let body = json!({
            "status": status.as_str(),
            "updated_at": Utc::now().to_rfc3339(),
        });
        self.write_one(Method::PATCH, &format!("/rest/v1/slots?id=eq.{}", slot_id), body)
            .await
    }

    async fn update_slot_terms(
        &self,
        slot_id: i64,
        fee_amount: i64,
        total_count: u32,
        status: SlotStatus,
    ) -> Result<Slot, SlotQueueError> {
        let body = json!({
            "fee_amount": fee_amount,
            "total_count": total_count,
            "status": status.as_str(),
            "updated_at": Utc::now().to_rfc3339(),
        });
        self.write_one(Method::PATCH, &format!("/rest/v1/slots?id=eq.{}", slot_id), body)
            .await
    }

    async fn list_doctor_slots(&self, doctor_id: i64, date: NaiveDate) -> Result<Vec<Slot>, SlotQueueError> {
        self.select(&format!(
            "/rest/v1/slots?doctor_id=eq.{}&schedule_date=eq.{}&order=id.asc",
            doctor_id,
            date.format("%Y-%m-%d")
        ))
        .await
    }

    async fn list_slots_between(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<Slot>, SlotQueueError> {
        self.select(&format!(
            "/rest/v1/slots?schedule_date=gte.{}&schedule_date=lte.{}&order=id.asc",
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        ))
        .await
    }

    async fn get_order(&self, order_id: i64) -> Result<Option<Order>, SlotQueueError> {
        self.select_one(&format!("/rest/v1/orders?id=eq.{}&limit=1", order_id)).await
    }

    async fn find_active_order(&self, patient_id: i64, slot_id: i64) -> Result<Option<Order>, SlotQueueError> {
        self.select_one(&format!(
            "/rest/v1/orders?patient_id=eq.{}&slot_id=eq.{}&status=neq.cancelled&limit=1",
            patient_id, slot_id
        ))
        .await
    }

    async fn list_open_orders(&self, patient_id: i64) -> Result<Vec<Order>, SlotQueueError> {
        self.select(&format!(
            "/rest/v1/orders?patient_id=eq.{}&status=in.(pending,paid)&order=id.asc",
            patient_id
        ))
        .await
    }

    async fn insert_order(&self, order: &Order) -> Result<Order, SlotQueueError> {
        self.write_one(Method::POST, "/rest/v1/orders", row_body(order)?).await
    }

    async fn update_order(&self, order: &Order) -> Result<Order, SlotQueueError> {
        self.write_one(
            Method::PATCH,
            &format!("/rest/v1/orders?id=eq.{}", order.id),
            row_body(order)?,
        )
        .await
    }

    async fn get_queue_entry(&self, entry_id: i64) -> Result<Option<QueueEntry>, SlotQueueError> {
        self.select_one(&format!("/rest/v1/queue_entries?id=eq.{}&limit=1", entry_id))
            .await
    }

    async fn find_queue_entry_by_order(&self, order_id: i64) -> Result<Option<QueueEntry>, SlotQueueError> {
        self.select_one(&format!(
            "/rest/v1/queue_entries?order_id=eq.{}&order=id.desc&limit=1",
            order_id
        ))
        .await
    }

    async fn list_active_queue_entries(&self, doctor_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        self.select(&format!(
            "/rest/v1/queue_entries?doctor_id=eq.{}&{}&order=is_priority.desc,queue_number.asc",
            doctor_id, ACTIVE_QUEUE_FILTER
        ))
        .await
    }

    async fn list_patient_queue_entries(&self, patient_id: i64) -> Result<Vec<QueueEntry>, SlotQueueError> {
        self.select(&format!(
            "/rest/v1/queue_entries?patient_id=eq.{}&{}&order=id.asc",
            patient_id, ACTIVE_QUEUE_FILTER
        ))
        .await
    }

    async fn max_queue_number(&self, doctor_id: i64) -> Result<Option<u32>, SlotQueueError> {
        let row: Option<QueueNumberRow> = self
            .select_one(&format!(
                "/rest/v1/queue_entries?doctor_id=eq.{}&select=queue_number&order=queue_number.desc&limit=1",
                doctor_id
            ))
            .await?;
        Ok(row.map(|r| r.queue_number))
    }

    async fn insert_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, SlotQueueError> {
        self.write_one(Method::POST, "/rest/v1/queue_entries", row_body(entry)?)
            .await
    }

    async fn update_queue_entry(&self, entry: &QueueEntry) -> Result<QueueEntry, SlotQueueError> {
        self.write_one(
            Method::PATCH,
            &format!("/rest/v1/queue_entries?id=eq.{}", entry.id),
            row_body(entry)?,
        )
        .await
    }

    async fn delete_queue_entry(&self, entry_id: i64) -> Result<bool, SlotQueueError> {
        let rows: Vec<Value> = self
            .write(
                Method::DELETE,
                &format!("/rest/v1/queue_entries?id=eq.{}", entry_id),
                None,
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn list_doctors_with_active_queue(&self) -> Result<Vec<i64>, SlotQueueError> {
        let rows: Vec<DoctorRow> = self
            .select(&format!(
                "/rest/v1/queue_entries?{}&select=doctor_id",
                ACTIVE_QUEUE_FILTER
            ))
            .await?;
        let doctors: BTreeSet<i64> = rows.into_iter().map(|r| r.doctor_id).collect();
        Ok(doctors.into_iter().collect())
    }
}

