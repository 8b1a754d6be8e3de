use crate::delta::Increment;
use chrono::{DateTime, Utc};

/// Lifecycle status of a purchased package. Transitions only move forward:
/// `NotStarted -> Active -> {Exhausted | Expired}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseStatus {
    NotStarted = 0,
    Active = 1,
    Exhausted = 2,
    Expired = 3,
}

impl PurchaseStatus {
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(PurchaseStatus::NotStarted),
            1 => Some(PurchaseStatus::Active),
            2 => Some(PurchaseStatus::Exhausted),
            3 => Some(PurchaseStatus::Expired),
            _ => None,
        }
    }

    pub fn as_i16(&self) -> i16 {
        *self as i16
    }
}

/// One row of the subscription ledger: a purchased package instance with its
/// quota counters. Byte quantities are `u128` in memory and NUMERIC in the
/// database so cumulative volumes can never overflow.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub id: i64,
    pub package_id: i64,
    pub order_code: String,
    pub user_id: String,
    pub purchase_status: PurchaseStatus,
    pub purchase_start_time: DateTime<Utc>,
    pub purchase_end_time: DateTime<Utc>,
    pub next_reset_date: Option<DateTime<Utc>>,
    pub data_allowance: u128,
    pub consumed_data_transfer: u128,
    pub consumed_data_download: u128,
    pub consumed_data_upload: u128,
    /// Rate limit in megabytes per second; `None` means unlimited.
    pub speed_limit: Option<u64>,
    pub device_num: Option<i32>,
    pub device_limit: Option<i32>,
    pub deleted: bool,
}

impl UsageRecord {
    /// Add one increment to the consumed counters and transition to
    /// `Exhausted` when the allowance is reached. Returns whether this call
    /// performed the transition.
    ///
    /// Download counts bytes sent towards the client (the reporter's output
    /// direction), upload the reverse.
    pub fn apply_increment(&mut self, increment: &Increment) -> bool {
        self.consumed_data_transfer += increment.total_bytes;
        self.consumed_data_download += increment.output_bytes;
        self.consumed_data_upload += increment.input_bytes;

        if self.purchase_status == PurchaseStatus::Active
            && self.consumed_data_transfer >= self.data_allowance
        {
            self.purchase_status = PurchaseStatus::Exhausted;
            return true;
        }
        false
    }
}

/// Subscriber identity; read-only from the metering core's perspective.
#[derive(Debug, Clone)]
pub struct User {
    pub id: String,
    pub password_hash: String,
    /// 1 = active account.
    pub status: i16,
}
