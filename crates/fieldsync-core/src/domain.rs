//! Business domains that own an offline queue.

use std::fmt;

use serde_json::{Map, Value};

use crate::{Error, Result};

/// A form type with its own isolated queue.
pub trait SyncDomain: Copy + Eq + std::hash::Hash + fmt::Debug + Send + Sync + 'static {
    /// Storage key of the domain's queue.
    fn queue_key(&self) -> &'static str;

    /// Server path entries are POSTed to, relative to the base URL.
    fn endpoint(&self) -> &'static str;

    /// Short label for logs and notices.
    fn label(&self) -> &'static str {
        self.queue_key()
    }

    /// Fields that must be present and non-blank.
    fn required_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Reject payloads that could never be accepted before they reach the
    /// durable queue.
    fn validate(&self, payload: &Value) -> Result<Map<String, Value>> {
        validate_payload(self.label(), payload, self.required_fields())
    }
}

/// Shared payload check: a non-empty JSON object carrying every required
/// field with a non-null, non-blank value.
pub fn validate_payload(
    domain: &str,
    payload: &Value,
    required_fields: &[&str],
) -> Result<Map<String, Value>> {
    let invalid = |reason: String| Error::InvalidPayload {
        domain: domain.to_string(),
        reason,
    };

    let Value::Object(fields) = payload else {
        return Err(invalid("payload must be a JSON object".to_string()));
    };
    if fields.is_empty() {
        return Err(invalid("payload must not be empty".to_string()));
    }

    let missing: Vec<&str> = required_fields
        .iter()
        .copied()
        .filter(|field| match fields.get(*field) {
            None | Some(Value::Null) => true,
            Some(Value::String(text)) => text.trim().is_empty(),
            Some(_) => false,
        })
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!("missing required fields: {}", missing.join(", "))));
    }

    Ok(fields.clone())
}

/// Built-in mine-site form domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormDomain {
    Mentoring,
    DailyActivity,
    TrainHours,
    P2h,
    Jcm,
    WorkOrder,
    GuestEvent,
}

impl FormDomain {
    pub const ALL: [Self; 7] = [
        Self::Mentoring,
        Self::DailyActivity,
        Self::TrainHours,
        Self::P2h,
        Self::Jcm,
        Self::WorkOrder,
        Self::GuestEvent,
    ];
}

impl SyncDomain for FormDomain {
    fn queue_key(&self) -> &'static str {
        match self {
            Self::Mentoring => "mentoring_queue_offline",
            Self::DailyActivity => "daily_queue_offline",
            Self::TrainHours => "train_hours_queue_offline",
            Self::P2h => "p2h_queue_offline",
            Self::Jcm => "jcm_queue_offline",
            Self::WorkOrder => "work_order_queue_offline",
            Self::GuestEvent => "event_queue_offline",
        }
    }

    fn endpoint(&self) -> &'static str {
        match self {
            Self::Mentoring => "/mentoring/store",
            Self::DailyActivity => "/daily-activity/store",
            Self::TrainHours => "/train-hours/store",
            Self::P2h => "/p2h/store",
            Self::Jcm => "/jcm/store",
            Self::WorkOrder => "/work-order/store",
            Self::GuestEvent => "/event/store",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Mentoring => "mentoring",
            Self::DailyActivity => "daily-activity",
            Self::TrainHours => "train-hours",
            Self::P2h => "p2h",
            Self::Jcm => "jcm",
            Self::WorkOrder => "work-order",
            Self::GuestEvent => "guest-event",
        }
    }

    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            Self::DailyActivity => &["jde_no", "total_hour"],
            Self::TrainHours | Self::Mentoring => &["jde_no"],
            Self::P2h | Self::Jcm => &["unit_id"],
            Self::WorkOrder | Self::GuestEvent => &[],
        }
    }
}

impl fmt::Display for FormDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
