use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Patient,
    Staff,
    Appointment,
    Consultation,
    Department,
    Equipment,
    LabReport,
    Prescription,
    PurchaseOrder,
    Supplier,
    MaintenanceLog,
    Issue,
}

impl EntityKind {
    pub const ALL: [EntityKind; 12] = [
        EntityKind::Patient,
        EntityKind::Staff,
        EntityKind::Appointment,
        EntityKind::Consultation,
        EntityKind::Department,
        EntityKind::Equipment,
        EntityKind::LabReport,
        EntityKind::Prescription,
        EntityKind::PurchaseOrder,
        EntityKind::Supplier,
        EntityKind::MaintenanceLog,
        EntityKind::Issue,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Patient => "patient",
            EntityKind::Staff => "staff",
            EntityKind::Appointment => "appointment",
            EntityKind::Consultation => "consultation",
            EntityKind::Department => "department",
            EntityKind::Equipment => "equipment",
            EntityKind::LabReport => "lab_report",
            EntityKind::Prescription => "prescription",
            EntityKind::PurchaseOrder => "purchase_order",
            EntityKind::Supplier => "supplier",
            EntityKind::MaintenanceLog => "maintenance_log",
            EntityKind::Issue => "issue",
        }
    }

    /// Fixed part of the identifier. Purchase orders additionally carry a
    /// `YYYYMMDD-` date segment after this.
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityKind::Patient => "PID",
            EntityKind::Staff => "STF",
            EntityKind::Appointment => "APT-",
            EntityKind::Consultation => "CON-",
            EntityKind::Department => "DEP-",
            EntityKind::Equipment => "EQ",
            EntityKind::LabReport => "LAB",
            EntityKind::Prescription => "RX-",
            EntityKind::PurchaseOrder => "PO-",
            EntityKind::Supplier => "SUP",
            EntityKind::MaintenanceLog => "ML",
            EntityKind::Issue => "ISS-",
        }
    }

    pub fn pad_width(&self) -> usize {
        match self {
            EntityKind::Patient | EntityKind::MaintenanceLog => 6,
            EntityKind::Staff
            | EntityKind::Equipment
            | EntityKind::LabReport
            | EntityKind::Supplier => 4,
            EntityKind::PurchaseOrder => 3,
            EntityKind::Appointment
            | EntityKind::Consultation
            | EntityKind::Department
            | EntityKind::Prescription
            | EntityKind::Issue => 5,
        }
    }

    pub fn is_date_scoped(&self) -> bool {
        matches!(self, EntityKind::PurchaseOrder)
    }

    /// Fields a new record's `data` must carry with a non-empty value.
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Patient => &["name"],
            EntityKind::Staff => &["name", "role"],
            EntityKind::Appointment => &["patient_id", "doctor_id", "date"],
            EntityKind::Consultation => &["patient_id", "doctor_id"],
            EntityKind::Department => &["name"],
            EntityKind::Equipment => &["name"],
            EntityKind::LabReport => &["patient_id", "test_type"],
            EntityKind::Prescription => &["patient_id", "medications"],
            EntityKind::PurchaseOrder => &["supplier_id", "items"],
            EntityKind::Supplier => &["name"],
            EntityKind::MaintenanceLog => &["equipment_id"],
            EntityKind::Issue => &["title"],
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown entity kind: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    /// Read the latest identifier and increment it. Not atomic across writers.
    Scan,
    /// Increment a per-scope counter row inside the inserting transaction.
    #[default]
    Counter,
}

impl AllocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStrategy::Scan => "scan",
            AllocationStrategy::Counter => "counter",
        }
    }
}

impl fmt::Display for AllocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(AllocationStrategy::Scan),
            "counter" => Ok(AllocationStrategy::Counter),
            other => Err(format!("unknown allocation strategy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub object_id: String,
    pub kind: EntityKind,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    pub record_id: String,
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindInfo {
    pub kind: EntityKind,
    pub prefix: String,
    pub pad_width: usize,
    pub date_scoped: bool,
    pub example: String,
    pub required_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KindCount {
    pub kind: EntityKind,
    pub count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateRecordParams {
    pub kind: EntityKind,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub actor: String,
}
