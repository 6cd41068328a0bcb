//! Core domain model for cylinder state snapshots.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cylsnap-core";

pub const UNCLASSIFIED: &str = "unclassified";

/// Strips the inconsistent padding the mirror carries on cylinder identifiers.
pub fn canonical_id(raw: &str) -> &str {
    raw.trim()
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required column `{0}` is null or empty")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub cylinder_id: String,
    pub gas_name: Option<String>,
    pub capacity: Option<f64>,
    pub valve_spec: Option<String>,
    pub cylinder_spec: Option<String>,
    pub location_code: Option<String>,
    pub usage_code: Option<String>,
    pub enduser_code: Option<String>,
    pub condition_code: Option<String>,
    pub pressure_due_date: Option<NaiveDate>,
    pub last_moved_at: Option<DateTime<Utc>>,
    /// Greater of the row's own update time and its latest status move time.
    pub source_updated_at: DateTime<Utc>,
}

impl SourceRecord {
    pub fn canonical_id(&self) -> &str {
        canonical_id(&self.cylinder_id)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.canonical_id().is_empty() {
            return Err(ValidationError::MissingField("cylinder_id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceHead {
    pub cylinder_id: String,
    pub source_updated_at: DateTime<Utc>,
}

/// Content-derived identity of a "kind of cylinder".
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct TypeKey(String);

impl TypeKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TypeKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub cylinder_id: String,
    pub gas_name: String,
    pub capacity: Option<f64>,
    pub valve_spec: String,
    pub cylinder_spec: String,
    pub location_code: String,
    pub usage_code: String,
    pub enduser_code: String,
    pub condition_code: String,
    /// Canonical status name; rows written by older jobs may hold a legacy label.
    pub status: Option<String>,
    pub valve_format: String,
    pub valve_material: String,
    pub cylinder_format: String,
    pub cylinder_material: String,
    pub usage_place: String,
    pub type_key: TypeKey,
    /// Explicit availability flag. Legacy rows may leave it null.
    pub is_available: Option<bool>,
    pub pressure_due_date: Option<NaiveDate>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub source_updated_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalStatus {
    StoredUncollected,
    StoredCollected,
    InProcess,
    Inspection,
    Shipped,
    AtCustomer,
    Abnormal,
    Scrapped,
    Other,
}

impl CanonicalStatus {
    pub const ALL: [CanonicalStatus; 9] = [
        CanonicalStatus::StoredUncollected,
        CanonicalStatus::StoredCollected,
        CanonicalStatus::InProcess,
        CanonicalStatus::Inspection,
        CanonicalStatus::Shipped,
        CanonicalStatus::AtCustomer,
        CanonicalStatus::Abnormal,
        CanonicalStatus::Scrapped,
        CanonicalStatus::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CanonicalStatus::StoredUncollected => "stored_uncollected",
            CanonicalStatus::StoredCollected => "stored_collected",
            CanonicalStatus::InProcess => "in_process",
            CanonicalStatus::Inspection => "inspection",
            CanonicalStatus::Shipped => "shipped",
            CanonicalStatus::AtCustomer => "at_customer",
            CanonicalStatus::Abnormal => "abnormal",
            CanonicalStatus::Scrapped => "scrapped",
            CanonicalStatus::Other => "other",
        }
    }

    pub fn display_label(self, lang: Language) -> &'static str {
        match (self, lang) {
            (CanonicalStatus::StoredUncollected, Language::En) => "In storage (uncollected)",
            (CanonicalStatus::StoredUncollected, Language::Ja) => "保管中(未回収)",
            (CanonicalStatus::StoredCollected, Language::En) => "In storage (collected)",
            (CanonicalStatus::StoredCollected, Language::Ja) => "保管中(回収済)",
            (CanonicalStatus::InProcess, Language::En) => "In process",
            (CanonicalStatus::InProcess, Language::Ja) => "処理中",
            (CanonicalStatus::Inspection, Language::En) => "Under inspection",
            (CanonicalStatus::Inspection, Language::Ja) => "検査中",
            (CanonicalStatus::Shipped, Language::En) => "Shipped",
            (CanonicalStatus::Shipped, Language::Ja) => "出荷済",
            (CanonicalStatus::AtCustomer, Language::En) => "At customer",
            (CanonicalStatus::AtCustomer, Language::Ja) => "顧客先",
            (CanonicalStatus::Abnormal, Language::En) => "Abnormal",
            (CanonicalStatus::Abnormal, Language::Ja) => "異常",
            (CanonicalStatus::Scrapped, Language::En) => "Scrapped",
            (CanonicalStatus::Scrapped, Language::Ja) => "廃棄",
            (CanonicalStatus::Other, Language::En) => "Other",
            (CanonicalStatus::Other, Language::Ja) => "その他",
        }
    }

    pub fn family(self) -> StatusFamily {
        match self {
            CanonicalStatus::StoredUncollected | CanonicalStatus::StoredCollected => {
                StatusFamily::Available
            }
            CanonicalStatus::InProcess | CanonicalStatus::Inspection => StatusFamily::InProcess,
            CanonicalStatus::Shipped | CanonicalStatus::AtCustomer => StatusFamily::Outbound,
            CanonicalStatus::Abnormal => StatusFamily::Abnormal,
            CanonicalStatus::Scrapped => StatusFamily::Scrapped,
            CanonicalStatus::Other => StatusFamily::Other,
        }
    }

    pub fn is_available(self) -> bool {
        self.family() == StatusFamily::Available
    }
}

impl fmt::Display for CanonicalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CanonicalStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CanonicalStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusFamily {
    Available,
    InProcess,
    Outbound,
    Abnormal,
    Scrapped,
    Other,
}

impl StatusFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusFamily::Available => "available",
            StatusFamily::InProcess => "in_process",
            StatusFamily::Outbound => "outbound",
            StatusFamily::Abnormal => "abnormal",
            StatusFamily::Scrapped => "scrapped",
            StatusFamily::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    En,
    Ja,
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "en" | "english" => Ok(Language::En),
            "ja" | "jp" | "japanese" => Ok(Language::Ja),
            other => Err(format!("unsupported language `{other}`")),
        }
    }
}

/// Ordered by severity: `Normal < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Normal,
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Normal => "NORMAL",
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventorySummaryRow {
    pub type_key: TypeKey,
    pub status: String,
    pub count: usize,
    pub available: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeGroupSummary {
    pub type_key: TypeKey,
    pub gas_name: String,
    pub capacity: Option<f64>,
    pub valve_spec: String,
    pub cylinder_spec: String,
    pub usage_place: String,
    pub enduser_code: String,
    pub total: usize,
    pub available: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_family: BTreeMap<String, usize>,
    pub risk: RiskLevel,
}

impl TypeGroupSummary {
    pub fn available_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.available as f64 / self.total as f64
        }
    }

    pub fn family_count(&self, family: StatusFamily) -> usize {
        self.by_family.get(family.as_str()).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEntry {
    pub type_key: TypeKey,
    pub risk: RiskLevel,
    pub advisory: String,
    pub gas_name: String,
    pub capacity: Option<f64>,
    pub total: usize,
    pub available: usize,
    pub available_ratio: f64,
}

/// Operator-maintained exclusion of a TypeKey from aggregated views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenTypeMarker {
    pub type_key: TypeKey,
    pub hidden_at: DateTime<Utc>,
    pub note: Option<String>,
}
