//! Inventory grouping and risk classification over the snapshot store.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cylsnap_core::{
    canonical_id, AlertEntry, CanonicalStatus, HiddenTypeMarker, InventorySummaryRow, Language,
    RiskLevel, SnapshotRecord, StatusFamily, TypeGroupSummary, TypeKey, UNCLASSIFIED,
};
use cylsnap_normalize::resolve_status_label;
use cylsnap_storage::{SnapshotFilter, SnapshotStore, SourceMirror, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "cylsnap-inventory";

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid risk thresholds: {0}")]
    InvalidThresholds(String),
}

/// Availability-ratio cutoffs. A group below `high_below` is HIGH, below
/// `medium_below` MEDIUM, below `low_below` LOW.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub high_below: f64,
    pub medium_below: f64,
    pub low_below: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            high_below: 0.10,
            medium_below: 0.20,
            low_below: 0.30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RiskRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(default)]
    thresholds: RiskThresholds,
}

impl RiskThresholds {
    pub fn validate(&self) -> Result<(), InventoryError> {
        let cutoffs = [self.high_below, self.medium_below, self.low_below];
        if cutoffs.iter().any(|c| !(0.0..=1.0).contains(c)) {
            return Err(InventoryError::InvalidThresholds(
                "cutoffs must lie within [0, 1]".to_string(),
            ));
        }
        if self.high_below > self.medium_below || self.medium_below > self.low_below {
            return Err(InventoryError::InvalidThresholds(
                "cutoffs must be non-decreasing from high to low".to_string(),
            ));
        }
        Ok(())
    }

    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        let file: RiskRulesFile = serde_yaml::from_str(text).context("parsing risk rules")?;
        file.thresholds.validate()?;
        Ok(file.thresholds)
    }

    pub fn load(rules_dir: &Path) -> anyhow::Result<Self> {
        let path = rules_dir.join("risk.yaml");
        if !path.exists() {
            debug!(path = %path.display(), "no risk rules file; using default thresholds");
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskReason {
    Empty,
    AbnormalOrScrapped { count: usize },
    NoneAvailable,
    LowRatio,
    Healthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    pub reason: RiskReason,
}

/// Priority order, first match wins: empty group, abnormal/scrapped units,
/// zero availability, then ratio bands.
pub fn assess_risk(
    total: usize,
    available: usize,
    abnormal_or_scrapped: usize,
    thresholds: &RiskThresholds,
) -> RiskAssessment {
    let assessment = |level, reason| RiskAssessment { level, reason };
    if total == 0 {
        return assessment(RiskLevel::Normal, RiskReason::Empty);
    }
    if abnormal_or_scrapped > 0 {
        return assessment(
            RiskLevel::High,
            RiskReason::AbnormalOrScrapped {
                count: abnormal_or_scrapped,
            },
        );
    }
    if available == 0 {
        return assessment(RiskLevel::High, RiskReason::NoneAvailable);
    }
    let ratio = available as f64 / total as f64;
    if ratio < thresholds.high_below {
        assessment(RiskLevel::High, RiskReason::LowRatio)
    } else if ratio < thresholds.medium_below {
        assessment(RiskLevel::Medium, RiskReason::LowRatio)
    } else if ratio < thresholds.low_below {
        assessment(RiskLevel::Low, RiskReason::LowRatio)
    } else {
        assessment(RiskLevel::Normal, RiskReason::Healthy)
    }
}

pub fn classify_risk(
    total: usize,
    available: usize,
    abnormal_or_scrapped: usize,
    thresholds: &RiskThresholds,
) -> RiskLevel {
    assess_risk(total, available, abnormal_or_scrapped, thresholds).level
}

pub fn record_status(record: &SnapshotRecord) -> Option<CanonicalStatus> {
    resolve_status_label(record.status.as_deref())
}

/// An explicit per-record flag wins over inference from the status string.
pub fn is_record_available(record: &SnapshotRecord) -> bool {
    record
        .is_available
        .unwrap_or_else(|| record_status(record).is_some_and(CanonicalStatus::is_available))
}

fn status_bucket(status: Option<CanonicalStatus>) -> &'static str {
    status.map(CanonicalStatus::as_str).unwrap_or(UNCLASSIFIED)
}

fn family_bucket(status: Option<CanonicalStatus>) -> &'static str {
    status
        .map(|s| s.family().as_str())
        .unwrap_or(UNCLASSIFIED)
}

#[derive(Debug, Clone)]
struct GroupAccumulator {
    representative: SnapshotRecord,
    total: usize,
    available: usize,
    by_status: BTreeMap<String, usize>,
    by_family: BTreeMap<String, usize>,
}

impl GroupAccumulator {
    fn new(representative: &SnapshotRecord) -> Self {
        Self {
            representative: representative.clone(),
            total: 0,
            available: 0,
            by_status: BTreeMap::new(),
            by_family: BTreeMap::new(),
        }
    }

    fn accumulate(&mut self, record: &SnapshotRecord) {
        let status = record_status(record);
        self.total += 1;
        if is_record_available(record) {
            self.available += 1;
        }
        *self.by_status.entry(status_bucket(status).to_string()).or_default() += 1;
        *self.by_family.entry(family_bucket(status).to_string()).or_default() += 1;
    }

    fn finish(self, thresholds: &RiskThresholds) -> TypeGroupSummary {
        let family = |f: StatusFamily| self.by_family.get(f.as_str()).copied().unwrap_or(0);
        let flagged = family(StatusFamily::Abnormal) + family(StatusFamily::Scrapped);
        let risk = classify_risk(self.total, self.available, flagged, thresholds);
        let rep = self.representative;
        TypeGroupSummary {
            type_key: rep.type_key,
            gas_name: rep.gas_name,
            capacity: rep.capacity,
            valve_spec: rep.valve_spec,
            cylinder_spec: rep.cylinder_spec,
            usage_place: rep.usage_place,
            enduser_code: rep.enduser_code,
            total: self.total,
            available: self.available,
            by_status: self.by_status,
            by_family: self.by_family,
            risk,
        }
    }
}

pub fn aggregate(records: &[SnapshotRecord], thresholds: &RiskThresholds) -> Vec<TypeGroupSummary> {
    let mut groups: BTreeMap<&TypeKey, GroupAccumulator> = BTreeMap::new();
    for record in records {
        groups
            .entry(&record.type_key)
            .or_insert_with(|| GroupAccumulator::new(record))
            .accumulate(record);
    }
    groups
        .into_values()
        .map(|acc| acc.finish(thresholds))
        .collect()
}

pub fn summary_rows(records: &[SnapshotRecord]) -> Vec<InventorySummaryRow> {
    let mut rows: BTreeMap<(TypeKey, &'static str), (usize, usize)> = BTreeMap::new();
    for record in records {
        let status = status_bucket(record_status(record));
        let entry = rows.entry((record.type_key.clone(), status)).or_default();
        entry.0 += 1;
        if is_record_available(record) {
            entry.1 += 1;
        }
    }
    rows.into_iter()
        .map(|((type_key, status), (count, available))| InventorySummaryRow {
            type_key,
            status: status.to_string(),
            count,
            available,
        })
        .collect()
}

pub fn advisory(group: &TypeGroupSummary, reason: RiskReason, lang: Language) -> String {
    let pct = group.available_ratio() * 100.0;
    match (reason, lang) {
        (RiskReason::Empty, Language::En) => "No cylinders of this type.".to_string(),
        (RiskReason::Empty, Language::Ja) => "この種別の容器はありません。".to_string(),
        (RiskReason::AbnormalOrScrapped { count }, Language::En) => format!(
            "{count} abnormal or scrapped cylinder(s); inspect before allocating this type."
        ),
        (RiskReason::AbnormalOrScrapped { count }, Language::Ja) => {
            format!("異常・廃棄の容器が{count}本あります。割当前に確認してください。")
        }
        (RiskReason::NoneAvailable, Language::En) => format!(
            "No cylinders in storage; all {} are in use or in process.",
            group.total
        ),
        (RiskReason::NoneAvailable, Language::Ja) => {
            format!("在庫がありません。{}本すべてが使用中または処理中です。", group.total)
        }
        (RiskReason::LowRatio, Language::En) => format!(
            "Only {} of {} cylinders available ({pct:.0}%).",
            group.available, group.total
        ),
        (RiskReason::LowRatio, Language::Ja) => format!(
            "利用可能な容器は{}本中{}本のみです({pct:.0}%)。",
            group.total, group.available
        ),
        (RiskReason::Healthy, Language::En) => "Stock level normal.".to_string(),
        (RiskReason::Healthy, Language::Ja) => "在庫は正常です。".to_string(),
    }
}

fn flagged_count(group: &TypeGroupSummary) -> usize {
    group.family_count(StatusFamily::Abnormal) + group.family_count(StatusFamily::Scrapped)
}

pub fn alerts(
    groups: &[TypeGroupSummary],
    thresholds: &RiskThresholds,
    lang: Language,
) -> Vec<AlertEntry> {
    let mut out = groups
        .iter()
        .filter_map(|group| {
            let assessment =
                assess_risk(group.total, group.available, flagged_count(group), thresholds);
            if assessment.level == RiskLevel::Normal {
                return None;
            }
            Some(AlertEntry {
                type_key: group.type_key.clone(),
                risk: assessment.level,
                advisory: advisory(group, assessment.reason, lang),
                gas_name: group.gas_name.clone(),
                capacity: group.capacity,
                total: group.total,
                available: group.available,
                available_ratio: group.available_ratio(),
            })
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.risk.cmp(&a.risk).then_with(|| a.type_key.cmp(&b.type_key)));
    out
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct InventoryQuery {
    pub type_key: Option<TypeKey>,
    /// Canonical status name or status family name.
    pub status: Option<String>,
    pub enduser_code: Option<String>,
    #[serde(default)]
    pub include_hidden: bool,
    /// Drop rows whose identifier no longer exists in the source mirror.
    #[serde(default)]
    pub orphan_guard: bool,
}

impl InventoryQuery {
    fn status_matches(&self, record: &SnapshotRecord) -> bool {
        let Some(wanted) = self.status.as_deref().map(str::trim) else {
            return true;
        };
        let status = record_status(record);
        status_bucket(status) == wanted || family_bucket(status) == wanted
    }
}

#[derive(Clone)]
pub struct InventoryService {
    store: Arc<dyn SnapshotStore>,
    mirror: Option<Arc<dyn SourceMirror>>,
    thresholds: RiskThresholds,
}

impl InventoryService {
    pub fn new(store: Arc<dyn SnapshotStore>, thresholds: RiskThresholds) -> Self {
        Self {
            store,
            mirror: None,
            thresholds,
        }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn SourceMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub async fn records(&self, query: &InventoryQuery) -> Result<Vec<SnapshotRecord>, InventoryError> {
        let filter = SnapshotFilter {
            type_key: query.type_key.clone(),
            enduser_code: query.enduser_code.clone(),
        };
        let mut records = self.store.list(&filter).await?;

        if !query.include_hidden {
            let hidden = self.store.hidden_type_keys().await?;
            records.retain(|r| !hidden.contains(&r.type_key));
        }
        records.retain(|r| query.status_matches(r));

        if query.orphan_guard {
            if let Some(mirror) = &self.mirror {
                let live = mirror
                    .list_heads()
                    .await?
                    .iter()
                    .map(|h| canonical_id(&h.cylinder_id).to_string())
                    .collect::<HashSet<_>>();
                records.retain(|r| live.contains(canonical_id(&r.cylinder_id)));
            }
        }
        Ok(records)
    }

    pub async fn groups(&self, query: &InventoryQuery) -> Result<Vec<TypeGroupSummary>, InventoryError> {
        let records = self.records(query).await?;
        Ok(aggregate(&records, &self.thresholds))
    }

    pub async fn rows(&self, query: &InventoryQuery) -> Result<Vec<InventorySummaryRow>, InventoryError> {
        let records = self.records(query).await?;
        Ok(summary_rows(&records))
    }

    pub async fn alerts(
        &self,
        query: &InventoryQuery,
        lang: Language,
    ) -> Result<Vec<AlertEntry>, InventoryError> {
        let groups = self.groups(query).await?;
        Ok(alerts(&groups, &self.thresholds, lang))
    }

    pub async fn hide(&self, marker: &HiddenTypeMarker) -> Result<(), InventoryError> {
        self.store.hide_type(marker).await?;
        debug!(type_key = %marker.type_key, "type hidden from inventory");
        Ok(())
    }

    pub async fn unhide(&self, type_key: &TypeKey) -> Result<bool, InventoryError> {
        Ok(self.store.unhide_type(type_key).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cylsnap_core::SourceRecord;
    use cylsnap_storage::MemoryStore;

    fn record(id: &str, key: &str, status: Option<&str>) -> SnapshotRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 3, 6, 0, 0).single().unwrap();
        SnapshotRecord {
            cylinder_id: id.to_string(),
            gas_name: "COS".to_string(),
            capacity: Some(47.0),
            valve_spec: "CGA330".to_string(),
            cylinder_spec: "BN SUS".to_string(),
            location_code: String::new(),
            usage_code: String::new(),
            enduser_code: String::new(),
            condition_code: String::new(),
            status: status.map(str::to_string),
            valve_format: "CGA330".to_string(),
            valve_material: String::new(),
            cylinder_format: String::new(),
            cylinder_material: "SUS".to_string(),
            usage_place: "DeptA".to_string(),
            type_key: TypeKey::new(key),
            is_available: None,
            pressure_due_date: None,
            last_event_at: None,
            source_updated_at: at,
            refreshed_at: at,
        }
    }

    fn group_of(statuses: &[Option<&str>]) -> TypeGroupSummary {
        let records = statuses
            .iter()
            .enumerate()
            .map(|(i, s)| record(&format!("C-{i}"), "k", *s))
            .collect::<Vec<_>>();
        aggregate(&records, &RiskThresholds::default())
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn zero_availability_is_high_not_ratio_based() {
        let t = RiskThresholds::default();
        assert_eq!(classify_risk(10, 0, 0, &t), RiskLevel::High);
        assert_eq!(assess_risk(10, 0, 0, &t).reason, RiskReason::NoneAvailable);
    }

    #[test]
    fn empty_group_is_normal() {
        let t = RiskThresholds::default();
        assert_eq!(classify_risk(0, 0, 0, &t), RiskLevel::Normal);
    }

    #[test]
    fn abnormal_dominates_healthy_ratio() {
        let t = RiskThresholds::default();
        assert_eq!(classify_risk(10, 10, 1, &t), RiskLevel::High);
        assert_eq!(
            assess_risk(10, 0, 2, &t).reason,
            RiskReason::AbnormalOrScrapped { count: 2 }
        );
    }

    #[test]
    fn ratio_bands() {
        let t = RiskThresholds::default();
        assert_eq!(classify_risk(100, 5, 0, &t), RiskLevel::High);
        assert_eq!(classify_risk(100, 10, 0, &t), RiskLevel::Medium);
        assert_eq!(classify_risk(100, 19, 0, &t), RiskLevel::Medium);
        assert_eq!(classify_risk(100, 20, 0, &t), RiskLevel::Low);
        assert_eq!(classify_risk(100, 29, 0, &t), RiskLevel::Low);
        assert_eq!(classify_risk(100, 30, 0, &t), RiskLevel::Normal);
    }

    #[test]
    fn fine_and_family_counts_both_sum_to_total() {
        let group = group_of(&[
            Some("stored_uncollected"),
            Some("stored_collected"),
            Some("shipped"),
            Some("at_customer"),
            Some("in storage"),
            Some("mystery"),
            None,
        ]);
        assert_eq!(group.total, 7);
        assert_eq!(group.by_status.values().sum::<usize>(), group.total);
        assert_eq!(group.by_family.values().sum::<usize>(), group.total);
        assert_eq!(group.by_family["available"], 3);
        assert_eq!(group.by_family["outbound"], 2);
        assert_eq!(group.by_status["stored_collected"], 2);
        assert_eq!(group.by_status[UNCLASSIFIED], 1);
        assert_eq!(group.available, 3);
    }

    #[test]
    fn explicit_flag_overrides_status_inference() {
        let mut shipped_but_flagged = record("C-1", "k", Some("shipped"));
        shipped_but_flagged.is_available = Some(true);
        let mut stored_but_flagged = record("C-2", "k", Some("stored_collected"));
        stored_but_flagged.is_available = Some(false);
        assert!(is_record_available(&shipped_but_flagged));
        assert!(!is_record_available(&stored_but_flagged));
        assert!(is_record_available(&record("C-3", "k", Some("保管中"))));
    }

    #[test]
    fn scrapped_unit_marks_group_high() {
        let group = group_of(&[Some("stored_collected"); 9]
            .into_iter()
            .chain([Some("scrapped")])
            .collect::<Vec<_>>());
        assert_eq!(group.risk, RiskLevel::High);
    }

    #[test]
    fn summary_rows_split_by_status() {
        let records = vec![
            record("C-1", "a", Some("shipped")),
            record("C-2", "a", Some("stored_collected")),
            record("C-3", "a", Some("stored_collected")),
            record("C-4", "b", None),
        ];
        let rows = summary_rows(&records);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].type_key.as_str(), "a");
        assert_eq!(rows[0].status, "shipped");
        assert_eq!((rows[1].count, rows[1].available), (2, 2));
        assert_eq!(rows[2].status, UNCLASSIFIED);
    }

    #[test]
    fn alerts_sorted_by_severity_with_localized_advisory() {
        let records = vec![
            record("A-1", "a", Some("shipped")),
            record("B-1", "b", Some("stored_collected")),
            record("B-2", "b", Some("abnormal")),
            record("C-1", "c", Some("stored_collected")),
        ];
        let groups = aggregate(&records, &RiskThresholds::default());
        let entries = alerts(&groups, &RiskThresholds::default(), Language::En);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.risk == RiskLevel::High));
        assert_eq!(entries[0].type_key.as_str(), "a");
        assert!(entries[0].advisory.contains("No cylinders in storage"));
        assert!(entries[1].advisory.contains("abnormal"));

        let ja = alerts(&groups, &RiskThresholds::default(), Language::Ja);
        assert!(ja[1].advisory.contains("異常"));
    }

    #[test]
    fn thresholds_load_from_yaml_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(RiskThresholds::load(dir.path()).unwrap(), RiskThresholds::default());

        std::fs::write(
            dir.path().join("risk.yaml"),
            "version: 1\nthresholds:\n  high_below: 0.05\n  medium_below: 0.15\n  low_below: 0.25\n",
        )
        .unwrap();
        let loaded = RiskThresholds::load(dir.path()).unwrap();
        assert_eq!(loaded.high_below, 0.05);
        assert_eq!(classify_risk(100, 7, 0, &loaded), RiskLevel::Medium);

        std::fs::write(
            dir.path().join("risk.yaml"),
            "version: 1\nthresholds:\n  high_below: 0.5\n  medium_below: 0.2\n",
        )
        .unwrap();
        assert!(RiskThresholds::load(dir.path()).is_err());
    }

    #[tokio::test]
    async fn service_applies_hidden_status_and_orphan_filters() {
        let store = Arc::new(MemoryStore::new());
        for r in [
            record("C-1", "a", Some("stored_collected")),
            record("C-2", "a", Some("shipped")),
            record("C-3", "b", Some("stored_collected")),
        ] {
            store.upsert(&r).await.unwrap();
        }
        let at = Utc.with_ymd_and_hms(2026, 3, 3, 6, 0, 0).single().unwrap();
        store
            .put_source(SourceRecord {
                cylinder_id: "C-1  ".to_string(),
                gas_name: None,
                capacity: None,
                valve_spec: None,
                cylinder_spec: None,
                location_code: None,
                usage_code: None,
                enduser_code: None,
                condition_code: None,
                pressure_due_date: None,
                last_moved_at: None,
                source_updated_at: at,
            })
            .await;

        let service = InventoryService::new(store.clone(), RiskThresholds::default())
            .with_mirror(store.clone());
        service
            .hide(&HiddenTypeMarker {
                type_key: TypeKey::new("b"),
                hidden_at: at,
                note: Some("retired".to_string()),
            })
            .await
            .unwrap();

        let groups = service.groups(&InventoryQuery::default()).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].total, 2);

        let all = InventoryQuery {
            include_hidden: true,
            ..Default::default()
        };
        assert_eq!(service.groups(&all).await.unwrap().len(), 2);

        let available_only = InventoryQuery {
            status: Some("available".to_string()),
            ..Default::default()
        };
        assert_eq!(service.records(&available_only).await.unwrap().len(), 1);

        let guarded = InventoryQuery {
            orphan_guard: true,
            ..Default::default()
        };
        let records = service.records(&guarded).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cylinder_id, "C-1");

        assert!(service.unhide(&TypeKey::new("b")).await.unwrap());
        assert!(!service.unhide(&TypeKey::new("b")).await.unwrap());
        assert_eq!(service.groups(&InventoryQuery::default()).await.unwrap().len(), 2);
    }
}
