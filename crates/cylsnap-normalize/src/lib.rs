//! Total normalizers for noisy mirror fields: spec parsing, status mapping, type keys.

use std::sync::OnceLock;

use cylsnap_core::{CanonicalStatus, Language, TypeKey};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "cylsnap-normalize";

/// Joins type-key fields. Never produced by the mirror's spec vocabularies.
pub const TYPE_KEY_DELIMITER: &str = "|";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParsedSpec {
    pub format: String,
    pub material: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialMatch {
    Prefix,
    Contains,
}

#[derive(Debug, Clone, Copy)]
pub struct MaterialRule {
    pub token: &'static str,
    pub material: &'static str,
}

/// Ordered, first match wins. Longer stainless grades sit before the bare `SUS`
/// token and spelled-out names before their abbreviations.
pub const MATERIAL_RULES: &[MaterialRule] = &[
    MaterialRule { token: "SUS316L", material: "SUS316L" },
    MaterialRule { token: "SUS316", material: "SUS316" },
    MaterialRule { token: "SUS304", material: "SUS304" },
    MaterialRule { token: "STAINLESS", material: "SUS" },
    MaterialRule { token: "SUS", material: "SUS" },
    MaterialRule { token: "BRASS", material: "BRASS" },
    MaterialRule { token: "ALUMINIUM", material: "AL" },
    MaterialRule { token: "ALUMINUM", material: "AL" },
    MaterialRule { token: "STEEL", material: "STEEL" },
    MaterialRule { token: "CRMO", material: "CRMO" },
    MaterialRule { token: "TITANIUM", material: "TI" },
    MaterialRule { token: "COPPER", material: "CU" },
    MaterialRule { token: "COS", material: "COS" },
    MaterialRule { token: "MN", material: "MN" },
    MaterialRule { token: "AL", material: "AL" },
];

#[derive(Debug, Clone, Copy)]
pub struct FormatRule {
    pub prefix: &'static str,
    pub pattern: &'static str,
}

/// Ordered, first match wins. Patterns run against upper-cased input.
pub const FORMAT_RULES: &[FormatRule] = &[
    FormatRule { prefix: "CGA", pattern: r"CGA[\s_\-./]*(\d{3,4})(?:[^0-9]|$)" },
    FormatRule { prefix: "DISS", pattern: r"DISS[\s_\-./]*(\d{3,4})(?:[^0-9]|$)" },
    FormatRule { prefix: "DIN", pattern: r"DIN[\s_\-./]*(\d{3,4})(?:[^0-9]|$)" },
    FormatRule { prefix: "JIS", pattern: r"JIS[\s_\-./]*(\d{3,4})(?:[^0-9]|$)" },
];

fn compiled_format_rules() -> &'static [(FormatRule, Regex)] {
    static RULES: OnceLock<Vec<(FormatRule, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        FORMAT_RULES
            .iter()
            .map(|rule| {
                let re = Regex::new(rule.pattern).expect("format rule patterns are valid");
                (*rule, re)
            })
            .collect()
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_format(spec: Option<&str>) -> String {
    let Some(text) = non_empty(spec) else {
        return String::new();
    };
    let upper = text.to_ascii_uppercase();
    for (rule, re) in compiled_format_rules() {
        if let Some(digits) = re.captures(&upper).and_then(|caps| caps.get(1)) {
            return format!("{}{}", rule.prefix, digits.as_str());
        }
    }
    text.to_string()
}

/// Short codes only count as contained when they stand apart from other letters,
/// so `AL` is not found inside `GENERAL`.
fn contains_token(haystack: &str, token: &str) -> bool {
    if token.len() > 3 {
        return haystack.contains(token);
    }
    haystack.match_indices(token).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + token.len()..].chars().next();
        !before.is_some_and(|c| c.is_ascii_alphabetic())
            && !after.is_some_and(|c| c.is_ascii_alphabetic())
    })
}

pub fn parse_material(spec: Option<&str>, mode: MaterialMatch) -> String {
    let Some(text) = non_empty(spec) else {
        return String::new();
    };
    let upper = text.to_ascii_uppercase();
    MATERIAL_RULES
        .iter()
        .find(|rule| match mode {
            MaterialMatch::Prefix => upper.starts_with(rule.token),
            MaterialMatch::Contains => contains_token(&upper, rule.token),
        })
        .map(|rule| rule.material.to_string())
        .unwrap_or_default()
}

pub fn parse_valve_spec(spec: Option<&str>) -> ParsedSpec {
    ParsedSpec {
        format: parse_format(spec),
        material: parse_material(spec, MaterialMatch::Prefix),
    }
}

pub fn parse_cylinder_spec(spec: Option<&str>) -> ParsedSpec {
    ParsedSpec {
        format: parse_format(spec),
        material: parse_material(spec, MaterialMatch::Contains),
    }
}

fn is_short_internal_code(value: &str) -> bool {
    (1..=6).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

pub fn compose_usage_place(location_code: Option<&str>, usage_code: Option<&str>) -> String {
    let location = non_empty(location_code);
    let Some(usage) = non_empty(usage_code) else {
        return location.unwrap_or_default().to_string();
    };
    if usage.contains('/') {
        return usage.to_string();
    }
    match location {
        Some(location) if is_short_internal_code(usage) => format!("{location}/{usage}"),
        _ => usage.to_string(),
    }
}

pub const CONDITION_CODES: &[(&str, CanonicalStatus)] = &[
    ("100", CanonicalStatus::StoredUncollected),
    ("101", CanonicalStatus::StoredUncollected),
    ("102", CanonicalStatus::StoredCollected),
    ("110", CanonicalStatus::StoredCollected),
    ("200", CanonicalStatus::InProcess),
    ("210", CanonicalStatus::InProcess),
    ("220", CanonicalStatus::InProcess),
    ("300", CanonicalStatus::InProcess),
    ("400", CanonicalStatus::Inspection),
    ("500", CanonicalStatus::Inspection),
    ("600", CanonicalStatus::Shipped),
    ("610", CanonicalStatus::Shipped),
    ("700", CanonicalStatus::AtCustomer),
    ("800", CanonicalStatus::Abnormal),
    ("810", CanonicalStatus::Abnormal),
    ("900", CanonicalStatus::Scrapped),
];

/// Coarse labels written by older jobs and UI paths, read as the newer fine-grained status.
pub const LEGACY_STATUS_ALIASES: &[(&str, CanonicalStatus)] = &[
    ("in storage", CanonicalStatus::StoredCollected),
    ("保管中", CanonicalStatus::StoredCollected),
    ("filled", CanonicalStatus::StoredCollected),
    ("充填済", CanonicalStatus::StoredCollected),
    ("empty", CanonicalStatus::StoredUncollected),
    ("空", CanonicalStatus::StoredUncollected),
    ("processing", CanonicalStatus::InProcess),
    ("lent", CanonicalStatus::AtCustomer),
    ("貸出中", CanonicalStatus::AtCustomer),
    ("defective", CanonicalStatus::Abnormal),
    ("不良", CanonicalStatus::Abnormal),
    ("disposed", CanonicalStatus::Scrapped),
    ("廃棄済", CanonicalStatus::Scrapped),
];

pub fn normalize_condition_code(code: Option<&str>) -> Option<CanonicalStatus> {
    let code = non_empty(code)?;
    let numeric = if code.chars().all(|c| c.is_ascii_digit()) {
        let stripped = code.trim_start_matches('0');
        if stripped.is_empty() {
            "0"
        } else {
            stripped
        }
    } else {
        code
    };
    let status = CONDITION_CODES
        .iter()
        .find(|(candidate, _)| *candidate == numeric)
        .map(|(_, status)| *status)
        .unwrap_or(CanonicalStatus::Other);
    Some(status)
}

/// Reads a stored status string: canonical names, display labels in either language,
/// then legacy aliases. Never rewrites what is stored.
pub fn resolve_status_label(label: Option<&str>) -> Option<CanonicalStatus> {
    let label = non_empty(label)?;
    if let Ok(status) = label.parse::<CanonicalStatus>() {
        return Some(status);
    }
    let lowered = label.to_lowercase();
    let by_display = CanonicalStatus::ALL.into_iter().find(|status| {
        [Language::En, Language::Ja]
            .into_iter()
            .any(|lang| status.display_label(lang).to_lowercase() == lowered)
    });
    if by_display.is_some() {
        return by_display;
    }
    let status = LEGACY_STATUS_ALIASES
        .iter()
        .find(|(alias, _)| *alias == lowered)
        .map(|(_, status)| *status)
        .unwrap_or(CanonicalStatus::Other);
    Some(status)
}

pub fn format_capacity(capacity: Option<f64>) -> String {
    capacity.map(|c| c.to_string()).unwrap_or_default()
}

pub fn canonical_type_string(
    gas_name: Option<&str>,
    capacity: Option<f64>,
    valve_spec: Option<&str>,
    cylinder_spec: Option<&str>,
    usage_place: Option<&str>,
    enduser_code: Option<&str>,
) -> String {
    let capacity = format_capacity(capacity);
    let mut fields = vec![
        gas_name.unwrap_or_default().trim(),
        capacity.as_str(),
        valve_spec.unwrap_or_default().trim(),
        cylinder_spec.unwrap_or_default().trim(),
        usage_place.unwrap_or_default().trim(),
    ];
    if let Some(enduser) = enduser_code {
        fields.push(enduser.trim());
    }
    fields.join(TYPE_KEY_DELIMITER)
}

pub fn generate_type_key(
    gas_name: Option<&str>,
    capacity: Option<f64>,
    valve_spec: Option<&str>,
    cylinder_spec: Option<&str>,
    usage_place: Option<&str>,
    enduser_code: Option<&str>,
) -> TypeKey {
    let canonical = canonical_type_string(
        gas_name,
        capacity,
        valve_spec,
        cylinder_spec,
        usage_place,
        enduser_code,
    );
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    TypeKey::new(hex::encode(&digest[..16]))
}
