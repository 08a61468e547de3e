//! Shared data model for bomwatch.
//!
//! This crate is shared by the monitor and its CLI so both read the same
//! schema for documents, sessions and BOM versions. The monitor remains the
//! authority on validation; the bridge only hands us raw rows.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const MAX_PART_NUMBER_LEN: usize = 256;
pub const UNKNOWN_PROJECT_ID: &str = "UNKNOWN";
pub const UNKNOWN_PROJECT_NAME: &str = "Unknown project";

// ─────────────────────────────────────────────────────────────────────────────
// Documents
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Assembly,
    Part,
    Drawing,
    Presentation,
    Other,
}

impl DocumentKind {
    /// Resolves a kind from the source's type tag, falling back to the file
    /// extension when the tag is missing or unrecognised.
    pub fn classify(type_tag: Option<&str>, path: &str) -> Self {
        if let Some(kind) = type_tag.and_then(Self::from_type_tag) {
            return kind;
        }
        Self::from_extension(path)
    }

    fn from_type_tag(tag: &str) -> Option<Self> {
        let tag = tag.trim().to_ascii_lowercase();
        // Inventor reports kAssemblyDocumentObject and friends.
        let tag = tag
            .trim_start_matches('k')
            .trim_end_matches("documentobject")
            .trim_end_matches("document");
        match tag {
            "assembly" => Some(DocumentKind::Assembly),
            "part" => Some(DocumentKind::Part),
            "drawing" => Some(DocumentKind::Drawing),
            "presentation" => Some(DocumentKind::Presentation),
            _ => None,
        }
    }

    fn from_extension(path: &str) -> Self {
        let extension = Path::new(path)
            .extension()
            .and_then(|value| value.to_str())
            .map(|value| value.to_ascii_lowercase());
        match extension.as_deref() {
            Some("iam") => DocumentKind::Assembly,
            Some("ipt") => DocumentKind::Part,
            Some("idw") | Some("dwg") => DocumentKind::Drawing,
            Some("ipn") => DocumentKind::Presentation,
            _ => DocumentKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Assembly => "assembly",
            DocumentKind::Part => "part",
            DocumentKind::Drawing => "drawing",
            DocumentKind::Presentation => "presentation",
            DocumentKind::Other => "other",
        }
    }
}

/// One row of the source's open-document listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub path: String,
    pub last_write_time: DateTime<Utc>,
    #[serde(default)]
    pub type_tag: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub path: String,
    pub last_write_time: DateTime<Utc>,
    pub kind: DocumentKind,
}

impl From<DocumentInfo> for DocumentSnapshot {
    fn from(info: DocumentInfo) -> Self {
        let kind = DocumentKind::classify(info.type_tag.as_deref(), &info.path);
        Self {
            path: info.path,
            last_write_time: info.last_write_time,
            kind,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentEventType {
    Opened,
    Saved,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentEvent {
    pub event_type: DocumentEventType,
    pub path: String,
    pub kind: DocumentKind,
    pub last_write_time: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInfo {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub operation_number: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// Composite identity under which BOM versions are sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssemblyKey {
    pub project_id: Option<String>,
    pub machine_id: Option<i64>,
    pub file_path: String,
}

impl AssemblyKey {
    pub fn new(project_id: Option<String>, machine_id: Option<i64>, file_path: &str) -> Self {
        Self {
            project_id: project_id.filter(|value| !value.trim().is_empty()),
            machine_id,
            file_path: normalize_path(file_path),
        }
    }
}

impl fmt::Display for AssemblyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let project = self.project_id.as_deref().unwrap_or("-");
        match self.machine_id {
            Some(machine) => write!(f, "{}|{}|{}", project, machine, self.file_path),
            None => write!(f, "{}|-|{}", project, self.file_path),
        }
    }
}

/// Paths coming from Windows CAD hosts are case-insensitive and may mix
/// separators; keys must not split on either.
pub fn normalize_path(path: &str) -> String {
    path.trim().replace('\\', "/").to_lowercase()
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Ended,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Active => "active",
            SessionState::Ended => "ended",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionState::Active),
            "ended" => Some(SessionState::Ended),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkSession {
    pub id: String,
    pub file_path: String,
    pub project_id: Option<String>,
    pub machine_id: Option<i64>,
    pub engineer: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_save_at: Option<DateTime<Utc>>,
    pub save_count: u32,
    pub state: SessionState,
}

impl WorkSession {
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bills of materials
// ─────────────────────────────────────────────────────────────────────────────

/// Row as produced by the extraction bridge, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawBomItem {
    #[serde(default)]
    pub part_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub quantity: Option<f64>,
    #[serde(default)]
    pub level: Option<u32>,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub mass: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomItem {
    pub part_number: String,
    #[serde(default)]
    pub description: String,
    pub quantity: f64,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub material: Option<String>,
    #[serde(default)]
    pub mass: Option<f64>,
}

impl BomItem {
    /// Identifier used to match items across versions.
    pub fn identifier(&self) -> (u32, &str) {
        (self.level, self.part_number.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BomSnapshot {
    pub items: Vec<BomItem>,
    pub content_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BomVersion {
    pub id: String,
    pub assembly_key: String,
    pub project_id: Option<String>,
    pub machine_id: Option<i64>,
    pub file_path: String,
    pub version_number: u32,
    pub items: Vec<BomItem>,
    pub content_hash: String,
    pub extracted_by: String,
    pub extracted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemChange {
    pub before: BomItem,
    pub after: BomItem,
    pub fields: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BomChangeSet {
    pub added: Vec<BomItem>,
    pub removed: Vec<BomItem>,
    pub changed: Vec<ItemChange>,
}

impl BomChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Reason a raw BOM row was dropped.
#[derive(Debug, Clone, PartialEq, Serialize, thiserror::Error)]
#[error("item {index}: {code}: {message}")]
pub struct ItemRejection {
    pub index: usize,
    pub code: String,
    pub message: String,
}

impl ItemRejection {
    fn new(index: usize, code: &str, message: impl Into<String>) -> Self {
        Self {
            index,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl RawBomItem {
    pub fn validate(&self, index: usize) -> Result<BomItem, ItemRejection> {
        let part_number = require_string(&self.part_number, "part_number", index)?;
        if part_number.len() > MAX_PART_NUMBER_LEN {
            return Err(ItemRejection::new(
                index,
                "invalid_part_number",
                format!(
                    "part_number must be {} characters or fewer",
                    MAX_PART_NUMBER_LEN
                ),
            ));
        }

        let quantity = match self.quantity {
            Some(value) if value.is_finite() && value > 0.0 => value,
            Some(value) => {
                return Err(ItemRejection::new(
                    index,
                    "invalid_quantity",
                    format!("quantity must be a positive number, got {}", value),
                ))
            }
            None => {
                return Err(ItemRejection::new(
                    index,
                    "missing_field",
                    "quantity is required",
                ))
            }
        };

        let mass = match self.mass {
            Some(value) if !value.is_finite() || value < 0.0 => {
                return Err(ItemRejection::new(
                    index,
                    "invalid_mass",
                    format!("mass must be a non-negative number, got {}", value),
                ))
            }
            other => other,
        };

        Ok(BomItem {
            part_number,
            description: self
                .description
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            quantity,
            level: self.level.unwrap_or(1),
            material: self
                .material
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string),
            mass,
        })
    }
}

/// Validates a batch, keeping every valid row. Rejections are returned so the
/// caller can log them; a bad row never discards the rest of the batch.
pub fn validate_items(raw: &[RawBomItem]) -> (Vec<BomItem>, Vec<ItemRejection>) {
    let mut items = Vec::with_capacity(raw.len());
    let mut rejected = Vec::new();
    for (index, row) in raw.iter().enumerate() {
        match row.validate(index) {
            Ok(item) => items.push(item),
            Err(rejection) => rejected.push(rejection),
        }
    }
    (items, rejected)
}

fn require_string(value: &Option<String>, field: &str, index: usize) -> Result<String, ItemRejection> {
    if let Some(candidate) = value {
        let trimmed = candidate.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }
    Err(ItemRejection::new(
        index,
        "missing_field",
        format!("{} is required", field),
    ))
}
