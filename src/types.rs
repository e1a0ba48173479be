//! Core domain types for the anonymization pipeline
//!
//! All serializable types use camelCase JSON for wire compatibility.
//! Partner secrets are deliberately not serializable.

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Logo used when a partner registers without one
pub const DEFAULT_PARTNER_LOGO: &str = "/icons/default_partner.svg";

/// Classification tag for a detected PII span or column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityCategory {
    /// Person or company name
    Person,
    /// National identity card number
    IcNumber,
    CreditCard,
    PhoneNumber,
    Email,
    /// Address or other geographic location
    Location,
    DateTime,
    /// Nationality, religious or political group, ethnicity
    Nrp,
}

impl EntityCategory {
    /// All known categories, in detection-settings order
    pub const ALL: [EntityCategory; 8] = [
        EntityCategory::PhoneNumber,
        EntityCategory::IcNumber,
        EntityCategory::Person,
        EntityCategory::Email,
        EntityCategory::Location,
        EntityCategory::DateTime,
        EntityCategory::Nrp,
        EntityCategory::CreditCard,
    ];

    /// Wire name of the category (e.g. `PHONE_NUMBER`)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "PERSON",
            Self::IcNumber => "IC_NUMBER",
            Self::CreditCard => "CREDIT_CARD",
            Self::PhoneNumber => "PHONE_NUMBER",
            Self::Email => "EMAIL",
            Self::Location => "LOCATION",
            Self::DateTime => "DATE_TIME",
            Self::Nrp => "NRP",
        }
    }
}

impl fmt::Display for EntityCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-partner detection toggles
///
/// Each toggle enables one entity category. Disabled categories are never
/// surfaced to a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionSettings {
    pub phone_number: bool,
    pub ic_number: bool,
    pub person_company_name: bool,
    pub email: bool,
    pub address_geographic: bool,
    pub date_time: bool,
    pub ethnicity_race_nationality: bool,
    pub credit_card: bool,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            phone_number: true,
            ic_number: true,
            person_company_name: true,
            email: true,
            address_geographic: true,
            date_time: true,
            ethnicity_race_nationality: true,
            credit_card: true,
        }
    }
}

impl DetectionSettings {
    /// Settings with every category disabled
    pub fn none() -> Self {
        Self {
            phone_number: false,
            ic_number: false,
            person_company_name: false,
            email: false,
            address_geographic: false,
            date_time: false,
            ethnicity_race_nationality: false,
            credit_card: false,
        }
    }

    /// Whether the given category is surfaced for this partner
    pub fn is_enabled(&self, category: EntityCategory) -> bool {
        match category {
            EntityCategory::PhoneNumber => self.phone_number,
            EntityCategory::IcNumber => self.ic_number,
            EntityCategory::Person => self.person_company_name,
            EntityCategory::Email => self.email,
            EntityCategory::Location => self.address_geographic,
            EntityCategory::DateTime => self.date_time,
            EntityCategory::Nrp => self.ethnicity_race_nationality,
            EntityCategory::CreditCard => self.credit_card,
        }
    }

    /// Enable or disable a single category
    pub fn set(&mut self, category: EntityCategory, enabled: bool) {
        let slot = match category {
            EntityCategory::PhoneNumber => &mut self.phone_number,
            EntityCategory::IcNumber => &mut self.ic_number,
            EntityCategory::Person => &mut self.person_company_name,
            EntityCategory::Email => &mut self.email,
            EntityCategory::Location => &mut self.address_geographic,
            EntityCategory::DateTime => &mut self.date_time,
            EntityCategory::Nrp => &mut self.ethnicity_race_nationality,
            EntityCategory::CreditCard => &mut self.credit_card,
        };
        *slot = enabled;
    }

    /// Builder-style variant of [`set`](Self::set)
    pub fn with(mut self, category: EntityCategory, enabled: bool) -> Self {
        self.set(category, enabled);
        self
    }

    /// Enabled categories, in settings order
    pub fn enabled_categories(&self) -> Vec<EntityCategory> {
        EntityCategory::ALL
            .into_iter()
            .filter(|c| self.is_enabled(*c))
            .collect()
    }
}

/// Secret string that is wiped on drop and never printed
#[derive(Clone, Default, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Raw secret bytes, only for key derivation
    pub(crate) fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

/// Partner key material, readable only by the anonymization executor
#[derive(Debug, Clone, Default)]
pub struct PartnerSecrets {
    pub data_encryption_key: Secret,
    pub file_password: Secret,
}

impl PartnerSecrets {
    pub fn new(data_encryption_key: impl Into<Secret>, file_password: impl Into<Secret>) -> Self {
        Self {
            data_encryption_key: data_encryption_key.into(),
            file_password: file_password.into(),
        }
    }
}

/// A registered partner, including secret material
///
/// Only the stores and the pipeline hold this type. Callers outside the
/// crate see [`PartnerProfile`].
#[derive(Debug, Clone)]
pub struct Partner {
    pub id: String,
    pub name: String,
    pub logo: String,
    pub secrets: PartnerSecrets,
    pub detection_settings: DetectionSettings,
    /// Registration time (Unix milliseconds)
    pub created_at: i64,
}

impl Partner {
    /// Create a partner from registration fields with a fresh id
    pub fn register(fields: NewPartner) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: fields.name.trim().to_string(),
            logo: fields
                .logo
                .filter(|l| !l.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PARTNER_LOGO.to_string()),
            secrets: PartnerSecrets::new(fields.data_encryption_key, fields.file_password),
            detection_settings: fields.detection_settings,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Public view without secrets
    pub fn profile(&self) -> PartnerProfile {
        PartnerProfile {
            id: self.id.clone(),
            name: self.name.clone(),
            logo: self.logo.clone(),
            detection_settings: self.detection_settings.clone(),
            created_at: self.created_at,
        }
    }
}

/// Secret-free partner view handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartnerProfile {
    pub id: String,
    pub name: String,
    pub logo: String,
    pub detection_settings: DetectionSettings,
    pub created_at: i64,
}

/// Fields for partner registration
#[derive(Debug, Clone, Default)]
pub struct NewPartner {
    pub name: String,
    pub logo: Option<String>,
    pub data_encryption_key: Secret,
    pub file_password: Secret,
    pub detection_settings: DetectionSettings,
}

impl NewPartner {
    pub fn new(
        name: impl Into<String>,
        data_encryption_key: impl Into<Secret>,
        file_password: impl Into<Secret>,
    ) -> Self {
        Self {
            name: name.into(),
            logo: None,
            data_encryption_key: data_encryption_key.into(),
            file_password: file_password.into(),
            detection_settings: DetectionSettings::default(),
        }
    }

    pub fn with_logo(mut self, logo: impl Into<String>) -> Self {
        self.logo = Some(logo.into());
        self
    }

    pub fn with_detection_settings(mut self, settings: DetectionSettings) -> Self {
        self.detection_settings = settings;
        self
    }
}

/// Partial update of a partner's settings; `None` fields are left alone
#[derive(Debug, Clone, Default)]
pub struct PartnerSettingsUpdate {
    pub logo: Option<String>,
    pub detection_settings: Option<DetectionSettings>,
    /// Rotate partner secrets. Previously anonymized files keep their key.
    pub secrets: Option<PartnerSecrets>,
}

/// Kind of file, derived from its extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Text,
    Tabular,
    Image,
    Document,
    Unknown,
}

impl FileType {
    /// Derive the file type from the filename's last extension, case-insensitively
    pub fn from_filename(filename: &str) -> Self {
        let ext = match filename.rsplit_once('.') {
            Some((_, ext)) => ext.to_ascii_lowercase(),
            None => return Self::Unknown,
        };
        match ext.as_str() {
            "txt" => Self::Text,
            "jpg" | "jpeg" | "png" | "bmp" => Self::Image,
            "csv" | "xlsx" | "xlsm" | "xls" => Self::Tabular,
            "doc" | "docx" | "pdf" => Self::Document,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Text => "Text file",
            Self::Tabular => "Tabular file",
            Self::Image => "Image file",
            Self::Document => "Document file",
            Self::Unknown => "Unknown file",
        };
        f.write_str(label)
    }
}

/// Who last decided a candidate's `ignore` flag
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IgnoreOrigin {
    /// Untouched caller default
    #[default]
    Default,
    /// Pre-set by the detector
    Detector,
    /// Set by confidence triage
    Auto,
    /// Set by a reviewer; triage never overrides it
    Human,
}

/// What a candidate points at inside the file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum CandidateTarget {
    /// A span of unstructured text (byte offsets into the content)
    #[serde(rename_all = "camelCase")]
    Text {
        word: String,
        start: usize,
        end: usize,
        confidence: f64,
    },
    /// A whole column of tabular content
    #[serde(rename_all = "camelCase")]
    Column {
        column: String,
        top_data: Vec<String>,
        avg_confidence: f64,
    },
}

/// A PII entity proposed by the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCandidate {
    /// Unique within a review session
    pub id: String,
    pub entity: EntityCategory,
    #[serde(flatten)]
    pub target: CandidateTarget,
    pub ignore: bool,
    #[serde(default)]
    pub ignore_origin: IgnoreOrigin,
}

impl EntityCandidate {
    /// A text-span candidate
    pub fn text(
        entity: EntityCategory,
        word: impl Into<String>,
        start: usize,
        end: usize,
        confidence: f64,
    ) -> Self {
        Self::new(
            entity,
            CandidateTarget::Text {
                word: word.into(),
                start,
                end,
                confidence,
            },
        )
    }

    /// A tabular-column candidate
    pub fn column(
        entity: EntityCategory,
        column: impl Into<String>,
        top_data: Vec<String>,
        avg_confidence: f64,
    ) -> Self {
        Self::new(
            entity,
            CandidateTarget::Column {
                column: column.into(),
                top_data,
                avg_confidence,
            },
        )
    }

    fn new(entity: EntityCategory, target: CandidateTarget) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity,
            target,
            ignore: false,
            ignore_origin: IgnoreOrigin::Default,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Detector-supplied ignore flag
    pub fn with_ignore(mut self, ignore: bool) -> Self {
        self.ignore = ignore;
        self.ignore_origin = if ignore {
            IgnoreOrigin::Detector
        } else {
            IgnoreOrigin::Default
        };
        self
    }

    /// Confidence used by triage, clamped to `[0, 100]` (NaN counts as 0)
    pub fn effective_confidence(&self) -> f64 {
        let raw = match &self.target {
            CandidateTarget::Text { confidence, .. } => *confidence,
            CandidateTarget::Column { avg_confidence, .. } => *avg_confidence,
        };
        if raw.is_nan() {
            0.0
        } else {
            raw.clamp(0.0, 100.0)
        }
    }
}
