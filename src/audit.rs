//! Audit log derivation
//!
//! An audit record is a pure function of the finalized candidate set plus
//! snapshot fields of the partner and file at commit time. It never holds
//! secrets or detected values, only category counts.

use crate::error::{AnonymizeError, Result};
use crate::lifecycle::PartnerFile;
use crate::types::{EntityCandidate, EntityCategory, FileType};
use serde::{Deserialize, Serialize};

/// Redaction scheme recorded in audit records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnonymizationMethod {
    /// AES-256-GCM sealing keyed by partner secrets
    #[default]
    Encryption,
}

/// Count of non-ignored candidates for one category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityCount {
    pub entity: EntityCategory,
    pub count: u64,
}

/// Immutable summary of one anonymization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    /// Partner name at commit time
    pub intended_for: String,
    pub anonymized_method: AnonymizationMethod,
    /// Non-ignored candidates per category, first-seen order
    pub detected_entities_summary: Vec<EntityCount>,
    pub filename: String,
    pub file_type: FileType,
    /// Unix milliseconds
    pub recorded_at: i64,
}

impl AuditRecord {
    pub fn new(
        intended_for: impl Into<String>,
        anonymized_method: AnonymizationMethod,
        file: &PartnerFile,
        detected_entities_summary: Vec<EntityCount>,
    ) -> Self {
        Self {
            intended_for: intended_for.into(),
            anonymized_method,
            detected_entities_summary,
            filename: file.filename.clone(),
            file_type: file.file_type,
            recorded_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Count recorded for a category (0 if absent)
    pub fn count_for(&self, entity: EntityCategory) -> u64 {
        self.detected_entities_summary
            .iter()
            .find(|e| e.entity == entity)
            .map(|e| e.count)
            .unwrap_or(0)
    }
}

/// Group non-ignored candidates by category, preserving first-seen order
pub fn summarize(candidates: &[EntityCandidate]) -> Vec<EntityCount> {
    let mut summary: Vec<EntityCount> = Vec::new();
    for candidate in candidates.iter().filter(|c| !c.ignore) {
        match summary.iter_mut().find(|e| e.entity == candidate.entity) {
            Some(entry) => entry.count += 1,
            None => summary.push(EntityCount {
                entity: candidate.entity,
                count: 1,
            }),
        }
    }
    summary
}

/// Builds and attaches audit records
pub struct AuditLogWriter {
    method: AnonymizationMethod,
}

impl AuditLogWriter {
    pub fn new(method: AnonymizationMethod) -> Self {
        Self { method }
    }

    /// Derive the record for a commit of `candidates` on `file`
    pub fn derive(
        &self,
        partner_name: &str,
        file: &PartnerFile,
        candidates: &[EntityCandidate],
    ) -> AuditRecord {
        let record = AuditRecord::new(partner_name, self.method, file, summarize(candidates));
        tracing::info!(
            file_id = %file.id,
            partner_id = %file.partner_id,
            categories = record.detected_entities_summary.len(),
            "Audit record derived"
        );
        record
    }

    /// Read contract: the file's current audit record
    pub fn read(file: &PartnerFile) -> Result<AuditRecord> {
        file.audit_log()
            .cloned()
            .ok_or_else(|| AnonymizeError::NoAuditLog(file.id.clone()))
    }
}

impl Default for AuditLogWriter {
    fn default() -> Self {
        Self::new(AnonymizationMethod::Encryption)
    }
}
