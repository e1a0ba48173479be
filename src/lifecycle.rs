//! File lifecycle state machine
//!
//! ```text
//! Uploaded ──detect──▶ PendingReview ──commit──▶ Anonymized ◀──toggle──▶ DeAnonymized
//!                           ▲                        │                      │
//!                           └────────detect──────────┴──────────────────────┘
//! ```
//!
//! Cancelling a review is not a transition: the file record is restored
//! from the snapshot taken when the review began.

use crate::audit::AuditRecord;
use crate::content::FileContent;
use crate::crypto::WrappedKey;
use crate::error::{AnonymizeError, Result};
use crate::executor::AnonymizedArtifact;
use crate::types::{EntityCandidate, FileType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a partner file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileState {
    /// Received, detection not finished yet
    Uploaded,
    PendingReview,
    Anonymized,
    DeAnonymized,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uploaded => "Uploaded",
            Self::PendingReview => "Pending Review",
            Self::Anonymized => "Anonymized",
            Self::DeAnonymized => "De-anonymized",
        };
        f.write_str(label)
    }
}

/// Events that move a file through its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Detection finished and a review session opened
    DetectionCompleted,
    /// The executor succeeded and the artifact was committed
    AnonymizationCommitted,
    /// Flip between anonymized and de-anonymized
    Toggle,
}

impl LifecycleEvent {
    fn action(&self) -> &'static str {
        match self {
            Self::DetectionCompleted => "begin review",
            Self::AnonymizationCommitted => "commit anonymization",
            Self::Toggle => "toggle anonymization",
        }
    }
}

impl FileState {
    /// Target state for `event`, or `None` if the move is illegal
    pub fn next(self, event: LifecycleEvent) -> Option<FileState> {
        use FileState::*;
        use LifecycleEvent::*;
        match (self, event) {
            (Uploaded | Anonymized | DeAnonymized, DetectionCompleted) => Some(PendingReview),
            (PendingReview, AnonymizationCommitted) => Some(Anonymized),
            (Anonymized, Toggle) => Some(DeAnonymized),
            (DeAnonymized, Toggle) => Some(Anonymized),
            _ => None,
        }
    }
}

/// A file owned by exactly one partner
///
/// Fields that depend on the state are private so the invariants hold:
/// `detected_pii` is present iff the state is `PendingReview`, the audit
/// log and artifact are present iff an anonymization has committed, and
/// the restored content is present iff the state is `DeAnonymized`.
#[derive(Debug, Clone)]
pub struct PartnerFile {
    pub id: String,
    pub partner_id: String,
    pub filename: String,
    pub file_type: FileType,
    state: FileState,
    detected_pii: Option<Vec<EntityCandidate>>,
    audit_log: Option<AuditRecord>,
    artifact: Option<AnonymizedArtifact>,
    restored: Option<FileContent>,
    /// Unix milliseconds
    pub uploaded_at: i64,
    pub updated_at: i64,
}

impl PartnerFile {
    /// A freshly uploaded file with a generated id
    pub fn uploaded(partner_id: impl Into<String>, filename: impl Into<String>) -> Self {
        let filename = filename.into();
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id: format!("file-{}", uuid::Uuid::new_v4()),
            partner_id: partner_id.into(),
            file_type: FileType::from_filename(&filename),
            filename,
            state: FileState::Uploaded,
            detected_pii: None,
            audit_log: None,
            artifact: None,
            restored: None,
            uploaded_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn detected_pii(&self) -> Option<&[EntityCandidate]> {
        self.detected_pii.as_deref()
    }

    pub fn audit_log(&self) -> Option<&AuditRecord> {
        self.audit_log.as_ref()
    }

    pub fn artifact(&self) -> Option<&AnonymizedArtifact> {
        self.artifact.as_ref()
    }

    /// Reconstituted original content while de-anonymized
    pub fn restored(&self) -> Option<&FileContent> {
        self.restored.as_ref()
    }

    /// Check that `event` is legal now, returning the target state
    pub fn check(&self, event: LifecycleEvent) -> Result<FileState> {
        self.state
            .next(event)
            .ok_or_else(|| AnonymizeError::InvalidStateTransition {
                file_id: self.id.clone(),
                state: self.state,
                action: event.action(),
            })
    }

    /// Detection finished: enter review with the triaged candidates.
    /// A prior audit log and artifact survive until a new commit.
    pub fn begin_review(&mut self, candidates: Vec<EntityCandidate>) -> Result<()> {
        self.state = self.check(LifecycleEvent::DetectionCompleted)?;
        self.detected_pii = Some(candidates);
        self.restored = None;
        self.touch();
        Ok(())
    }

    /// The executor succeeded: store the artifact and its audit record
    pub fn commit_anonymization(
        &mut self,
        artifact: AnonymizedArtifact,
        audit: AuditRecord,
    ) -> Result<()> {
        self.state = self.check(LifecycleEvent::AnonymizationCommitted)?;
        self.detected_pii = None;
        self.artifact = Some(artifact);
        self.audit_log = Some(audit);
        self.restored = None;
        self.touch();
        Ok(())
    }

    /// Anonymized → DeAnonymized with the reconstituted content
    pub fn de_anonymize(&mut self, restored: FileContent) -> Result<()> {
        if self.state != FileState::Anonymized {
            return Err(self.invalid(LifecycleEvent::Toggle));
        }
        self.state = self.check(LifecycleEvent::Toggle)?;
        self.restored = Some(restored);
        self.touch();
        Ok(())
    }

    /// DeAnonymized → Anonymized; the stored artifact is reused as is
    pub fn re_anonymize(&mut self) -> Result<()> {
        if self.state != FileState::DeAnonymized {
            return Err(self.invalid(LifecycleEvent::Toggle));
        }
        self.state = self.check(LifecycleEvent::Toggle)?;
        self.restored = None;
        self.touch();
        Ok(())
    }

    /// Swap the stored artifact's data key for one wrapped under rotated
    /// partner secrets. State, content and audit log are unchanged.
    pub fn rewrap_artifact(&mut self, data_key: WrappedKey) -> Result<()> {
        let artifact = self
            .artifact
            .as_mut()
            .ok_or_else(|| AnonymizeError::InvalidStateTransition {
                file_id: self.id.clone(),
                state: self.state,
                action: "rewrap key",
            })?;
        artifact.data_key = data_key;
        self.touch();
        Ok(())
    }

    /// Current downloadable content for the file's state
    pub fn current_content(&self) -> Result<&FileContent> {
        match self.state {
            FileState::Anonymized => self.artifact.as_ref().map(|a| &a.content),
            FileState::DeAnonymized => self.restored.as_ref(),
            FileState::Uploaded | FileState::PendingReview => None,
        }
        .ok_or_else(|| AnonymizeError::InvalidStateTransition {
            file_id: self.id.clone(),
            state: self.state,
            action: "download",
        })
    }

    /// Secret-free summary for listings
    pub fn summary(&self) -> FileSummary {
        FileSummary {
            id: self.id.clone(),
            filename: self.filename.clone(),
            file_type: self.file_type,
            state: self.state,
            pending_candidates: self.detected_pii.as_ref().map(Vec::len),
            has_audit_log: self.audit_log.is_some(),
            updated_at: self.updated_at,
        }
    }

    fn invalid(&self, event: LifecycleEvent) -> AnonymizeError {
        AnonymizeError::InvalidStateTransition {
            file_id: self.id.clone(),
            state: self.state,
            action: event.action(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }
}

/// Listing view of a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub filename: String,
    pub file_type: FileType,
    pub state: FileState,
    /// Number of candidates awaiting review, while pending
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_candidates: Option<usize>,
    pub has_audit_log: bool,
    pub updated_at: i64,
}
