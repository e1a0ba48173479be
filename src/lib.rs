//! # a3s-anonymize
//!
//! Reversible PII anonymization for partner files in the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-anonymize` takes a partner's uploaded file through detection,
//! confidence triage, human review, reversible encryption of the confirmed
//! PII and an audit record of what was redacted. Anonymized files can be
//! toggled back to their original content with the partner's key: each
//! file carries its own data key, wrapped under the partner key and
//! re-wrapped when the partner rotates its secrets.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_anonymize::{Anonymizer, NewPartner, PatternDetector};
//! use a3s_anonymize::store::memory::{MemoryFileStore, MemoryPartnerStore};
//!
//! # async fn example() -> a3s_anonymize::Result<()> {
//! let anonymizer = Anonymizer::new(
//!     MemoryPartnerStore::new(),
//!     MemoryFileStore::new(),
//!     PatternDetector::new()?,
//! );
//!
//! let partner = anonymizer
//!     .register_partner(NewPartner::new("Acme", "data-key", "file-password"))
//!     .await?;
//!
//! // Detection and triage open a review session
//! let session = anonymizer
//!     .upload(&partner.id, "contacts.txt", b"Mail zain@example.com")
//!     .await?;
//!
//! // Commit the reviewed candidates
//! let file = anonymizer.proceed(&partner.id, &session.id).await?;
//! let audit = anonymizer.get_audit_log(&partner.id, &file.id).await?;
//! println!("Anonymized for {}", audit.intended_for);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **TriagePolicy**: filters candidates by partner settings and
//!   auto-ignores low-confidence ones
//! - **PartnerFile**: file record and its lifecycle state machine
//! - **ReviewSessionManager**: one review session per file, between
//!   detection and commit
//! - **AnonymizationExecutor**: AES-256-GCM sealing of confirmed PII and
//!   its inverse
//! - **AuditLogWriter**: per-category summary of each anonymization
//! - **PiiDetector / PartnerStore / FileStore**: pluggable collaborators
//! - **Anonymizer**: high-level API over all of the above

pub mod audit;
pub mod config;
pub mod content;
pub mod crypto;
pub mod detector;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod pipeline;
pub mod session;
pub mod store;
pub mod triage;
pub mod types;

// Re-export core types
pub use audit::{AnonymizationMethod, AuditLogWriter, AuditRecord, EntityCount};
pub use config::AnonymizerConfig;
pub use content::{FileContent, Table};
pub use detector::{PatternDetector, PiiDetector, StaticDetector};
pub use error::{AnonymizeError, Result};
pub use crypto::WrappedKey;
pub use executor::{AnonymizationExecutor, AnonymizedArtifact};
pub use lifecycle::{FileState, FileSummary, LifecycleEvent, PartnerFile};
pub use pipeline::Anonymizer;
pub use session::{ReviewSessionManager, SessionStatus, SessionView};
pub use store::{FileStore, PartnerStore};
pub use triage::TriagePolicy;
pub use types::{
    CandidateTarget, DetectionSettings, EntityCandidate, EntityCategory, FileType, IgnoreOrigin,
    NewPartner, PartnerProfile, PartnerSecrets, PartnerSettingsUpdate, Secret,
};

// Re-export in-memory stores for convenience
pub use store::memory::{MemoryFileStore, MemoryPartnerStore};
