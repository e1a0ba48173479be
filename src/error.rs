//! Error types for a3s-anonymize

use crate::lifecycle::FileState;
use thiserror::Error;

/// Errors that can occur in the anonymization pipeline
///
/// Every variant leaves the affected file in its last well-defined state.
/// None of them carry partner secret material.
#[derive(Debug, Error)]
pub enum AnonymizeError {
    /// Illegal lifecycle move for the file's current state
    #[error("Invalid state transition for file '{file_id}': cannot {action} while {state}")]
    InvalidStateTransition {
        file_id: String,
        state: FileState,
        action: &'static str,
    },

    /// A review session is already open for the file
    #[error("A review session is already open for file '{0}'")]
    SessionAlreadyOpen(String),

    /// No open review session with this id
    #[error("Review session not found: {0}")]
    SessionNotFound(String),

    /// Candidate id unknown to the session
    #[error("Candidate '{candidate_id}' not found in session '{session_id}'")]
    CandidateNotFound {
        session_id: String,
        candidate_id: String,
    },

    /// Another operation on the same file is in flight
    #[error("File '{0}' is busy with another operation, retry later")]
    FileBusy(String),

    /// Partner key material missing or unusable
    #[error("Key unavailable: {0}")]
    KeyUnavailable(String),

    /// File content could not be read or does not match the candidates
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// The external PII detector failed
    #[error("Detection unavailable: {0}")]
    DetectionUnavailable(String),

    /// Partner not found
    #[error("Partner not found: {0}")]
    PartnerNotFound(String),

    /// File not found (or not owned by the requesting partner)
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// The file was never anonymized
    #[error("No audit log for file '{0}': it has not been anonymized yet")]
    NoAuditLog(String),

    /// Rejected partner registration or settings update
    #[error("Invalid partner: {0}")]
    InvalidPartner(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline task stopped unexpectedly
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for anonymization operations
pub type Result<T> = std::result::Result<T, AnonymizeError>;
