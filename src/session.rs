//! Review session management
//!
//! A review session holds the triaged candidates of one file between
//! detection and commit. At most one session exists per file, and a session
//! is only visible to the partner owning the file: any other partner gets
//! `SessionNotFound`. A session being committed is marked `Committing`;
//! every other request against it fails with `FileBusy` until the commit
//! finishes and the session is gone.

use crate::content::FileContent;
use crate::error::{AnonymizeError, Result};
use crate::lifecycle::PartnerFile;
use crate::types::{EntityCandidate, FileType, IgnoreOrigin};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// Accepting reviewer changes
    Open,
    /// Handed to the executor; no further changes
    Committing,
}

struct ReviewSession {
    id: String,
    file_id: String,
    partner_id: String,
    filename: String,
    file_type: FileType,
    candidates: Vec<EntityCandidate>,
    content: FileContent,
    /// File record before the review began; `None` for a brand-new upload
    prior: Option<PartnerFile>,
    status: SessionStatus,
    opened_at: i64,
}

impl ReviewSession {
    fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            file_id: self.file_id.clone(),
            filename: self.filename.clone(),
            file_type: self.file_type,
            status: self.status,
            candidates: self.candidates.clone(),
            opened_at: self.opened_at,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.status {
            SessionStatus::Open => Ok(()),
            SessionStatus::Committing => Err(AnonymizeError::FileBusy(self.file_id.clone())),
        }
    }
}

/// What a reviewer sees; never includes raw content or secrets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: String,
    pub file_id: String,
    pub filename: String,
    pub file_type: FileType,
    pub status: SessionStatus,
    pub candidates: Vec<EntityCandidate>,
    pub opened_at: i64,
}

/// The finalized session handed to the commit step
#[derive(Debug)]
pub struct CommitTicket {
    pub session_id: String,
    pub file_id: String,
    pub partner_id: String,
    /// Final candidate set, with every reviewer override applied
    pub candidates: Vec<EntityCandidate>,
    pub content: FileContent,
    pub prior: Option<PartnerFile>,
}

/// A session closed without committing
#[derive(Debug)]
pub struct ClosedSession {
    pub session_id: String,
    pub file_id: String,
    pub partner_id: String,
    pub prior: Option<PartnerFile>,
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, ReviewSession>,
    /// file_id → session_id
    by_file: HashMap<String, String>,
}

impl SessionTable {
    fn owned(&self, partner_id: &str, session_id: &str) -> Result<&ReviewSession> {
        self.sessions
            .get(session_id)
            .filter(|s| s.partner_id == partner_id)
            .ok_or_else(|| AnonymizeError::SessionNotFound(session_id.to_string()))
    }

    fn owned_mut(&mut self, partner_id: &str, session_id: &str) -> Result<&mut ReviewSession> {
        self.sessions
            .get_mut(session_id)
            .filter(|s| s.partner_id == partner_id)
            .ok_or_else(|| AnonymizeError::SessionNotFound(session_id.to_string()))
    }

    fn remove(&mut self, session_id: &str) -> Option<ReviewSession> {
        let session = self.sessions.remove(session_id)?;
        self.by_file.remove(&session.file_id);
        Some(session)
    }
}

/// Holds every in-flight review session
///
/// Sessions and the per-file index live under one lock, so the
/// one-session-per-file rule holds under any caller concurrency. The lock
/// is never held across an await.
#[derive(Default)]
pub struct ReviewSessionManager {
    table: RwLock<SessionTable>,
}

impl ReviewSessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionTable> {
        self.table
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionTable> {
        self.table
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a session for `file` with its triaged candidates
    pub fn open_session(
        &self,
        file: &PartnerFile,
        candidates: Vec<EntityCandidate>,
        content: FileContent,
        prior: Option<PartnerFile>,
    ) -> Result<SessionView> {
        let mut table = self.write();
        if table.by_file.contains_key(&file.id) {
            return Err(AnonymizeError::SessionAlreadyOpen(file.id.clone()));
        }

        let session = ReviewSession {
            id: format!("rev-{}", uuid::Uuid::new_v4()),
            file_id: file.id.clone(),
            partner_id: file.partner_id.clone(),
            filename: file.filename.clone(),
            file_type: file.file_type,
            candidates,
            content,
            prior,
            status: SessionStatus::Open,
            opened_at: chrono::Utc::now().timestamp_millis(),
        };
        let view = session.view();

        table
            .by_file
            .insert(session.file_id.clone(), session.id.clone());
        table.sessions.insert(session.id.clone(), session);

        tracing::info!(
            session_id = %view.id,
            file_id = %view.file_id,
            candidates = view.candidates.len(),
            "Review session opened"
        );
        Ok(view)
    }

    /// Current view of a session owned by `partner_id`
    pub fn get(&self, partner_id: &str, session_id: &str) -> Result<SessionView> {
        self.read()
            .owned(partner_id, session_id)
            .map(ReviewSession::view)
    }

    /// Id of the session open for a file, if any
    pub fn session_for_file(&self, file_id: &str) -> Option<String> {
        self.read().by_file.get(file_id).cloned()
    }

    /// Number of sessions currently held
    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flip one candidate's ignore flag; the reviewer now owns that flag
    pub fn toggle_ignore(
        &self,
        partner_id: &str,
        session_id: &str,
        candidate_id: &str,
    ) -> Result<EntityCandidate> {
        let mut table = self.write();
        let session = table.owned_mut(partner_id, session_id)?;
        session.ensure_open()?;

        let candidate = session
            .candidates
            .iter_mut()
            .find(|c| c.id == candidate_id)
            .ok_or_else(|| AnonymizeError::CandidateNotFound {
                session_id: session_id.to_string(),
                candidate_id: candidate_id.to_string(),
            })?;
        candidate.ignore = !candidate.ignore;
        candidate.ignore_origin = IgnoreOrigin::Human;

        tracing::debug!(
            session_id,
            candidate_id,
            ignore = candidate.ignore,
            "Candidate ignore toggled"
        );
        Ok(candidate.clone())
    }

    /// Close the session and run `commit` on its final state
    ///
    /// Once `commit` returns, the session is destroyed whatever the outcome.
    /// Restoring the file on failure is the job of `commit`, which owns the
    /// prior snapshot. If `commit` panics or its future is dropped before
    /// returning, the session goes back to `Open` so the review can be
    /// retried or cancelled.
    pub async fn proceed<F, Fut, T>(
        &self,
        partner_id: &str,
        session_id: &str,
        commit: F,
    ) -> Result<T>
    where
        F: FnOnce(CommitTicket) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.begin_commit(partner_id, session_id)?;
        let mut guard = CommitGuard {
            manager: self,
            session_id,
            completed: false,
        };
        let result = commit(ticket).await;
        guard.completed = true;
        result
    }

    /// Mark the session as committing and hand out its final state
    fn begin_commit(&self, partner_id: &str, session_id: &str) -> Result<CommitTicket> {
        let mut table = self.write();
        let session = table.owned_mut(partner_id, session_id)?;
        session.ensure_open()?;
        session.status = SessionStatus::Committing;

        Ok(CommitTicket {
            session_id: session.id.clone(),
            file_id: session.file_id.clone(),
            partner_id: session.partner_id.clone(),
            candidates: session.candidates.clone(),
            content: session.content.clone(),
            prior: session.prior.clone(),
        })
    }

    /// Destroy a session after its commit finished
    fn finish(&self, session_id: &str) {
        if let Some(session) = self.write().remove(session_id) {
            tracing::info!(
                session_id,
                file_id = %session.file_id,
                "Review session closed"
            );
        }
    }

    /// Put an interrupted commit's session back in review
    fn reopen(&self, session_id: &str) {
        if let Some(session) = self.write().sessions.get_mut(session_id) {
            session.status = SessionStatus::Open;
            tracing::warn!(
                session_id,
                file_id = %session.file_id,
                "Commit interrupted, review session reopened"
            );
        }
    }

    /// Destroy an open session without committing
    pub fn cancel(&self, partner_id: &str, session_id: &str) -> Result<ClosedSession> {
        let mut table = self.write();
        table.owned(partner_id, session_id)?.ensure_open()?;
        let session = table
            .remove(session_id)
            .ok_or_else(|| AnonymizeError::SessionNotFound(session_id.to_string()))?;

        tracing::info!(
            session_id,
            file_id = %session.file_id,
            "Review session cancelled"
        );
        Ok(ClosedSession {
            session_id: session.id,
            file_id: session.file_id,
            partner_id: session.partner_id,
            prior: session.prior,
        })
    }
}

/// Ends a commit: the session is destroyed if the commit returned, and
/// reopened if it unwound or was dropped midway
struct CommitGuard<'a> {
    manager: &'a ReviewSessionManager,
    session_id: &'a str,
    completed: bool,
}

impl Drop for CommitGuard<'_> {
    fn drop(&mut self) {
        if self.completed {
            self.manager.finish(self.session_id);
        } else {
            self.manager.reopen(self.session_id);
        }
    }
}
