//! High-level anonymization pipeline
//!
//! `Anonymizer` ties the stores, the detector, triage, review sessions, the
//! executor and the audit writer together. Operations on one file are
//! serialized by a per-file guard: a second concurrent request for the same
//! file fails fast with `FileBusy` instead of waiting.
//!
//! Each partner also has a key lock. Commits and de-anonymization hold it
//! shared while they read the partner's secrets; a secret rotation holds it
//! exclusively while it re-wraps the data keys of the partner's files.

use crate::audit::{AuditLogWriter, AuditRecord};
use crate::config::AnonymizerConfig;
use crate::content::FileContent;
use crate::crypto::derive_key;
use crate::detector::PiiDetector;
use crate::error::{AnonymizeError, Result};
use crate::executor::AnonymizationExecutor;
use crate::lifecycle::{FileState, FileSummary, LifecycleEvent, PartnerFile};
use crate::session::{CommitTicket, ReviewSessionManager, SessionView};
use crate::store::{FileStore, PartnerStore};
use crate::triage::TriagePolicy;
use crate::types::{
    EntityCandidate, EntityCategory, NewPartner, Partner, PartnerProfile, PartnerSettingsUpdate,
};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Anonymization pipeline over pluggable stores and detector
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Anonymizer {
    inner: Arc<Inner>,
}

struct Inner {
    partners: Box<dyn PartnerStore>,
    files: Box<dyn FileStore>,
    detector: Box<dyn PiiDetector>,
    sessions: ReviewSessionManager,
    executor: AnonymizationExecutor,
    triage: TriagePolicy,
    audit: AuditLogWriter,
    config: AnonymizerConfig,

    /// Files with an operation in flight
    busy: DashMap<String, ()>,
    /// partner_id → key lock
    key_locks: DashMap<String, Arc<RwLock<()>>>,
}

/// Holds a file's busy slot until dropped
struct FileGuard<'a> {
    busy: &'a DashMap<String, ()>,
    file_id: String,
}

impl Drop for FileGuard<'_> {
    fn drop(&mut self) {
        self.busy.remove(&self.file_id);
    }
}

impl Anonymizer {
    /// Create a pipeline with the default configuration
    pub fn new(
        partners: impl PartnerStore + 'static,
        files: impl FileStore + 'static,
        detector: impl PiiDetector + 'static,
    ) -> Self {
        Self::build(partners, files, detector, AnonymizerConfig::default())
    }

    /// Create a pipeline with a validated configuration
    pub fn with_config(
        partners: impl PartnerStore + 'static,
        files: impl FileStore + 'static,
        detector: impl PiiDetector + 'static,
        config: AnonymizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(partners, files, detector, config))
    }

    fn build(
        partners: impl PartnerStore + 'static,
        files: impl FileStore + 'static,
        detector: impl PiiDetector + 'static,
        config: AnonymizerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                partners: Box::new(partners),
                files: Box::new(files),
                detector: Box::new(detector),
                sessions: ReviewSessionManager::new(),
                executor: AnonymizationExecutor::new(),
                triage: TriagePolicy::new(config.auto_ignore_threshold),
                audit: AuditLogWriter::new(config.anonymization_method),
                config,
                busy: DashMap::new(),
                key_locks: DashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &AnonymizerConfig {
        &self.inner.config
    }

    /// Get the detector name
    pub fn detector_name(&self) -> &str {
        self.inner.detector.name()
    }

    // ========================================================================
    // Partners
    // ========================================================================

    /// Register a partner
    ///
    /// A partner without a usable data encryption key is accepted, but
    /// every anonymization for it fails with `KeyUnavailable` until its
    /// secrets are updated.
    pub async fn register_partner(&self, fields: NewPartner) -> Result<PartnerProfile> {
        if fields.name.trim().is_empty() {
            return Err(AnonymizeError::InvalidPartner(
                "Partner name is required".to_string(),
            ));
        }
        let partner = self.inner.partners.create_partner(fields).await?;
        if let Err(e) = derive_key(&partner.secrets) {
            tracing::warn!(partner_id = %partner.id, error = %e, "Partner has no usable key");
        }

        tracing::info!(partner_id = %partner.id, "Partner registered");
        Ok(partner.profile())
    }

    pub async fn get_partner(&self, partner_id: &str) -> Result<PartnerProfile> {
        Ok(self.inner.partners.get_partner(partner_id).await?.profile())
    }

    pub async fn list_partners(&self) -> Result<Vec<PartnerProfile>> {
        let partners = self.inner.partners.list_partners().await?;
        Ok(partners.iter().map(Partner::profile).collect())
    }

    /// Apply a settings update. New detection settings apply to the next
    /// detection run. Rotated secrets apply to the next anonymization, and
    /// the data keys of files already anonymized are re-wrapped under them.
    ///
    /// A rotation fails with `FileBusy` while any of the partner's files has
    /// an operation in flight or an open review session; nothing is changed
    /// in that case.
    pub async fn update_partner_settings(
        &self,
        partner_id: &str,
        update: PartnerSettingsUpdate,
    ) -> Result<PartnerProfile> {
        let key_lock = self.inner.key_lock(partner_id);
        let _exclusive = key_lock.write().await;
        let mut partner = self.inner.partners.get_partner(partner_id).await?;

        if let Some(logo) = update.logo {
            if !logo.trim().is_empty() {
                partner.logo = logo;
            }
        }
        if let Some(settings) = update.detection_settings {
            partner.detection_settings = settings;
        }

        let Some(secrets) = update.secrets else {
            self.inner.partners.update_partner(partner.clone()).await?;
            tracing::info!(partner_id, rotated = false, "Partner settings updated");
            return Ok(partner.profile());
        };
        if secrets.data_encryption_key.is_empty() {
            return Err(AnonymizeError::InvalidPartner(
                "Data encryption key must not be empty".to_string(),
            ));
        }

        let file_ids: Vec<String> = self
            .inner
            .files
            .list_files_for_partner(partner_id)
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect();
        let mut guards = Vec::with_capacity(file_ids.len());
        for file_id in &file_ids {
            guards.push(self.inner.acquire(file_id)?);
            if self.inner.sessions.session_for_file(file_id).is_some() {
                return Err(AnonymizeError::FileBusy(file_id.clone()));
            }
        }

        // Re-read under the guards; nothing is written until every data key
        // has been re-wrapped
        let mut previous = Vec::new();
        let mut rewrapped = Vec::new();
        for file_id in &file_ids {
            let mut file = match self.inner.files.get_file(file_id).await {
                Ok(file) => file,
                Err(AnonymizeError::FileNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            let Some(artifact) = file.artifact() else {
                continue;
            };
            let data_key = self
                .inner
                .executor
                .rewrap(&partner.secrets, &secrets, artifact)?;
            previous.push(file.clone());
            file.rewrap_artifact(data_key)?;
            rewrapped.push(file);
        }

        partner.secrets = secrets;
        self.inner
            .apply_rotation(partner.clone(), previous, rewrapped)
            .await?;
        drop(guards);

        tracing::info!(partner_id, rotated = true, "Partner settings updated");
        Ok(partner.profile())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Upload a new file, run detection and open its review session
    pub async fn upload(
        &self,
        partner_id: &str,
        filename: &str,
        bytes: &[u8],
    ) -> Result<SessionView> {
        let partner = self.inner.partners.get_partner(partner_id).await?;
        let file = PartnerFile::uploaded(&partner.id, filename);
        let content = FileContent::decode(file.file_type, bytes)?;

        tracing::info!(
            partner_id,
            file_id = %file.id,
            file_type = %file.file_type,
            "File uploaded"
        );
        self.inner.review(&partner, file, content, None).await
    }

    /// Replace the content of an existing file and review it again
    ///
    /// The file keeps its last audit log until the new review commits.
    /// Cancelling the review restores the file as it was.
    pub async fn reupload(
        &self,
        partner_id: &str,
        file_id: &str,
        bytes: &[u8],
    ) -> Result<SessionView> {
        let _guard = self.inner.acquire(file_id)?;
        let partner = self.inner.partners.get_partner(partner_id).await?;
        let file = self.inner.owned_file(partner_id, file_id).await?;
        if self.inner.sessions.session_for_file(file_id).is_some()
            || file.state() == FileState::PendingReview
        {
            return Err(AnonymizeError::SessionAlreadyOpen(file.id));
        }
        let content = FileContent::decode(file.file_type, bytes)?;

        tracing::info!(partner_id, file_id, "File re-uploaded");
        self.inner.review(&partner, file.clone(), content, Some(file)).await
    }

    pub async fn list_files(&self, partner_id: &str) -> Result<Vec<FileSummary>> {
        self.inner.partners.get_partner(partner_id).await?;
        let files = self.inner.files.list_files_for_partner(partner_id).await?;
        Ok(files.iter().map(PartnerFile::summary).collect())
    }

    pub async fn file(&self, partner_id: &str, file_id: &str) -> Result<FileSummary> {
        Ok(self.inner.owned_file(partner_id, file_id).await?.summary())
    }

    /// Content of the file as currently presented (sealed or restored)
    pub async fn download(&self, partner_id: &str, file_id: &str) -> Result<Vec<u8>> {
        let file = self.inner.owned_file(partner_id, file_id).await?;
        let bytes = file.current_content()?.to_bytes()?;
        tracing::debug!(partner_id, file_id, state = %file.state(), "File downloaded");
        Ok(bytes)
    }

    /// Current audit record of an anonymized file
    pub async fn get_audit_log(&self, partner_id: &str, file_id: &str) -> Result<AuditRecord> {
        let file = self.inner.owned_file(partner_id, file_id).await?;
        AuditLogWriter::read(&file)
    }

    // ========================================================================
    // Review
    // ========================================================================

    /// Current view of one of the partner's review sessions
    pub fn session(&self, partner_id: &str, session_id: &str) -> Result<SessionView> {
        self.inner.sessions.get(partner_id, session_id)
    }

    /// Flip a candidate's ignore flag in an open session
    pub fn toggle_ignore(
        &self,
        partner_id: &str,
        session_id: &str,
        candidate_id: &str,
    ) -> Result<EntityCandidate> {
        self.inner
            .sessions
            .toggle_ignore(partner_id, session_id, candidate_id)
    }

    /// Commit the review: anonymize, record the audit log, close the session
    ///
    /// The commit runs on its own task, so dropping the returned future does
    /// not abort it halfway. Any failure leaves the file as it was before
    /// the review and still closes the session.
    pub async fn proceed(&self, partner_id: &str, session_id: &str) -> Result<FileSummary> {
        let inner = self.inner.clone();
        let partner_id = partner_id.to_string();
        let session_id = session_id.to_string();
        tokio::spawn(async move { inner.proceed(&partner_id, &session_id).await })
            .await
            .map_err(|e| AnonymizeError::Internal(format!("Commit task failed: {}", e)))?
    }

    /// Close the review without committing
    ///
    /// Returns the restored file for a re-upload, `None` when a new upload
    /// was discarded.
    pub async fn cancel(&self, partner_id: &str, session_id: &str) -> Result<Option<FileSummary>> {
        let file_id = self.inner.sessions.get(partner_id, session_id)?.file_id;
        let _guard = self.inner.acquire(&file_id)?;
        let closed = self.inner.sessions.cancel(partner_id, session_id)?;

        let restored = closed.prior.as_ref().map(PartnerFile::summary);
        self.inner.restore(&closed.file_id, closed.prior).await?;
        Ok(restored)
    }

    /// Switch between the anonymized and de-anonymized presentation
    pub async fn toggle_anonymization(
        &self,
        partner_id: &str,
        file_id: &str,
    ) -> Result<FileSummary> {
        let _guard = self.inner.acquire(file_id)?;
        let key_lock = self.inner.key_lock(partner_id);
        let _shared = key_lock.read().await;
        let partner = self.inner.partners.get_partner(partner_id).await?;
        let mut file = self.inner.owned_file(partner_id, file_id).await?;
        file.check(LifecycleEvent::Toggle)?;

        if file.state() == FileState::Anonymized {
            let artifact = file.artifact().cloned().ok_or_else(|| {
                AnonymizeError::KeyUnavailable(format!("File '{}' has no sealed artifact", file_id))
            })?;
            let restored = self
                .inner
                .executor
                .deanonymize(&partner.secrets, &artifact)
                .await?;
            file.de_anonymize(restored)?;
        } else {
            file.re_anonymize()?;
        }
        self.inner.files.save_file(file.clone()).await?;

        tracing::info!(partner_id, file_id, state = %file.state(), "Anonymization toggled");
        Ok(file.summary())
    }
}

impl Inner {
    fn acquire(&self, file_id: &str) -> Result<FileGuard<'_>> {
        match self.busy.entry(file_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(AnonymizeError::FileBusy(file_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
                Ok(FileGuard {
                    busy: &self.busy,
                    file_id: file_id.to_string(),
                })
            }
        }
    }

    fn key_lock(&self, partner_id: &str) -> Arc<RwLock<()>> {
        self.key_locks
            .entry(partner_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Persist re-wrapped files, then the partner with its new secrets.
    /// On failure every file written so far is put back.
    async fn apply_rotation(
        &self,
        partner: Partner,
        previous: Vec<PartnerFile>,
        rewrapped: Vec<PartnerFile>,
    ) -> Result<()> {
        for (written, file) in rewrapped.into_iter().enumerate() {
            if let Err(e) = self.files.save_file(file).await {
                self.roll_back(&previous[..written]).await;
                return Err(e);
            }
        }
        if let Err(e) = self.partners.update_partner(partner).await {
            self.roll_back(&previous).await;
            return Err(e);
        }
        Ok(())
    }

    async fn roll_back(&self, files: &[PartnerFile]) {
        for file in files {
            if let Err(e) = self.files.save_file(file.clone()).await {
                tracing::warn!(file_id = %file.id, error = %e, "Failed to roll back data key");
            }
        }
    }

    /// Load a file, hiding files of other partners
    async fn owned_file(&self, partner_id: &str, file_id: &str) -> Result<PartnerFile> {
        let file = self.files.get_file(file_id).await?;
        if file.partner_id != partner_id {
            return Err(AnonymizeError::FileNotFound(file_id.to_string()));
        }
        Ok(file)
    }

    async fn detect(
        &self,
        content: &FileContent,
        file: &PartnerFile,
        enabled: &[EntityCategory],
    ) -> Result<Vec<EntityCandidate>> {
        let detection = self.detector.detect(content, file.file_type, enabled);
        match self.config.detection_timeout() {
            Some(limit) => tokio::time::timeout(limit, detection).await.map_err(|_| {
                AnonymizeError::DetectionUnavailable(format!(
                    "Detector '{}' timed out after {:?}",
                    self.detector.name(),
                    limit
                ))
            })?,
            None => detection.await,
        }
    }

    /// Detect, triage and open the review session for `file`
    async fn review(
        &self,
        partner: &Partner,
        mut file: PartnerFile,
        content: FileContent,
        prior: Option<PartnerFile>,
    ) -> Result<SessionView> {
        let settings = &partner.detection_settings;
        let raw = self
            .detect(&content, &file, &settings.enabled_categories())
            .await
            .inspect_err(|e| {
                tracing::warn!(file_id = %file.id, error = %e, "Detection failed");
            })?;
        let candidates = unique_ids(self.triage.apply(raw, settings));

        file.begin_review(candidates.clone())?;
        let view = self
            .sessions
            .open_session(&file, candidates, content, prior)?;

        if let Err(e) = self.files.save_file(file).await {
            self.sessions.cancel(&partner.id, &view.id).ok();
            return Err(e);
        }
        Ok(view)
    }

    async fn proceed(&self, partner_id: &str, session_id: &str) -> Result<FileSummary> {
        let file_id = self.sessions.get(partner_id, session_id)?.file_id;
        let _guard = self.acquire(&file_id)?;
        self.sessions
            .proceed(partner_id, session_id, |ticket| self.commit(ticket))
            .await
    }

    async fn commit(&self, ticket: CommitTicket) -> Result<FileSummary> {
        let CommitTicket {
            session_id,
            file_id,
            partner_id,
            candidates,
            content,
            prior,
        } = ticket;

        let result = async {
            let key_lock = self.key_lock(&partner_id);
            let _shared = key_lock.read().await;
            let partner = self.partners.get_partner(&partner_id).await?;
            let mut file = self.files.get_file(&file_id).await?;
            let artifact = self
                .executor
                .anonymize(&partner.secrets, content, &candidates)
                .await?;
            let record = self.audit.derive(&partner.name, &file, &candidates);
            file.commit_anonymization(artifact, record)?;
            self.files.save_file(file.clone()).await?;
            Ok(file.summary())
        }
        .await;

        match result {
            Ok(summary) => {
                tracing::info!(%session_id, %file_id, "Anonymization committed");
                Ok(summary)
            }
            Err(e) => {
                tracing::warn!(%session_id, %file_id, error = %e, "Anonymization aborted");
                if let Err(restore_err) = self.restore(&file_id, prior).await {
                    tracing::warn!(%file_id, error = %restore_err, "Failed to restore file");
                }
                Err(e)
            }
        }
    }

    /// Put the file back as it was before the review
    async fn restore(&self, file_id: &str, prior: Option<PartnerFile>) -> Result<()> {
        match prior {
            Some(file) => self.files.save_file(file).await,
            None => match self.files.delete_file(file_id).await {
                Err(AnonymizeError::FileNotFound(_)) | Ok(()) => Ok(()),
                Err(e) => Err(e),
            },
        }
    }
}

/// Give duplicate or empty candidate ids a fresh id
fn unique_ids(candidates: Vec<EntityCandidate>) -> Vec<EntityCandidate> {
    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .map(|mut candidate| {
            if candidate.id.is_empty() || !seen.insert(candidate.id.clone()) {
                candidate.id = format!("cand-{}", uuid::Uuid::new_v4());
                seen.insert(candidate.id.clone());
            }
            candidate
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::StaticDetector;
    use crate::store::memory::{MemoryFileStore, MemoryPartnerStore};

    fn anonymizer(candidates: Vec<EntityCandidate>) -> (Anonymizer, MemoryFileStore) {
        let files = MemoryFileStore::new();
        let anonymizer = Anonymizer::new(
            MemoryPartnerStore::new(),
            files.clone(),
            StaticDetector::new(candidates),
        );
        (anonymizer, files)
    }

    #[test]
    fn test_unique_ids() {
        let candidates = vec![
            EntityCandidate::text(EntityCategory::Person, "Zain", 0, 4, 90.0).with_id("c-1"),
            EntityCandidate::text(EntityCategory::Person, "Zain", 10, 14, 90.0).with_id("c-1"),
            EntityCandidate::text(EntityCategory::Person, "Ali", 20, 23, 90.0).with_id(""),
        ];
        let ids: Vec<_> = unique_ids(candidates).into_iter().map(|c| c.id).collect();
        assert_eq!(ids[0], "c-1");
        assert_ne!(ids[1], "c-1");
        assert!(!ids[2].is_empty());
        assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 3);
    }

    #[tokio::test]
    async fn test_register_requires_name() {
        let (anonymizer, _) = anonymizer(vec![]);
        let err = anonymizer
            .register_partner(NewPartner::new("  ", "key", "pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnonymizeError::InvalidPartner(_)));
    }

    #[tokio::test]
    async fn test_file_guard_released_on_drop() {
        let (anonymizer, _) = anonymizer(vec![]);
        let inner = &anonymizer.inner;
        {
            let _guard = inner.acquire("file-1").unwrap();
            assert!(matches!(
                inner.acquire("file-1"),
                Err(AnonymizeError::FileBusy(_))
            ));
            assert!(inner.acquire("file-2").is_ok());
        }
        assert!(inner.acquire("file-1").is_ok());
    }

    #[tokio::test]
    async fn test_upload_persists_pending_file() {
        let (anonymizer, files) = anonymizer(vec![EntityCandidate::text(
            EntityCategory::Person,
            "Zain",
            0,
            4,
            92.0,
        )]);
        let partner = anonymizer
            .register_partner(NewPartner::new("Acme", "key", "pw"))
            .await
            .unwrap();

        let view = anonymizer
            .upload(&partner.id, "notes.txt", b"Zain called")
            .await
            .unwrap();
        let stored = files.get_file(&view.file_id).await.unwrap();
        assert_eq!(stored.state(), FileState::PendingReview);
        assert_eq!(stored.detected_pii().map(|c| c.len()), Some(1));
        assert_eq!(anonymizer.session(&partner.id, &view.id).unwrap(), view);
    }

    #[tokio::test]
    async fn test_upload_unknown_partner() {
        let (anonymizer, files) = anonymizer(vec![]);
        let err = anonymizer
            .upload("nobody", "notes.txt", b"text")
            .await
            .unwrap_err();
        assert!(matches!(err, AnonymizeError::PartnerNotFound(_)));
        assert!(files.is_empty().await);
    }

    #[tokio::test]
    async fn test_reupload_while_pending_rejected() {
        let (anonymizer, _) = anonymizer(vec![]);
        let partner = anonymizer
            .register_partner(NewPartner::new("Acme", "key", "pw"))
            .await
            .unwrap();
        let view = anonymizer
            .upload(&partner.id, "notes.txt", b"hello")
            .await
            .unwrap();

        let err = anonymizer
            .reupload(&partner.id, &view.file_id, b"hello again")
            .await
            .unwrap_err();
        assert!(matches!(err, AnonymizeError::SessionAlreadyOpen(_)));
    }
}
