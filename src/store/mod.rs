//! Partner and file persistence
//!
//! The storage engine is an external collaborator. The pipeline only needs
//! the narrow CRUD surface below; `memory` provides in-process backends for
//! tests and single-process use.

use crate::error::Result;
use crate::lifecycle::PartnerFile;
use crate::types::{NewPartner, Partner};
use async_trait::async_trait;

pub mod memory;

/// Partner profile storage
#[async_trait]
pub trait PartnerStore: Send + Sync {
    /// Register a partner, assigning its id
    async fn create_partner(&self, fields: NewPartner) -> Result<Partner>;

    /// Fetch a partner (`PartnerNotFound` if unknown)
    async fn get_partner(&self, id: &str) -> Result<Partner>;

    /// Replace a partner's settings (`PartnerNotFound` if unknown)
    async fn update_partner(&self, partner: Partner) -> Result<()>;

    /// All registered partners
    async fn list_partners(&self) -> Result<Vec<Partner>>;
}

/// File record storage
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Insert or replace a file record
    async fn save_file(&self, file: PartnerFile) -> Result<()>;

    /// Fetch a file (`FileNotFound` if unknown)
    async fn get_file(&self, id: &str) -> Result<PartnerFile>;

    /// Files owned by a partner, oldest upload first
    async fn list_files_for_partner(&self, partner_id: &str) -> Result<Vec<PartnerFile>>;

    /// Remove a file record (`FileNotFound` if unknown)
    async fn delete_file(&self, id: &str) -> Result<()>;
}
