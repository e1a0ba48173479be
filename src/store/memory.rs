//! In-memory stores for testing and single-process use
//!
//! State is lost on drop.

use super::{FileStore, PartnerStore};
use crate::error::{AnonymizeError, Result};
use crate::lifecycle::PartnerFile;
use crate::types::{NewPartner, Partner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory partner store
#[derive(Default, Clone)]
pub struct MemoryPartnerStore {
    partners: Arc<RwLock<HashMap<String, Partner>>>,
}

impl MemoryPartnerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartnerStore for MemoryPartnerStore {
    async fn create_partner(&self, fields: NewPartner) -> Result<Partner> {
        let partner = Partner::register(fields);
        self.partners
            .write()
            .await
            .insert(partner.id.clone(), partner.clone());
        Ok(partner)
    }

    async fn get_partner(&self, id: &str) -> Result<Partner> {
        self.partners
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AnonymizeError::PartnerNotFound(id.to_string()))
    }

    async fn update_partner(&self, partner: Partner) -> Result<()> {
        let mut partners = self.partners.write().await;
        match partners.get_mut(&partner.id) {
            Some(slot) => {
                *slot = partner;
                Ok(())
            }
            None => Err(AnonymizeError::PartnerNotFound(partner.id)),
        }
    }

    async fn list_partners(&self) -> Result<Vec<Partner>> {
        let mut partners: Vec<Partner> = self.partners.read().await.values().cloned().collect();
        partners.sort_by_key(|p| p.created_at);
        Ok(partners)
    }
}

/// In-memory file store
#[derive(Default, Clone)]
pub struct MemoryFileStore {
    files: Arc<RwLock<HashMap<String, PartnerFile>>>,
}

impl MemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored files
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn save_file(&self, file: PartnerFile) -> Result<()> {
        self.files.write().await.insert(file.id.clone(), file);
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<PartnerFile> {
        self.files
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| AnonymizeError::FileNotFound(id.to_string()))
    }

    async fn list_files_for_partner(&self, partner_id: &str) -> Result<Vec<PartnerFile>> {
        let mut files: Vec<PartnerFile> = self
            .files
            .read()
            .await
            .values()
            .filter(|f| f.partner_id == partner_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then(a.id.cmp(&b.id)));
        Ok(files)
    }

    async fn delete_file(&self, id: &str) -> Result<()> {
        self.files
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| AnonymizeError::FileNotFound(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectionSettings, EntityCategory};

    #[tokio::test]
    async fn test_partner_create_get_update() {
        let store = MemoryPartnerStore::new();
        let partner = store
            .create_partner(NewPartner::new("Starbucks", "starbucksKey123", "sbPass"))
            .await
            .unwrap();

        let fetched = store.get_partner(&partner.id).await.unwrap();
        assert_eq!(fetched.name, "Starbucks");

        let mut updated = fetched.clone();
        updated.detection_settings =
            DetectionSettings::default().with(EntityCategory::CreditCard, false);
        store.update_partner(updated).await.unwrap();

        let fetched = store.get_partner(&partner.id).await.unwrap();
        assert!(!fetched.detection_settings.credit_card);
        assert_eq!(store.list_partners().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_partner_not_found() {
        let store = MemoryPartnerStore::new();
        assert!(matches!(
            store.get_partner("ghost").await.unwrap_err(),
            AnonymizeError::PartnerNotFound(_)
        ));

        let orphan = Partner::register(NewPartner::new("Ghost", "k", "p"));
        assert!(matches!(
            store.update_partner(orphan).await.unwrap_err(),
            AnonymizeError::PartnerNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_file_crud_and_partner_listing() {
        let store = MemoryFileStore::new();
        let a = PartnerFile::uploaded("bmw", "Finanial_Data.xlsx");
        let b = PartnerFile::uploaded("bmw", "Client_Testimonial.txt");
        let c = PartnerFile::uploaded("salesforce", "CRM_Data_Q1.xlsx");

        for file in [a.clone(), b.clone(), c.clone()] {
            store.save_file(file).await.unwrap();
        }
        assert_eq!(store.len().await, 3);

        let bmw = store.list_files_for_partner("bmw").await.unwrap();
        assert_eq!(bmw.len(), 2);
        assert!(bmw.iter().all(|f| f.partner_id == "bmw"));

        assert_eq!(store.get_file(&c.id).await.unwrap().filename, "CRM_Data_Q1.xlsx");

        store.delete_file(&a.id).await.unwrap();
        assert!(matches!(
            store.get_file(&a.id).await.unwrap_err(),
            AnonymizeError::FileNotFound(_)
        ));
        assert!(store.delete_file(&a.id).await.is_err());
        assert_eq!(store.list_files_for_partner("bmw").await.unwrap().len(), 1);
    }
}
