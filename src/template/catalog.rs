//! Catalog of registered templates.
//!
//! Templates are registered once under a unique name, can be replaced by a
//! newer revision, and are retired by taking them offline rather than being
//! deleted, so instances that were provisioned from them stay explainable.

use crate::error::ValidationErrors;
use crate::template::document::TemplateDocument;
use crate::template::model::ValidTemplate;
use crate::template::validator::{TemplateValidator, ValidationOptions};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Availability of a catalog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateStatus {
    Online,
    Offline,
}

/// A registered template revision.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub template: Arc<ValidTemplate>,
    pub status: TemplateStatus,
    pub revision: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error(transparent)]
    Invalid(#[from] ValidationErrors),

    #[error("Template '{0}' already exists")]
    AlreadyExists(String),

    #[error("Template '{0}' does not exist")]
    NotFound(String),
}

/// Concurrent template catalog.
#[derive(Debug, Default)]
pub struct TemplateCatalog {
    entries: DashMap<String, CatalogEntry>,
    validator: TemplateValidator,
}

impl TemplateCatalog {
    pub fn new(options: ValidationOptions) -> Self {
        Self {
            entries: DashMap::new(),
            validator: TemplateValidator::new(options),
        }
    }

    /// Validate and register a new template.
    pub fn register(&self, document: &TemplateDocument) -> Result<Arc<ValidTemplate>, CatalogError> {
        let template = Arc::new(self.validator.validate(document)?);
        let name = template.name().to_string();

        match self.entries.entry(name.clone()) {
            dashmap::Entry::Occupied(_) => Err(CatalogError::AlreadyExists(name)),
            dashmap::Entry::Vacant(slot) => {
                slot.insert(CatalogEntry {
                    template: template.clone(),
                    status: TemplateStatus::Online,
                    revision: 1,
                    updated_at: Utc::now(),
                });
                info!("Registered template '{}'", name);
                Ok(template)
            }
        }
    }

    /// Replace an existing template with a new revision and bring it online.
    pub fn update(&self, document: &TemplateDocument) -> Result<Arc<ValidTemplate>, CatalogError> {
        let template = Arc::new(self.validator.validate(document)?);
        let name = template.name().to_string();

        let mut entry = self
            .entries
            .get_mut(&name)
            .ok_or_else(|| CatalogError::NotFound(name.clone()))?;
        entry.template = template.clone();
        entry.status = TemplateStatus::Online;
        entry.revision += 1;
        entry.updated_at = Utc::now();

        info!("Updated template '{}' to revision {}", name, entry.revision);
        Ok(template)
    }

    /// Take a template offline. Already offline templates stay offline.
    pub fn retire(&self, name: &str) -> Result<(), CatalogError> {
        let mut entry = self
            .entries
            .get_mut(name)
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))?;
        if entry.status == TemplateStatus::Online {
            entry.status = TemplateStatus::Offline;
            entry.updated_at = Utc::now();
            info!("Retired template '{}'", name);
        } else {
            debug!("Template '{}' is already offline", name);
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<CatalogEntry> {
        self.entries.get(name).map(|e| e.clone())
    }

    /// Names of all templates, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
