//! Document access checks.
//!
//! Documents belong to organizations; a user may act on a document while
//! they hold an active membership in its organization. Owners and admins
//! may additionally rewrite and delete operations.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use polygon_core::{DocumentId, OperationError, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authenticated caller of a store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: UserId,
}

impl Session {
    pub fn new(user_id: UserId) -> Self {
        Self { user_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    /// Owners and admins may update and delete operations.
    pub fn is_privileged(self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    pub id: DocumentId,
    pub organization_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentInfo {
    pub fn new(id: DocumentId, organization_id: Uuid, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            organization_id,
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub organization_id: Uuid,
    pub role: Role,
}

/// Resolves documents and the caller's standing in their organization.
pub trait Authorizer: Send + Sync {
    /// `NotFound` if the document does not exist.
    fn document(&self, document_id: DocumentId) -> Result<DocumentInfo, OperationError>;

    /// `Forbidden` unless the user is an active member of the document's
    /// organization; `NotFound` if the document does not exist.
    fn membership(&self, user_id: UserId, document_id: DocumentId) -> Result<Membership, OperationError>;
}

/// One row of the directory file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub user_id: UserId,
    pub organization_id: Uuid,
    pub role: Role,
    /// Removed members keep their row with `deletedAt` set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// On-disk form: `{"documents": [...], "members": [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryFile {
    #[serde(default)]
    pub documents: Vec<DocumentInfo>,
    #[serde(default)]
    pub members: Vec<MemberRecord>,
}

/// In-memory [`Authorizer`].
#[derive(Debug, Default)]
pub struct MembershipDirectory {
    documents: RwLock<HashMap<DocumentId, DocumentInfo>>,
    members: RwLock<HashMap<(UserId, Uuid), MemberRecord>>,
}

impl MembershipDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file_contents(file: DirectoryFile) -> Self {
        let directory = Self::new();
        for document in file.documents {
            directory.add_document(document);
        }
        for member in file.members {
            directory.add_record(member);
        }
        directory
    }

    /// Load a directory from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OperationError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| {
            OperationError::storage(format!("Failed to read {}: {e}", path.display()))
        })?;
        let file: DirectoryFile = serde_json::from_slice(&bytes).map_err(|e| {
            OperationError::invalid(format!("Malformed membership file {}: {e}", path.display()))
        })?;
        Ok(Self::from_file_contents(file))
    }

    pub fn add_document(&self, document: DocumentInfo) {
        if let Ok(mut documents) = self.documents.write() {
            documents.insert(document.id, document);
        }
    }

    pub fn add_member(&self, user_id: UserId, organization_id: Uuid, role: Role) {
        self.add_record(MemberRecord {
            user_id,
            organization_id,
            role,
            deleted_at: None,
        });
    }

    /// Soft-remove a member; their row stays but no longer grants access.
    pub fn remove_member(&self, user_id: UserId, organization_id: Uuid) -> bool {
        let Ok(mut members) = self.members.write() else {
            return false;
        };
        match members.get_mut(&(user_id, organization_id)) {
            Some(record) if record.deleted_at.is_none() => {
                record.deleted_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    fn add_record(&self, record: MemberRecord) {
        if let Ok(mut members) = self.members.write() {
            members.insert((record.user_id, record.organization_id), record);
        }
    }
}

impl Authorizer for MembershipDirectory {
    fn document(&self, document_id: DocumentId) -> Result<DocumentInfo, OperationError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| OperationError::storage("membership directory lock poisoned"))?;
        documents
            .get(&document_id)
            .cloned()
            .ok_or_else(|| OperationError::not_found("Document not found"))
    }

    fn membership(&self, user_id: UserId, document_id: DocumentId) -> Result<Membership, OperationError> {
        let document = self.document(document_id)?;
        let members = self
            .members
            .read()
            .map_err(|_| OperationError::storage("membership directory lock poisoned"))?;
        match members.get(&(user_id, document.organization_id)) {
            Some(record) if record.deleted_at.is_none() => Ok(Membership {
                organization_id: record.organization_id,
                role: record.role,
            }),
            _ => Err(OperationError::forbidden(
                "You don't have access to this organization",
            )),
        }
    }
}
