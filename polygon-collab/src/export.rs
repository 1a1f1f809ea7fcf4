//! Document export.
//!
//! Only the native JSON format is produced; mesh and B-rep formats report
//! `NotImplemented`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use polygon_core::{DocumentId, Operation, OperationError, OperationId, OperationType};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{DocumentInfo, Session};
use crate::store::OperationStore;

pub const NATIVE_FORMAT_VERSION: &str = "1.0.0";
pub const NATIVE_FORMAT_NAME: &str = "polygon-native";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "stl")]
    Stl,
    #[serde(rename = "step")]
    Step,
    #[serde(rename = "3mf")]
    ThreeMf,
}

impl ExportFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Stl => "stl",
            ExportFormat::Step => "step",
            ExportFormat::ThreeMf => "3mf",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tessellation_tolerance: Option<f64>,
    #[serde(default = "default_true")]
    pub include_metadata: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            unit: None,
            tessellation_tolerance: None,
            include_metadata: true,
        }
    }
}

/// A rendered export; `data` is base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportArtifact {
    pub filename: String,
    pub mime_type: String,
    pub data: String,
}

impl ExportArtifact {
    pub fn decode_data(&self) -> Result<Vec<u8>, OperationError> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| OperationError::invalid(format!("export data is not base64: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeDocument {
    pub version: String,
    pub format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<NativeMetadata>,
    pub operations: Vec<NativeOperation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeMetadata {
    pub document_id: DocumentId,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub exported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeOperation {
    pub id: OperationId,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub sequence: u64,
    pub parameters: Value,
    pub dependencies: Vec<OperationId>,
    pub created_at: DateTime<Utc>,
}

impl NativeOperation {
    fn from_operation(op: &Operation) -> Result<Self, OperationError> {
        Ok(Self {
            id: op.id.clone(),
            op_type: op.op_type(),
            sequence: op.sequence,
            parameters: op.params.to_value()?,
            dependencies: op.dependencies.clone(),
            created_at: op.created_at,
        })
    }
}

/// Export a document's live operations. Members only.
pub fn export_document(
    store: &OperationStore,
    session: &Session,
    document_id: DocumentId,
    format: ExportFormat,
    options: &ExportOptions,
) -> Result<ExportArtifact, OperationError> {
    let document = store.document(session, document_id)?;
    let operations = store.get_by_document(session, document_id)?;

    match format {
        ExportFormat::Json => to_native_json(&document, &operations, options),
        ExportFormat::Stl | ExportFormat::Step | ExportFormat::ThreeMf => {
            Err(OperationError::NotImplemented {
                feature: format!("{} export", format.as_str()),
            })
        }
    }
}

fn to_native_json(
    document: &DocumentInfo,
    operations: &[Operation],
    options: &ExportOptions,
) -> Result<ExportArtifact, OperationError> {
    let mut ordered: Vec<&Operation> = operations.iter().collect();
    ordered.sort_by_key(|op| op.sequence);

    let native = NativeDocument {
        version: NATIVE_FORMAT_VERSION.to_string(),
        format: NATIVE_FORMAT_NAME.to_string(),
        metadata: options.include_metadata.then(|| NativeMetadata {
            document_id: document.id,
            name: document.name.clone(),
            created_at: document.created_at,
            updated_at: document.updated_at,
            exported_at: Utc::now(),
        }),
        operations: ordered
            .into_iter()
            .map(NativeOperation::from_operation)
            .collect::<Result<_, _>>()?,
    };

    let json = serde_json::to_vec_pretty(&native)
        .map_err(|e| OperationError::storage(format!("export serialization failed: {e}")))?;

    Ok(ExportArtifact {
        filename: format!("{}.polygon.json", document.name),
        mime_type: "application/json".to_string(),
        data: STANDARD.encode(json),
    })
}
