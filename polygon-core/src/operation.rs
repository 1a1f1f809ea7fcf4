//! Typed construction operations: the canonical document model.
//!
//! Every operation is one atomic CAD construction step. The parameter
//! payload is a closed sum type keyed by [`OperationType`], so a value of
//! [`Operation`] is always schema-valid: deserialization runs the same
//! validation the store runs on create.
//!
//! Wire shape (JSON):
//! ```text
//! {
//!   "id": "…", "sequence": 0, "type": "sketch_rectangle",
//!   "parameters": { "dimension": "z", "startPoint": {…}, … },
//!   "dependencies": ["…"],
//!   "createdAt": "2025-01-01T00:00:00Z", "updatedAt": "…"
//! }
//! ```

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::OperationError;

/// Default stroke color for sketches.
pub const DEFAULT_SKETCH_COLOR: &str = "#000000";

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque operation identifier.
///
/// Optimistic operations carry a time-based client id; the store assigns a
/// UUID when the operation is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Server-side id (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Client-side, time-based id: `<unix millis>-<counter>`.
    pub fn client_generated() -> Self {
        let millis = Utc::now().timestamp_millis();
        let n = CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("{millis}-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for OperationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Sketch plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    X,
    Y,
    Z,
}

impl Dimension {
    pub const ALL: [Dimension; 3] = [Dimension::X, Dimension::Y, Dimension::Z];

    pub fn as_str(self) -> &'static str {
        match self {
            Dimension::X => "x",
            Dimension::Y => "y",
            Dimension::Z => "z",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Operation discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    SketchLine,
    SketchRectangle,
    SketchCircle,
    Extrude,
    Revolve,
    Fillet,
    Pattern,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::SketchLine => "sketch_line",
            OperationType::SketchRectangle => "sketch_rectangle",
            OperationType::SketchCircle => "sketch_circle",
            OperationType::Extrude => "extrude",
            OperationType::Revolve => "revolve",
            OperationType::Fillet => "fillet",
            OperationType::Pattern => "pattern",
        }
    }

    pub fn is_sketch(self) -> bool {
        matches!(
            self,
            OperationType::SketchLine | OperationType::SketchRectangle | OperationType::SketchCircle
        )
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sketch_line" => Ok(OperationType::SketchLine),
            "sketch_rectangle" => Ok(OperationType::SketchRectangle),
            "sketch_circle" => Ok(OperationType::SketchCircle),
            "extrude" => Ok(OperationType::Extrude),
            "revolve" => Ok(OperationType::Revolve),
            "fillet" => Ok(OperationType::Fillet),
            "pattern" => Ok(OperationType::Pattern),
            other => Err(OperationError::invalid(format!("Unknown operation type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtrudeDirection {
    #[default]
    Positive,
    Negative,
    Symmetric,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Linear,
    Circular,
}

fn default_color() -> String {
    DEFAULT_SKETCH_COLOR.to_string()
}

// ─── Parameter payloads ──────────────────────────────────────────────

/// Freehand polyline (pencil tool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchLineParams {
    pub dimension: Dimension,
    pub points: Vec<Point3>,
    #[serde(default = "default_color")]
    pub color: String,
    #[serde(default)]
    pub closed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchRectangleParams {
    pub dimension: Dimension,
    pub start_point: Point3,
    pub end_point: Point3,
    #[serde(default = "default_color")]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SketchCircleParams {
    pub dimension: Dimension,
    pub center: Point3,
    pub radius: f64,
    #[serde(default = "default_color")]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrudeParams {
    pub sketch_operation_id: OperationId,
    pub depth: f64,
    #[serde(default)]
    pub direction: ExtrudeDirection,
    /// Inherits the sketch color when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevolveParams {
    pub sketch_operation_id: OperationId,
    pub axis: Dimension,
    /// Degrees, `0..=360`.
    pub angle: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilletParams {
    pub target_operation_id: OperationId,
    pub edge_indices: Vec<u32>,
    pub radius: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternParams {
    pub target_operation_id: OperationId,
    pub pattern_type: PatternKind,
    pub count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacing: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub angle: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<Dimension>,
}

fn check_finite(field: &str, value: f64) -> Result<(), OperationError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(OperationError::invalid(format!("{field}: must be a finite number")))
    }
}

fn check_positive(field: &str, value: f64) -> Result<(), OperationError> {
    check_finite(field, value)?;
    if value > 0.0 {
        Ok(())
    } else {
        Err(OperationError::invalid(format!("{field}: must be positive")))
    }
}

fn check_point(field: &str, point: &Point3) -> Result<(), OperationError> {
    if point.is_finite() {
        Ok(())
    } else {
        Err(OperationError::invalid(format!("{field}: coordinates must be finite")))
    }
}

/// Variant-specific parameter payload.
///
/// Serializes as the bare payload object; the discriminant travels in the
/// enclosing operation's `type` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OperationParams {
    SketchLine(SketchLineParams),
    SketchRectangle(SketchRectangleParams),
    SketchCircle(SketchCircleParams),
    Extrude(ExtrudeParams),
    Revolve(RevolveParams),
    Fillet(FilletParams),
    Pattern(PatternParams),
}

impl OperationParams {
    /// Parse and validate a raw JSON payload against the schema of `op_type`.
    pub fn parse(op_type: OperationType, value: Value) -> Result<Self, OperationError> {
        if !value.is_object() {
            return Err(OperationError::invalid(format!(
                "{op_type}: parameters must be an object"
            )));
        }

        fn decode<T: serde::de::DeserializeOwned>(
            op_type: OperationType,
            value: Value,
        ) -> Result<T, OperationError> {
            serde_json::from_value(value)
                .map_err(|e| OperationError::invalid(format!("{op_type}: {e}")))
        }

        let params = match op_type {
            OperationType::SketchLine => Self::SketchLine(decode(op_type, value)?),
            OperationType::SketchRectangle => Self::SketchRectangle(decode(op_type, value)?),
            OperationType::SketchCircle => Self::SketchCircle(decode(op_type, value)?),
            OperationType::Extrude => Self::Extrude(decode(op_type, value)?),
            OperationType::Revolve => Self::Revolve(decode(op_type, value)?),
            OperationType::Fillet => Self::Fillet(decode(op_type, value)?),
            OperationType::Pattern => Self::Pattern(decode(op_type, value)?),
        };
        params.validate()?;
        Ok(params)
    }

    /// Range checks serde cannot express.
    pub fn validate(&self) -> Result<(), OperationError> {
        match self {
            Self::SketchLine(p) => {
                if p.points.len() < 2 {
                    return Err(OperationError::invalid(
                        "sketch_line: points must contain at least 2 points",
                    ));
                }
                for (i, point) in p.points.iter().enumerate() {
                    check_point(&format!("sketch_line: points[{i}]"), point)?;
                }
                Ok(())
            }
            Self::SketchRectangle(p) => {
                check_point("sketch_rectangle: startPoint", &p.start_point)?;
                check_point("sketch_rectangle: endPoint", &p.end_point)
            }
            Self::SketchCircle(p) => {
                check_point("sketch_circle: center", &p.center)?;
                check_positive("sketch_circle: radius", p.radius)
            }
            Self::Extrude(p) => check_positive("extrude: depth", p.depth),
            Self::Revolve(p) => {
                check_finite("revolve: angle", p.angle)?;
                if !(0.0..=360.0).contains(&p.angle) {
                    return Err(OperationError::invalid("revolve: angle must be within 0..=360"));
                }
                Ok(())
            }
            Self::Fillet(p) => check_positive("fillet: radius", p.radius),
            Self::Pattern(p) => {
                if p.count < 2 {
                    return Err(OperationError::invalid("pattern: count must be at least 2"));
                }
                if let Some(spacing) = p.spacing {
                    check_finite("pattern: spacing", spacing)?;
                }
                if let Some(angle) = p.angle {
                    check_finite("pattern: angle", angle)?;
                }
                Ok(())
            }
        }
    }

    pub fn op_type(&self) -> OperationType {
        match self {
            Self::SketchLine(_) => OperationType::SketchLine,
            Self::SketchRectangle(_) => OperationType::SketchRectangle,
            Self::SketchCircle(_) => OperationType::SketchCircle,
            Self::Extrude(_) => OperationType::Extrude,
            Self::Revolve(_) => OperationType::Revolve,
            Self::Fillet(_) => OperationType::Fillet,
            Self::Pattern(_) => OperationType::Pattern,
        }
    }

    /// Sketch plane, for sketch operations.
    pub fn dimension(&self) -> Option<Dimension> {
        match self {
            Self::SketchLine(p) => Some(p.dimension),
            Self::SketchRectangle(p) => Some(p.dimension),
            Self::SketchCircle(p) => Some(p.dimension),
            Self::Extrude(_) | Self::Revolve(_) | Self::Fillet(_) | Self::Pattern(_) => None,
        }
    }

    /// Operation named inside the payload (`sketchOperationId` / `targetOperationId`).
    pub fn source_reference(&self) -> Option<&OperationId> {
        match self {
            Self::Extrude(p) => Some(&p.sketch_operation_id),
            Self::Revolve(p) => Some(&p.sketch_operation_id),
            Self::Fillet(p) => Some(&p.target_operation_id),
            Self::Pattern(p) => Some(&p.target_operation_id),
            Self::SketchLine(_) | Self::SketchRectangle(_) | Self::SketchCircle(_) => None,
        }
    }

    /// Point the payload reference at another operation (batch id remapping).
    pub fn set_source_reference(&mut self, id: OperationId) {
        match self {
            Self::Extrude(p) => p.sketch_operation_id = id,
            Self::Revolve(p) => p.sketch_operation_id = id,
            Self::Fillet(p) => p.target_operation_id = id,
            Self::Pattern(p) => p.target_operation_id = id,
            Self::SketchLine(_) | Self::SketchRectangle(_) | Self::SketchCircle(_) => {}
        }
    }

    pub fn to_value(&self) -> Result<Value, OperationError> {
        serde_json::to_value(self).map_err(|e| OperationError::invalid(e.to_string()))
    }

    /// Shallow-merge `patch` over the current fields and re-validate.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Self, OperationError> {
        let mut fields = match self.to_value()? {
            Value::Object(map) => map,
            _ => return Err(OperationError::invalid("parameters must be an object")),
        };
        for (key, value) in patch {
            fields.insert(key.clone(), value.clone());
        }
        Self::parse(self.op_type(), Value::Object(fields))
    }
}

// ─── Operation ───────────────────────────────────────────────────────

/// One persisted (or optimistic) construction step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "OperationWire")]
pub struct Operation {
    pub id: OperationId,
    /// Store-assigned total order within the document.
    pub sequence: u64,
    pub params: OperationParams,
    pub dependencies: Vec<OperationId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        id: OperationId,
        sequence: u64,
        params: OperationParams,
        dependencies: Vec<OperationId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            sequence,
            params,
            dependencies,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn op_type(&self) -> OperationType {
        self.params.op_type()
    }

    pub fn is_sketch(&self) -> bool {
        self.op_type().is_sketch()
    }

    pub fn dimension(&self) -> Option<Dimension> {
        self.params.dimension()
    }

    pub fn depends_on(&self, id: &OperationId) -> bool {
        self.dependencies.iter().any(|d| d == id)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OperationWire {
    id: OperationId,
    sequence: u64,
    #[serde(rename = "type")]
    op_type: OperationType,
    parameters: Value,
    #[serde(default)]
    dependencies: Vec<OperationId>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OperationWire> for Operation {
    type Error = OperationError;

    fn try_from(wire: OperationWire) -> Result<Self, Self::Error> {
        let params = OperationParams::parse(wire.op_type, wire.parameters)?;
        Ok(Self {
            id: wire.id,
            sequence: wire.sequence,
            params,
            dependencies: wire.dependencies,
            created_at: wire.created_at,
            updated_at: wire.updated_at,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationWireRef<'a> {
    id: &'a OperationId,
    sequence: u64,
    #[serde(rename = "type")]
    op_type: OperationType,
    parameters: &'a OperationParams,
    dependencies: &'a [OperationId],
    created_at: &'a DateTime<Utc>,
    updated_at: &'a DateTime<Utc>,
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        OperationWireRef {
            id: &self.id,
            sequence: self.sequence,
            op_type: self.op_type(),
            parameters: &self.params,
            dependencies: &self.dependencies,
            created_at: &self.created_at,
            updated_at: &self.updated_at,
        }
        .serialize(serializer)
    }
}

/// Create request for one operation.
///
/// `parameters` stays raw until the store validates it. `client_id` lets a
/// later item of the same batch name this one in its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOperation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<OperationId>,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub parameters: Value,
    #[serde(default)]
    pub dependencies: Vec<OperationId>,
}

impl NewOperation {
    pub fn new(op_type: OperationType, parameters: Value) -> Self {
        Self {
            client_id: None,
            op_type,
            parameters,
            dependencies: Vec::new(),
        }
    }

    pub fn from_params(params: &OperationParams) -> Result<Self, OperationError> {
        Ok(Self::new(params.op_type(), params.to_value()?))
    }

    pub fn with_client_id(mut self, id: impl Into<OperationId>) -> Self {
        self.client_id = Some(id.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<OperationId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    /// Batch input for an optimistic operation, keyed by its client id.
    pub fn from_pending(op: &Operation) -> Result<Self, OperationError> {
        Ok(Self {
            client_id: Some(op.id.clone()),
            op_type: op.op_type(),
            parameters: op.params.to_value()?,
            dependencies: op.dependencies.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rect_params() -> Value {
        json!({
            "dimension": "z",
            "startPoint": {"x": 0.0, "y": 0.0, "z": 0.0},
            "endPoint": {"x": 10.0, "y": 10.0, "z": 0.0}
        })
    }

    #[test]
    fn test_parse_rectangle_applies_default_color() {
        let params = OperationParams::parse(OperationType::SketchRectangle, rect_params()).unwrap();
        match params {
            OperationParams::SketchRectangle(p) => {
                assert_eq!(p.dimension, Dimension::Z);
                assert_eq!(p.end_point, Point3::new(10.0, 10.0, 0.0));
                assert_eq!(p.color, DEFAULT_SKETCH_COLOR);
            }
            other => panic!("unexpected params {other:?}"),
        }
    }

    #[test]
    fn test_sketch_line_requires_two_points() {
        let err = OperationParams::parse(
            OperationType::SketchLine,
            json!({"dimension": "x", "points": [{"x": 0.0, "y": 0.0, "z": 0.0}]}),
        )
        .unwrap_err();
        assert!(matches!(err, OperationError::InvalidParameters { .. }));
    }

    #[test]
    fn test_sketch_line_defaults() {
        let params = OperationParams::parse(
            OperationType::SketchLine,
            json!({
                "dimension": "y",
                "points": [{"x": 0.0, "y": 0.0, "z": 0.0}, {"x": 1.0, "y": 2.0, "z": 0.0}]
            }),
        )
        .unwrap();
        let OperationParams::SketchLine(line) = params else {
            panic!("expected sketch line");
        };
        assert!(!line.closed);
        assert_eq!(line.color, "#000000");
    }

    #[test]
    fn test_extrude_depth_must_be_positive() {
        for depth in [0.0, -5.0] {
            let err = OperationParams::parse(
                OperationType::Extrude,
                json!({"sketchOperationId": "a", "depth": depth}),
            )
            .unwrap_err();
            assert!(err.to_string().contains("depth"), "{err}");
        }
    }

    #[test]
    fn test_extrude_direction_default_and_reference() {
        let params = OperationParams::parse(
            OperationType::Extrude,
            json!({"sketchOperationId": "rect-1", "depth": 5.0}),
        )
        .unwrap();
        let OperationParams::Extrude(ref extrude) = params else {
            panic!("expected extrude");
        };
        assert_eq!(extrude.direction, ExtrudeDirection::Positive);
        assert!(extrude.color.is_none());
        assert_eq!(params.source_reference(), Some(&OperationId::from("rect-1")));
    }

    #[test]
    fn test_revolve_angle_range() {
        let ok = OperationParams::parse(
            OperationType::Revolve,
            json!({"sketchOperationId": "s", "axis": "y", "angle": 360.0}),
        );
        assert!(ok.is_ok());
        let err = OperationParams::parse(
            OperationType::Revolve,
            json!({"sketchOperationId": "s", "axis": "y", "angle": 361.0}),
        );
        assert!(err.is_err());
    }

    #[test]
    fn test_pattern_count_is_integer_at_least_two() {
        let base = |count: Value| {
            json!({"targetOperationId": "t", "patternType": "linear", "count": count})
        };
        assert!(OperationParams::parse(OperationType::Pattern, base(json!(2))).is_ok());
        assert!(OperationParams::parse(OperationType::Pattern, base(json!(1))).is_err());
        assert!(OperationParams::parse(OperationType::Pattern, base(json!(2.5))).is_err());
    }

    #[test]
    fn test_circle_radius_and_fillet_radius() {
        assert!(OperationParams::parse(
            OperationType::SketchCircle,
            json!({"dimension": "z", "center": {"x": 0.0, "y": 0.0, "z": 0.0}, "radius": 0.0}),
        )
        .is_err());
        assert!(OperationParams::parse(
            OperationType::Fillet,
            json!({"targetOperationId": "t", "edgeIndices": [0, 3], "radius": 1.5}),
        )
        .is_ok());
    }

    #[test]
    fn test_parameters_must_be_object() {
        let err = OperationParams::parse(OperationType::Extrude, json!([1, 2])).unwrap_err();
        assert!(err.to_string().contains("object"));
    }

    #[test]
    fn test_unknown_type_is_invalid_parameters() {
        let err = "chamfer".parse::<OperationType>().unwrap_err();
        assert!(matches!(err, OperationError::InvalidParameters { .. }));
        assert_eq!("extrude".parse::<OperationType>().unwrap(), OperationType::Extrude);
    }

    #[test]
    fn test_merge_revalidates() {
        let params = OperationParams::parse(
            OperationType::Extrude,
            json!({"sketchOperationId": "s", "depth": 5.0}),
        )
        .unwrap();

        let mut patch = Map::new();
        patch.insert("depth".into(), json!(12.5));
        patch.insert("color".into(), json!("#ff0000"));
        let merged = params.merged(&patch).unwrap();
        let OperationParams::Extrude(extrude) = merged else {
            panic!("expected extrude");
        };
        assert_eq!(extrude.depth, 12.5);
        assert_eq!(extrude.color.as_deref(), Some("#ff0000"));
        assert_eq!(extrude.sketch_operation_id.as_str(), "s");

        let mut bad = Map::new();
        bad.insert("depth".into(), json!(-1.0));
        assert!(params.merged(&bad).is_err());
    }

    #[test]
    fn test_operation_wire_shape() {
        let params = OperationParams::parse(OperationType::SketchRectangle, rect_params()).unwrap();
        let op = Operation::new(OperationId::from("rect"), 0, params, Vec::new());

        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "sketch_rectangle");
        assert_eq!(json["sequence"], 0);
        assert_eq!(json["parameters"]["startPoint"]["x"], 0.0);
        assert!(json["createdAt"].as_str().unwrap().contains('T'));

        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_operation_deserialize_rejects_bad_parameters() {
        let json = json!({
            "id": "e", "sequence": 1, "type": "extrude",
            "parameters": {"sketchOperationId": "r", "depth": 0},
            "dependencies": ["r"],
            "createdAt": "2025-01-01T00:00:00Z", "updatedAt": "2025-01-01T00:00:00Z"
        });
        assert!(serde_json::from_value::<Operation>(json).is_err());
    }

    #[test]
    fn test_client_ids_are_unique() {
        let a = OperationId::client_generated();
        let b = OperationId::client_generated();
        assert_ne!(a, b);
    }

    #[test]
    fn test_new_operation_from_pending_keeps_client_id() {
        let params = OperationParams::parse(OperationType::SketchRectangle, rect_params()).unwrap();
        let op = Operation::new(OperationId::from("local-1"), 3, params, Vec::new());
        let new_op = NewOperation::from_pending(&op).unwrap();
        assert_eq!(new_op.client_id, Some(OperationId::from("local-1")));
        assert_eq!(new_op.op_type, OperationType::SketchRectangle);
        assert_eq!(new_op.parameters["dimension"], "z");
    }
}
