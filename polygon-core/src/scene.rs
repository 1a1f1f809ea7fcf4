//! Renderable scene derived from the operation list.
//!
//! ```text
//!   [Operation] ──derive_sketches──────────▶ PlaneSketches { x, y, z }
//!       │
//!       └──────derive_extruded_shapes────▶ [ExtrudedShape]
//! ```
//!
//! Both derivations are pure functions of the operation slice. The combined
//! [`SceneState`] is the payload the sync bridge persists and broadcasts.

use serde::{Deserialize, Serialize};

use crate::error::OperationError;
use crate::operation::{Dimension, Operation, OperationParams, Point3};

/// Color of an extruded shape whose extrude carries none.
pub const DEFAULT_EXTRUDE_COLOR: &str = "#cccccc";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Pencil,
    Rectangle,
    Eraser,
    Select,
}

/// One drawn item on a sketch plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawingItem {
    pub id: String,
    pub tool: Tool,
    pub color: String,
    pub points: Vec<Point3>,
    pub dimension: Dimension,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlaneSketches {
    pub x: Vec<DrawingItem>,
    pub y: Vec<DrawingItem>,
    pub z: Vec<DrawingItem>,
}

impl PlaneSketches {
    pub fn plane(&self, dimension: Dimension) -> &[DrawingItem] {
        match dimension {
            Dimension::X => &self.x,
            Dimension::Y => &self.y,
            Dimension::Z => &self.z,
        }
    }

    pub fn plane_mut(&mut self, dimension: Dimension) -> &mut Vec<DrawingItem> {
        match dimension {
            Dimension::X => &mut self.x,
            Dimension::Y => &mut self.y,
            Dimension::Z => &mut self.z,
        }
    }

    /// Items in plane order `x`, `y`, `z`.
    pub fn iter(&self) -> impl Iterator<Item = &DrawingItem> {
        self.x.iter().chain(self.y.iter()).chain(self.z.iter())
    }

    pub fn find(&self, id: &str) -> Option<&DrawingItem> {
        self.iter().find(|item| item.id == id)
    }

    pub fn len(&self) -> usize {
        self.x.len() + self.y.len() + self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrudedShape {
    pub id: String,
    pub sketch_id: String,
    pub dimension: Dimension,
    pub depth: f64,
    pub color: String,
}

/// Document-state payload: the sketches per plane plus extruded shapes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SceneState {
    pub sketches: PlaneSketches,
    pub extruded_shapes: Vec<ExtrudedShape>,
}

impl SceneState {
    pub fn from_operations(ops: &[Operation]) -> Self {
        Self {
            sketches: derive_sketches(ops),
            extruded_shapes: derive_extruded_shapes(ops),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.sketches.is_empty() && self.extruded_shapes.is_empty()
    }

    /// Decode and validate an incoming payload.
    pub fn parse(bytes: &[u8]) -> Result<Self, OperationError> {
        let scene: SceneState = serde_json::from_slice(bytes)
            .map_err(|e| OperationError::invalid(format!("scene: {e}")))?;
        scene.validate()?;
        Ok(scene)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, OperationError> {
        serde_json::to_vec(self).map_err(|e| OperationError::invalid(format!("scene: {e}")))
    }

    pub fn validate(&self) -> Result<(), OperationError> {
        for dimension in Dimension::ALL {
            for item in self.sketches.plane(dimension) {
                if item.dimension != dimension {
                    return Err(OperationError::invalid(format!(
                        "scene: item {} is stored under plane {} but declares {}",
                        item.id,
                        dimension.as_str(),
                        item.dimension.as_str()
                    )));
                }
                if item.points.iter().any(|p| !p.is_finite()) {
                    return Err(OperationError::invalid(format!(
                        "scene: item {} has non-finite coordinates",
                        item.id
                    )));
                }
            }
        }
        for shape in &self.extruded_shapes {
            if !shape.depth.is_finite() {
                return Err(OperationError::invalid(format!(
                    "scene: shape {} has a non-finite depth",
                    shape.id
                )));
            }
        }
        Ok(())
    }
}

/// Group sketch operations into per-plane drawing items, keeping list order.
pub fn derive_sketches(ops: &[Operation]) -> PlaneSketches {
    let mut sketches = PlaneSketches::default();
    for op in ops {
        let item = match &op.params {
            OperationParams::SketchLine(p) => DrawingItem {
                id: op.id.to_string(),
                tool: Tool::Pencil,
                color: p.color.clone(),
                points: p.points.clone(),
                dimension: p.dimension,
            },
            OperationParams::SketchRectangle(p) => DrawingItem {
                id: op.id.to_string(),
                tool: Tool::Rectangle,
                color: p.color.clone(),
                points: vec![p.start_point, p.end_point],
                dimension: p.dimension,
            },
            // Circles render through the pencil path from their center.
            OperationParams::SketchCircle(p) => DrawingItem {
                id: op.id.to_string(),
                tool: Tool::Pencil,
                color: p.color.clone(),
                points: vec![p.center],
                dimension: p.dimension,
            },
            OperationParams::Extrude(_)
            | OperationParams::Revolve(_)
            | OperationParams::Fillet(_)
            | OperationParams::Pattern(_) => continue,
        };
        sketches.plane_mut(item.dimension).push(item);
    }
    sketches
}

/// Resolve every extrude to its source sketch plane.
///
/// Dangling references contribute nothing.
pub fn derive_extruded_shapes(ops: &[Operation]) -> Vec<ExtrudedShape> {
    ops.iter()
        .filter_map(|op| {
            let OperationParams::Extrude(extrude) = &op.params else {
                return None;
            };
            let source = ops.iter().find(|o| o.id == extrude.sketch_operation_id)?;
            let dimension = source.dimension()?;
            Some(ExtrudedShape {
                id: op.id.to_string(),
                sketch_id: extrude.sketch_operation_id.to_string(),
                dimension,
                depth: extrude.depth,
                color: extrude
                    .color
                    .clone()
                    .unwrap_or_else(|| DEFAULT_EXTRUDE_COLOR.to_string()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OperationId, OperationType};
    use serde_json::json;

    fn op(id: &str, sequence: u64, op_type: OperationType, params: serde_json::Value) -> Operation {
        let params = OperationParams::parse(op_type, params).unwrap();
        let deps = params.source_reference().cloned().into_iter().collect();
        Operation::new(OperationId::from(id), sequence, params, deps)
    }

    fn sample_ops() -> Vec<Operation> {
        vec![
            op(
                "rect",
                0,
                OperationType::SketchRectangle,
                json!({
                    "dimension": "z",
                    "startPoint": {"x": 0.0, "y": 0.0, "z": 0.0},
                    "endPoint": {"x": 10.0, "y": 10.0, "z": 0.0}
                }),
            ),
            op(
                "line",
                1,
                OperationType::SketchLine,
                json!({
                    "dimension": "x",
                    "points": [{"x": 0.0, "y": 0.0, "z": 0.0}, {"x": 0.0, "y": 4.0, "z": 2.0}],
                    "color": "#123456"
                }),
            ),
            op(
                "circle",
                2,
                OperationType::SketchCircle,
                json!({"dimension": "z", "center": {"x": 1.0, "y": 1.0, "z": 0.0}, "radius": 3.0}),
            ),
            op(
                "ext",
                3,
                OperationType::Extrude,
                json!({"sketchOperationId": "rect", "depth": 5.0}),
            ),
        ]
    }

    #[test]
    fn test_derive_sketches_groups_by_plane() {
        let sketches = derive_sketches(&sample_ops());
        assert_eq!(sketches.x.len(), 1);
        assert!(sketches.y.is_empty());
        assert_eq!(sketches.z.len(), 2);

        let rect = &sketches.z[0];
        assert_eq!(rect.id, "rect");
        assert_eq!(rect.tool, Tool::Rectangle);
        assert_eq!(rect.points, vec![Point3::new(0.0, 0.0, 0.0), Point3::new(10.0, 10.0, 0.0)]);

        let circle = &sketches.z[1];
        assert_eq!(circle.tool, Tool::Pencil);
        assert_eq!(circle.points, vec![Point3::new(1.0, 1.0, 0.0)]);

        assert_eq!(sketches.x[0].color, "#123456");
    }

    #[test]
    fn test_derive_extruded_shapes_resolves_plane() {
        let shapes = derive_extruded_shapes(&sample_ops());
        assert_eq!(shapes.len(), 1);
        assert_eq!(shapes[0].id, "ext");
        assert_eq!(shapes[0].sketch_id, "rect");
        assert_eq!(shapes[0].dimension, Dimension::Z);
        assert_eq!(shapes[0].color, DEFAULT_EXTRUDE_COLOR);
    }

    #[test]
    fn test_dangling_extrude_contributes_nothing() {
        let ops: Vec<Operation> = sample_ops().into_iter().filter(|o| o.id.as_str() != "rect").collect();
        assert!(derive_extruded_shapes(&ops).is_empty());
        assert_eq!(derive_sketches(&ops).len(), 2);
    }

    #[test]
    fn test_scene_json_shape() {
        let scene = SceneState::from_operations(&sample_ops());
        let json = serde_json::to_value(&scene).unwrap();
        assert_eq!(json["extrudedShapes"][0]["sketchId"], "rect");
        assert_eq!(json["sketches"]["z"][0]["tool"], "rectangle");
    }

    #[test]
    fn test_parse_rejects_misfiled_item() {
        let payload = json!({
            "sketches": {
                "x": [{"id": "a", "tool": "pencil", "color": "#000", "points": [], "dimension": "z"}],
                "y": [], "z": []
            },
            "extrudedShapes": []
        });
        let err = SceneState::parse(payload.to_string().as_bytes()).unwrap_err();
        assert!(err.to_string().contains("plane"));
    }

    #[test]
    fn test_parse_rejects_unknown_tool_and_garbage() {
        let payload = json!({
            "sketches": {
                "x": [], "y": [],
                "z": [{"id": "a", "tool": "laser", "color": "#000", "points": [], "dimension": "z"}]
            },
            "extrudedShapes": []
        });
        assert!(SceneState::parse(payload.to_string().as_bytes()).is_err());
        assert!(SceneState::parse(b"not json").is_err());
    }

    #[test]
    fn test_parse_accepts_derived_scene() {
        let scene = SceneState::from_operations(&sample_ops());
        let bytes = scene.to_json().unwrap();
        assert_eq!(SceneState::parse(&bytes).unwrap(), scene);
    }
}
