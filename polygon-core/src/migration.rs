//! Conversion of a client-only scene into operation create requests.
//!
//! Documents edited before operations were persisted only have a
//! [`SceneState`]. [`migrate_scene`] turns it into an ordered batch that the
//! store accepts in one `create_batch` call: sketches in plane order `x`,
//! `y`, `z`, then extrudes referencing their sketch by client id.

use std::collections::HashSet;

use log::warn;
use serde_json::json;

use crate::operation::{NewOperation, OperationId, OperationParams, OperationType};
use crate::scene::{DrawingItem, ExtrudedShape, SceneState, Tool};

/// Build the create batch for a legacy scene. Unmappable items are skipped.
pub fn migrate_scene(scene: &SceneState) -> Vec<NewOperation> {
    let mut batch = Vec::new();
    let mut migrated: HashSet<String> = HashSet::new();

    for item in scene.sketches.iter() {
        if migrated.contains(&item.id) {
            warn!("Skipping duplicate sketch id {} during migration", item.id);
            continue;
        }
        match sketch_to_operation(item) {
            Some(op) => {
                migrated.insert(item.id.clone());
                batch.push(op);
            }
            None => warn!("Skipping unmigratable sketch {} ({:?})", item.id, item.tool),
        }
    }

    for shape in &scene.extruded_shapes {
        if !migrated.contains(&shape.sketch_id) {
            continue;
        }
        if migrated.contains(&shape.id) {
            warn!("Skipping extrude {} whose id collides with a sketch", shape.id);
            continue;
        }
        match extrude_to_operation(shape) {
            Some(op) => {
                migrated.insert(shape.id.clone());
                batch.push(op);
            }
            None => warn!("Skipping invalid extrude {} during migration", shape.id),
        }
    }

    batch
}

fn sketch_to_operation(item: &DrawingItem) -> Option<NewOperation> {
    let (op_type, parameters) = match item.tool {
        Tool::Rectangle => {
            let [start, end, ..] = item.points.as_slice() else {
                return None;
            };
            (
                OperationType::SketchRectangle,
                json!({
                    "dimension": item.dimension,
                    "startPoint": start,
                    "endPoint": end,
                    "color": item.color,
                }),
            )
        }
        Tool::Pencil => (
            OperationType::SketchLine,
            json!({
                "dimension": item.dimension,
                "points": item.points,
                "color": item.color,
                "closed": false,
            }),
        ),
        Tool::Eraser | Tool::Select => return None,
    };
    checked(op_type, parameters).map(|op| op.with_client_id(item.id.as_str()))
}

fn extrude_to_operation(shape: &ExtrudedShape) -> Option<NewOperation> {
    let parameters = json!({
        "sketchOperationId": shape.sketch_id,
        "depth": shape.depth,
        "direction": "positive",
        "color": shape.color,
    });
    checked(OperationType::Extrude, parameters).map(|op| {
        op.with_client_id(shape.id.as_str())
            .depends_on(OperationId::from(shape.sketch_id.as_str()))
    })
}

fn checked(op_type: OperationType, parameters: serde_json::Value) -> Option<NewOperation> {
    match OperationParams::parse(op_type, parameters.clone()) {
        Ok(_) => Some(NewOperation::new(op_type, parameters)),
        Err(e) => {
            warn!("Migration produced invalid {op_type}: {e}");
            None
        }
    }
}
