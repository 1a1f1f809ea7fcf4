//! Pure state transitions: `apply_action` and its structural inverse.
//!
//! The inverse is captured from the pre-state before applying, and holds
//! the prior value of every slot the action writes. Reverting restores
//! those slots verbatim, so `revert(apply(s, a), inv(s, a)) == s` for every
//! action, including the silent no-ops on missing targets.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::action::{
    ActionKind, AppearanceAction, DocumentAction, HistoryAction, SketchAction, SolidAction,
};
use super::{DocumentState, StateMetadata};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Sketches,
    Objects,
    Materials,
    Settings,
}

/// Prior contents of one `(collection, key)` slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotValue {
    pub collection: Collection,
    pub key: String,
    pub value: Option<Value>,
}

/// What `apply_action` overwrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inverse {
    pub slots: Vec<SlotValue>,
    pub metadata: StateMetadata,
}

impl Inverse {
    /// Capture the slots `action` is about to write.
    pub fn capture(state: &DocumentState, action: &HistoryAction) -> Self {
        let slots = touched_slots(action)
            .into_iter()
            .map(|(collection, key)| SlotValue {
                collection,
                value: state.slot(collection, &key).cloned(),
                key,
            })
            .collect();
        Self {
            slots,
            metadata: state.metadata.clone(),
        }
    }
}

impl DocumentState {
    fn collection(&self, collection: Collection) -> &std::collections::BTreeMap<String, Value> {
        match collection {
            Collection::Sketches => &self.sketches,
            Collection::Objects => &self.objects,
            Collection::Materials => &self.materials,
            Collection::Settings => &self.settings,
        }
    }

    fn collection_mut(
        &mut self,
        collection: Collection,
    ) -> &mut std::collections::BTreeMap<String, Value> {
        match collection {
            Collection::Sketches => &mut self.sketches,
            Collection::Objects => &mut self.objects,
            Collection::Materials => &mut self.materials,
            Collection::Settings => &mut self.settings,
        }
    }

    pub fn slot(&self, collection: Collection, key: &str) -> Option<&Value> {
        self.collection(collection).get(key)
    }

    fn set_slot(&mut self, collection: Collection, key: String, value: Option<Value>) {
        let map = self.collection_mut(collection);
        match value {
            Some(v) => {
                map.insert(key, v);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

fn target_ids(action: &HistoryAction) -> Vec<String> {
    action
        .param("targetIds")
        .and_then(Value::as_array)
        .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Slots written by `action`, independent of whether the target exists.
fn touched_slots(action: &HistoryAction) -> Vec<(Collection, String)> {
    let target = action.target_id.clone();
    match action.kind {
        ActionKind::Sketch(_) => target.map(|t| (Collection::Sketches, t)).into_iter().collect(),
        ActionKind::ThreeD(sub) => {
            let mut slots: Vec<_> = target.map(|t| (Collection::Objects, t)).into_iter().collect();
            if matches!(
                sub,
                SolidAction::BooleanUnion | SolidAction::BooleanSubtract | SolidAction::BooleanIntersect
            ) {
                slots.extend(target_ids(action).into_iter().map(|id| (Collection::Objects, id)));
            }
            slots
        }
        ActionKind::Appearance(_) => {
            target.map(|t| (Collection::Materials, t)).into_iter().collect()
        }
        ActionKind::Document(DocumentAction::SettingsChange) => action
            .parameters
            .keys()
            .map(|k| (Collection::Settings, k.clone()))
            .collect(),
        ActionKind::Document(DocumentAction::Import | DocumentAction::Export)
        | ActionKind::Assembly(_)
        | ActionKind::Annotation(_) => Vec::new(),
    }
}

/// New entity: `{id, type, ...parameters, createdAt, createdBy}`.
fn created_entity(
    action: &HistoryAction,
    id: &str,
    entity_type: &str,
    extra: &[(&str, Value)],
) -> Value {
    let mut map = Map::new();
    map.insert("id".into(), Value::String(id.to_string()));
    map.insert("type".into(), Value::String(entity_type.to_string()));
    for (key, value) in extra {
        map.insert((*key).to_string(), value.clone());
    }
    for (key, value) in &action.parameters {
        map.insert(key.clone(), value.clone());
    }
    map.insert("createdAt".into(), Value::from(action.timestamp));
    map.insert("createdBy".into(), Value::String(action.user_id.to_string()));
    Value::Object(map)
}

/// Shallow merge of the action parameters plus `modifiedAt` / `modifiedBy`.
fn modified_entity(existing: Option<&Value>, action: &HistoryAction) -> Value {
    let mut map = match existing {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    for (key, value) in &action.parameters {
        map.insert(key.clone(), value.clone());
    }
    map.insert("modifiedAt".into(), Value::from(action.timestamp));
    map.insert("modifiedBy".into(), Value::String(action.user_id.to_string()));
    Value::Object(map)
}

/// Shared entity subtypes (modify, move, delete, duplicate) for sketches and solids.
fn apply_common(state: &mut DocumentState, collection: Collection, action: &HistoryAction, subtype: Common) {
    let Some(target) = action.target_id.as_deref() else {
        return;
    };
    match subtype {
        Common::Modify => {
            if let Some(existing) = state.slot(collection, target) {
                let merged = modified_entity(Some(existing), action);
                state.set_slot(collection, target.to_string(), Some(merged));
            }
        }
        Common::Delete => state.set_slot(collection, target.to_string(), None),
        Common::Duplicate => {
            let source = action
                .param_str("sourceId")
                .and_then(|id| state.slot(collection, id))
                .cloned();
            if let Some(Value::Object(mut copy)) = source {
                copy.insert("id".into(), Value::String(target.to_string()));
                copy.insert("createdAt".into(), Value::from(action.timestamp));
                copy.insert("createdBy".into(), Value::String(action.user_id.to_string()));
                state.set_slot(collection, target.to_string(), Some(Value::Object(copy)));
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Common {
    Modify,
    Delete,
    Duplicate,
}

fn apply_sketch(state: &mut DocumentState, action: &HistoryAction, sub: SketchAction) {
    let Some(target) = action.target_id.as_deref() else {
        return;
    };
    match sub {
        SketchAction::Create
        | SketchAction::DrawLine
        | SketchAction::DrawRectangle
        | SketchAction::DrawCircle => {
            let entity = created_entity(action, target, sub.subtype().as_str(), &[]);
            state.set_slot(Collection::Sketches, target.to_string(), Some(entity));
        }
        SketchAction::Modify | SketchAction::Move => {
            apply_common(state, Collection::Sketches, action, Common::Modify)
        }
        SketchAction::Delete => apply_common(state, Collection::Sketches, action, Common::Delete),
        SketchAction::Duplicate => {
            apply_common(state, Collection::Sketches, action, Common::Duplicate)
        }
        SketchAction::AddConstraint => {
            if let Some(Value::Object(sketch)) = state.sketches.get_mut(target) {
                let mut constraint = Map::new();
                constraint.insert("id".into(), Value::String(action.id.to_string()));
                for (key, value) in &action.parameters {
                    constraint.insert(key.clone(), value.clone());
                }
                let constraints = sketch
                    .entry("constraints")
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(list) = constraints {
                    list.push(Value::Object(constraint));
                }
            }
        }
        SketchAction::RemoveConstraint => {
            let Some(constraint_id) = action.param_str("constraintId") else {
                return;
            };
            if let Some(Value::Object(sketch)) = state.sketches.get_mut(target) {
                if let Some(Value::Array(list)) = sketch.get_mut("constraints") {
                    list.retain(|c| c.get("id").and_then(Value::as_str) != Some(constraint_id));
                }
            }
        }
    }
}

fn apply_solid(state: &mut DocumentState, action: &HistoryAction, sub: SolidAction) {
    let Some(target) = action.target_id.as_deref() else {
        return;
    };
    let created_type = match sub {
        SolidAction::Extrude => Some("extrusion"),
        SolidAction::Revolve => Some("revolution"),
        SolidAction::Loft => Some("loft"),
        SolidAction::Sweep => Some("sweep"),
        SolidAction::Create => Some("solid"),
        _ => None,
    };
    if let Some(entity_type) = created_type {
        let mut extra = Vec::new();
        if let Some(sketch_id) = action.param("sketchId") {
            extra.push(("sourceSketchId", sketch_id.clone()));
        }
        let entity = created_entity(action, target, entity_type, &extra);
        state.set_slot(Collection::Objects, target.to_string(), Some(entity));
        return;
    }

    match sub {
        SolidAction::BooleanUnion | SolidAction::BooleanSubtract | SolidAction::BooleanIntersect => {
            let operation = Value::String(sub.subtype().as_str().to_string());
            let entity = created_entity(action, target, "boolean", &[("operation", operation)]);
            state.set_slot(Collection::Objects, target.to_string(), Some(entity));
            for id in target_ids(action) {
                if let Some(Value::Object(consumed)) = state.objects.get_mut(&id) {
                    consumed.insert("consumedBy".into(), Value::String(target.to_string()));
                }
            }
        }
        SolidAction::Modify | SolidAction::Move => {
            apply_common(state, Collection::Objects, action, Common::Modify)
        }
        SolidAction::Delete => apply_common(state, Collection::Objects, action, Common::Delete),
        SolidAction::Duplicate => {
            apply_common(state, Collection::Objects, action, Common::Duplicate)
        }
        SolidAction::Extrude
        | SolidAction::Revolve
        | SolidAction::Loft
        | SolidAction::Sweep
        | SolidAction::Create => {}
    }
}

fn apply_appearance(state: &mut DocumentState, action: &HistoryAction, sub: AppearanceAction) {
    let Some(target) = action.target_id.as_deref() else {
        return;
    };
    match sub {
        AppearanceAction::Delete => state.set_slot(Collection::Materials, target.to_string(), None),
        AppearanceAction::Create
        | AppearanceAction::Modify
        | AppearanceAction::ApplyMaterial
        | AppearanceAction::ChangeColor
        | AppearanceAction::SetVisibility
        | AppearanceAction::SetTransparency => {
            let merged = modified_entity(state.materials.get(target), action);
            state.set_slot(Collection::Materials, target.to_string(), Some(merged));
        }
    }
}

/// Apply `action` to `state`. Missing targets are silent no-ops; the
/// metadata always records the action's time and author.
pub fn apply_action(mut state: DocumentState, action: &HistoryAction) -> DocumentState {
    match action.kind {
        ActionKind::Sketch(sub) => apply_sketch(&mut state, action, sub),
        ActionKind::ThreeD(sub) => apply_solid(&mut state, action, sub),
        ActionKind::Appearance(sub) => apply_appearance(&mut state, action, sub),
        ActionKind::Document(DocumentAction::SettingsChange) => {
            for (key, value) in &action.parameters {
                state.settings.insert(key.clone(), value.clone());
            }
        }
        ActionKind::Document(DocumentAction::Import | DocumentAction::Export)
        | ActionKind::Assembly(_)
        | ActionKind::Annotation(_) => {}
    }
    state.metadata = StateMetadata {
        last_modified: action.timestamp,
        last_modified_by: Some(action.user_id),
    };
    state
}

/// Restore the slots captured in `inverse`.
pub fn revert_action(mut state: DocumentState, inverse: &Inverse) -> DocumentState {
    // Reverse order so a slot listed twice ends at its earliest value.
    for slot in inverse.slots.iter().rev() {
        state.set_slot(slot.collection, slot.key.clone(), slot.value.clone());
    }
    state.metadata = inverse.metadata.clone();
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::action::{ActionDraft, AssemblyAction};
    use serde_json::json;
    use uuid::Uuid;

    fn action(draft: ActionDraft, ts: i64) -> HistoryAction {
        draft.into_action(Uuid::new_v4(), ts, Uuid::nil())
    }

    fn roundtrip(state: DocumentState, action: &HistoryAction) -> (DocumentState, DocumentState) {
        let inverse = Inverse::capture(&state, action);
        let applied = apply_action(state, action);
        let reverted = revert_action(applied.clone(), &inverse);
        (applied, reverted)
    }

    #[test]
    fn test_draw_creates_sketch() {
        let a = action(
            ActionDraft::new(ActionKind::Sketch(SketchAction::DrawLine))
                .target("s1")
                .param("points", json!([[0, 0], [1, 1]])),
            10,
        );
        let state = apply_action(DocumentState::default(), &a);
        let sketch = &state.sketches["s1"];
        assert_eq!(sketch["type"], "draw_line");
        assert_eq!(sketch["createdAt"], 10);
        assert_eq!(state.metadata.last_modified, 10);
    }

    #[test]
    fn test_modify_missing_target_is_noop() {
        let a = action(
            ActionDraft::new(ActionKind::Sketch(SketchAction::Modify))
                .target("ghost")
                .param("color", "#fff"),
            5,
        );
        let (applied, reverted) = roundtrip(DocumentState::default(), &a);
        assert!(applied.sketches.is_empty());
        assert_eq!(reverted, DocumentState::default());
    }

    #[test]
    fn test_extrude_links_source_sketch() {
        let a = action(
            ActionDraft::new(ActionKind::ThreeD(SolidAction::Extrude))
                .target("o1")
                .param("sketchId", "s1")
                .param("depth", 5),
            1,
        );
        let state = apply_action(DocumentState::default(), &a);
        assert_eq!(state.objects["o1"]["type"], "extrusion");
        assert_eq!(state.objects["o1"]["sourceSketchId"], "s1");
    }

    #[test]
    fn test_boolean_marks_and_restores_consumed_objects() {
        let mut base = DocumentState::default();
        base.objects.insert("a".into(), json!({"id": "a"}));
        base.objects.insert("b".into(), json!({"id": "b"}));

        let a = action(
            ActionDraft::new(ActionKind::ThreeD(SolidAction::BooleanUnion))
                .target("u")
                .param("targetIds", json!(["a", "b", "missing"])),
            2,
        );
        let (applied, reverted) = roundtrip(base.clone(), &a);
        assert_eq!(applied.objects["u"]["operation"], "boolean_union");
        assert_eq!(applied.objects["a"]["consumedBy"], "u");
        assert!(!applied.objects.contains_key("missing"));
        assert_eq!(reverted, base);
    }

    #[test]
    fn test_constraints_add_and_remove() {
        let mut base = DocumentState::default();
        base.sketches.insert("s".into(), json!({"id": "s"}));

        let add = action(
            ActionDraft::new(ActionKind::Sketch(SketchAction::AddConstraint))
                .target("s")
                .param("kind", "parallel"),
            1,
        );
        let state = apply_action(base.clone(), &add);
        assert_eq!(state.sketches["s"]["constraints"][0]["kind"], "parallel");

        let remove = action(
            ActionDraft::new(ActionKind::Sketch(SketchAction::RemoveConstraint))
                .target("s")
                .param("constraintId", add.id.to_string()),
            2,
        );
        let (removed, reverted) = roundtrip(state.clone(), &remove);
        assert_eq!(removed.sketches["s"]["constraints"], json!([]));
        assert_eq!(reverted, state);
    }

    #[test]
    fn test_settings_change_reverts_per_key() {
        let mut base = DocumentState::default();
        base.settings.insert("units".into(), json!("mm"));

        let a = action(
            ActionDraft::new(ActionKind::Document(DocumentAction::SettingsChange))
                .param("units", "in")
                .param("grid", true),
            3,
        );
        let (applied, reverted) = roundtrip(base.clone(), &a);
        assert_eq!(applied.settings["units"], "in");
        assert_eq!(applied.settings["grid"], true);
        assert_eq!(reverted, base);
    }

    #[test]
    fn test_duplicate_copies_source() {
        let mut base = DocumentState::default();
        base.sketches.insert("s".into(), json!({"id": "s", "color": "#f00"}));
        let a = action(
            ActionDraft::new(ActionKind::Sketch(SketchAction::Duplicate))
                .target("s2")
                .param("sourceId", "s"),
            4,
        );
        let (applied, reverted) = roundtrip(base.clone(), &a);
        assert_eq!(applied.sketches["s2"]["color"], "#f00");
        assert_eq!(applied.sketches["s2"]["id"], "s2");
        assert_eq!(reverted, base);
    }

    #[test]
    fn test_assembly_only_touches_metadata() {
        let a = action(ActionDraft::new(ActionKind::Assembly(AssemblyAction::Group)).target("g"), 9);
        let (applied, reverted) = roundtrip(DocumentState::default(), &a);
        assert_eq!(applied.metadata.last_modified, 9);
        assert!(applied.sketches.is_empty() && applied.objects.is_empty());
        assert_eq!(reverted, DocumentState::default());
    }

    #[test]
    fn test_appearance_delete_and_revert() {
        let mut base = DocumentState::default();
        base.materials.insert("m".into(), json!({"color": "red"}));
        let a = action(
            ActionDraft::new(ActionKind::Appearance(AppearanceAction::Delete)).target("m"),
            1,
        );
        let (applied, reverted) = roundtrip(base.clone(), &a);
        assert!(applied.materials.is_empty());
        assert_eq!(reverted, base);
    }
}
