//! History actions: a two-level `type` / `subtype` variant.
//!
//! On the wire both levels are flat strings. In memory they form the closed
//! [`ActionKind`] sum type, so a `sketch/extrude` pair cannot exist past
//! deserialization.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::HistoryError;
use crate::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Sketch,
    #[serde(rename = "3d")]
    ThreeD,
    Assembly,
    Appearance,
    Annotation,
    Document,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Sketch => "sketch",
            ActionType::ThreeD => "3d",
            ActionType::Assembly => "assembly",
            ActionType::Appearance => "appearance",
            ActionType::Annotation => "annotation",
            ActionType::Document => "document",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionSubtype {
    // Common
    Create,
    Modify,
    Delete,
    Move,
    Duplicate,
    // Sketch
    DrawLine,
    DrawRectangle,
    DrawCircle,
    AddConstraint,
    RemoveConstraint,
    // 3D
    Extrude,
    Revolve,
    Loft,
    Sweep,
    BooleanUnion,
    BooleanSubtract,
    BooleanIntersect,
    // Assembly
    Group,
    Ungroup,
    AddComponent,
    RemoveComponent,
    // Appearance
    ApplyMaterial,
    ChangeColor,
    SetVisibility,
    SetTransparency,
    // Document
    Import,
    Export,
    SettingsChange,
}

impl ActionSubtype {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionSubtype::Create => "create",
            ActionSubtype::Modify => "modify",
            ActionSubtype::Delete => "delete",
            ActionSubtype::Move => "move",
            ActionSubtype::Duplicate => "duplicate",
            ActionSubtype::DrawLine => "draw_line",
            ActionSubtype::DrawRectangle => "draw_rectangle",
            ActionSubtype::DrawCircle => "draw_circle",
            ActionSubtype::AddConstraint => "add_constraint",
            ActionSubtype::RemoveConstraint => "remove_constraint",
            ActionSubtype::Extrude => "extrude",
            ActionSubtype::Revolve => "revolve",
            ActionSubtype::Loft => "loft",
            ActionSubtype::Sweep => "sweep",
            ActionSubtype::BooleanUnion => "boolean_union",
            ActionSubtype::BooleanSubtract => "boolean_subtract",
            ActionSubtype::BooleanIntersect => "boolean_intersect",
            ActionSubtype::Group => "group",
            ActionSubtype::Ungroup => "ungroup",
            ActionSubtype::AddComponent => "add_component",
            ActionSubtype::RemoveComponent => "remove_component",
            ActionSubtype::ApplyMaterial => "apply_material",
            ActionSubtype::ChangeColor => "change_color",
            ActionSubtype::SetVisibility => "set_visibility",
            ActionSubtype::SetTransparency => "set_transparency",
            ActionSubtype::Import => "import",
            ActionSubtype::Export => "export",
            ActionSubtype::SettingsChange => "settings_change",
        }
    }
}

impl fmt::Display for ActionSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type subtype enum, convertible to and from the flat [`ActionSubtype`].
macro_rules! subtype_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn from_subtype(subtype: ActionSubtype) -> Option<Self> {
                match subtype {
                    $(ActionSubtype::$variant => Some($name::$variant),)+
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }

            pub fn subtype(self) -> ActionSubtype {
                match self {
                    $($name::$variant => ActionSubtype::$variant),+
                }
            }
        }
    };
}

subtype_enum!(
    /// Subtypes accepted for `sketch` actions.
    SketchAction {
        Create, Modify, Delete, Move, Duplicate,
        DrawLine, DrawRectangle, DrawCircle, AddConstraint, RemoveConstraint,
    }
);

subtype_enum!(
    /// Subtypes accepted for `3d` actions.
    SolidAction {
        Create, Modify, Delete, Move, Duplicate,
        Extrude, Revolve, Loft, Sweep, BooleanUnion, BooleanSubtract, BooleanIntersect,
    }
);

subtype_enum!(
    AssemblyAction {
        Create, Modify, Delete, Move, Duplicate,
        Group, Ungroup, AddComponent, RemoveComponent,
    }
);

subtype_enum!(
    AppearanceAction {
        Create, Modify, Delete,
        ApplyMaterial, ChangeColor, SetVisibility, SetTransparency,
    }
);

subtype_enum!(
    AnnotationAction {
        Create, Modify, Delete, Move, Duplicate,
    }
);

subtype_enum!(
    DocumentAction {
        Import, Export, SettingsChange,
    }
);

/// Closed `type` × `subtype` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Sketch(SketchAction),
    ThreeD(SolidAction),
    Assembly(AssemblyAction),
    Appearance(AppearanceAction),
    Annotation(AnnotationAction),
    Document(DocumentAction),
}

impl ActionKind {
    pub fn new(action_type: ActionType, subtype: ActionSubtype) -> Result<Self, HistoryError> {
        let kind = match action_type {
            ActionType::Sketch => SketchAction::from_subtype(subtype).map(Self::Sketch),
            ActionType::ThreeD => SolidAction::from_subtype(subtype).map(Self::ThreeD),
            ActionType::Assembly => AssemblyAction::from_subtype(subtype).map(Self::Assembly),
            ActionType::Appearance => AppearanceAction::from_subtype(subtype).map(Self::Appearance),
            ActionType::Annotation => AnnotationAction::from_subtype(subtype).map(Self::Annotation),
            ActionType::Document => DocumentAction::from_subtype(subtype).map(Self::Document),
        };
        kind.ok_or_else(|| HistoryError::InvalidAction {
            action_type: action_type.to_string(),
            subtype: subtype.to_string(),
        })
    }

    pub fn action_type(self) -> ActionType {
        match self {
            Self::Sketch(_) => ActionType::Sketch,
            Self::ThreeD(_) => ActionType::ThreeD,
            Self::Assembly(_) => ActionType::Assembly,
            Self::Appearance(_) => ActionType::Appearance,
            Self::Annotation(_) => ActionType::Annotation,
            Self::Document(_) => ActionType::Document,
        }
    }

    pub fn subtype(self) -> ActionSubtype {
        match self {
            Self::Sketch(s) => s.subtype(),
            Self::ThreeD(s) => s.subtype(),
            Self::Assembly(s) => s.subtype(),
            Self::Appearance(s) => s.subtype(),
            Self::Annotation(s) => s.subtype(),
            Self::Document(s) => s.subtype(),
        }
    }
}

/// A recorded user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawHistoryAction", into = "RawHistoryAction")]
pub struct HistoryAction {
    pub id: Uuid,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub user_id: UserId,
    pub kind: ActionKind,
    pub target_id: Option<String>,
    pub parent_action_id: Option<Uuid>,
    pub parameters: Map<String, Value>,
    pub metadata: Option<Map<String, Value>>,
}

impl HistoryAction {
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.parameters.get(key)
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHistoryAction {
    id: Uuid,
    timestamp: i64,
    user_id: UserId,
    #[serde(rename = "type")]
    action_type: ActionType,
    subtype: ActionSubtype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parent_action_id: Option<Uuid>,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Map<String, Value>>,
}

impl TryFrom<RawHistoryAction> for HistoryAction {
    type Error = HistoryError;

    fn try_from(raw: RawHistoryAction) -> Result<Self, Self::Error> {
        Ok(Self {
            id: raw.id,
            timestamp: raw.timestamp,
            user_id: raw.user_id,
            kind: ActionKind::new(raw.action_type, raw.subtype)?,
            target_id: raw.target_id,
            parent_action_id: raw.parent_action_id,
            parameters: raw.parameters,
            metadata: raw.metadata,
        })
    }
}

impl From<HistoryAction> for RawHistoryAction {
    fn from(action: HistoryAction) -> Self {
        Self {
            id: action.id,
            timestamp: action.timestamp,
            user_id: action.user_id,
            action_type: action.kind.action_type(),
            subtype: action.kind.subtype(),
            target_id: action.target_id,
            parent_action_id: action.parent_action_id,
            parameters: action.parameters,
            metadata: action.metadata,
        }
    }
}

/// Caller-supplied part of an action; the engine stamps id, time and user.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDraft {
    pub kind: ActionKind,
    pub target_id: Option<String>,
    pub parent_action_id: Option<Uuid>,
    pub parameters: Map<String, Value>,
    pub metadata: Option<Map<String, Value>>,
}

impl ActionDraft {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target_id: None,
            parent_action_id: None,
            parameters: Map::new(),
            metadata: None,
        }
    }

    pub fn target(mut self, id: impl Into<String>) -> Self {
        self.target_id = Some(id.into());
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn parent(mut self, action_id: Uuid) -> Self {
        self.parent_action_id = Some(action_id);
        self
    }

    pub fn into_action(self, id: Uuid, timestamp: i64, user_id: UserId) -> HistoryAction {
        HistoryAction {
            id,
            timestamp,
            user_id,
            kind: self.kind,
            target_id: self.target_id,
            parent_action_id: self.parent_action_id,
            parameters: self.parameters,
            metadata: self.metadata,
        }
    }
}
