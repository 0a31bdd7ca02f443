use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Free-form property bag carried by entity/material/physics payloads.
pub type Properties = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityCreate {
    pub entity_id: String,
    pub entity_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub properties: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityUpdate {
    pub entity_id: String,
    pub changes: Properties,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDelete {
    pub entity_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvatarMove {
    pub avatar_id: String,
    pub position: Vec3,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<Quat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialChange {
    pub material_id: String,
    #[serde(default)]
    pub properties: Properties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnimationAction {
    Play,
    Pause,
    Stop,
    Seek,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimationControl {
    pub entity_id: String,
    pub animation: String,
    pub action: AnimationAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicsUpdate {
    pub entity_id: String,
    pub properties: Properties,
}

/// Closed set of operation kinds. The tag selects the payload schema; the
/// sync core never looks inside the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationKind {
    EntityCreate(EntityCreate),
    EntityUpdate(EntityUpdate),
    EntityDelete(EntityDelete),
    AvatarMove(AvatarMove),
    MaterialCreate(MaterialChange),
    MaterialUpdate(MaterialChange),
    AnimationControl(AnimationControl),
    PhysicsUpdate(PhysicsUpdate),
}

impl OperationKind {
    /// Wire tag of this kind, e.g. `entity_create`.
    pub fn tag(&self) -> &'static str {
        match self {
            OperationKind::EntityCreate(_) => "entity_create",
            OperationKind::EntityUpdate(_) => "entity_update",
            OperationKind::EntityDelete(_) => "entity_delete",
            OperationKind::AvatarMove(_) => "avatar_move",
            OperationKind::MaterialCreate(_) => "material_create",
            OperationKind::MaterialUpdate(_) => "material_update",
            OperationKind::AnimationControl(_) => "animation_control",
            OperationKind::PhysicsUpdate(_) => "physics_update",
        }
    }
}

/// Producer input: everything except the sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewOperation {
    pub client_id: String,
    #[serde(flatten)]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewOperation {
    pub fn new(client_id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            client_id: client_id.into(),
            kind,
            timestamp: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub session_id: String,
    pub client_id: String,
    /// Informational only; ordering is by `seq_num`.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(session_id: impl Into<String>, op: NewOperation) -> Self {
        Self {
            session_id: session_id.into(),
            client_id: op.client_id,
            timestamp: op.timestamp.unwrap_or_else(Utc::now),
            kind: op.kind,
        }
    }
}

/// An operation together with the sequence number the sequencer assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedOperation {
    pub seq_num: u64,
    pub operation: Operation,
}

impl SequencedOperation {
    pub fn session_id(&self) -> &str {
        &self.operation.session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_wire_shape_is_type_plus_data() {
        let op = Operation::new(
            "lobby",
            NewOperation::new(
                "rest-api",
                OperationKind::EntityDelete(EntityDelete {
                    entity_id: "crate-7".into(),
                }),
            ),
        );
        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["type"], "entity_delete");
        assert_eq!(value["data"]["entity_id"], "crate-7");
        assert_eq!(value["client_id"], "rest-api");
        assert_eq!(value["session_id"], "lobby");
    }

    #[test]
    fn new_operation_parses_producer_body() {
        let body = json!({
            "client_id": "avatar-svc",
            "type": "avatar_move",
            "data": { "avatar_id": "a1", "position": { "x": 1.0, "y": 0.0, "z": -2.5 } }
        });
        let op: NewOperation = serde_json::from_value(body).unwrap();
        assert_eq!(op.kind.tag(), "avatar_move");
        assert!(op.timestamp.is_none());
        match op.kind {
            OperationKind::AvatarMove(mv) => assert_eq!(mv.position, Vec3::new(1.0, 0.0, -2.5)),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        let body = json!({ "client_id": "x", "type": "teleport", "data": {} });
        assert!(serde_json::from_value::<NewOperation>(body).is_err());
    }
}
