pub mod operations;

pub use operations::{
    AnimationAction, AnimationControl, AvatarMove, EntityCreate, EntityDelete, EntityUpdate,
    MaterialChange, NewOperation, Operation, OperationKind, PhysicsUpdate, Properties, Quat,
    SequencedOperation, Vec3,
};
