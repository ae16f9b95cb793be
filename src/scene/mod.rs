//! Scene state: the model registry, the pending-edit handoff and the
//! animation drivers that produce edits.

mod animation;
mod edits;
mod registry;
mod worker;

pub use animation::{circle_transforms, wave_deform, Animator};
pub use edits::{SceneEditQueue, SceneUpdate, VertexUpdate};
pub use registry::{DirtySet, Instance, InstanceId, ModelId, ModelRegistry};
pub use worker::{AnimationWorker, WorkerCommand, WorkerResult};
