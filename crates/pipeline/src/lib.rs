pub mod frontmatter;
pub mod gate;
pub mod generate;

pub use gate::{GateDecision, RejectReason, evaluate, evaluate_payload};
pub use generate::{GenerationError, Instance, PipelineSpec, Step, generate};
