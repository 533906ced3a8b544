mod types;

pub use types::{GenerationParams, GenerationRequest, GenerationResult, StreamEvent, TokenDelta};
