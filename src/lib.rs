pub mod backend;
pub mod config;
pub mod deployment;
pub mod error;
pub mod model;
pub mod normalize;
pub mod server;
pub mod shutdown;
pub mod streaming;
pub mod validation;

pub use backend::{Backend, BackendDescriptor, CancelSignal, load_backend};
pub use config::AppConfig;
pub use deployment::DeploymentInstance;
pub use error::{BackendError, ServiceError};
pub use model::{GenerationRequest, GenerationResult, StreamEvent, TokenDelta};
pub use server::{AppState, build_router};
