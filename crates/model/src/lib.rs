pub mod block;
pub mod config;
pub mod model;

pub use block::{Architecture, TaskKind};
pub use config::ModelConfig;
pub use model::Model;
