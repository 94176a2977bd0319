pub mod clock;
pub mod collaborators;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod logging;
pub mod machine;
pub mod orchestrator;
pub mod plan;
pub mod queue;
pub mod recovery;
pub mod scheduler;
pub mod store;

pub use orchestrator::{Orchestrator, SessionView};
