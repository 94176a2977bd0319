//! Shared domain types for the cotflow pipeline.
//!
//! Everything here is plain data plus the two collaborator seams
//! (`ReasoningClient`, `SearchClient`). Persistence, scheduling and
//! recovery live in the `cotflow` crate.

pub mod collaborator;
pub mod payload;
pub mod phase;
pub mod session;
pub mod task;

pub use collaborator::{CollaboratorError, ReasoningClient, SearchClient};
pub use payload::{
    Citation, ExecuteResult, IntegrateResult, PayloadError, PlannedQuery, ReasoningRequest,
    ReasoningResponse, Recency, SearchOutcome, SearchRequest, SearchResponse, StepResult,
    TaskRequest, TaskResponse, ThinkResult, Usage,
};
pub use phase::{PhaseRecord, PhaseStatus};
pub use session::{Cursor, Session, SessionConfig, SessionStatus, Step};
pub use task::{NewTask, Task, TaskStatus, TaskSummary, TaskType};
