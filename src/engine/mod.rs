//! The review request workflow engine.

pub mod orchestrator;
pub mod request;

pub use orchestrator::{
    EngineDeps, IntakeOutcome, RegenerateOutcome, ReminderReport, ReviewEngine, ReviewView,
};
pub use request::{ErrorLogEntry, RequestStatus, ReviewRequest};
