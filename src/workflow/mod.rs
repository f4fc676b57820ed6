//! Contact review workflow: pick a contact, generate suggestions from the
//! meeting, review them and push the chosen ones to the CRM.

pub mod actor;
pub mod session;

pub use actor::{spawn_session, RegistryError, SessionContext, SessionHandle, SessionRegistry, SessionServices};
pub use session::{
    Job, JobResult, SessionCommand, SessionError, SessionEvent, SessionSnapshot, Transition,
    WorkflowSession, WorkflowStep, MIN_QUERY_CHARS,
};
