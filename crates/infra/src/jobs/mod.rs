//! Asynchronous job orchestration.
//!
//! ## Components
//!
//! - `JobSpec`: what one kind of job does (validate, prepare, execute, persist)
//! - `JobHandler`: drives any `JobSpec` through the task lifecycle
//!   `created → active → completed | failed`
//! - `JobRegistry`: kind → handler lookup, built once at startup
//! - `kinds`: the concrete job kinds
//!
//! Every lifecycle change is written to the task store first and then
//! broadcast to the job's room; the broadcast is best-effort.

pub mod handler;
pub mod kinds;
pub mod notify;
pub mod registry;
pub mod spec;

pub use handler::{JobHandler, JobServices, RegisteredJob};
pub use kinds::{JobDependencies, standard_registry};
pub use notify::Notifier;
pub use registry::{JobRegistry, JobRegistryBuilder};
pub use spec::{JobContext, JobOwner, JobSpec};
