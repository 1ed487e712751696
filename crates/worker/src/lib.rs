//! Job worker process: wires configuration to the job core.

pub mod app;
