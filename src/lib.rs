//! poolgate — on-demand S3 backend supervisor.
//!
//! A request for a pool goes through the [`gate::AccessGate`], which checks
//! the pool's eligibility and asks the [`supervisor::Supervisor`] for a
//! running backend. Supervisors on any number of hosts coordinate only
//! through the shared [`registry`].

pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod logger;
pub mod registry;
pub mod supervisor;
