//! Coordination core for a multi-agent orchestration system.
//!
//! A coordinator process spawns and drives worker agents, communicating with
//! them exclusively through an external mailbox service. This crate owns the
//! wire protocol, the durable session registry, the room-history reconciler
//! used on resume, and the tool surface a coordinator agent calls through.
//! The mailbox service itself, the worker's own agent loop, and process
//! spawn mechanics are outside this crate — see [`mailbox::MailboxClient`]
//! and [`launcher::AgentLauncher`] for those boundaries.

pub mod config;
pub mod context;
pub mod error;
pub mod launcher;
pub mod mailbox;
pub mod protocol;
pub mod session;
pub mod tools;

pub use error::{CoordinationError, Result};
