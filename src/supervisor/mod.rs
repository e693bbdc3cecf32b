//! Supervisor process RPC: request/response calls and notification streams.

pub mod client;
pub mod codec;

pub use client::{HttpSupervisor, SupervisorApi, SupervisorStream};
