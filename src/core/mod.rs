//! Core modules: storage plumbing shared by every subsystem.
//!
//! Connection handling, write serialization, the audit log, schemas,
//! configuration and the error type live here.

pub mod broker;
pub mod config;
pub mod db;
pub mod error;
pub mod output;
pub mod pool;
pub mod schemas;
pub mod store;
pub mod time;
