//! Shared library for savekit.
//! Includes the job model, config parsing, the crypto core, the save
//! strategies, the job manager, and the crypto IPC message types.

pub mod config;
pub mod crypto;
pub mod gates;
pub mod ipc;
pub mod live_state;
pub mod manager;
pub mod paths;
pub mod process;
pub mod save;
pub mod selection;
pub mod service;
pub mod types;
