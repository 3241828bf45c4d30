//! Crypto server for savekit: answers encrypt/decrypt requests from save
//! workers over a Unix socket, one instance per user.

pub mod instance;
pub mod logging;
pub mod server;
