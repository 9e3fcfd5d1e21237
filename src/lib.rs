//! Out-of-process RPC bridge for a single-threaded embedded simulation engine.
//!
//! Clients call named endpoints over TCP; the server funnels every engine
//! call onto the one thread that owns the engine, and streams project files
//! through the same channel.

pub mod adapters;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod rpc;
