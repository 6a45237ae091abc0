//! chunkftp
//!
//! Single-threaded, non-blocking chunked file transfer over TCP: a text
//! command channel and a binary chunk stream sharing one connection.

pub mod buffer;
pub mod cli;
pub mod client;
pub mod commands;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod journal;
pub mod progress;
pub mod protocol;
pub mod protocol_core;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod transfer;
