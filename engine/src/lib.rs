//! Deckhand Library
//!
//! Core modules for the deckhand single-node deployment engine.

pub mod app;
pub mod archive;
pub mod backup;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod health;
pub mod logs;
pub mod models;
pub mod process;
pub mod proxy;
pub mod routes;
pub mod runtime;
pub mod server;
pub mod storage;
pub mod utils;
pub mod workers;
