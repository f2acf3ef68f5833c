//! Backup and restore

pub mod engine;
pub mod manifest;

pub use engine::BackupEngine;
