//! Domain models

pub mod app;
pub mod backup;
pub mod deployment;
