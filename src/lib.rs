#![forbid(unsafe_code)]

// Conclave library - signaling and session orchestration for multi-party video rooms

pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
