//! Rollcall engine: environment configuration, the model thread and the
//! async attendance service used by front ends.

pub mod config;
pub mod engine;
pub mod service;

pub use config::Config;
pub use engine::{decode_image, spawn_engine, EngineError, EngineHandle};
pub use service::{AttendanceService, EvaluationSample, MarkOutcome, DEFAULT_SOURCE};
