//! Batch pipeline: settings, prompt translation, the single-item generator
//! and the sequential batch runner.

pub mod batch;
pub mod context;
pub mod error;
pub mod events;
pub mod generator;
pub mod settings;
pub mod translate;
