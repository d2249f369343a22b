//! Background worker that drains the Optti job queue.
//!
//! Each claimed job names a media entity; the worker asks the backend to
//! describe the image and stores the generated alt text.

pub mod config;
pub mod media;
pub mod processor;

pub use config::{ConfigError, Settings};
pub use media::{MediaLibrary, SqliteMediaLibrary};
pub use processor::AltTextProcessor;
