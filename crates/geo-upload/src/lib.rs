pub mod artifact;
pub mod artifact_store;
pub mod clock;
pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod signals;
pub mod uploader;
pub mod workspace;

pub use error::{Error, Result};
