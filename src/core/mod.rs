//! Core domain models for deployment pipelines
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, images, build files and their configuration.

pub mod buildfile;
pub mod config;
pub mod context;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod state;
pub mod step;

pub use context::*;
pub use error::*;
pub use image::*;
pub use pipeline::*;
pub use state::*;
pub use step::*;
