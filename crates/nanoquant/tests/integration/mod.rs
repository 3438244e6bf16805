//! Integration tests for multi-level generation.
//!
//! These tests drive the dispatcher, generator and pipeline end to end on
//! small synthetic models, writing artifacts into temporary directories.

mod common;
mod dispatch;
mod generator;
mod pipeline;
