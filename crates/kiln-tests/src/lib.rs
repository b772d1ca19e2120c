//! Kiln Integration Tests
//!
//! Drives the worker controller end to end against an in-memory coordinator
//! and a scripted render engine. Nothing here needs a network or Blender.
//! Run with: `cargo test -p kiln-tests`

pub mod common;
