//! Integration test suite for the Braid admission pipeline.
//!
//! Exercises the processor, work unit cache, request queue, and validator
//! chain together, both against in-memory storage and a full node backed by
//! RocksDB, including concurrent and adversarial inputs.

pub mod helpers;
