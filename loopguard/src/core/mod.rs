//! Deterministic, pure logic for the verification and recovery loop.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests. The only
//! exception is [`expr`], which reads the tree through the [`expr::Inspector`]
//! trait supplied by the caller.

pub mod budget;
pub mod classifier;
pub mod contract;
pub mod criteria;
pub mod expr;
pub mod lessons;
pub mod lifecycle;
pub mod recovery;
pub mod types;
