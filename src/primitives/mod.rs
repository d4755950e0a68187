//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, positioned I/O providers and the database locks.

/// Byte-level utilities and encoding/decoding.
///
/// Low-level utilities for working with raw bytes, buffers, and encoding operations.
pub mod bytes;

/// Concurrency primitives and synchronization.
///
/// Thread-safe data structures and coordination mechanisms for concurrent access.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;
