//! Storage seams — the key-value store carrying workflow state, locks,
//! and counters, and the object store carrying workspace archives.
//!
//! Networked backends (Redis, S3) live behind the same traits; the
//! in-process backends here are the single-host defaults and the test
//! doubles.

pub mod kv;
pub mod object;

pub use kv::{KvStore, MemoryKv};
pub use object::{FsObjectStore, MemoryObjectStore, ObjectStore};
