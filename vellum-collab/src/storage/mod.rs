//! Persistent storage for notes, blocks, and per-block edit history.

pub mod rocks;

pub use rocks::{NoteStore, StoreConfig, StoreError};
