//! Persistent storage layer for replicated documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   write-through  ┌──────────────┐
//! │ DocumentHub │ ───────────────► │ DocumentStore│
//! │ (in-memory) │                  │ (RocksDB)    │
//! └──────┬──────┘                  └──────┬───────┘
//!        │                                │
//!        │ on join / recover              │ column families
//!        ▼                                ▼
//! ┌─────────────┐     ┌──────────────────────────────────┐
//! │ JSON doc +  │     │ CF "rooms":    room documents    │
//! │ version     │     │ CF "players":  player documents  │
//! └─────────────┘     │ CF "metadata": version, sizes    │
//!                     └──────────────────────────────────┘
//! ```
//!
//! A publish is only committed after its document reached the store.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError, StoredDocument};
