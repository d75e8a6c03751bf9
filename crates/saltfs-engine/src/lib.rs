//! saltfs-engine: the client-side encrypted file-system engine.
//!
//! The engine keeps a per-user tree of folder and file manifests, encrypted
//! client-side and stored as versioned vlobs on an untrusted server. It is
//! built from:
//!
//!   - a lazily-hydrated in-memory manifest cache ([`tree::LocalTree`]),
//!   - a buffered-write layer per open file ([`file::OpenedFile`]),
//!   - clean/dirty persistent stores (`saltfs-store`),
//!   - a recursive synchronizer with three-way merge ([`merge`], [`sync`]).
//!
//! The remote side is an injected [`Transport`] capability; the engine never
//! talks to a concrete wire protocol. [`MemoryTransport`] provides a
//! version-enforcing in-memory server for tests and offline use.
//!
//! Concurrency model: one engine instance is a single cooperative task.
//! Public operations are `async fn`s that suspend only on store and
//! transport I/O; between suspension points manifest state is private.

pub mod engine;
pub mod event;
pub mod file;
pub mod memory;
pub mod merge;
pub mod path;
pub mod sync;
pub mod transport;
pub mod tree;

mod manager;

pub use engine::{EntryStat, FsEngine};
pub use event::EngineEvent;
pub use file::{OpenedFile, Payload};
pub use memory::MemoryTransport;
pub use path::FsPath;
pub use transport::Transport;
