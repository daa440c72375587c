//! AgentFleet storage.
//!
//! The [`Store`] trait is the CRUD surface every backend provides. Backends
//! that can coordinate several controllers additionally expose
//! [`CoordinationCapable`] through [`Store::coordination`].
//!
//! Backends:
//! - [`FileStore`]: one JSON document per record under a data directory
//! - [`MemoryStore`]: process-local maps, nothing survives a restart

pub mod coordination;
pub mod error;
pub mod file;
pub mod memory;
pub mod store;

pub use coordination::{CoordinationCapable, LocalCoordinator, WatchEvent, WatchEventKind, WatchStream};
pub use error::{EntityKind, StoreError, StoreResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::Store;
