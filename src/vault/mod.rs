pub mod catalog;
pub mod entry;
pub mod manager;
pub mod metadata;
pub mod mover;
pub mod wipe;

pub use catalog::{IntegrityReport, VaultCatalog};
pub use entry::{EntryState, EntrySummary, VaultEntry};
pub use manager::{UnhideMode, VaultManager};
pub use metadata::{FolderMetadata, NodeMeta, TreeManifest, VaultMetadata};
