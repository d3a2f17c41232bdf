// Snapshot backends and process settings for the confession bot.

pub mod in_memory;
pub mod json_snapshot_store;
pub mod settings;

pub use in_memory::InMemorySnapshotBackend;
pub use json_snapshot_store::JsonSnapshotFile;
pub use settings::Settings;
