pub mod documents;
pub mod index;
pub mod metadata;
pub mod snapshot;

pub use documents::DocumentsStep;
pub use index::IndexStep;
pub use metadata::MetadataStep;
pub use snapshot::SnapshotStep;
