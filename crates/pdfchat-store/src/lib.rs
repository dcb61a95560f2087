//! Persistence for users, documents, chat history and uploaded files.

pub mod fetch;
pub mod metadata;
pub mod object;
pub mod postgres;

pub use fetch::{http_fetch_bytes, FetchPolicy};
pub use metadata::{MemoryMetadataStore, MetadataStore};
pub use object::{FsObjectStore, MemoryObjectStore, ObjectStore, StoredObject};
pub use postgres::PgMetadataStore;
