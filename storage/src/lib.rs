mod catalog;
mod credentials;
mod error;
mod gcs;
mod local;
mod store;

pub use catalog::{CatalogEntry, Origin, combined_listing};
pub use credentials::Credentials;
pub use error::{StorageError, StorageResult};
pub use gcs::{DEFAULT_ENDPOINT as GCS_DEFAULT_ENDPOINT, GcsStore};
pub use local::LocalStore;
pub use store::{ObjectMeta, ObjectStore};
