//! SQLite-backed persistence for the vendo gateway session store.

mod error;
mod executor;
mod migrations;
mod models;
mod pool;
mod queries;
mod store;

pub use error::{DatabaseError, DatabaseResult};
pub use models::{FailureRecord, NewUser, RateRow, Sale, SourceKind, SourceRow, User};
pub use pool::{ReaderPool, ReaderPoolConfig};
pub use queries::normalize_mac;
pub use store::SessionStore;

pub use executor::Writer;
pub use migrations::CURRENT_VERSION;
