pub mod error;
pub mod lock;
pub mod memory;
pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "test-utils")]
pub mod testutil;

pub use error::{CursorError, Result};
pub use lock::LeaderLock;
pub use memory::MemoryCursorStore;
pub use store::{CursorStore, PgCursorStore};
pub use types::{key_map, Cursor};
