pub mod associator;
pub mod error;
pub mod events;
pub mod memory;
pub mod nearest;
pub mod notifier;
pub mod store;
pub mod types;

pub use associator::{Associator, MAX_WINDOW_MS, MIN_WINDOW_MS};
pub use error::{AssociatorError, Result};
pub use events::{ImageCreated, WeightAssociated};
pub use memory::{MemoryAssociationStore, MemoryCandidateStore, MemoryProbeStore};
pub use nearest::nearest;
pub use notifier::{handle_image_created, BusNotifier, PairingNotifier};
pub use store::{AssociationStore, CandidateStore, PgSensorStore, ProbeStore};
pub use types::*;
