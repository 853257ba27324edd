pub mod catalog;
pub mod descriptor;
pub mod error;
pub mod kafka;
pub mod memory;
pub mod mover;
pub mod reader;
pub mod registry;
pub mod row;
pub mod scheduler;
pub mod sink;

pub use descriptor::{Destination, EnvelopeFn, KeyColumn, PartitionKeyFn, SourceDescriptor};
pub use error::{MoverError, Result};
pub use kafka::KafkaPublisher;
pub use memory::{MemoryBatchReader, MemoryPublisher, MemoryTableSink};
pub use mover::{Mover, MoverPhase};
pub use reader::{BatchReader, PgBatchReader};
pub use registry::SourceRegistry;
pub use row::SourceRow;
pub use scheduler::{Scheduler, SchedulerState, SourceOutcome, TickReport};
pub use sink::{BusMessage, BusSink, PgReplicaSink, Publisher, SinkWriter};
