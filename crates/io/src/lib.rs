// Source extraction, staging, destination writes and export

pub mod audit;
pub mod error;
pub mod export;
pub mod extract;
pub mod lookup;
pub mod mapping;
pub mod mutate;
pub mod partition;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod source;
pub mod staging;

pub use audit::AuditRecord;
pub use error::{ErrorKind, Result, SyncError};
pub use export::{ArtifactName, ExportFormat, ExportOutcome, Exporter};
pub use extract::{spawn_producer, Batch, BatchReceiver, Extractor};
pub use lookup::fetch_snapshot;
pub use mapping::{LineMapper, MappedBatch};
pub use mutate::{MutationReport, Mutator};
pub use partition::{PartitionResolver, PartitionTable};
pub use pool::{DestinationPool, PooledConn};
pub use retry::with_retry;
pub use source::{BatchSource, Cell, ResultBatch, SqliteSource};
pub use staging::StagingArea;
