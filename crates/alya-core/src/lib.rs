// alya-core - domain model for the alya job engine
//
// This crate contains the pure coordination vocabulary: batch/row entities,
// the error taxonomy, the processor capability traits, the processor
// registry, and the adapter seams (persistence, keystore, object store).
// No I/O lives here; the adapter crates implement the seams.

pub mod error;
pub mod processor;
pub mod registry;
pub mod store;
pub mod types;

pub use error::{
    ConfigurationError, RegistryError, StateError, SummarizeError, ERRCODE_CONFIG,
    ERRCODE_PROCESSING, MSGID_INITIALIZER_NOT_FOUND, MSGID_INIT_FAILED, MSGID_PROCESSING_ERROR,
    MSGID_PROCESSOR_NOT_FOUND, MSGID_WRONG_PROCESSOR_KIND,
};
pub use processor::{BatchProcessor, InitBlock, Initializer, SlowQueryProcessor};
pub use registry::{ProcessorRegistry, RegisteredProcessor};
pub use store::{
    BatchSummaryUpdate, Keystore, NewRow, ObjectStore, Persistence, PersistenceTx, RowResult,
};
pub use types::{
    Batch, BatchDetails, BatchOutput, BatchRow, BatchStatus, BatchSummary, BlobRows, ClaimedRow,
    DoneStatus, ErrorMessage, OutputFiles, RowStatus, SlowQueryOutput,
};
