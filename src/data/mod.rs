//! Record persistence: durable output documents, file naming and the result store.

pub mod durable_record;
pub mod file_namer;
pub mod result_store;

pub use durable_record::{with_suffix, DurableRecord, Finalized, TEMP_SUFFIX};
pub use file_namer::{make_filename_compliant, FileNamer};
pub use result_store::{fingerprint, ResultStore, StoreEvent, StoredMeasurement};
