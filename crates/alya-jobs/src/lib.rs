// alya-jobs - the coordination core of the alya job engine
//
// A cluster of workers cooperatively claims queued rows from the shared
// database, runs user processors over them, summarizes finished batches
// into object-store output files, and recovers rows abandoned by crashed
// peers. This crate hosts the supervisor loop, the row dispatcher, the
// batch summarizer, the liveness protocol, and the client-side helpers.
//
// The database is authoritative everywhere; the keystore carries caches
// and liveness state only.

mod dispatch;
mod liveness;
mod manager;
mod summarize;

pub mod client;

pub use alya_core::store::NewRow;
pub use client::{AbortResult, BatchDoneResult, Client, SlowQueryDoneResult};
pub use manager::JobManager;
