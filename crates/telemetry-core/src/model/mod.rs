//! The persisted data model (spec.md §3).
//!
//! Every type here is a plain data record: construction/derivation lives in
//! `collector`/`orchestrator`, persistence lives in `store`. All derive
//! `Debug, Clone, Serialize, Deserialize` to match the teacher's
//! `storage::model::*` convention, even though the `rusqlite`-backed store
//! maps fields to columns by hand (spec.md §1 puts the storage schema's
//! physical representation out of scope, so the derive exists for callers
//! outside this crate that need to serialize a sample, not for the store
//! itself).

mod dmv;
mod http;
mod marker;
mod process;
mod run;
mod runtime;
mod system;

pub use dmv::DmvSample;
pub use http::HttpSample;
pub use marker::{Marker, MarkerKind, MarkerLevel};
pub use process::ProcessSample;
pub use run::{Run, WorkloadDescriptor};
pub use runtime::{ManagedRuntimeSample, RuntimeKind};
pub use system::SystemSample;
