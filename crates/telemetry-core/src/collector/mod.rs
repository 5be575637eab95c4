//! The five cooperating capture components (spec.md §2, C1-C5). Each is
//! constructed against the `os` traits so it can run against either the
//! real Windows collaborators or the mocks in tests.

pub mod counter_reader;
pub mod dmv_sampler;
pub mod http_reconstructor;
pub mod process_tracker;
pub mod runtime_session;

pub use counter_reader::{CounterReader, SystemSnapshot};
pub use dmv_sampler::DmvSampler;
pub use http_reconstructor::HttpReconstructor;
pub use process_tracker::{ArrivalListener, ProcessLifecycleTracker};
pub use runtime_session::{ClassicRuntimeSampler, ManagedRuntimeSessionHost};
