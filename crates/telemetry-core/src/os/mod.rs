//! Abstractions over the five external OS/runtime/database surfaces the
//! capture engine consults (spec.md §6.1), following the teacher's
//! `FileSystem`/`RealFs`/`MockFs` seam: every real implementation is
//! `#[cfg(windows)]`; a mock implementation is always compiled so the
//! collector logic is testable on any host.

pub mod counters;
pub mod diagnostic_channel;
pub mod host_info;
pub mod process_facility;
pub mod relational;

pub use counters::{CounterCatalog, CounterError, CounterHandle, MockCounterCatalog};
pub use diagnostic_channel::{
    DiagnosticChannel, DiagnosticEvent, DiagnosticSession, MockDiagnosticChannel, PayloadValue, Provider, RuntimeSessionError,
};
pub use host_info::{HostInfoSource, MemoryStatus, MockHostInfoSource, SystemDriveStatus};
pub use process_facility::{ExitWatcher, MockProcessFacility, ProcessError, ProcessFacility, ProcessHandle, StartWatcher};
pub use relational::{Column, DmvError, MockRelationalConnector, RelationalConnection, RelationalConnector, Row};

#[cfg(windows)]
pub use counters::RealCounterCatalog;
#[cfg(windows)]
pub use diagnostic_channel::RealDiagnosticChannel;
#[cfg(windows)]
pub use host_info::RealHostInfoSource;
#[cfg(windows)]
pub use process_facility::RealProcessFacility;
#[cfg(windows)]
pub use relational::TiberiusConnector;
