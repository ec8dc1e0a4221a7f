pub mod config;
pub mod convert;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod lock;
pub mod monitor;
pub mod policy;
pub mod process;
pub mod queue;
pub mod recovery;
pub mod sidecar;
pub mod stats;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::SchedulerConfig;
pub use coordinator::{Collaborators, Control, Coordinator, RunOutcome};
pub use error::{ConfigError, ExecutorError, LockError, MonitorError};
pub use executor::{JobExecutor, JobSlot, SlotStatus};
pub use lock::{Acquire, LockHandle, LockManager, LockRecord};
pub use monitor::{ResourceMonitor, ResourceSample};
pub use policy::{decide, ScalingPolicy};
pub use queue::{ConversionCandidate, ConversionOracle, QueueBuilder, QueueOrder};
pub use stats::StatsSnapshot;
