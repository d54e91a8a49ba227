//! Resource pool management and build scheduling for Kiln.

pub mod config;
pub mod pool;
pub mod priority;
pub mod queue;
pub mod scheduler;

pub use config::{PoolConfig, SchedulerConfig};
pub use pool::ResourcePool;
pub use priority::{PriorityAssessment, PriorityPolicy};
pub use queue::{BuildQueue, QueuedBuild};
pub use scheduler::{Scheduler, SchedulerStats};
