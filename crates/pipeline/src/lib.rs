//! Execution engine for job groups.
//!
//! [`JobGroupManager`] fans a request out into one child job per backend,
//! runs each child on its own task through [`ChildJobExecutor`], folds the
//! children's outcomes into a group status, and republishes everything on
//! the group's [`renderfarm_events::EventBroadcaster`] channel.

pub mod config;
pub mod executor;
pub mod group;
pub mod manager;

pub use config::SchedulerConfig;
pub use executor::{ChildJobExecutor, ChildTask, ExecutionCancelled};
pub use manager::JobGroupManager;
