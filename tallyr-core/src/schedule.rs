mod launcher;
mod recurrence;
mod store;
mod task;
mod types;

pub use launcher::{AdmittingLauncher, ExecutionLauncher, LaunchRequest};
pub use recurrence::Recurrence;
pub use store::{ClaimRequest, Completion, MemoryScheduleStore, ScheduleStore};
pub use task::{DueScheduler, SchedulerConfig, TickReport};
pub use types::{
    EntityKind, Lease, NewSchedule, ScheduleId, ScheduleStatus, ScheduledEntity, Trigger,
};
