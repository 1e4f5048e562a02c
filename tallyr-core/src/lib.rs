mod error;
mod execution;
mod progress;
mod quota;
mod schedule;
mod telemetry;
mod verdict;

pub use error::{Error, QuotaScope, Result};
pub use execution::{
    Execution, ExecutionConfig, ExecutionRegistry, ExecutionStatus, RampPlan, RampStep, Target,
    TenantId,
};
pub use progress::{elapsed_display, format_progress, progress_percent};
pub use quota::{QuotaCollaborator, QuotaConfig, QuotaGuard};
pub use schedule::{
    AdmittingLauncher, ClaimRequest, Completion, DueScheduler, EntityKind, ExecutionLauncher,
    LaunchRequest, Lease, MemoryScheduleStore, NewSchedule, Recurrence, ScheduleId,
    ScheduleStatus, ScheduleStore, ScheduledEntity, SchedulerConfig, TickReport, Trigger,
};
pub use telemetry::{IngestReport, TelemetryService};
pub use verdict::{
    CompareOp, Criterion, CriterionMetric, Verdict, Violation, evaluate, parse_criterion,
};

pub use tallyr_metrics;
