use crate::cli::OutputFormat;
use crate::replay::ReplayReport;
use crate::schedule::ScheduleReport;

mod human;
mod json;

pub(crate) trait OutputFormatter: Send + Sync {
    fn print_replay(&self, report: &ReplayReport) -> anyhow::Result<()>;
    fn print_schedules(&self, report: &ScheduleReport) -> anyhow::Result<()>;
}

pub(crate) fn formatter(format: OutputFormat) -> Box<dyn OutputFormatter> {
    match format {
        OutputFormat::HumanReadable => Box::new(human::HumanReadableOutput),
        OutputFormat::Json => Box::new(json::JsonOutput),
    }
}
