use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "line-monitor",
    version,
    about = "Production line episode aggregation and notification workers"
)]
pub struct Args {
    /// Run one aggregation sweep and exit.
    #[arg(long, default_value_t = false)]
    pub once: bool,
    /// Rebuild episodes for a single production job and exit.
    #[arg(long, value_name = "JOB_ID", conflicts_with = "once")]
    pub recalculate: Option<i64>,
    /// Put a dead-lettered aggregation job back on its queue and exit.
    #[arg(long, value_name = "JOB_UUID", conflicts_with_all = ["once", "recalculate"])]
    pub retry_dead_letter: Option<String>,
}
