use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WorkerClassArg {
    /// Everything in one process: scheduler plus all worker classes.
    All,
    /// Enqueue-only cadence loops.
    Scheduler,
    /// ICMP reachability batches.
    Monitoring,
    /// SNMP polling and interface discovery batches.
    Snmp,
    /// Alert rule evaluation.
    Alerts,
    /// Retention, vacuum and health duties.
    Maintenance,
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum Command {
    /// Verifies that the environment configuration can be loaded without errors
    ConfigTest,
    /// Applies pending database migrations and exits
    Migrate,
    /// Do the thing!
    Run {
        /// Which worker class this process serves
        #[arg(long, value_enum, default_value = "all")]
        class: WorkerClassArg,
    },
}

#[derive(Debug, Parser)]
#[command(version, about, infer_subcommands = true, propagate_version = true)]
pub struct Opts {
    #[command(subcommand)]
    pub command: Command,
}
