use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmds;

#[derive(Debug, Parser)]
#[command(name = "sperf", about = "CPU profiler built on perf_event_open")]
struct Command {
    #[clap(subcommand)]
    subcmd: SubCommand,
}

#[derive(Debug, Subcommand)]
enum SubCommand {
    /// Gather performance counter statistics of running processes or a
    /// command.
    #[clap(name = "stat")]
    Stat(StatOpts),
    /// Sample events into memory and report what was collected.
    #[clap(name = "record")]
    Record(RecordOpts),
}

#[derive(Debug, Args)]
pub struct StatOpts {
    /// Collect system-wide information.
    #[arg(short = 'a', long)]
    pub system_wide: bool,
    /// Monitor events on the selected cpus (e.g. "0-3,8").
    #[arg(long)]
    pub cpu: Option<String>,
    /// Write the report in comma separated form.
    #[arg(long)]
    pub csv: bool,
    /// Monitor for the given number of seconds instead of waiting for the
    /// command to finish.
    #[arg(long)]
    pub duration: Option<f64>,
    /// Print counters every given number of milliseconds.
    #[arg(long)]
    pub interval: Option<f64>,
    /// Print the number of events that happened in each interval, instead
    /// of cumulative totals.
    #[arg(long)]
    pub interval_only_values: bool,
    /// Events to count, e.g. "cpu-cycles,instructions" or "cache-misses:u".
    #[arg(short = 'e', long = "event")]
    pub events: Vec<String>,
    /// Events to count as one group, scheduled in and out together.
    #[arg(long = "group")]
    pub groups: Vec<String>,
    /// Don't count child threads/processes created by the target.
    #[arg(long)]
    pub no_inherit: bool,
    /// Write the report to a file instead of standard output.
    #[arg(short = 'o', long)]
    pub output: Option<std::path::PathBuf>,
    /// Write the report to an inherited file descriptor.
    #[arg(long, hide = true)]
    pub out_fd: Option<i32>,
    /// Stop counting when this file descriptor becomes readable.
    #[arg(long, hide = true)]
    pub stop_signal_fd: Option<i32>,
    /// Print counters for each cpu core.
    #[arg(long)]
    pub per_core: bool,
    /// Print counters for each thread.
    #[arg(long)]
    pub per_thread: bool,
    /// Also count threads created after counting starts. Needs
    /// --per-thread and --no-inherit.
    #[arg(long)]
    pub monitor_new_thread: bool,
    /// Existing processes to count, by pid.
    #[arg(short = 'p', long = "pid")]
    pub pids: Vec<String>,
    /// Existing threads to count, by tid.
    #[arg(short = 't', long = "tid")]
    pub tids: Vec<String>,
    /// Filter string for the previously added tracepoint event.
    #[arg(long)]
    pub tp_filter: Option<String>,
    /// Sort keys for --per-thread/--per-core reports
    /// (count_per_thread,tid,cpu,count,pid,comm).
    #[arg(long)]
    pub sort: Option<String>,
    /// Ask devfreq to release hardware counters held by the memory latency
    /// governor while counting (needs root).
    #[arg(long)]
    pub use_devfreq_counters: bool,
    /// Show each counter reading before the summary.
    #[arg(long)]
    pub verbose: bool,
    /// Command to run while counting.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[derive(Debug, Args)]
pub struct RecordOpts {
    /// Collect system-wide samples.
    #[arg(short = 'a', long)]
    pub system_wide: bool,
    /// Sample on the selected cpus (e.g. "0-3,8").
    #[arg(long)]
    pub cpu: Option<String>,
    /// Events to sample.
    #[arg(short = 'e', long = "event")]
    pub events: Vec<String>,
    /// Sample frequency in samples per second.
    #[arg(short = 'f', long)]
    pub freq: Option<u64>,
    /// Sample period in event counts (alternative to -f).
    #[arg(short = 'c', long)]
    pub count: Option<u64>,
    /// Sample for the given number of seconds.
    #[arg(long)]
    pub duration: Option<f64>,
    /// Call graph mode: "fp" or "dwarf[,stack_size]".
    #[arg(long)]
    pub call_graph: Option<String>,
    /// Don't sample child threads/processes created by the target.
    #[arg(long)]
    pub no_inherit: bool,
    /// Drop records generated by the profiler itself.
    #[arg(long)]
    pub exclude_perf: bool,
    /// Maximum ring buffer size per cpu, in pages (a power of two).
    #[arg(long)]
    pub mmap_pages: Option<usize>,
    /// Size of the in-memory record queue, in megabytes.
    #[arg(long)]
    pub record_buffer_size: Option<usize>,
    /// Existing processes to sample, by pid.
    #[arg(short = 'p', long = "pid")]
    pub pids: Vec<String>,
    /// Existing threads to sample, by tid.
    #[arg(short = 't', long = "tid")]
    pub tids: Vec<String>,
    /// Stop sampling when this file descriptor becomes readable.
    #[arg(long, hide = true)]
    pub stop_signal_fd: Option<i32>,
    /// Command to run while sampling.
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = Command::parse();
    match opts.subcmd {
        SubCommand::Stat(opts) => cmds::stat::run(opts),
        SubCommand::Record(opts) => cmds::record::run(opts),
    }
}
