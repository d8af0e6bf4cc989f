//! The stat subcommand: open counters for a target set, run the reactor
//! until something stops it, and print counter summaries.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::os::fd::FromRawFd;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};

use sperf::environment::{self, DevfreqCounters};
use sperf::event_loop::{IOEventLoop, IOEventPriority};
use sperf::event_types::EventCatalog;
use sperf::selection::{CountersInfo, EventSelectionSet};
use sperf::summary::{
    check_sort_keys, CounterSum, CounterSummaries, CounterSummaryBuilder, ThreadInfo,
    DEFAULT_SORT_KEYS,
};
use sperf::workload::Workload;

use crate::StatOpts;

/// Default events measured when -e is not given. Unsupported members are
/// skipped; only an empty result is an error.
const DEFAULT_MEASURED_EVENT_TYPES: &[&str] = &[
    "cpu-cycles",
    "stalled-cycles-frontend",
    "stalled-cycles-backend",
    "instructions",
    "branch-instructions",
    "branch-misses",
    "task-clock",
    "context-switches",
    "page-faults",
];

const TARGET_CHECK_INTERVAL: Duration = Duration::from_secs(1);

struct StatContext {
    set: Arc<Mutex<EventSelectionSet>>,
    out: Box<dyn Write + Send>,
    csv: bool,
    verbose: bool,
    interval_only_values: bool,
    report_per_thread: bool,
    report_per_core: bool,
    sort_keys: Vec<String>,
    thread_info: Arc<Mutex<HashMap<libc::pid_t, ThreadInfo>>>,
    start_time: Instant,
    last_sums: Vec<Vec<CounterSum>>,
    saw_multiplexing: bool,
}

impl StatContext {
    fn print_counters(&mut self) -> Result<()> {
        let mut counters = self.set.lock().unwrap().read_counters()?;
        let duration_in_sec = self.start_time.elapsed().as_secs_f64();
        if self.interval_only_values {
            self.adjust_to_interval_only_values(&mut counters);
        }
        self.show_counters(&counters, duration_in_sec)
    }

    /// Replace cumulative readings with deltas against the previous
    /// snapshot of the same counter.
    fn adjust_to_interval_only_values(&mut self, counters: &mut [CountersInfo]) {
        if self.last_sums.len() < counters.len() {
            self.last_sums.resize(counters.len(), Vec::new());
        }
        for (info, last_sums) in counters.iter_mut().zip(self.last_sums.iter_mut()) {
            if last_sums.len() < info.counters.len() {
                last_sums.resize(info.counters.len(), CounterSum::default());
            }
            for (counter_info, last) in info.counters.iter_mut().zip(last_sums.iter_mut()) {
                let new_sum = CounterSum::from_counter(&counter_info.counter);
                new_sum.sub(last).to_counter(&mut counter_info.counter);
                *last = new_sum;
            }
        }
    }

    fn show_counters(&mut self, counters: &[CountersInfo], duration_in_sec: f64) -> Result<()> {
        if self.csv {
            writeln!(self.out, "Performance counter statistics,")?;
        } else {
            writeln!(self.out, "Performance counter statistics:\n")?;
        }

        if self.verbose {
            for info in counters {
                for counter_info in &info.counters {
                    let c = &counter_info.counter;
                    if self.csv {
                        writeln!(
                            self.out,
                            "{},tid,{},cpu,{},count,{},time_enabled,{},time running,{},id,{},",
                            info.event_name,
                            counter_info.tid,
                            counter_info.cpu,
                            c.value,
                            c.time_enabled,
                            c.time_running,
                            c.id
                        )?;
                    } else {
                        writeln!(
                            self.out,
                            "{}(tid {}, cpu {}): count {}, time_enabled {}, time running {}, id {}",
                            info.event_name,
                            counter_info.tid,
                            counter_info.cpu,
                            c.value,
                            c.time_enabled,
                            c.time_running,
                            c.id
                        )?;
                    }
                }
            }
        }

        let mut builder = CounterSummaryBuilder::new(
            self.report_per_thread,
            self.report_per_core,
            self.csv,
            self.thread_info.lock().unwrap().clone(),
            self.sort_keys.clone(),
        );
        for info in counters {
            builder.add_counters_for_one_event(info);
        }
        let mut summaries: CounterSummaries = builder.build();
        summaries.auto_generate_summaries();
        summaries.generate_comments(duration_in_sec);
        summaries.show(&mut self.out)?;
        self.saw_multiplexing |= summaries.any_multiplexed();

        if self.csv {
            writeln!(self.out, "Total test time,{:.6},seconds,", duration_in_sec)?;
        } else {
            writeln!(self.out, "\nTotal test time: {:.6} seconds.", duration_in_sec)?;
        }
        Ok(())
    }
}

/// Periodically rescan the target processes for new threads and open
/// counter files for them. Backs off exponentially while nothing new
/// appears so an idle scan doesn't burn a core.
struct NewThreadMonitor {
    set: Arc<Mutex<EventSelectionSet>>,
    monitored_processes: Vec<libc::pid_t>,
    thread_info: Arc<Mutex<HashMap<libc::pid_t, ThreadInfo>>>,
    next_scan: Instant,
    backoff: Duration,
}

impl NewThreadMonitor {
    const SCAN_INTERVAL: Duration = Duration::from_millis(1);
    const MAX_BACKOFF: Duration = Duration::from_millis(100);

    fn start(
        set: &Arc<Mutex<EventSelectionSet>>,
        event_loop: &mut IOEventLoop,
        monitored_processes: Vec<libc::pid_t>,
        thread_info: Arc<Mutex<HashMap<libc::pid_t, ThreadInfo>>>,
    ) -> Result<()> {
        // Counter files opened for new threads must start counting right
        // away.
        set.lock().unwrap().set_enable_condition(true, false);
        let mut monitor = NewThreadMonitor {
            set: Arc::clone(set),
            monitored_processes,
            thread_info,
            next_scan: Instant::now(),
            backoff: Self::SCAN_INTERVAL,
        };
        event_loop.add_periodic_event(
            Self::SCAN_INTERVAL,
            IOEventPriority::Low,
            Box::new(move || {
                monitor.scan();
                Ok(())
            }),
        )?;
        Ok(())
    }

    fn scan(&mut self) {
        let now = Instant::now();
        if now < self.next_scan {
            return;
        }
        let mut new_tids = std::collections::BTreeSet::new();
        {
            let thread_info = self.thread_info.lock().unwrap();
            for &pid in &self.monitored_processes {
                for tid in environment::get_threads_in_process(pid) {
                    if !thread_info.contains_key(&tid) {
                        new_tids.insert(tid);
                    }
                }
            }
        }
        let mut open_tids = std::collections::BTreeSet::new();
        for &tid in &new_tids {
            if let Some((name, pid)) = environment::read_thread_name_and_pid(tid) {
                self.thread_info
                    .lock()
                    .unwrap()
                    .insert(tid, ThreadInfo { tid, pid, name });
                open_tids.insert(tid);
            }
        }
        if open_tids.is_empty() {
            self.backoff = (self.backoff * 2).min(Self::MAX_BACKOFF);
        } else {
            self.backoff = Self::SCAN_INTERVAL;
            // Failure is expected here: the new threads may already have
            // exited.
            let mut set = self.set.lock().unwrap();
            set.add_monitored_threads(open_tids.iter().copied());
            if let Err(err) = set.open_event_files_for_threads(&open_tids) {
                tracing::debug!("failed to open event files for new threads: {}", err);
            }
        }
        self.next_scan = now + self.backoff;
    }
}

fn add_default_event_types(set: &mut EventSelectionSet, catalog: &EventCatalog) -> Result<()> {
    for name in DEFAULT_MEASURED_EVENT_TYPES {
        if catalog.find(name).is_none() {
            continue;
        }
        // Unsupported default events are not an error.
        if set.add_event(name).is_err() {
            tracing::debug!("default event {} is not supported, skipping", name);
        }
    }
    if set.is_empty() {
        bail!("Failed to add any supported default measured types");
    }
    Ok(())
}

fn parse_id_list(values: &[String]) -> Result<Vec<libc::pid_t>> {
    let mut ids = Vec::new();
    for value in values {
        for item in value.split(',') {
            ids.push(
                item.trim()
                    .parse()
                    .with_context(|| format!("invalid pid/tid '{}'", item))?,
            );
        }
    }
    Ok(ids)
}

/// Replace process targets with their individual threads so each thread
/// gets its own counter files and its own report rows.
fn monitor_each_thread(
    set: &mut EventSelectionSet,
    workload: Option<&Workload>,
    thread_info: &mut HashMap<libc::pid_t, ThreadInfo>,
) {
    let mut threads = Vec::new();
    for &pid in set.get_monitored_processes() {
        for tid in environment::get_threads_in_process(pid) {
            if let Some(name) = environment::get_thread_name(tid) {
                let name = match workload {
                    Some(w) if tid == pid && w.pid() == pid => w.command_name().to_string(),
                    _ => name,
                };
                thread_info.insert(tid, ThreadInfo { tid, pid, name });
                threads.push(tid);
            }
        }
    }
    for &tid in set.get_monitored_threads() {
        if let Some((name, pid)) = environment::read_thread_name_and_pid(tid) {
            thread_info.insert(tid, ThreadInfo { tid, pid, name });
            threads.push(tid);
        }
    }
    set.clear_monitored_targets();
    set.add_monitored_threads(threads);
}

pub fn run(opts: StatOpts) -> Result<()> {
    environment::check_perf_event_limit()?;
    environment::allow_more_opened_files()?;

    if opts.monitor_new_thread && (!opts.per_thread || !opts.no_inherit) {
        bail!("--monitor-new-thread should be used with --per-thread and --no-inherit");
    }
    let sort_keys: Vec<String> = match &opts.sort {
        Some(keys) => keys.split(',').map(str::to_string).collect(),
        None => DEFAULT_SORT_KEYS.iter().map(|s| s.to_string()).collect(),
    };
    check_sort_keys(&sort_keys)?;

    let mut devfreq_counters = DevfreqCounters::default();
    if opts.use_devfreq_counters {
        devfreq_counters.use_counters()?;
    }

    let catalog = Arc::new(EventCatalog::load());
    let mut set = EventSelectionSet::new(true, catalog.clone());

    if let Some(cpu_list) = &opts.cpu {
        let cpus = environment::parse_cpu_list(cpu_list)?;
        set.set_cpus_for_new_events(&cpus);
    }
    for value in &opts.events {
        for name in value.split(',') {
            set.add_event(name.trim())?;
        }
    }
    for value in &opts.groups {
        let names: Vec<String> = value.split(',').map(|s| s.trim().to_string()).collect();
        set.add_event_group(&names, true)?;
    }
    if let Some(filter) = &opts.tp_filter {
        set.set_tracepoint_filter(filter)?;
    }
    if set.is_empty() {
        add_default_event_types(&mut set, &catalog)?;
    }
    set.set_inherit(!opts.no_inherit);

    // Sort out what to monitor.
    let mut workload = if !opts.command.is_empty() {
        Some(Workload::create(&opts.command)?)
    } else {
        None
    };
    for pid in parse_id_list(&opts.pids)? {
        set.add_monitored_processes([pid]);
    }
    for tid in parse_id_list(&opts.tids)? {
        set.add_monitored_threads([tid]);
    }
    if opts.system_wide && set.has_monitored_target() {
        bail!("Stat system wide and existing processes/threads can't be used at the same time.");
    }
    let mut need_to_check_targets = false;
    if opts.system_wide {
        if unsafe { libc::getuid() } != 0 {
            bail!("System wide profiling needs root privilege.");
        }
        if opts.per_thread {
            set.add_monitored_processes(environment::get_all_processes());
        } else {
            set.add_monitored_threads([-1]);
        }
    } else if !set.has_monitored_target() {
        match &workload {
            Some(workload) => {
                set.add_monitored_processes([workload.pid()]);
                set.set_enable_condition(false, true);
            }
            None => bail!("No threads to monitor. Try `sperf help stat` for help."),
        }
    } else {
        need_to_check_targets = true;
    }

    let thread_info: Arc<Mutex<HashMap<libc::pid_t, ThreadInfo>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let monitored_processes: Vec<libc::pid_t> =
        set.get_monitored_processes().iter().copied().collect();
    if opts.per_thread {
        monitor_each_thread(
            &mut set,
            workload.as_ref(),
            &mut thread_info.lock().unwrap(),
        );
    }

    set.open_event_files()?;

    let out: Box<dyn Write + Send> = if let Some(path) = &opts.output {
        Box::new(File::create(path).with_context(|| format!("failed to open {}", path.display()))?)
    } else if let Some(fd) = opts.out_fd {
        Box::new(unsafe { File::from_raw_fd(fd) })
    } else {
        Box::new(std::io::stdout())
    };

    let mut event_loop = IOEventLoop::new()?;
    let set = Arc::new(Mutex::new(set));
    let context = Arc::new(Mutex::new(StatContext {
        set: Arc::clone(&set),
        out,
        csv: opts.csv,
        verbose: opts.verbose,
        interval_only_values: opts.interval_only_values,
        report_per_thread: opts.per_thread,
        report_per_core: opts.per_core,
        sort_keys,
        thread_info: Arc::clone(&thread_info),
        start_time: Instant::now(),
        last_sums: Vec::new(),
        saw_multiplexing: false,
    }));

    if need_to_check_targets {
        EventSelectionSet::stop_when_no_more_targets(&set, &mut event_loop, TARGET_CHECK_INTERVAL)?;
    }
    let exit = event_loop.exit_handle();
    event_loop.add_signal_events(
        &[libc::SIGCHLD, libc::SIGINT, libc::SIGTERM, libc::SIGHUP],
        IOEventPriority::Low,
        Box::new(move || {
            exit.exit_loop();
            Ok(())
        }),
    )?;
    if let Some(fd) = opts.stop_signal_fd {
        let exit = event_loop.exit_handle();
        event_loop.add_read_event(
            fd,
            IOEventPriority::Low,
            Box::new(move || {
                exit.exit_loop();
                Ok(())
            }),
        )?;
    }
    if let Some(duration) = opts.duration {
        if duration <= 0.0 {
            bail!("duration must be positive");
        }
        let exit = event_loop.exit_handle();
        event_loop.add_one_time_event(
            Duration::from_secs_f64(duration),
            IOEventPriority::Low,
            Box::new(move || {
                exit.exit_loop();
                Ok(())
            }),
        )?;
    }
    if let Some(interval) = opts.interval {
        if interval <= 0.0 {
            bail!("interval must be positive");
        }
        let interval_context = Arc::clone(&context);
        event_loop.add_periodic_event(
            Duration::from_secs_f64(interval / 1000.0),
            IOEventPriority::Low,
            Box::new(move || interval_context.lock().unwrap().print_counters()),
        )?;
    }
    if opts.monitor_new_thread {
        NewThreadMonitor::start(
            &set,
            &mut event_loop,
            monitored_processes,
            Arc::clone(&thread_info),
        )?;
    }

    // Count while the workload runs.
    context.lock().unwrap().start_time = Instant::now();
    if let Some(workload) = &mut workload {
        workload.start()?;
    }
    event_loop.run_loop()?;

    if opts.interval.is_none() {
        context.lock().unwrap().print_counters()?;
    }

    set.lock().unwrap().close_event_files();
    if context.lock().unwrap().saw_multiplexing {
        tracing::warn!(
            "Some events were multiplexed onto a limited number of hardware counters: \
             they were not counted the whole time, and scaled counts are estimates. \
             Measure fewer events or use event groups for exact counts."
        );
    }
    Ok(())
}
