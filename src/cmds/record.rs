//! The record subcommand: sample events through the mapped ring buffers
//! and report what was collected. Writing the samples out in a trace file
//! format is left to downstream consumers of the library.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};

use sperf::attr::{PERF_RECORD_LOST, PERF_RECORD_SAMPLE};
use sperf::environment;
use sperf::event_loop::{IOEventLoop, IOEventPriority};
use sperf::event_types::EventCatalog;
use sperf::selection::{EventSelectionSet, SampleRate};
use sperf::workload::Workload;

use crate::RecordOpts;

const DEFAULT_MIN_MMAP_PAGES: usize = 1;
const DEFAULT_MAX_MMAP_PAGES: usize = 1024;
const DEFAULT_RECORD_BUFFER_SIZE: usize = 64 << 20;

#[derive(Default)]
struct RecordStats {
    samples: HashMap<usize, u64>,
    other_records: u64,
    lost_records: u64,
}

pub fn run(opts: RecordOpts) -> Result<()> {
    environment::check_perf_event_limit()?;
    environment::allow_more_opened_files()?;

    let catalog = Arc::new(EventCatalog::load());
    let mut set = EventSelectionSet::new(false, catalog);

    if let Some(cpu_list) = &opts.cpu {
        let cpus = environment::parse_cpu_list(cpu_list)?;
        set.set_cpus_for_new_events(&cpus);
    }
    if let Some(freq) = opts.freq {
        set.set_sample_rate_for_new_events(SampleRate::Frequency(freq));
    } else if let Some(period) = opts.count {
        set.set_sample_rate_for_new_events(SampleRate::Period(period));
    }
    for value in &opts.events {
        for name in value.split(',') {
            set.add_event(name.trim())?;
        }
    }
    if set.is_empty() {
        // Fall back to cpu-clock where the cycle counter is unavailable
        // (some VMs).
        if set.add_event("cpu-cycles").is_err() {
            set.add_event("cpu-clock")?;
        }
    }
    match opts.call_graph.as_deref() {
        None => {}
        Some("fp") => set.enable_fp_callchain_sampling(),
        Some(value) => {
            let Some(rest) = value.strip_prefix("dwarf") else {
                bail!("unknown --call-graph value: {}", value);
            };
            let stack_size = match rest.strip_prefix(',') {
                Some(size) => size.parse()?,
                None if rest.is_empty() => 8192,
                None => bail!("unknown --call-graph value: {}", value),
            };
            set.enable_dwarf_callchain_sampling(stack_size)?;
        }
    }
    set.set_inherit(!opts.no_inherit);

    let mut workload = if !opts.command.is_empty() {
        Some(Workload::create(&opts.command)?)
    } else {
        None
    };
    for value in &opts.pids {
        for pid in value.split(',') {
            set.add_monitored_processes([pid.trim().parse::<libc::pid_t>()?]);
        }
    }
    for value in &opts.tids {
        for tid in value.split(',') {
            set.add_monitored_threads([tid.trim().parse::<libc::pid_t>()?]);
        }
    }
    let mut need_to_check_targets = false;
    if opts.system_wide {
        set.add_monitored_threads([-1]);
    } else if !set.has_monitored_target() {
        match &workload {
            Some(workload) => {
                set.add_monitored_processes([workload.pid()]);
                set.set_enable_condition(false, true);
            }
            None => bail!("No threads to monitor. Try `sperf help record` for help."),
        }
    } else {
        need_to_check_targets = true;
    }

    set.open_event_files()?;
    set.mmap_event_files(
        DEFAULT_MIN_MMAP_PAGES,
        opts.mmap_pages.unwrap_or(DEFAULT_MAX_MMAP_PAGES),
        opts.record_buffer_size
            .map(|mb| mb << 20)
            .unwrap_or(DEFAULT_RECORD_BUFFER_SIZE),
        opts.exclude_perf,
    )?;

    let event_names = set.event_names();
    let mut event_loop = IOEventLoop::new()?;
    let set = Arc::new(Mutex::new(set));
    let stats = Arc::new(Mutex::new(RecordStats::default()));

    // Signals must be routed before the reader thread exists so it
    // inherits the blocked mask.
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
    if need_to_check_targets {
        EventSelectionSet::stop_when_no_more_targets(
            &set,
            &mut event_loop,
            Duration::from_secs(1),
        )?;
    }

    let callback_stats = Arc::clone(&stats);
    EventSelectionSet::prepare_sample_reading(
        &set,
        &mut event_loop,
        Box::new(move |record| {
            let mut stats = callback_stats.lock().unwrap();
            match record.record_type() {
                PERF_RECORD_SAMPLE => {
                    *stats.samples.entry(record.attr_index).or_default() += 1;
                }
                PERF_RECORD_LOST => stats.lost_records += 1,
                _ => stats.other_records += 1,
            }
            Ok(())
        }),
    )?;

    if let Some(workload) = &mut workload {
        workload.start()?;
    }
    event_loop.run_loop()?;

    // Flush whatever the kernel wrote before teardown.
    {
        let mut set = set.lock().unwrap();
        set.sync_kernel_buffer()?;
        set.finish_read_mmap_event_data()?;
    }

    let mut set = set.lock().unwrap();
    let lost = set.lost_counts();
    set.close_event_files();

    let stats = stats.lock().unwrap();
    let total_samples: u64 = stats.samples.values().sum();
    println!("Samples recorded: {}.", total_samples);
    for (index, name) in event_names.iter().enumerate() {
        let count = stats.samples.get(&index).copied().unwrap_or(0);
        let dropped = lost.get(index).map(|(_, count)| *count).unwrap_or(0);
        println!("  {}: {} samples, {} lost in user space.", name, count, dropped);
    }
    if stats.lost_records > 0 {
        println!("Lost {} records in the kernel.", stats.lost_records);
    }
    println!("Other records: {}.", stats.other_records);
    Ok(())
}
