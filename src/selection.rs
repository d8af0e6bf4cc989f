//! Event selection set: the ordered list of event groups being profiled,
//! the policies applied to all of them, and the matrix of counter fds
//! opened for (thread, cpu) cells.
//!
//! A group's events are scheduled atomically by the kernel: every fd in a
//! group is opened with the first one as group leader. Side-band records
//! (mmap/comm/...) are only requested on the first event of the first
//! group, since all groups monitor the same targets.

use std::collections::{BTreeSet, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::attr::*;
use crate::environment;
use crate::event_fd::{is_event_attr_supported, EventFd, PerfCounter};
use crate::event_loop::{ExitHandle, IOEventLoop, IOEventPriority};
use crate::event_types::{default_perf_event_attr, parse_event_type, EventCatalog, EventTypeAndModifier};
use crate::read_thread::RecordReadThread;
use crate::records::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    Frequency(u64),
    Period(u64),
}

/// One cumulative reading of one counter cell.
#[derive(Debug, Clone, Copy)]
pub struct CounterInfo {
    pub tid: libc::pid_t,
    pub cpu: i32,
    pub counter: PerfCounter,
}

/// All readings of one event selection, in (tid, cpu) cell order.
#[derive(Debug, Clone)]
pub struct CountersInfo {
    pub group_id: usize,
    pub event_name: String,
    pub event_modifier: String,
    pub counters: Vec<CounterInfo>,
}

pub struct EventSelection {
    pub event_type_modifier: EventTypeAndModifier,
    pub event_attr: perf_event_attr,
    allowed_cpus: Vec<i32>,
    tracepoint_filter: Option<String>,
    event_fds: Vec<EventFd>,
}

pub struct EventSelectionGroup {
    selections: Vec<EventSelection>,
    cpus: Vec<i32>,
    set_sample_rate: bool,
}

pub type RecordCallback = Box<dyn FnMut(&Record) -> Result<()> + Send>;

pub struct EventSelectionSet {
    for_stat_cmd: bool,
    catalog: Arc<EventCatalog>,
    groups: Vec<EventSelectionGroup>,
    processes: BTreeSet<libc::pid_t>,
    threads: BTreeSet<libc::pid_t>,
    sample_rate: Option<SampleRate>,
    cpus: Option<Vec<i32>>,
    mmap_pages: Option<(usize, usize)>,
    read_thread: Option<RecordReadThread>,
    record_callback: Option<RecordCallback>,
}

impl EventSelectionSet {
    pub fn new(for_stat_cmd: bool, catalog: Arc<EventCatalog>) -> Self {
        EventSelectionSet {
            for_stat_cmd,
            catalog,
            groups: Vec::new(),
            processes: BTreeSet::new(),
            threads: BTreeSet::new(),
            sample_rate: None,
            cpus: None,
            mmap_pages: None,
            read_thread: None,
            record_callback: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn build_and_check_event_selection(
        &self,
        event_name: &str,
        first_event: bool,
        check: bool,
    ) -> Result<EventSelection> {
        let event_type = parse_event_type(&self.catalog, event_name)?;
        if self.for_stat_cmd {
            let base = &event_type.event_type.name;
            if (base == "cpu-clock" || base == "task-clock")
                && (event_type.exclude_user || event_type.exclude_kernel)
            {
                bail!(
                    "Modifiers u and k used in event type {} are not supported by the kernel.",
                    base
                );
            }
        }
        for group in &self.groups {
            for selection in &group.selections {
                if selection.event_type_modifier.name == event_name {
                    bail!("Event type '{}' appears more than once", event_name);
                }
            }
        }

        let mut attr = default_perf_event_attr(&event_type.event_type);
        attr.flags.set_exclude_user(event_type.exclude_user as u64);
        attr.flags.set_exclude_kernel(event_type.exclude_kernel as u64);
        attr.flags.set_exclude_hv(event_type.exclude_hv as u64);
        attr.flags.set_exclude_host(event_type.exclude_host as u64);
        attr.flags.set_exclude_guest(event_type.exclude_guest as u64);
        attr.flags.set_precise_ip(event_type.precise_ip as u64);

        let mut set_default_sample_freq = false;
        if !self.for_stat_cmd {
            // The identifier lets the reader attribute records to their
            // event no matter which ring buffer they arrive through.
            attr.sample_type |= PERF_SAMPLE_IDENTIFIER;
            if event_type.event_type.is_tracepoint() {
                attr.flags.set_freq(0);
                attr.sample.sample_period = DEFAULT_SAMPLE_PERIOD_FOR_TRACEPOINT_EVENT;
            } else {
                attr.flags.set_freq(1);
                // Check support with the minimum sample freq; the real
                // default is applied after the check so a clamped max
                // frequency doesn't fail it.
                attr.sample.sample_freq = 1;
                set_default_sample_freq = true;
            }
            if first_event {
                // Side-band records are only needed once per target set.
                attr.flags.set_mmap(1);
                attr.flags.set_comm(1);
                if matches!(environment::get_kernel_version(), Some(v) if v >= (3, 12)) {
                    attr.flags.set_mmap2(1);
                }
            }
        }
        if check && !event_type.event_type.is_pmu() {
            // PMU events are provided by the kernel, so they should be
            // supported without probing.
            if !is_event_attr_supported(&attr, &event_type.name) {
                bail!(
                    "Event type '{}' is not supported on the device",
                    event_type.name
                );
            }
        }
        if set_default_sample_freq {
            attr.sample.sample_freq = DEFAULT_SAMPLE_FREQ;
        }

        Ok(EventSelection {
            event_type_modifier: event_type,
            event_attr: attr,
            allowed_cpus: Vec::new(),
            tracepoint_filter: None,
            event_fds: Vec::new(),
        })
    }

    pub fn add_event(&mut self, event_name: &str) -> Result<()> {
        self.add_event_group(&[event_name.to_string()], true)
    }

    pub fn add_event_group(&mut self, event_names: &[String], check: bool) -> Result<()> {
        let mut group = EventSelectionGroup {
            selections: Vec::new(),
            cpus: Vec::new(),
            set_sample_rate: false,
        };
        let mut first_event = self.groups.is_empty();
        let mut first_in_group = true;
        for event_name in event_names {
            let mut selection = self.build_and_check_event_selection(event_name, first_event, check)?;
            if first_in_group {
                if let Some(pmu_cpus) = &selection.event_type_modifier.event_type.pmu_cpus {
                    selection.allowed_cpus = pmu_cpus.clone();
                }
            }
            first_event = false;
            first_in_group = false;
            group.selections.push(selection);
        }
        if let Some(rate) = self.sample_rate {
            set_sample_rate_for_group(&mut group, rate);
        }
        if let Some(cpus) = &self.cpus {
            group.cpus = cpus.clone();
        }
        self.groups.push(group);
        self.union_sample_type();
        Ok(())
    }

    /// Add events to the single existing group with a sample period so
    /// large they never generate samples themselves; their values ride
    /// along in other events' grouped sample payloads.
    pub fn add_counters(&mut self, event_names: &[String]) -> Result<()> {
        if self.groups.len() != 1 {
            bail!("Failed to add counters. Only one event group is allowed.");
        }
        for event_name in event_names {
            let mut selection = self.build_and_check_event_selection(event_name, false, true)?;
            selection.event_attr.flags.set_freq(0);
            selection.event_attr.sample.sample_period = INFINITE_SAMPLE_PERIOD;
            selection.event_attr.flags.set_inherit(0);
            self.groups[0].selections.push(selection);
        }
        for selection in &mut self.groups[0].selections {
            selection.event_attr.sample_type |= PERF_SAMPLE_READ;
            selection.event_attr.read_format |= PERF_FORMAT_GROUP;
        }
        self.union_sample_type();
        Ok(())
    }

    /// Unioning the sample type across the set makes record parsing
    /// uniform regardless of which event produced a record.
    fn union_sample_type(&mut self) {
        let mut sample_type = 0;
        for group in &self.groups {
            for selection in &group.selections {
                sample_type |= selection.event_attr.sample_type;
            }
        }
        for group in &mut self.groups {
            for selection in &mut group.selections {
                selection.event_attr.sample_type = sample_type;
            }
        }
    }

    fn for_each_attr(&mut self, mut f: impl FnMut(&mut perf_event_attr)) {
        for group in &mut self.groups {
            for selection in &mut group.selections {
                f(&mut selection.event_attr);
            }
        }
    }

    pub fn set_enable_condition(&mut self, enable_on_open: bool, enable_on_exec: bool) {
        self.for_each_attr(|attr| {
            attr.flags.set_disabled(!enable_on_open as u64);
            attr.flags.set_enable_on_exec(enable_on_exec as u64);
        });
    }

    pub fn is_enabled_on_exec(&self) -> bool {
        self.groups.iter().all(|group| {
            group
                .selections
                .iter()
                .all(|s| s.event_attr.flags.enable_on_exec() == 1)
        })
    }

    pub fn sample_id_all(&mut self) {
        self.for_each_attr(|attr| attr.flags.set_sample_id_all(1));
    }

    pub fn set_inherit(&mut self, enable: bool) {
        self.for_each_attr(|attr| attr.flags.set_inherit(enable as u64));
    }

    pub fn set_clock_id(&mut self, clock_id: libc::clockid_t) {
        self.for_each_attr(|attr| {
            attr.flags.set_use_clockid(1);
            attr.clockid = clock_id;
        });
    }

    pub fn set_sample_rate_for_new_events(&mut self, rate: SampleRate) {
        self.sample_rate = Some(rate);
        for group in &mut self.groups {
            if !group.set_sample_rate {
                set_sample_rate_for_group(group, rate);
            }
        }
    }

    pub fn set_cpus_for_new_events(&mut self, cpus: &[i32]) {
        self.cpus = Some(cpus.to_vec());
        for group in &mut self.groups {
            if group.cpus.is_empty() {
                group.cpus = cpus.to_vec();
            }
        }
    }

    pub fn set_branch_sampling(&mut self, branch_sample_type: u64) -> Result<()> {
        if branch_sample_type != 0 {
            if branch_sample_type
                & (PERF_SAMPLE_BRANCH_ANY
                    | PERF_SAMPLE_BRANCH_ANY_CALL
                    | PERF_SAMPLE_BRANCH_ANY_RETURN
                    | PERF_SAMPLE_BRANCH_IND_CALL)
                == 0
            {
                bail!("Invalid branch_sample_type: 0x{:x}", branch_sample_type);
            }
            if !is_branch_sampling_supported(&self.catalog) {
                bail!("branch stack sampling is not supported on this device.");
            }
        }
        self.for_each_attr(|attr| {
            if branch_sample_type != 0 {
                attr.sample_type |= PERF_SAMPLE_BRANCH_STACK;
            } else {
                attr.sample_type &= !PERF_SAMPLE_BRANCH_STACK;
            }
            attr.branch_sample_type = branch_sample_type;
        });
        Ok(())
    }

    pub fn enable_fp_callchain_sampling(&mut self) {
        self.for_each_attr(|attr| attr.sample_type |= PERF_SAMPLE_CALLCHAIN);
    }

    pub fn enable_dwarf_callchain_sampling(&mut self, dump_stack_size: u32) -> Result<()> {
        if !is_dwarf_callchain_sampling_supported(&self.catalog) {
            bail!("dwarf callchain sampling is not supported on this device.");
        }
        let reg_mask = environment::get_supported_reg_mask();
        self.for_each_attr(|attr| {
            attr.sample_type |=
                PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
            attr.flags.set_exclude_callchain_user(1);
            attr.sample_regs_user = reg_mask;
            attr.sample_stack_user = dump_stack_size;
        });
        Ok(())
    }

    /// Request non-executable mmap records from the first event.
    pub fn set_record_not_executable_maps(&mut self, record: bool) {
        self.groups[0].selections[0]
            .event_attr
            .flags
            .set_mmap_data(record as u64);
    }

    pub fn record_not_executable_maps(&self) -> bool {
        self.groups[0].selections[0].event_attr.flags.mmap_data() == 1
    }

    pub fn enable_switch_record(&mut self) {
        self.groups[0].selections[0]
            .event_attr
            .flags
            .set_context_switch(1);
    }

    pub fn wakeup_per_sample(&mut self) {
        self.for_each_attr(|attr| {
            attr.flags.set_watermark(0);
            attr.wakeup.wakeup_events = 1;
        });
    }

    /// Bind a tracepoint filter to the most recently added event, which
    /// must be a lone tracepoint event in its group.
    pub fn set_tracepoint_filter(&mut self, filter: &str) -> Result<()> {
        let selection = self
            .groups
            .last_mut()
            .filter(|group| group.selections.len() == 1)
            .map(|group| &mut group.selections[0])
            .filter(|s| s.event_attr.type_ == PERF_TYPE_TRACEPOINT);
        let Some(selection) = selection else {
            bail!("No tracepoint event before filter: {}", filter);
        };
        selection.tracepoint_filter = Some(filter.to_string());
        Ok(())
    }

    pub fn add_monitored_processes<I: IntoIterator<Item = libc::pid_t>>(&mut self, pids: I) {
        self.processes.extend(pids);
    }

    pub fn add_monitored_threads<I: IntoIterator<Item = libc::pid_t>>(&mut self, tids: I) {
        self.threads.extend(tids);
    }

    pub fn get_monitored_processes(&self) -> &BTreeSet<libc::pid_t> {
        &self.processes
    }

    pub fn get_monitored_threads(&self) -> &BTreeSet<libc::pid_t> {
        &self.threads
    }

    pub fn clear_monitored_targets(&mut self) {
        self.processes.clear();
        self.threads.clear();
    }

    pub fn has_monitored_target(&self) -> bool {
        !self.processes.is_empty() || !self.threads.is_empty()
    }

    /// Event names in attr-index order (the order records are attributed
    /// in).
    pub fn event_names(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|group| {
                group
                    .selections
                    .iter()
                    .map(|s| s.event_type_modifier.name.clone())
            })
            .collect()
    }

    fn open_event_files_on_group(
        group: &mut EventSelectionGroup,
        tid: libc::pid_t,
        cpu: i32,
        atom_cpus: &HashSet<i32>,
        atom_type: Option<u32>,
    ) -> io::Result<()> {
        // Events in a group are opened all-or-nothing for a given cell,
        // with the first fd as group leader.
        let mut event_fds: Vec<EventFd> = Vec::new();
        for selection in group.selections.iter() {
            let mut attr = selection.event_attr;
            if attr.type_ == PERF_TYPE_RAW && atom_cpus.contains(&cpu) {
                let Some(atom_type) = atom_type else {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        "Can't read pmu type for Intel Atom CPU",
                    ));
                };
                attr.type_ = atom_type;
            }
            let event_fd = EventFd::open(
                &attr,
                tid,
                cpu,
                event_fds.first(),
                &selection.event_type_modifier.name,
            )?;
            tracing::debug!(
                "opened event file for {} on tid {} cpu {}",
                event_fd.name(),
                tid,
                cpu
            );
            event_fds.push(event_fd);
        }
        for (selection, event_fd) in group.selections.iter_mut().zip(event_fds) {
            selection.event_fds.push(event_fd);
        }
        Ok(())
    }

    pub fn open_event_files(&mut self) -> Result<()> {
        let mut threads = self.threads.clone();
        for &pid in &self.processes {
            threads.extend(environment::get_threads_in_process(pid));
        }
        self.open_event_files_for_threads(&threads)
    }

    /// Open the whole (thread, cpu) matrix for every group. Cells may fail
    /// individually (threads exit, cpus go offline between enumeration and
    /// open); a group is only fatal when no cell at all succeeded.
    pub fn open_event_files_for_threads(&mut self, threads: &BTreeSet<libc::pid_t>) -> Result<()> {
        let online_cpus = environment::get_online_cpus()?;
        let atom_cpus = environment::get_x86_intel_atom_cpus();
        let atom_type = self.catalog.intel_atom_event_type();

        for group in &mut self.groups {
            let cpus: Vec<i32> = if !group.selections[0].allowed_cpus.is_empty() {
                // A PMU's cpumask overrides the requested cpu list; those
                // PMUs are only meaningful on their own cpus.
                group.selections[0].allowed_cpus.clone()
            } else if !group.cpus.is_empty() {
                for &cpu in &group.cpus {
                    if cpu != -1 && !online_cpus.contains(&cpu) {
                        bail!("cpu {} is not online.", cpu);
                    }
                }
                group.cpus.clone()
            } else {
                online_cpus.clone()
            };

            let mut success_count = 0usize;
            let mut last_error: Option<io::Error> = None;
            let mut failed_event_type = String::new();
            for &tid in threads {
                for &cpu in &cpus {
                    match Self::open_event_files_on_group(group, tid, cpu, &atom_cpus, atom_type) {
                        Ok(()) => success_count += 1,
                        Err(err) => {
                            tracing::debug!(
                                "failed to open event files on tid {} cpu {}: {}",
                                tid,
                                cpu,
                                err
                            );
                            failed_event_type = group.selections[0].event_type_modifier.name.clone();
                            last_error = Some(err);
                        }
                    }
                }
            }
            if success_count == 0 {
                let err = last_error
                    .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no target cells"));
                let mut msg = format!(
                    "failed to open perf event file for event_type {}: {}",
                    failed_event_type, err
                );
                if err.raw_os_error() == Some(libc::EMFILE) {
                    msg.push_str("\nPlease increase hard limit of open file numbers.");
                }
                bail!(msg);
            }
        }
        self.apply_tracepoint_filters()
    }

    fn apply_tracepoint_filters(&mut self) -> Result<()> {
        for group in &mut self.groups {
            for selection in &mut group.selections {
                let Some(filter) = &selection.tracepoint_filter else {
                    continue;
                };
                for event_fd in &selection.event_fds {
                    event_fd
                        .set_filter(filter)
                        .with_context(|| format!("failed to set filter for {}", event_fd.name()))?;
                }
            }
        }
        Ok(())
    }

    pub fn has_sampler(&self) -> bool {
        self.groups
            .iter()
            .any(|group| group.selections.iter().any(|s| !s.event_fds.is_empty()))
    }

    pub fn set_enable_events(&mut self, enable: bool) -> Result<()> {
        for group in &self.groups {
            for selection in &group.selections {
                for event_fd in &selection.event_fds {
                    event_fd.set_enable(enable).with_context(|| {
                        format!("failed to {} {}", if enable { "enable" } else { "disable" }, event_fd.name())
                    })?;
                }
            }
        }
        Ok(())
    }

    /// Read the cumulative reading of every open counter.
    pub fn read_counters(&self) -> Result<Vec<CountersInfo>> {
        let mut counters = Vec::new();
        for (group_id, group) in self.groups.iter().enumerate() {
            let grouped = group.selections[0].event_attr.read_format & PERF_FORMAT_GROUP != 0;
            if grouped {
                Self::read_grouped_counters(group_id, group, &mut counters)?;
                continue;
            }
            for selection in &group.selections {
                let mut info = CountersInfo {
                    group_id,
                    event_name: selection.event_type_modifier.event_type.name.clone(),
                    event_modifier: selection.event_type_modifier.modifier.clone(),
                    counters: Vec::new(),
                };
                for event_fd in &selection.event_fds {
                    let counter = event_fd
                        .read_counter()
                        .with_context(|| format!("failed to read counter {}", event_fd.name()))?;
                    info.counters.push(CounterInfo {
                        tid: event_fd.thread_id(),
                        cpu: event_fd.cpu(),
                        counter,
                    });
                }
                counters.push(info);
            }
        }
        Ok(counters)
    }

    /// With PERF_FORMAT_GROUP, each leader read yields all members'
    /// values; distribute them back to their selections by kernel id.
    fn read_grouped_counters(
        group_id: usize,
        group: &EventSelectionGroup,
        out: &mut Vec<CountersInfo>,
    ) -> Result<()> {
        let group_size = group.selections.len();
        let mut infos: Vec<CountersInfo> = group
            .selections
            .iter()
            .map(|selection| CountersInfo {
                group_id,
                event_name: selection.event_type_modifier.event_type.name.clone(),
                event_modifier: selection.event_type_modifier.modifier.clone(),
                counters: Vec::new(),
            })
            .collect();
        for (cell, leader_fd) in group.selections[0].event_fds.iter().enumerate() {
            let values = leader_fd
                .read_group_counters(group_size)
                .with_context(|| format!("failed grouped read of {}", leader_fd.name()))?;
            for (index, selection) in group.selections.iter().enumerate() {
                let Some(event_fd) = selection.event_fds.get(cell) else {
                    continue;
                };
                let counter = values
                    .iter()
                    .find(|c| c.id == event_fd.id())
                    .copied()
                    .unwrap_or_default();
                infos[index].counters.push(CounterInfo {
                    tid: event_fd.thread_id(),
                    cpu: event_fd.cpu(),
                    counter,
                });
            }
        }
        out.extend(infos);
        Ok(())
    }

    /// Create the reader thread that will own the mapped kernel buffers.
    pub fn mmap_event_files(
        &mut self,
        min_mmap_pages: usize,
        max_mmap_pages: usize,
        record_buffer_size: usize,
        exclude_perf: bool,
    ) -> Result<()> {
        let attr = &self.groups[0].selections[0].event_attr;
        let single_attr = self.groups.len() == 1 && self.groups[0].selections.len() == 1;
        self.read_thread = Some(RecordReadThread::new(
            record_buffer_size,
            attr.sample_type,
            attr.flags.sample_id_all() == 1,
            single_attr,
            exclude_perf,
        )?);
        self.mmap_pages = Some((min_mmap_pages, max_mmap_pages));
        Ok(())
    }

    /// Hand every open fd to the reader thread and register its wake
    /// descriptor with the reactor. `callback` receives each record pulled
    /// out of the record buffer.
    pub fn prepare_sample_reading(
        set: &Arc<Mutex<EventSelectionSet>>,
        event_loop: &mut IOEventLoop,
        callback: RecordCallback,
    ) -> Result<()> {
        let wake_fd = {
            let mut guard = set.lock().unwrap();
            guard.record_callback = Some(callback);
            guard.hand_fds_to_reader()?;
            guard
                .read_thread
                .as_ref()
                .map(|thread| thread.wake_fd())
                .context("mmap_event_files must be called before sample reading")?
        };
        let set = Arc::clone(set);
        event_loop.add_read_event(
            wake_fd,
            IOEventPriority::High,
            Box::new(move || set.lock().unwrap().read_mmap_event_data(true)),
        )?;
        Ok(())
    }

    fn hand_fds_to_reader(&mut self) -> Result<()> {
        let Some((min_pages, max_pages)) = self.mmap_pages else {
            bail!("mmap_event_files must be called before sample reading");
        };
        let Some(read_thread) = &self.read_thread else {
            bail!("mmap_event_files must be called before sample reading");
        };

        // One mapped buffer per cpu; additional fds on the same cpu
        // redirect their output into it. Any-cpu fds each get their own.
        let mut buffers = Vec::new();
        let mut ids = Vec::new();
        let mut cpu_leader: std::collections::HashMap<i32, usize> = std::collections::HashMap::new();
        let mut attr_index = 0usize;
        for group in &self.groups {
            for selection in &group.selections {
                let mut fd_ids = Vec::new();
                for event_fd in &selection.event_fds {
                    fd_ids.push(event_fd.id());
                    let cpu = event_fd.cpu();
                    if cpu >= 0 {
                        if let Some(&leader_index) = cpu_leader.get(&cpu) {
                            let leader: &MappedBufferOwner = &buffers[leader_index];
                            event_fd
                                .set_output(leader.owner_fd)
                                .map_err(anyhow::Error::from)
                                .with_context(|| {
                                    format!("failed to redirect output of {}", event_fd.name())
                                })?;
                            continue;
                        }
                    }
                    let buffer = create_buffer_with_backoff(event_fd, min_pages, max_pages, attr_index)?;
                    if cpu >= 0 {
                        cpu_leader.insert(cpu, buffers.len());
                    }
                    buffers.push(MappedBufferOwner {
                        owner_fd: event_fd,
                        buffer: Some(buffer),
                    });
                }
                ids.push((attr_index, fd_ids));
                attr_index += 1;
            }
        }
        let buffers: Vec<_> = buffers
            .into_iter()
            .map(|mut owner| owner.buffer.take().unwrap())
            .collect();
        read_thread.add_buffers(buffers, ids)
    }

    pub fn sync_kernel_buffer(&self) -> Result<()> {
        match &self.read_thread {
            Some(thread) => thread.sync_kernel_buffer(),
            None => Ok(()),
        }
    }

    /// Deliver queued records to the callback, stopping after ~100 ms when
    /// `with_time_limit` so one drain can't starve the reactor.
    pub fn read_mmap_event_data(&mut self, with_time_limit: bool) -> Result<()> {
        const TIME_LIMIT_NS: u64 = 100_000_000;
        let start_time = environment::get_system_clock_ns();
        loop {
            let Some(record) = self.read_thread.as_ref().and_then(|t| t.get_record()) else {
                return Ok(());
            };
            if let Some(callback) = &mut self.record_callback {
                callback(&record)?;
            }
            if with_time_limit && environment::get_system_clock_ns() - start_time >= TIME_LIMIT_NS {
                return Ok(());
            }
        }
    }

    pub fn finish_read_mmap_event_data(&mut self) -> Result<()> {
        self.read_mmap_event_data(false)
    }

    /// Lost-record counts per event, in attr-index order.
    pub fn lost_counts(&self) -> Vec<(String, u64)> {
        let names = self.event_names();
        let counts = self
            .read_thread
            .as_ref()
            .map(|thread| thread.lost_counts())
            .unwrap_or_default();
        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name, counts.get(i).copied().unwrap_or(0)))
            .collect()
    }

    /// Periodically probe the explicit targets and exit the reactor when
    /// none of them is alive any more.
    pub fn stop_when_no_more_targets(
        set: &Arc<Mutex<EventSelectionSet>>,
        event_loop: &mut IOEventLoop,
        check_interval: Duration,
    ) -> Result<()> {
        let exit = event_loop.exit_handle();
        let set = Arc::clone(set);
        event_loop.add_periodic_event(
            check_interval,
            IOEventPriority::Low,
            Box::new(move || {
                set.lock().unwrap().check_monitored_targets(&exit);
                Ok(())
            }),
        )?;
        Ok(())
    }

    fn check_monitored_targets(&self, exit: &ExitHandle) {
        if !self.has_sampler() {
            exit.exit_loop();
            return;
        }
        let alive = self
            .threads
            .iter()
            .chain(self.processes.iter())
            .any(|&tid| environment::is_thread_alive(tid));
        if !alive {
            exit.exit_loop();
        }
    }

    /// Stop the reader thread (joining it) first, then drop every counter
    /// fd. Safe to call more than once.
    pub fn close_event_files(&mut self) {
        if let Some(mut read_thread) = self.read_thread.take() {
            if let Err(err) = read_thread.stop() {
                tracing::warn!("failed to stop record reader: {}", err);
            }
        }
        for group in &mut self.groups {
            for selection in &mut group.selections {
                selection.event_fds.clear();
            }
        }
    }
}

impl Drop for EventSelectionSet {
    fn drop(&mut self) {
        self.close_event_files();
    }
}

struct MappedBufferOwner<'a> {
    owner_fd: &'a EventFd,
    buffer: Option<crate::event_fd::MappedBuffer>,
}

/// Try mmap sizes from the largest allowed down to the smallest; the
/// kernel rejects large buffers when locked memory is tight.
fn create_buffer_with_backoff(
    event_fd: &EventFd,
    min_pages: usize,
    max_pages: usize,
    attr_index: usize,
) -> Result<crate::event_fd::MappedBuffer> {
    let mut pages = max_pages.next_power_of_two().max(1);
    let min_pages = min_pages.max(1);
    loop {
        match event_fd.create_mapped_buffer(pages, attr_index) {
            Ok(buffer) => return Ok(buffer),
            Err(err) if pages > min_pages => {
                tracing::debug!(
                    "mmap of {} pages failed ({}), retrying with {}",
                    pages,
                    err,
                    pages / 2
                );
                pages /= 2;
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to mmap buffer for {}", event_fd.name()));
            }
        }
    }
}

fn set_sample_rate_for_group(group: &mut EventSelectionGroup, rate: SampleRate) {
    group.set_sample_rate = true;
    for selection in &mut group.selections {
        match rate {
            SampleRate::Frequency(freq) => {
                selection.event_attr.flags.set_freq(1);
                selection.event_attr.sample.sample_freq = freq;
            }
            SampleRate::Period(period) => {
                selection.event_attr.flags.set_freq(0);
                selection.event_attr.sample.sample_period = period;
            }
        }
    }
}

fn is_branch_sampling_supported(catalog: &EventCatalog) -> bool {
    let Some(event_type) = catalog.find("cpu-cycles") else {
        return false;
    };
    let mut attr = default_perf_event_attr(&event_type);
    attr.sample_type |= PERF_SAMPLE_BRANCH_STACK;
    attr.branch_sample_type = PERF_SAMPLE_BRANCH_ANY;
    attr.flags.set_exclude_kernel(1);
    is_event_attr_supported(&attr, &event_type.name)
}

fn is_dwarf_callchain_sampling_supported(catalog: &EventCatalog) -> bool {
    // Kernel >= 3.18 has all patches needed for dwarf callchains.
    if matches!(environment::get_kernel_version(), Some(v) if v >= (3, 18)) {
        return true;
    }
    let Some(event_type) = catalog.find("cpu-clock") else {
        return false;
    };
    let mut attr = default_perf_event_attr(&event_type);
    attr.sample_type |= PERF_SAMPLE_CALLCHAIN | PERF_SAMPLE_REGS_USER | PERF_SAMPLE_STACK_USER;
    attr.flags.set_exclude_callchain_user(1);
    attr.flags.set_exclude_kernel(1);
    attr.sample_regs_user = environment::get_supported_reg_mask();
    attr.sample_stack_user = 8192;
    is_event_attr_supported(&attr, &event_type.name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_types::EventCatalog;

    fn catalog() -> Arc<EventCatalog> {
        Arc::new(EventCatalog::load())
    }

    fn stat_set() -> EventSelectionSet {
        EventSelectionSet::new(true, catalog())
    }

    fn perf_available() -> bool {
        let catalog = EventCatalog::load();
        let clock = catalog.find("cpu-clock").unwrap();
        let attr = default_perf_event_attr(&clock);
        is_event_attr_supported(&attr, "cpu-clock")
    }

    #[test]
    fn duplicate_event_names_are_rejected() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = stat_set();
        set.add_event("page-faults").unwrap();
        let err = set.add_event("page-faults").unwrap_err();
        assert!(err.to_string().contains("more than once"));
        // Same event with a different modifier is a different selection.
        set.add_event("page-faults:u").unwrap();
    }

    #[test]
    fn clock_events_reject_u_and_k_modifiers_for_stat() {
        let mut set = stat_set();
        assert!(set.add_event("cpu-clock:u").is_err());
        assert!(set.add_event("task-clock:k").is_err());
    }

    #[test]
    fn sample_type_is_unioned_across_the_set() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = EventSelectionSet::new(false, catalog());
        set.add_event("cpu-clock").unwrap();
        set.enable_fp_callchain_sampling();
        set.add_event("page-faults").unwrap();
        let mut sample_types = Vec::new();
        for group in &set.groups {
            for selection in &group.selections {
                sample_types.push(selection.event_attr.sample_type);
            }
        }
        assert_eq!(sample_types.len(), 2);
        assert!(sample_types.iter().all(|&t| t == sample_types[0]));
        assert_ne!(sample_types[0] & PERF_SAMPLE_CALLCHAIN, 0);
    }

    #[test]
    fn only_first_event_carries_sideband_toggles() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = EventSelectionSet::new(false, catalog());
        set.add_event("cpu-clock").unwrap();
        set.add_event("page-faults").unwrap();
        let first = &set.groups[0].selections[0].event_attr;
        let second = &set.groups[1].selections[0].event_attr;
        assert_eq!(first.flags.mmap(), 1);
        assert_eq!(first.flags.comm(), 1);
        assert_eq!(second.flags.mmap(), 0);
        assert_eq!(second.flags.comm(), 0);
    }

    #[test]
    fn stat_attrs_do_not_request_sideband() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = stat_set();
        set.add_event("cpu-clock").unwrap();
        assert_eq!(set.groups[0].selections[0].event_attr.flags.mmap(), 0);
    }

    #[test]
    fn tracepoint_filter_requires_a_tracepoint() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = stat_set();
        set.add_event("cpu-clock").unwrap();
        assert!(set.set_tracepoint_filter("pid != 0").is_err());
    }

    #[test]
    fn open_read_and_close_own_process() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = stat_set();
        set.add_event("cpu-clock").unwrap();
        set.add_event("page-faults").unwrap();
        set.add_monitored_threads([unsafe { libc::gettid() }]);
        set.open_event_files().unwrap();
        assert!(set.has_sampler());
        for group in &set.groups {
            for selection in &group.selections {
                assert!(!selection.event_fds.is_empty());
            }
        }

        let mut x = 0u64;
        for i in 0..100_000u64 {
            x = x.wrapping_add(std::hint::black_box(i));
        }
        std::hint::black_box(x);

        let counters = set.read_counters().unwrap();
        assert_eq!(counters.len(), 2);
        let clock = &counters[0];
        assert_eq!(clock.event_name, "cpu-clock");
        assert!(!clock.counters.is_empty());
        for info in &clock.counters {
            if info.counter.time_running > 0 {
                assert!(info.counter.time_enabled >= info.counter.time_running);
            }
        }

        set.close_event_files();
        assert!(!set.has_sampler());
        // Idempotent.
        set.close_event_files();
    }

    #[test]
    fn open_fails_when_every_cell_fails() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = stat_set();
        set.add_event("cpu-clock").unwrap();
        // A tid that can't exist.
        set.add_monitored_threads([i32::MAX - 1]);
        assert!(set.open_event_files().is_err());
    }

    #[test]
    fn add_counters_requires_single_group_and_sets_group_read() {
        if !perf_available() {
            eprintln!("skipping: perf_event_open not permitted");
            return;
        }
        let mut set = EventSelectionSet::new(false, catalog());
        set.add_event("cpu-clock").unwrap();
        set.add_counters(&["page-faults".to_string()]).unwrap();
        for selection in &set.groups[0].selections {
            assert_ne!(selection.event_attr.read_format & PERF_FORMAT_GROUP, 0);
            assert_ne!(selection.event_attr.sample_type & PERF_SAMPLE_READ, 0);
        }
        let added = &set.groups[0].selections[1];
        assert_eq!(added.event_attr.flags.freq(), 0);
        assert_eq!(unsafe { added.event_attr.sample.sample_period }, INFINITE_SAMPLE_PERIOD);

        set.add_event("instructions").unwrap();
        assert!(set.add_counters(&["cache-misses".to_string()]).is_err());
    }
}
