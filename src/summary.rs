//! Counter summaries: scaling, aggregation, derived rate comments, and the
//! CSV / text report formats.

use std::collections::HashMap;
use std::io::Write;

use anyhow::Result;

use crate::event_fd::PerfCounter;
use crate::selection::CountersInfo;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub tid: libc::pid_t,
    pub pid: libc::pid_t,
    pub name: String,
}

/// Accumulated {value, time_enabled, time_running} triple. Deltas between
/// successive snapshots of one counter are always non-negative; a decrease
/// means the counter wrapped or was reset, which is a bug.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSum {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
}

impl CounterSum {
    pub fn from_counter(counter: &PerfCounter) -> Self {
        CounterSum {
            value: counter.value,
            time_enabled: counter.time_enabled,
            time_running: counter.time_running,
        }
    }

    pub fn to_counter(self, counter: &mut PerfCounter) {
        counter.value = self.value;
        counter.time_enabled = self.time_enabled;
        counter.time_running = self.time_running;
    }

    pub fn add(&mut self, other: &CounterSum) {
        self.value += other.value;
        self.time_enabled += other.time_enabled;
        self.time_running += other.time_running;
    }

    pub fn sub(&self, prev: &CounterSum) -> CounterSum {
        assert!(
            self.value >= prev.value
                && self.time_enabled >= prev.time_enabled
                && self.time_running >= prev.time_running,
            "counter went backwards: {:?} -> {:?}",
            prev,
            self
        );
        CounterSum {
            value: self.value - prev.value,
            time_enabled: self.time_enabled - prev.time_enabled,
            time_running: self.time_running - prev.time_running,
        }
    }
}

/// Insert thousands separators, e.g. 1234567 -> "1,234,567".
pub fn readable_count(count: u64) -> String {
    let digits = count.to_string();
    let mut result = String::new();
    let len = digits.len();
    for (i, c) in digits.chars().enumerate() {
        result.push(c);
        let remaining = len - i - 1;
        if remaining > 0 && remaining % 3 == 0 {
            result.push(',');
        }
    }
    result
}

#[derive(Debug, Clone)]
pub struct CounterSummary {
    pub type_name: String,
    pub modifier: String,
    pub group_id: usize,
    pub thread: Option<ThreadInfo>,
    pub cpu: i32,
    pub count: u64,
    pub runtime_in_ns: u64,
    /// time_enabled / time_running; > 1 means the counter was multiplexed
    /// and the count was scaled up. 0 marks a counter that never ran.
    pub scale: f64,
    pub auto_generated: bool,
    pub comment: String,
    csv: bool,
}

impl CounterSummary {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        type_name: &str,
        modifier: &str,
        group_id: usize,
        thread: Option<ThreadInfo>,
        cpu: i32,
        count: u64,
        runtime_in_ns: u64,
        scale: f64,
        auto_generated: bool,
        csv: bool,
    ) -> Self {
        CounterSummary {
            type_name: type_name.to_string(),
            modifier: modifier.to_string(),
            group_id,
            thread,
            cpu,
            count,
            runtime_in_ns,
            scale,
            auto_generated,
            comment: String::new(),
            csv,
        }
    }

    pub fn name(&self) -> String {
        if self.modifier.is_empty() {
            self.type_name.clone()
        } else {
            format!("{}:{}", self.type_name, self.modifier)
        }
    }

    pub fn not_run(&self) -> bool {
        self.scale == 0.0
    }

    pub fn multiplexed(&self) -> bool {
        self.scale > 1.0 + 1e-9
    }

    /// Whether two summaries cover the same time window. Same event group
    /// means the kernel scheduled them together; otherwise allow ~1% skew
    /// on time_enabled.
    pub fn is_monitored_at_the_same_time(&self, other: &CounterSummary) -> bool {
        if self.group_id == other.group_id {
            return true;
        }
        let near = |a: u64, b: u64| a as u128 * 100 <= b as u128 * 101;
        near(self.time_enabled_proxy(), other.time_enabled_proxy())
            && near(other.time_enabled_proxy(), self.time_enabled_proxy())
    }

    // runtime_in_ns is time_running summed over cells; with one target set
    // per selection set the windows track each other.
    fn time_enabled_proxy(&self) -> u64 {
        self.runtime_in_ns
    }

    pub fn readable_count_value(&self) -> String {
        if self.type_name == "cpu-clock" || self.type_name == "task-clock" {
            // The clock counters tick in nanoseconds.
            return format!("{:.6}(ms)", self.count as f64 / 1e6);
        }
        if self.csv {
            return self.count.to_string();
        }
        readable_count(self.count)
    }
}

const COMMON_EVENT_RATE_MAP: &[(&str, (&str, &str))] = &[
    ("cache-misses", ("cache-references", "miss rate")),
    ("branch-misses", ("branch-instructions", "miss rate")),
];

// Meaningful ratios between common ARM microarchitectural events.
const ARM_EVENT_RATE_MAP: &[(&str, (&str, &str))] = &[
    ("raw-l1i-cache-refill", ("raw-l1i-cache", "level 1 instruction cache refill rate")),
    ("raw-l1i-tlb-refill", ("raw-l1i-tlb", "level 1 instruction TLB refill rate")),
    ("raw-l1d-cache-refill", ("raw-l1d-cache", "level 1 data or unified cache refill rate")),
    ("raw-l1d-tlb-refill", ("raw-l1d-tlb", "level 1 data or unified TLB refill rate")),
    ("raw-l2d-cache-refill", ("raw-l2d-cache", "level 2 data or unified cache refill rate")),
    ("raw-l2i-cache-refill", ("raw-l2i-cache", "level 2 instruction cache refill rate")),
    ("raw-l3d-cache-refill", ("raw-l3d-cache", "level 3 data or unified cache refill rate")),
    ("raw-l2d-tlb-refill", ("raw-l2d-tlb", "level 2 data or unified TLB refill rate")),
    ("raw-l2i-tlb-refill", ("raw-l2i-tlb", "level 2 instruction TLB refill rate")),
    ("raw-bus-access", ("raw-bus-cycles", "bus accesses per cycle")),
    ("raw-ll-cache-miss", ("raw-ll-cache", "last level data or unified cache refill rate")),
    ("raw-dtlb-walk", ("raw-l1d-tlb", "data TLB miss rate")),
    ("raw-itlb-walk", ("raw-l1i-tlb", "instruction TLB miss rate")),
    ("raw-ll-cache-miss-rd", ("raw-ll-cache-rd", "memory read operation miss rate")),
    ("raw-remote-access-rd", ("raw-remote-access", "read accesses to another socket in a multi-socket system")),
    ("raw-l1d-cache-refill-rd", ("raw-l1d-cache-rd", "level 1 cache refill rate, read")),
    ("raw-l1d-cache-refill-wr", ("raw-l1d-cache-wr", "level 1 cache refill rate, write")),
    ("raw-l1d-tlb-refill-rd", ("raw-l1d-tlb-rd", "level 1 TLB refill rate, read")),
    ("raw-l1d-tlb-refill-wr", ("raw-l1d-tlb-wr", "level 1 TLB refill rate, write")),
    ("raw-l2d-cache-refill-rd", ("raw-l2d-cache-rd", "level 2 data cache refill rate, read")),
    ("raw-l2d-cache-refill-wr", ("raw-l2d-cache-wr", "level 2 data cache refill rate, write")),
    ("raw-l2d-tlb-refill-rd", ("raw-l2d-tlb-rd", "level 2 data TLB refill rate, read")),
];

pub struct CounterSummaries {
    summaries: Vec<CounterSummary>,
    csv: bool,
}

impl CounterSummaries {
    pub fn new(summaries: Vec<CounterSummary>, csv: bool) -> Self {
        CounterSummaries { summaries, csv }
    }

    pub fn summaries(&self) -> &[CounterSummary] {
        &self.summaries
    }

    pub fn find_summary(
        &self,
        type_name: &str,
        modifier: &str,
        thread: Option<&ThreadInfo>,
        cpu: i32,
    ) -> Option<&CounterSummary> {
        self.summaries.iter().find(|s| {
            s.type_name == type_name
                && s.modifier == modifier
                && s.thread.as_ref().map(|t| (t.tid, t.pid)) == thread.map(|t| (t.tid, t.pid))
                && s.cpu == cpu
        })
    }

    /// When an event was monitored with both u and k modifiers over the
    /// same window, synthesize their sum as an unmodified summary. A
    /// caller-supplied total for the same event wins over the synthetic
    /// one.
    pub fn auto_generate_summaries(&mut self) {
        for i in 0..self.summaries.len() {
            let s = &self.summaries[i];
            if s.modifier != "u" {
                continue;
            }
            let Some(other) =
                self.find_summary(&s.type_name, "k", s.thread.as_ref(), s.cpu)
            else {
                continue;
            };
            if !other.is_monitored_at_the_same_time(s) {
                continue;
            }
            if self
                .find_summary(&s.type_name, "", s.thread.as_ref(), s.cpu)
                .is_some()
            {
                continue;
            }
            let s = &self.summaries[i];
            let other = self
                .find_summary(&s.type_name, "k", s.thread.as_ref(), s.cpu)
                .unwrap();
            let summary = CounterSummary::new(
                &s.type_name,
                "",
                s.group_id,
                s.thread.clone(),
                s.cpu,
                s.count + other.count,
                s.runtime_in_ns,
                s.scale,
                true,
                self.csv,
            );
            self.summaries.push(summary);
        }
    }

    pub fn generate_comments(&mut self, duration_in_sec: f64) {
        for i in 0..self.summaries.len() {
            let comment = self.comment_for_summary(&self.summaries[i], duration_in_sec);
            self.summaries[i].comment = comment;
        }
    }

    fn comment_for_summary(&self, s: &CounterSummary, duration_in_sec: f64) -> String {
        let sep = if self.csv { ',' } else { ' ' };
        if s.type_name == "task-clock" {
            let run_sec = s.count as f64 / 1e9;
            let used_cpus = run_sec / duration_in_sec;
            return format!("{:.6}{}cpus used", used_cpus, sep);
        }
        if s.type_name == "cpu-clock" {
            return String::new();
        }
        if s.type_name == "cpu-cycles" {
            if s.runtime_in_ns == 0 {
                return String::new();
            }
            let ghz = s.count as f64 / s.runtime_in_ns as f64;
            return format!("{:.6}{}GHz", ghz, sep);
        }
        if s.type_name == "instructions" && s.count != 0 {
            if let Some(other) =
                self.find_summary("cpu-cycles", &s.modifier, s.thread.as_ref(), s.cpu)
            {
                if other.is_monitored_at_the_same_time(s) {
                    let cpi = other.count as f64 / s.count as f64;
                    return format!("{:.6}{}cycles per instruction", cpi, sep);
                }
            }
        }
        let rate_comment = self.rate_comment(s, sep);
        if !rate_comment.is_empty() {
            return rate_comment;
        }
        if s.runtime_in_ns == 0 {
            return String::new();
        }
        let runtime_in_sec = s.runtime_in_ns as f64 / 1e9;
        let rate = s.count as f64 / runtime_in_sec;
        if rate >= 1e9 - 1e5 {
            return format!("{:.3}{}G/sec", rate / 1e9, sep);
        }
        if rate >= 1e6 - 1e2 {
            return format!("{:.3}{}M/sec", rate / 1e6, sep);
        }
        if rate >= 1e3 {
            return format!("{:.3}{}K/sec", rate / 1e3, sep);
        }
        format!("{:.3}{}/sec", rate, sep)
    }

    /// Ratio of a miss-style event against its reference event, when both
    /// were monitored over the same window.
    fn rate_comment(&self, s: &CounterSummary, sep: char) -> String {
        let mut event_name = String::new();
        let mut rate_desc = "";
        if let Some((_, (name, desc))) = COMMON_EVENT_RATE_MAP
            .iter()
            .find(|(miss, _)| *miss == s.type_name)
        {
            event_name = name.to_string();
            rate_desc = desc;
        }
        if event_name.is_empty() && cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            if let Some((_, (name, desc))) = ARM_EVENT_RATE_MAP
                .iter()
                .find(|(miss, _)| *miss == s.type_name)
            {
                event_name = name.to_string();
                rate_desc = desc;
            }
        }
        if event_name.is_empty() {
            if let Some(stem) = s.type_name.strip_suffix("-misses") {
                event_name = format!("{}s", stem);
                rate_desc = "miss rate";
            }
        }
        if event_name.is_empty() {
            return String::new();
        }
        let Some(other) = self.find_summary(&event_name, &s.modifier, s.thread.as_ref(), s.cpu)
        else {
            return String::new();
        };
        if !other.is_monitored_at_the_same_time(s) || other.count == 0 {
            return String::new();
        }
        let miss_rate = s.count as f64 / other.count as f64;
        format!("{:.6}%{}{}", miss_rate * 100.0, sep, rate_desc)
    }

    pub fn any_multiplexed(&self) -> bool {
        self.summaries.iter().any(|s| s.multiplexed())
    }

    pub fn show(&self, out: &mut impl Write) -> Result<()> {
        let show_thread = self
            .summaries
            .first()
            .map(|s| s.thread.is_some())
            .unwrap_or(false);
        let show_cpu = self.summaries.first().map(|s| s.cpu != -1).unwrap_or(false);
        if self.csv {
            self.show_csv(out, show_thread, show_cpu)
        } else {
            self.show_text(out, show_thread, show_cpu)
        }
    }

    fn show_csv(&self, out: &mut impl Write, show_thread: bool, show_cpu: bool) -> Result<()> {
        for s in &self.summaries {
            if show_thread {
                let thread = s.thread.as_ref().unwrap();
                write!(out, "{},{},{},", thread.name, thread.pid, thread.tid)?;
            }
            if show_cpu {
                write!(out, "{},", s.cpu)?;
            }
            writeln!(
                out,
                "{},{},{},{}",
                s.readable_count_value(),
                s.name(),
                s.comment,
                if s.auto_generated { "(generated)," } else { "" }
            )?;
        }
        Ok(())
    }

    fn show_text(&self, out: &mut impl Write, show_thread: bool, show_cpu: bool) -> Result<()> {
        let mut titles: Vec<String> = Vec::new();
        if show_thread {
            titles.extend(["thread_name", "pid", "tid"].map(String::from));
        }
        if show_cpu {
            titles.push("cpu".to_string());
        }
        titles.push("count".to_string());
        titles.push("event_name".to_string());
        titles.push(" # count / runtime".to_string());

        let mut width: Vec<usize> = titles.iter().map(|t| t.len()).collect();
        // The last title is too long; don't let it widen its column.
        *width.last_mut().unwrap() = 0;

        for s in &self.summaries {
            let mut i = 0;
            if show_thread {
                let thread = s.thread.as_ref().unwrap();
                width[i] = width[i].max(thread.name.len());
                width[i + 1] = width[i + 1].max(thread.pid.to_string().len());
                width[i + 2] = width[i + 2].max(thread.tid.to_string().len());
                i += 3;
            }
            if show_cpu {
                width[i] = width[i].max(s.cpu.to_string().len());
                i += 1;
            }
            width[i] = width[i].max(s.readable_count_value().len());
            width[i + 1] = width[i + 1].max(s.name().len());
            width[i + 2] = width[i + 2].max(s.comment.len());
        }

        write!(out, "# ")?;
        for (i, title) in titles.iter().enumerate() {
            if title == "count" {
                write!(out, "{:>w$}", title, w = width[i])?;
            } else {
                write!(out, "{:<w$}", title, w = width[i])?;
            }
            if i + 1 < titles.len() {
                write!(out, "  ")?;
            }
        }
        writeln!(out)?;

        for s in &self.summaries {
            let mut i = 0;
            if show_thread {
                let thread = s.thread.as_ref().unwrap();
                write!(out, "  {:<w$}", thread.name, w = width[i])?;
                write!(out, "  {:<w$}", thread.pid, w = width[i + 1])?;
                write!(out, "  {:<w$}", thread.tid, w = width[i + 2])?;
                i += 3;
            }
            if show_cpu {
                write!(out, "  {:<w$}", s.cpu, w = width[i])?;
                i += 1;
            }
            writeln!(
                out,
                "  {:>cw$}  {:<nw$}   # {:<mw$}{}",
                s.readable_count_value(),
                s.name(),
                s.comment,
                if s.auto_generated { " (generated)" } else { "" },
                cw = width[i],
                nw = width[i + 1],
                mw = width[i + 2],
            )?;
        }
        Ok(())
    }
}

/// Aggregates raw counter readings into summaries, optionally split per
/// thread and/or per core, sorted by the configured keys.
pub struct CounterSummaryBuilder {
    report_per_thread: bool,
    report_per_core: bool,
    csv: bool,
    thread_map: HashMap<libc::pid_t, ThreadInfo>,
    sort_keys: Vec<String>,
    summaries: Vec<CounterSummary>,
}

pub const DEFAULT_SORT_KEYS: &[&str] = &["count_per_thread", "tid", "cpu", "count"];

pub fn check_sort_keys(keys: &[String]) -> Result<()> {
    for key in keys {
        match key.as_str() {
            "count" | "count_per_thread" | "cpu" | "pid" | "tid" | "comm" => {}
            other => anyhow::bail!("Unknown sort key: {}", other),
        }
    }
    Ok(())
}

impl CounterSummaryBuilder {
    pub fn new(
        report_per_thread: bool,
        report_per_core: bool,
        csv: bool,
        thread_map: HashMap<libc::pid_t, ThreadInfo>,
        sort_keys: Vec<String>,
    ) -> Self {
        CounterSummaryBuilder {
            report_per_thread,
            report_per_core,
            csv,
            thread_map,
            sort_keys,
            summaries: Vec::new(),
        }
    }

    pub fn add_counters_for_one_event(&mut self, info: &CountersInfo) {
        // Aggregate cells into (thread, cpu) buckets per the report mode.
        let mut sums: Vec<((Option<libc::pid_t>, i32), CounterSum)> = Vec::new();
        for counter_info in &info.counters {
            let tid_key = self.report_per_thread.then_some(counter_info.tid);
            let cpu_key = if self.report_per_core {
                counter_info.cpu
            } else {
                -1
            };
            let key = (tid_key, cpu_key);
            let sum = CounterSum::from_counter(&counter_info.counter);
            match sums.iter_mut().find(|(k, _)| *k == key) {
                Some((_, existing)) => existing.add(&sum),
                None => sums.push((key, sum)),
            }
        }
        for ((tid, cpu), sum) in sums {
            let thread = tid.map(|tid| {
                self.thread_map.get(&tid).cloned().unwrap_or(ThreadInfo {
                    tid,
                    pid: tid,
                    name: "<unknown>".to_string(),
                })
            });
            let (count, scale) = scale_count(&sum);
            self.summaries.push(CounterSummary::new(
                &info.event_name,
                &info.event_modifier,
                info.group_id,
                thread,
                cpu,
                count,
                sum.time_running,
                scale,
                false,
                self.csv,
            ));
        }
    }

    pub fn build(mut self) -> CounterSummaries {
        if self.report_per_thread || self.report_per_core {
            self.sort_summaries();
        }
        CounterSummaries::new(self.summaries, self.csv)
    }

    fn sort_summaries(&mut self) {
        let mut count_per_thread: HashMap<libc::pid_t, u64> = HashMap::new();
        for s in &self.summaries {
            if let Some(thread) = &s.thread {
                *count_per_thread.entry(thread.tid).or_default() += s.count;
            }
        }
        let keys = self.sort_keys.clone();
        self.summaries.sort_by(|a, b| {
            use std::cmp::Ordering;
            for key in &keys {
                let ord = match key.as_str() {
                    // Counts sort largest first.
                    "count" => b.count.cmp(&a.count),
                    "count_per_thread" => {
                        let a_count = a
                            .thread
                            .as_ref()
                            .and_then(|t| count_per_thread.get(&t.tid))
                            .copied()
                            .unwrap_or(0);
                        let b_count = b
                            .thread
                            .as_ref()
                            .and_then(|t| count_per_thread.get(&t.tid))
                            .copied()
                            .unwrap_or(0);
                        b_count.cmp(&a_count)
                    }
                    "cpu" => a.cpu.cmp(&b.cpu),
                    "pid" => thread_field(a, b, |t| t.pid),
                    "tid" => thread_field(a, b, |t| t.tid),
                    "comm" => {
                        let a_name = a.thread.as_ref().map(|t| t.name.as_str()).unwrap_or("");
                        let b_name = b.thread.as_ref().map(|t| t.name.as_str()).unwrap_or("");
                        a_name.cmp(b_name)
                    }
                    _ => Ordering::Equal,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }
}

fn thread_field(
    a: &CounterSummary,
    b: &CounterSummary,
    f: impl Fn(&ThreadInfo) -> libc::pid_t,
) -> std::cmp::Ordering {
    let a_val = a.thread.as_ref().map(&f).unwrap_or(-1);
    let b_val = b.thread.as_ref().map(&f).unwrap_or(-1);
    a_val.cmp(&b_val)
}

/// Scaled count and scale factor for a reading. time_enabled > time_running
/// means the kernel multiplexed the counter; the count is corrected by
/// enabled/running. A counter that never ran reports zero with scale 0.
fn scale_count(sum: &CounterSum) -> (u64, f64) {
    if sum.time_running < sum.time_enabled {
        if sum.time_running == 0 {
            return (0, 0.0);
        }
        let scale = sum.time_enabled as f64 / sum.time_running as f64;
        return ((sum.value as f64 * scale) as u64, scale);
    }
    (sum.value, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(type_name: &str, modifier: &str, count: u64, runtime: u64) -> CounterSummary {
        CounterSummary::new(
            type_name, modifier, 0, None, -1, count, runtime, 1.0, false, false,
        )
    }

    fn summaries(list: Vec<CounterSummary>) -> CounterSummaries {
        CounterSummaries::new(list, false)
    }

    #[test]
    fn readable_count_inserts_thousands_separators() {
        assert_eq!(readable_count(0), "0");
        assert_eq!(readable_count(999), "999");
        assert_eq!(readable_count(1000), "1,000");
        assert_eq!(readable_count(1234567), "1,234,567");
    }

    #[test]
    fn counter_sum_delta_is_exact() {
        let prev = CounterSum {
            value: 100,
            time_enabled: 1000,
            time_running: 900,
        };
        let cur = CounterSum {
            value: 180,
            time_enabled: 2000,
            time_running: 1800,
        };
        let delta = cur.sub(&prev);
        assert_eq!(delta.value, 80);
        assert_eq!(delta.time_enabled, 1000);
        assert_eq!(delta.time_running, 900);
    }

    #[test]
    #[should_panic(expected = "counter went backwards")]
    fn counter_sum_wrap_is_a_bug() {
        let prev = CounterSum {
            value: 100,
            time_enabled: 100,
            time_running: 100,
        };
        let cur = CounterSum {
            value: 50,
            time_enabled: 200,
            time_running: 200,
        };
        let _ = cur.sub(&prev);
    }

    #[test]
    fn scaling_corrects_for_multiplexing() {
        let (count, scale) = scale_count(&CounterSum {
            value: 100,
            time_enabled: 2000,
            time_running: 1000,
        });
        assert_eq!(count, 200);
        assert!((scale - 2.0).abs() < 1e-9);

        let (count, scale) = scale_count(&CounterSum {
            value: 100,
            time_enabled: 1000,
            time_running: 1000,
        });
        assert_eq!(count, 100);
        assert!((scale - 1.0).abs() < 1e-9);

        // Never ran: zero count, flagged by scale 0.
        let (count, scale) = scale_count(&CounterSum {
            value: 100,
            time_enabled: 1000,
            time_running: 0,
        });
        assert_eq!(count, 0);
        assert_eq!(scale, 0.0);
    }

    #[test]
    fn cpi_comment_is_cycles_over_instructions() {
        let mut s = summaries(vec![
            summary("instructions", "", 1000, 1_000_000),
            summary("cpu-cycles", "", 2500, 1_000_000),
        ]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "2.500000 cycles per instruction");
    }

    #[test]
    fn miss_rate_comment_is_percentage_of_reference() {
        let mut s = summaries(vec![
            summary("cache-misses", "", 10, 1_000_000),
            summary("cache-references", "", 100, 1_000_000),
        ]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "10.000000% miss rate");
    }

    #[test]
    fn miss_suffix_falls_back_to_pluralized_stem() {
        let mut s = summaries(vec![
            summary("dcache-misses", "", 5, 1_000_000),
            summary("dcaches", "", 50, 1_000_000),
        ]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "10.000000% miss rate");
    }

    #[test]
    fn task_clock_reports_cpus_used() {
        let mut s = summaries(vec![summary("task-clock", "", 2_000_000_000, 0)]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "2.000000 cpus used");
    }

    #[test]
    fn cpu_cycles_reports_ghz() {
        let mut s = summaries(vec![summary("cpu-cycles", "", 3_000_000, 1_000_000)]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "3.000000 GHz");
    }

    #[test]
    fn generic_events_report_si_rates() {
        let mut s = summaries(vec![summary("page-faults", "", 2_000, 1_000_000_000)]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "2.000 K/sec");

        let mut s = summaries(vec![summary("page-faults", "", 12, 1_000_000_000)]);
        s.generate_comments(1.0);
        assert_eq!(s.summaries()[0].comment, "12.000 /sec");
    }

    #[test]
    fn u_and_k_summaries_combine_into_generated_total() {
        let mut s = summaries(vec![
            summary("cpu-cycles", "u", 100, 1_000_000),
            summary("cpu-cycles", "k", 40, 1_000_000),
        ]);
        s.auto_generate_summaries();
        let total = s.find_summary("cpu-cycles", "", None, -1).unwrap();
        assert_eq!(total.count, 140);
        assert!(total.auto_generated);
    }

    #[test]
    fn user_supplied_total_wins_over_generated() {
        let mut s = summaries(vec![
            summary("cpu-cycles", "u", 100, 1_000_000),
            summary("cpu-cycles", "k", 40, 1_000_000),
            summary("cpu-cycles", "", 150, 1_000_000),
        ]);
        s.auto_generate_summaries();
        assert_eq!(s.summaries().len(), 3);
        let total = s.find_summary("cpu-cycles", "", None, -1).unwrap();
        assert_eq!(total.count, 150);
        assert!(!total.auto_generated);
    }

    #[test]
    fn disjoint_windows_do_not_combine() {
        let mut s = summaries(vec![
            {
                let mut s = summary("cpu-cycles", "u", 100, 1_000_000);
                s.group_id = 0;
                s
            },
            {
                let mut s = summary("cpu-cycles", "k", 40, 3_000_000);
                s.group_id = 1;
                s
            },
        ]);
        s.auto_generate_summaries();
        assert!(s.find_summary("cpu-cycles", "", None, -1).is_none());
    }

    #[test]
    fn clock_counts_render_in_milliseconds() {
        let s = summary("task-clock", "", 1_500_000, 0);
        assert_eq!(s.readable_count_value(), "1.500000(ms)");
    }

    #[test]
    fn csv_rows_have_fixed_columns() {
        let mut list = vec![summary("cache-misses", "", 10, 1_000_000)];
        list[0].comment = "10.000000%,miss rate".to_string();
        let mut s = CounterSummaries::new(list, true);
        s.summaries[0].csv = true;
        let mut out = Vec::new();
        s.show(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text, "10,cache-misses,10.000000%,miss rate,\n");
    }

    #[test]
    fn text_report_aligns_columns() {
        let mut s = summaries(vec![
            summary("cpu-cycles", "", 1_234_567, 1_000_000),
            summary("instructions", "", 1_000, 1_000_000),
        ]);
        s.generate_comments(1.0);
        let mut out = Vec::new();
        s.show(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("# "));
        assert!(lines[0].contains("count"));
        assert!(lines[0].contains("event_name"));
        assert!(lines[1].contains("1,234,567"));
        assert!(lines[1].contains("cpu-cycles"));
        assert!(lines[2].contains("instructions"));
    }

    #[test]
    fn per_thread_summaries_sort_by_count_per_thread() {
        let busy = ThreadInfo {
            tid: 2,
            pid: 1,
            name: "busy".to_string(),
        };
        let idle = ThreadInfo {
            tid: 3,
            pid: 1,
            name: "idle".to_string(),
        };
        let mut builder = CounterSummaryBuilder::new(
            true,
            false,
            false,
            HashMap::from([(2, busy.clone()), (3, idle.clone())]),
            DEFAULT_SORT_KEYS.iter().map(|s| s.to_string()).collect(),
        );
        builder.add_counters_for_one_event(&CountersInfo {
            group_id: 0,
            event_name: "cpu-clock".to_string(),
            event_modifier: String::new(),
            counters: vec![
                crate::selection::CounterInfo {
                    tid: 3,
                    cpu: 0,
                    counter: PerfCounter {
                        value: 10,
                        time_enabled: 100,
                        time_running: 100,
                        id: 1,
                    },
                },
                crate::selection::CounterInfo {
                    tid: 2,
                    cpu: 0,
                    counter: PerfCounter {
                        value: 1000,
                        time_enabled: 100,
                        time_running: 100,
                        id: 2,
                    },
                },
            ],
        });
        let summaries = builder.build();
        let all = summaries.summaries();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].thread.as_ref().unwrap().name, "busy");
        assert_eq!(all[1].thread.as_ref().unwrap().name, "idle");
    }

    #[test]
    fn cells_aggregate_when_not_split() {
        let mut builder = CounterSummaryBuilder::new(
            false,
            false,
            false,
            HashMap::new(),
            Vec::new(),
        );
        builder.add_counters_for_one_event(&CountersInfo {
            group_id: 0,
            event_name: "page-faults".to_string(),
            event_modifier: String::new(),
            counters: (0..4)
                .map(|cpu| crate::selection::CounterInfo {
                    tid: 1,
                    cpu,
                    counter: PerfCounter {
                        value: 25,
                        time_enabled: 100,
                        time_running: 100,
                        id: cpu as u64,
                    },
                })
                .collect(),
        });
        let summaries = builder.build();
        assert_eq!(summaries.summaries().len(), 1);
        assert_eq!(summaries.summaries()[0].count, 100);
    }
}
