//! Event-type catalog: maps event names to kernel (type, config) pairs.
//!
//! Three sources feed the catalog: a static table of hardware, software and
//! cache events; tracepoints resolved from tracefs at lookup time; and
//! dynamic PMUs discovered under /sys/bus/event_source/devices, which also
//! carry a cpumask restricting where their events may be opened.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Result};
use regex::Regex;

use crate::attr::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Hardware,
    Software,
    Tracepoint,
    HwCache,
    Raw,
    Pmu,
}

#[derive(Debug, Clone)]
pub struct EventType {
    pub name: String,
    pub type_: u32,
    pub config: u64,
    pub class: EventClass,
    /// Set for events provided by a PMU with its own cpumask. Only these
    /// cpus are legal targets for the event.
    pub pmu_cpus: Option<Vec<i32>>,
}

impl EventType {
    fn new(name: &str, type_: u32, config: u64, class: EventClass) -> Self {
        EventType {
            name: name.to_string(),
            type_,
            config,
            class,
            pmu_cpus: None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(
            self.class,
            EventClass::Hardware | EventClass::HwCache | EventClass::Raw
        )
    }

    pub fn is_tracepoint(&self) -> bool {
        self.class == EventClass::Tracepoint
    }

    pub fn is_pmu(&self) -> bool {
        self.class == EventClass::Pmu
    }
}

fn cache_config(cache: u64, op: u64, result: u64) -> u64 {
    cache | (op << 8) | (result << 16)
}

fn static_event_types() -> Vec<EventType> {
    use EventClass::*;
    let mut types = vec![
        EventType::new("cpu-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES, Hardware),
        EventType::new("instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS, Hardware),
        EventType::new("cache-references", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_REFERENCES, Hardware),
        EventType::new("cache-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_CACHE_MISSES, Hardware),
        EventType::new("branch-instructions", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_INSTRUCTIONS, Hardware),
        EventType::new("branch-misses", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES, Hardware),
        EventType::new("bus-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_BUS_CYCLES, Hardware),
        EventType::new("stalled-cycles-frontend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_FRONTEND, Hardware),
        EventType::new("stalled-cycles-backend", PERF_TYPE_HARDWARE, PERF_COUNT_HW_STALLED_CYCLES_BACKEND, Hardware),
        EventType::new("ref-cycles", PERF_TYPE_HARDWARE, PERF_COUNT_HW_REF_CPU_CYCLES, Hardware),
        EventType::new("cpu-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_CLOCK, Software),
        EventType::new("task-clock", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK, Software),
        EventType::new("page-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS, Software),
        EventType::new("context-switches", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CONTEXT_SWITCHES, Software),
        EventType::new("cpu-migrations", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_CPU_MIGRATIONS, Software),
        EventType::new("minor-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MIN, Software),
        EventType::new("major-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_PAGE_FAULTS_MAJ, Software),
        EventType::new("alignment-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_ALIGNMENT_FAULTS, Software),
        EventType::new("emulation-faults", PERF_TYPE_SOFTWARE, PERF_COUNT_SW_EMULATION_FAULTS, Software),
    ];
    let cache_events: &[(&str, u64, u64, u64)] = &[
        ("L1-dcache-loads", PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("L1-dcache-load-misses", PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
        ("L1-dcache-stores", PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("L1-dcache-store-misses", PERF_COUNT_HW_CACHE_L1D, PERF_COUNT_HW_CACHE_OP_WRITE, PERF_COUNT_HW_CACHE_RESULT_MISS),
        ("L1-icache-loads", PERF_COUNT_HW_CACHE_L1I, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("L1-icache-load-misses", PERF_COUNT_HW_CACHE_L1I, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
        ("LLC-loads", PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("LLC-load-misses", PERF_COUNT_HW_CACHE_LL, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
        ("dTLB-loads", PERF_COUNT_HW_CACHE_DTLB, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("dTLB-load-misses", PERF_COUNT_HW_CACHE_DTLB, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
        ("iTLB-loads", PERF_COUNT_HW_CACHE_ITLB, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("iTLB-load-misses", PERF_COUNT_HW_CACHE_ITLB, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
        ("branch-loads", PERF_COUNT_HW_CACHE_BPU, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_ACCESS),
        ("branch-load-misses", PERF_COUNT_HW_CACHE_BPU, PERF_COUNT_HW_CACHE_OP_READ, PERF_COUNT_HW_CACHE_RESULT_MISS),
    ];
    for (name, cache, op, result) in cache_events {
        types.push(EventType::new(
            name,
            PERF_TYPE_HW_CACHE,
            cache_config(*cache, *op, *result),
            HwCache,
        ));
    }
    types
}

/// One event exposed by a dynamic PMU under /sys/bus/event_source/devices.
#[derive(Default, Debug, Clone)]
struct PmuEvent {
    config: u64,
}

#[derive(Default, Debug)]
struct PmuDevice {
    type_: u32,
    cpus: Vec<i32>,
    events: HashMap<String, PmuEvent>,
}

fn parse_pmu_events(dir: &Path, device: &mut PmuDevice) -> Result<()> {
    let event_re = Regex::new(r"event=0x([0-9a-fA-F]+)").unwrap();
    let umask_re = Regex::new(r"umask=0x([0-9a-fA-F]+)").unwrap();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        // Skip .scale/.unit companions of an event file.
        if name.contains('.') {
            continue;
        }
        let Ok(buf) = fs::read_to_string(&path) else {
            continue;
        };
        let mut event = PmuEvent::default();
        if let Some(cap) = event_re.captures(&buf) {
            event.config = u64::from_str_radix(&cap[1], 16)?;
        }
        if let Some(cap) = umask_re.captures(&buf) {
            event.config |= u64::from_str_radix(&cap[1], 16)? << 8;
        }
        device.events.insert(name.to_string(), event);
    }
    Ok(())
}

fn parse_pmu_device(dir: &Path) -> Result<PmuDevice> {
    let mut device = PmuDevice::default();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if path.is_dir() {
            if name == "events" {
                parse_pmu_events(&path, &mut device)?;
            }
        } else if name == "type" {
            device.type_ = fs::read_to_string(&path)?.trim().parse()?;
        } else if name == "cpumask" || name == "cpus" {
            device.cpus = crate::environment::parse_cpu_list(fs::read_to_string(&path)?.trim())?;
        }
    }
    Ok(device)
}

/// Immutable catalog of known event types, built once before any selection
/// set is constructed and injected where needed.
pub struct EventCatalog {
    static_types: HashMap<String, EventType>,
    pmus: HashMap<String, PmuDevice>,
    tracefs_dir: Option<&'static str>,
}

impl EventCatalog {
    pub fn load() -> Self {
        Self::load_from("/sys/bus/event_source/devices")
    }

    fn load_from(pmu_dir: &str) -> Self {
        let mut static_types = HashMap::new();
        for ty in static_event_types() {
            static_types.insert(ty.name.clone(), ty);
        }
        let mut pmus = HashMap::new();
        if let Ok(entries) = fs::read_dir(pmu_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                match parse_pmu_device(&path) {
                    Ok(device) => {
                        pmus.insert(name.to_string(), device);
                    }
                    Err(err) => {
                        tracing::debug!("skipping pmu {}: {}", name, err);
                    }
                }
            }
        }
        EventCatalog {
            static_types,
            pmus,
            tracefs_dir: tracefs_dir(),
        }
    }

    /// Look up an event by name. Raw `rNNN` events and tracepoint
    /// `subsys:name` events are resolved on the fly.
    pub fn find(&self, name: &str) -> Option<EventType> {
        if let Some(ty) = self.static_types.get(name) {
            return Some(ty.clone());
        }
        if let Some(hex) = name.strip_prefix('r') {
            if !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit()) {
                let config = u64::from_str_radix(hex, 16).ok()?;
                return Some(EventType::new(name, PERF_TYPE_RAW, config, EventClass::Raw));
            }
        }
        // PMU events are written "<pmu>/<event>/".
        if let Some((pmu_name, rest)) = name.split_once('/') {
            let event_name = rest.strip_suffix('/')?;
            let pmu = self.pmus.get(pmu_name)?;
            let event = pmu.events.get(event_name)?;
            let mut ty = EventType::new(name, pmu.type_, event.config, EventClass::Pmu);
            if !pmu.cpus.is_empty() {
                ty.pmu_cpus = Some(pmu.cpus.clone());
            }
            return Some(ty);
        }
        if let Some((subsys, event)) = name.split_once(':') {
            return self.find_tracepoint(subsys, event);
        }
        None
    }

    fn find_tracepoint(&self, subsys: &str, event: &str) -> Option<EventType> {
        let dir = self.tracefs_dir?;
        let id_path = format!("{}/events/{}/{}/id", dir, subsys, event);
        let id: u64 = fs::read_to_string(id_path).ok()?.trim().parse().ok()?;
        Some(EventType::new(
            &format!("{}:{}", subsys, event),
            PERF_TYPE_TRACEPOINT,
            id,
            EventClass::Tracepoint,
        ))
    }

    /// Event type id of the cpu_atom PMU on x86 hybrid parts, if present.
    pub fn intel_atom_event_type(&self) -> Option<u32> {
        self.pmus.get("cpu_atom").map(|pmu| pmu.type_)
    }
}

fn tracefs_dir() -> Option<&'static str> {
    const CANDIDATES: &[&str] = &["/sys/kernel/tracing", "/sys/kernel/debug/tracing"];
    CANDIDATES
        .iter()
        .find(|dir| Path::new(&format!("{}/events", dir)).is_dir())
        .copied()
}

/// Parsed "event[:modifier]" string: the resolved event type plus the
/// exclusion and precision flags the modifier letters encode.
#[derive(Debug, Clone)]
pub struct EventTypeAndModifier {
    pub name: String,
    pub event_type: EventType,
    pub modifier: String,
    pub exclude_user: bool,
    pub exclude_kernel: bool,
    pub exclude_hv: bool,
    pub exclude_host: bool,
    pub exclude_guest: bool,
    pub precise_ip: u8,
}

/// Split "name[:modifier]" and resolve the name against the catalog.
///
/// Tracepoint names contain a ':' themselves, so only a suffix consisting
/// entirely of modifier characters is treated as one.
pub fn parse_event_type(catalog: &EventCatalog, full_name: &str) -> Result<EventTypeAndModifier> {
    let is_modifier = |s: &str| !s.is_empty() && s.chars().all(|c| "ukhGHp".contains(c));
    let (event_name, modifier) = match full_name.rsplit_once(':') {
        Some((name, suffix)) if is_modifier(suffix) => (name, suffix),
        _ => (full_name, ""),
    };

    let Some(event_type) = catalog.find(event_name) else {
        bail!("Unknown event type '{}'", event_name);
    };

    let mut parsed = EventTypeAndModifier {
        name: full_name.to_string(),
        event_type,
        modifier: modifier.to_string(),
        exclude_user: false,
        exclude_kernel: false,
        exclude_hv: false,
        exclude_host: false,
        exclude_guest: false,
        precise_ip: 0,
    };
    let mut excluded = false;
    for c in modifier.chars() {
        match c {
            'u' | 'k' | 'h' => excluded = true,
            _ => {}
        }
    }
    if excluded {
        parsed.exclude_user = !modifier.contains('u');
        parsed.exclude_kernel = !modifier.contains('k');
        parsed.exclude_hv = !modifier.contains('h');
    }
    if modifier.contains('G') || modifier.contains('H') {
        parsed.exclude_guest = !modifier.contains('G');
        parsed.exclude_host = !modifier.contains('H');
    }
    parsed.precise_ip = modifier.chars().filter(|&c| c == 'p').count().min(3) as u8;
    Ok(parsed)
}

/// Default attribute for an event type: counting enabled, the sample
/// payload and read format every selection starts from.
pub fn default_perf_event_attr(event_type: &EventType) -> perf_event_attr {
    let mut attr = perf_event_attr::zeroed();
    attr.type_ = event_type.type_;
    attr.config = event_type.config;
    attr.sample_type = PERF_SAMPLE_IP | PERF_SAMPLE_TID | PERF_SAMPLE_TIME | PERF_SAMPLE_PERIOD;
    attr.read_format =
        PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID;
    attr.flags.set_sample_id_all(1);
    attr
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> EventCatalog {
        // Static table only; PMU discovery is pointed at an empty dir so
        // tests don't depend on the host's sysfs contents.
        EventCatalog::load_from("/nonexistent")
    }

    #[test]
    fn static_table_resolves_common_events() {
        let catalog = catalog();
        let cycles = catalog.find("cpu-cycles").unwrap();
        assert_eq!(cycles.type_, PERF_TYPE_HARDWARE);
        assert_eq!(cycles.config, PERF_COUNT_HW_CPU_CYCLES);
        assert!(cycles.is_hardware());

        let clock = catalog.find("task-clock").unwrap();
        assert_eq!(clock.type_, PERF_TYPE_SOFTWARE);
        assert!(!clock.is_hardware());

        let llc = catalog.find("LLC-load-misses").unwrap();
        assert_eq!(llc.type_, PERF_TYPE_HW_CACHE);
        assert_eq!(llc.config, cache_config(2, 0, 1));
    }

    #[test]
    fn raw_events_parse_hex_config() {
        let catalog = catalog();
        let raw = catalog.find("r1b").unwrap();
        assert_eq!(raw.type_, PERF_TYPE_RAW);
        assert_eq!(raw.config, 0x1b);
        assert!(catalog.find("rzz").is_none());
    }

    #[test]
    fn modifiers_set_exclusion_flags() {
        let catalog = catalog();
        let parsed = parse_event_type(&catalog, "cpu-cycles:u").unwrap();
        assert_eq!(parsed.modifier, "u");
        assert!(!parsed.exclude_user);
        assert!(parsed.exclude_kernel);
        assert!(parsed.exclude_hv);

        let parsed = parse_event_type(&catalog, "cpu-cycles:k").unwrap();
        assert!(parsed.exclude_user);
        assert!(!parsed.exclude_kernel);

        let parsed = parse_event_type(&catalog, "instructions").unwrap();
        assert!(parsed.modifier.is_empty());
        assert!(!parsed.exclude_user);
        assert!(!parsed.exclude_kernel);

        let parsed = parse_event_type(&catalog, "cpu-cycles:upp").unwrap();
        assert_eq!(parsed.precise_ip, 2);
    }

    #[test]
    fn unknown_event_is_an_error() {
        let catalog = catalog();
        assert!(parse_event_type(&catalog, "not-an-event").is_err());
    }

    #[test]
    fn default_attr_unifies_read_format() {
        let catalog = catalog();
        let cycles = catalog.find("cpu-cycles").unwrap();
        let attr = default_perf_event_attr(&cycles);
        assert_eq!(attr.type_, PERF_TYPE_HARDWARE);
        assert_ne!(attr.read_format & PERF_FORMAT_TOTAL_TIME_ENABLED, 0);
        assert_ne!(attr.read_format & PERF_FORMAT_TOTAL_TIME_RUNNING, 0);
        assert_ne!(attr.read_format & PERF_FORMAT_ID, 0);
        assert_eq!(attr.flags.sample_id_all(), 1);
    }
}
