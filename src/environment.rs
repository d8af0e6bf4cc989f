//! Probes of the surrounding system: online cpus, /proc walks, kernel
//! version, resource limits, and the hardware quirks that affect where
//! counters may be opened.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};

pub fn get_online_cpus() -> Result<Vec<i32>> {
    let buf = fs::read_to_string("/sys/devices/system/cpu/online")
        .context("failed to read online cpu list")?;
    parse_cpu_list(buf.trim())
}

/// Parse a kernel cpu list like "0-3,5,7-8".
pub fn parse_cpu_list(list: &str) -> Result<Vec<i32>> {
    let mut cpus = Vec::new();
    if list.is_empty() {
        return Ok(cpus);
    }
    for item in list.split(',') {
        let item = item.trim();
        if let Some((start, end)) = item.split_once('-') {
            let start: i32 = start.trim().parse().context("bad cpu range")?;
            let end: i32 = end.trim().parse().context("bad cpu range")?;
            if start > end {
                bail!("bad cpu range '{}'", item);
            }
            cpus.extend(start..=end);
        } else {
            cpus.push(item.parse().context("bad cpu id")?);
        }
    }
    Ok(cpus)
}

pub fn get_all_processes() -> Vec<libc::pid_t> {
    let mut pids = Vec::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(pid) = name.parse::<libc::pid_t>() {
                    pids.push(pid);
                }
            }
        }
    }
    pids
}

pub fn get_threads_in_process(pid: libc::pid_t) -> Vec<libc::pid_t> {
    let mut tids = Vec::new();
    let task_dir = format!("/proc/{}/task", pid);
    if let Ok(entries) = fs::read_dir(task_dir) {
        for entry in entries.flatten() {
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(tid) = name.parse::<libc::pid_t>() {
                    tids.push(tid);
                }
            }
        }
    }
    tids
}

pub fn is_thread_alive(tid: libc::pid_t) -> bool {
    Path::new(&format!("/proc/{}", tid)).exists()
}

pub fn get_thread_name(tid: libc::pid_t) -> Option<String> {
    fs::read_to_string(format!("/proc/{}/comm", tid))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Thread name and owning process id, read from /proc/<tid>/status.
pub fn read_thread_name_and_pid(tid: libc::pid_t) -> Option<(String, libc::pid_t)> {
    let status = fs::read_to_string(format!("/proc/{}/status", tid)).ok()?;
    let mut name = None;
    let mut pid = None;
    for line in status.lines() {
        if let Some(value) = line.strip_prefix("Name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Tgid:") {
            pid = value.trim().parse().ok();
        }
        if name.is_some() && pid.is_some() {
            break;
        }
    }
    Some((name?, pid?))
}

pub fn get_kernel_version() -> Option<(u32, u32)> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    let release = release.to_str().ok()?;
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Check /proc/sys/kernel/perf_event_paranoid and explain what the current
/// value forbids. Opening may still fail; this exists to give a remediation
/// hint up front instead of a bare EACCES later.
pub fn check_perf_event_limit() -> Result<()> {
    let is_root = unsafe { libc::getuid() } == 0;
    if is_root {
        return Ok(());
    }
    let Ok(buf) = fs::read_to_string("/proc/sys/kernel/perf_event_paranoid") else {
        // Missing on some hardened kernels; let the open syscall decide.
        return Ok(());
    };
    let value: i32 = buf.trim().parse().unwrap_or(2);
    if value > 2 {
        bail!(
            "perf_event_paranoid is {}, which disallows profiling for non-root users.\n\
             Try `sysctl kernel.perf_event_paranoid=2` or run as root.",
            value
        );
    }
    Ok(())
}

/// Open file descriptors scale as events x threads x cpus, so raise the
/// soft NOFILE limit to the hard limit before opening the matrix.
pub fn allow_more_opened_files() -> Result<()> {
    let mut rlimit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlimit) } != 0 {
        bail!("getrlimit failed: {}", std::io::Error::last_os_error());
    }
    if rlimit.rlim_cur >= rlimit.rlim_max {
        return Ok(());
    }
    rlimit.rlim_cur = rlimit.rlim_max;
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit) } != 0 {
        bail!("setrlimit failed: {}", std::io::Error::last_os_error());
    }
    Ok(())
}

pub fn get_system_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Cpus backed by the cpu_atom PMU on x86 hybrid parts. Raw events opened
/// on these cpus need the Atom PMU's own event type.
pub fn get_x86_intel_atom_cpus() -> HashSet<i32> {
    let mut cpus = HashSet::new();
    if !cfg!(any(target_arch = "x86", target_arch = "x86_64")) {
        return cpus;
    }
    if let Ok(buf) = fs::read_to_string("/sys/bus/event_source/devices/cpu_atom/cpus") {
        if let Ok(list) = parse_cpu_list(buf.trim()) {
            cpus.extend(list);
        }
    }
    cpus
}

/// User register mask for dwarf stack sampling, one bit per register the
/// kernel can dump. Segment registers are left out on x86.
pub fn get_supported_reg_mask() -> u64 {
    if cfg!(target_arch = "x86_64") {
        // AX..R15 without DS/ES/FS/GS.
        0xff0fff
    } else if cfg!(target_arch = "x86") {
        0x0fff
    } else if cfg!(target_arch = "aarch64") {
        // x0-x30, sp, pc.
        (1u64 << 33) - 1
    } else if cfg!(target_arch = "arm") {
        0xffff
    } else {
        0
    }
}

/// devfreq may use performance counters to calculate memory latency. Asking
/// devfreq to drop the memory latency governor while profiling frees those
/// counters for us. The original governor is restored on drop.
#[derive(Default)]
pub struct DevfreqCounters {
    mem_latency_governor_paths: Vec<String>,
}

impl DevfreqCounters {
    pub fn use_counters(&mut self) -> Result<()> {
        if unsafe { libc::getuid() } != 0 {
            bail!("--use-devfreq-counters needs root permission to set devfreq governors");
        }
        let devfreq_dir = "/sys/class/devfreq/";
        let Ok(entries) = fs::read_dir(devfreq_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let governor_path = entry.path().join("governor");
            if !governor_path.is_file() {
                continue;
            }
            let governor = fs::read_to_string(&governor_path)
                .with_context(|| format!("failed to read {}", governor_path.display()))?;
            if governor.trim() == "mem_latency" {
                fs::write(&governor_path, "performance")
                    .with_context(|| format!("failed to write {}", governor_path.display()))?;
                self.mem_latency_governor_paths
                    .push(governor_path.to_string_lossy().to_string());
            }
        }
        Ok(())
    }
}

impl Drop for DevfreqCounters {
    fn drop(&mut self) {
        for path in &self.mem_latency_governor_paths {
            let _ = fs::write(path, "mem_latency");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_list_parses_ranges_and_singles() {
        assert_eq!(parse_cpu_list("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpu_list("0-2,5,7-8").unwrap(), vec![0, 1, 2, 5, 7, 8]);
        assert_eq!(parse_cpu_list("4").unwrap(), vec![4]);
        assert_eq!(parse_cpu_list("").unwrap(), Vec::<i32>::new());
        assert!(parse_cpu_list("3-1").is_err());
        assert!(parse_cpu_list("a-b").is_err());
    }

    #[test]
    fn own_process_is_visible() {
        let pid = unsafe { libc::getpid() };
        assert!(is_thread_alive(pid));
        let tids = get_threads_in_process(pid);
        assert!(tids.contains(&pid));
        let (name, tgid) = read_thread_name_and_pid(pid).unwrap();
        assert!(!name.is_empty());
        assert_eq!(tgid, pid);
    }

    #[test]
    fn kernel_version_is_sane() {
        let (major, _minor) = get_kernel_version().unwrap();
        assert!(major >= 3);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = get_system_clock_ns();
        let b = get_system_clock_ns();
        assert!(b >= a);
    }
}
