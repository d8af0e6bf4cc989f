//! One kernel counter handle: the file descriptor returned by
//! perf_event_open plus its ioctls, grouped reads, and the optional mapped
//! ring buffer samples are drained from.

use std::ffi::CString;
use std::io::{Error, ErrorKind};
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{fence, Ordering};

use nix::errno::Errno;
use nix::{ioctl_none, ioctl_read, ioctl_write_int_bad, ioctl_write_ptr_bad, request_code_none, request_code_write};

use crate::attr::{perf_event_attr, PERF_FLAG_FD_CLOEXEC};

extern "C" {
    fn syscall(number: libc::c_long, ...) -> libc::c_long;
}

const PERF_EVENT_MAGIC: u8 = b'$';
const PERF_EVENT_IOC_ENABLE: u8 = 0;
const PERF_EVENT_IOC_DISABLE: u8 = 1;
const PERF_EVENT_IOC_RESET: u8 = 3;
const PERF_EVENT_IOC_SET_OUTPUT: u8 = 5;
const PERF_EVENT_IOC_SET_FILTER: u8 = 6;
const PERF_EVENT_IOC_ID: u8 = 7;

ioctl_none!(perf_event_ioc_enable, PERF_EVENT_MAGIC, PERF_EVENT_IOC_ENABLE);
ioctl_none!(perf_event_ioc_disable, PERF_EVENT_MAGIC, PERF_EVENT_IOC_DISABLE);
ioctl_none!(perf_event_ioc_reset, PERF_EVENT_MAGIC, PERF_EVENT_IOC_RESET);
ioctl_write_int_bad!(
    perf_event_ioc_set_output,
    request_code_none!(PERF_EVENT_MAGIC, PERF_EVENT_IOC_SET_OUTPUT)
);
ioctl_write_ptr_bad!(
    perf_event_ioc_set_filter,
    request_code_write!(
        PERF_EVENT_MAGIC,
        PERF_EVENT_IOC_SET_FILTER,
        mem::size_of::<*const libc::c_char>()
    ),
    libc::c_char
);
ioctl_read!(perf_event_ioc_id, PERF_EVENT_MAGIC, PERF_EVENT_IOC_ID, u64);

/// One cumulative counter reading. Values only grow between resets; the
/// enabled/running times feed the multiplexing scale factor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PerfCounter {
    pub value: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub id: u64,
}

fn perf_event_open_raw(
    attr: &perf_event_attr,
    tid: libc::pid_t,
    cpu: libc::c_int,
    group_fd: libc::c_int,
    flags: libc::c_ulong,
) -> Result<RawFd, Error> {
    let fd = unsafe {
        syscall(
            libc::SYS_perf_event_open,
            attr as *const perf_event_attr,
            tid,
            cpu,
            group_fd,
            flags,
        )
    } as i32;
    if fd < 0 {
        return Err(Error::last_os_error());
    }
    Ok(fd)
}

#[derive(Debug)]
pub struct EventFd {
    fd: OwnedFd,
    tid: libc::pid_t,
    cpu: i32,
    id: u64,
    name: String,
}

impl EventFd {
    /// Create the kernel counter for (tid, cpu). Errors carry the raw errno
    /// so callers can classify EMFILE/EACCES/ENODEV.
    pub fn open(
        attr: &perf_event_attr,
        tid: libc::pid_t,
        cpu: i32,
        group_fd: Option<&EventFd>,
        name: &str,
    ) -> Result<EventFd, Error> {
        let group_raw = group_fd.map(|fd| fd.as_raw_fd()).unwrap_or(-1);
        let fd = perf_event_open_raw(attr, tid, cpu, group_raw, PERF_FLAG_FD_CLOEXEC)?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let mut id = 0u64;
        // Old kernels don't have the ID ioctl; the id then comes from the
        // first grouped read instead.
        match unsafe { perf_event_ioc_id(fd.as_raw_fd(), &mut id) } {
            Ok(_) => {}
            Err(Errno::ENOTTY) => id = 0,
            Err(err) => return Err(err.into()),
        }
        Ok(EventFd {
            fd,
            tid,
            cpu,
            id,
            name: name.to_string(),
        })
    }

    pub fn thread_id(&self) -> libc::pid_t {
        self.tid
    }

    pub fn cpu(&self) -> i32 {
        self.cpu
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_enable(&self, enable: bool) -> Result<(), Error> {
        let ret = if enable {
            unsafe { perf_event_ioc_enable(self.fd.as_raw_fd()) }
        } else {
            unsafe { perf_event_ioc_disable(self.fd.as_raw_fd()) }
        };
        ret.map(|_| ()).map_err(Error::from)
    }

    pub fn reset(&self) -> Result<(), Error> {
        unsafe { perf_event_ioc_reset(self.fd.as_raw_fd()) }
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Attach a tracepoint filter string to this counter.
    pub fn set_filter(&self, filter: &str) -> Result<(), Error> {
        let filter = CString::new(filter).map_err(|_| Error::from(ErrorKind::InvalidInput))?;
        unsafe { perf_event_ioc_set_filter(self.fd.as_raw_fd(), filter.as_ptr()) }
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Redirect this counter's samples into another counter's ring buffer.
    pub fn set_output(&self, target: &EventFd) -> Result<(), Error> {
        unsafe { perf_event_ioc_set_output(self.fd.as_raw_fd(), target.as_raw_fd()) }
            .map(|_| ())
            .map_err(Error::from)
    }

    /// Read the cumulative {value, time_enabled, time_running, id} quad.
    pub fn read_counter(&self) -> Result<PerfCounter, Error> {
        let mut buf = [0u64; 4];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                mem::size_of_val(&buf),
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        if (n as usize) < mem::size_of_val(&buf) {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("short counter read for {}", self.name),
            ));
        }
        Ok(PerfCounter {
            value: buf[0],
            time_enabled: buf[1],
            time_running: buf[2],
            id: buf[3],
        })
    }

    /// Grouped read: one sub-counter per member of the group, all sharing
    /// the leader's enabled/running times. Requires PERF_FORMAT_GROUP.
    pub fn read_group_counters(&self, group_size: usize) -> Result<Vec<PerfCounter>, Error> {
        // Layout: nr, time_enabled, time_running, then (value, id) pairs.
        let words = 3 + 2 * group_size;
        let mut buf = vec![0u64; words];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                words * mem::size_of::<u64>(),
            )
        };
        if n < 0 {
            return Err(Error::last_os_error());
        }
        let nr = buf[0] as usize;
        if nr > group_size || (n as usize) < (3 + 2 * nr) * mem::size_of::<u64>() {
            return Err(Error::new(
                ErrorKind::UnexpectedEof,
                format!("short grouped read for {}", self.name),
            ));
        }
        let mut counters = Vec::with_capacity(nr);
        for i in 0..nr {
            counters.push(PerfCounter {
                value: buf[3 + 2 * i],
                time_enabled: buf[1],
                time_running: buf[2],
                id: buf[4 + 2 * i],
            });
        }
        Ok(counters)
    }

    /// Map the kernel ring buffer: one header page followed by
    /// `pages` (a power of two) data pages.
    pub fn create_mapped_buffer(&self, pages: usize, attr_index: usize) -> Result<MappedBuffer, Error> {
        assert!(pages.is_power_of_two());
        let page_size = page_size();
        let mmap_len = (pages + 1) * page_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                mmap_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(MappedBuffer {
            base: base as *mut u8,
            mmap_len,
            data_offset: page_size,
            data_size: pages * page_size,
            fd: self.fd.as_raw_fd(),
            attr_index,
        })
    }
}

impl AsRawFd for EventFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Probe whether the kernel accepts an attribute by opening a counter on
/// the current thread and immediately closing it.
pub fn is_event_attr_supported(attr: &perf_event_attr, name: &str) -> bool {
    let tid = unsafe { libc::gettid() };
    EventFd::open(attr, tid, -1, None, name).is_ok()
}

pub fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Mirrors the head of struct perf_event_mmap_page. Only the fields up to
/// the data indices are touched; the 1 KiB reserved pad keeps data_head at
/// its kernel offset.
#[repr(C)]
#[allow(non_camel_case_types)]
struct perf_event_mmap_page {
    version: u32,
    compat_version: u32,
    lock: u32,
    index: u32,
    offset: i64,
    time_enabled: u64,
    time_running: u64,
    capabilities: u64,
    pmc_width: u16,
    time_shift: u16,
    time_mult: u32,
    time_offset: u64,
    time_zero: u64,
    size: u32,
    __reserved_1: u32,
    time_cycles: u64,
    time_mask: u64,
    __reserved: [u8; 116 * 8],
    data_head: u64,
    data_tail: u64,
    data_offset: u64,
    data_size: u64,
    aux_head: u64,
    aux_tail: u64,
    aux_offset: u64,
    aux_size: u64,
}

/// A view over one mapped kernel ring buffer. The fd stays owned by the
/// EventFd; the reader thread must be joined before that owner drops.
pub struct MappedBuffer {
    base: *mut u8,
    mmap_len: usize,
    data_offset: usize,
    data_size: usize,
    fd: RawFd,
    attr_index: usize,
}

// The mapping is only touched from the reader thread after hand-off.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    fn page(&self) -> *mut perf_event_mmap_page {
        self.base as *mut perf_event_mmap_page
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn attr_index(&self) -> usize {
        self.attr_index
    }

    /// Copy all bytes the kernel has published since the last drain into
    /// `sink` and advance data_tail past them. Returns the byte count.
    pub fn drain(&mut self, sink: &mut Vec<u8>) -> usize {
        sink.clear();
        // data_head free-runs; it must be read before the data, with an
        // acquire fence in between (the kernel's rmb pairing).
        let head = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page()).data_head)) } as usize;
        let tail = unsafe { ptr::read_volatile(ptr::addr_of!((*self.page()).data_tail)) } as usize;
        fence(Ordering::Acquire);
        let avail = head.wrapping_sub(tail);
        if avail == 0 {
            return 0;
        }
        debug_assert!(avail <= self.data_size);

        let mask = self.data_size - 1;
        let start = tail & mask;
        let data = unsafe { self.base.add(self.data_offset) };
        if start + avail <= self.data_size {
            sink.extend_from_slice(unsafe { std::slice::from_raw_parts(data.add(start), avail) });
        } else {
            let first = self.data_size - start;
            sink.extend_from_slice(unsafe { std::slice::from_raw_parts(data.add(start), first) });
            sink.extend_from_slice(unsafe { std::slice::from_raw_parts(data, avail - first) });
        }

        // Publish the new tail only after the copy is done so the kernel
        // doesn't overwrite bytes we are still reading.
        fence(Ordering::Release);
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*self.page()).data_tail), head as u64);
        }
        avail
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.mmap_len);
        }
    }
}
