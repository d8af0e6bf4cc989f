//! sperf library - the profiling core behind the `sperf` binary.
//!
//! The core owns event selection, opens kernel counter file descriptors
//! through `perf_event_open`, multiplexes their readiness through a
//! single-threaded reactor, drains mapped ring buffers on a dedicated
//! reader thread, and reports aggregate counter values.
//!
//! # Modules
//!
//! - [`attr`] - bit-exact `perf_event_attr` and kernel constants
//! - [`event_types`] - event name catalog (static, tracepoint, PMU)
//! - [`event_fd`] - one counter fd: open/read/ioctl/mmap/drain
//! - [`selection`] - event groups and the (thread, cpu) open matrix
//! - [`event_loop`] - epoll reactor over fds, signals and timers
//! - [`read_thread`] - ring-buffer drain thread and bounded record queue
//! - [`records`] - record frames and id attribution
//! - [`summary`] - counter scaling, rate comments and report output
//! - [`environment`] - /proc and /sys probes
//! - [`workload`] - fork-then-exec-on-signal child processes

pub mod attr;
pub mod environment;
pub mod event_fd;
pub mod event_loop;
pub mod event_types;
pub mod read_thread;
pub mod records;
pub mod selection;
pub mod summary;
pub mod workload;

pub use event_loop::{IOEventLoop, IOEventPriority};
pub use selection::{CounterInfo, CountersInfo, EventSelectionSet, SampleRate};
pub use summary::{CounterSummaries, CounterSummaryBuilder, ThreadInfo};
