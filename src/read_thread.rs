//! Dedicated thread that drains mapped kernel ring buffers into a bounded
//! in-memory record queue, waking the main reactor when records are ready.
//!
//! The thread owns the mapped views and its own epoll instance, isolated
//! from the main reactor. Communication is one eventfd per direction plus a
//! command channel: the main thread sends buffers/sync/stop commands, the
//! reader signals data availability. The record queue is single-producer
//! single-consumer under a mutex; when it fills up the producer drops the
//! newest records and counts them as lost rather than blocking the kernel
//! writer.

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::event_fd::MappedBuffer;
use crate::records::{Record, RecordParser};

struct WakeFd {
    eventfd: OwnedFd,
}

impl WakeFd {
    fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(WakeFd {
            eventfd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn signal(&self) {
        let val: u64 = 1;
        let _ = unsafe {
            libc::write(
                self.eventfd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            )
        };
    }

    fn clear(&self) {
        let mut val: u64 = 0;
        let _ = unsafe {
            libc::read(
                self.eventfd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                8,
            )
        };
    }

    fn fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }
}

/// Bounded FIFO of parsed records, capacity measured in bytes.
pub struct RecordBuffer {
    queue: VecDeque<Record>,
    bytes: usize,
    capacity: usize,
    lost: Vec<u64>,
}

impl RecordBuffer {
    fn new(capacity: usize) -> Self {
        RecordBuffer {
            queue: VecDeque::new(),
            bytes: 0,
            capacity,
            lost: Vec::new(),
        }
    }

    fn push(&mut self, record: Record) -> bool {
        if self.bytes + record.size() > self.capacity {
            self.count_lost(record.attr_index, 1);
            return false;
        }
        self.bytes += record.size();
        self.queue.push_back(record);
        true
    }

    fn pop(&mut self) -> Option<Record> {
        let record = self.queue.pop_front()?;
        self.bytes -= record.size();
        Some(record)
    }

    fn count_lost(&mut self, attr_index: usize, count: u64) {
        if self.lost.len() <= attr_index {
            self.lost.resize(attr_index + 1, 0);
        }
        self.lost[attr_index] += count;
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn over_watermark(&self) -> bool {
        self.bytes * 2 >= self.capacity
    }
}

enum ReaderCommand {
    AddBuffers(Vec<MappedBuffer>, Vec<(usize, Vec<u64>)>),
    Sync(Sender<()>),
    Stop,
}

struct ReaderState {
    epoll_fd: OwnedFd,
    buffers: Vec<MappedBuffer>,
    parser: RecordParser,
    scratch: Vec<u8>,
    record_buffer: Arc<Mutex<RecordBuffer>>,
    data_wake: Arc<WakeFd>,
    exclude_perf: bool,
    own_pid: u32,
}

const CMD_SLOT: u64 = u64::MAX;

impl ReaderState {
    fn add_buffer(&mut self, buffer: MappedBuffer) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: self.buffers.len() as u64,
        };
        if unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                buffer.fd(),
                &mut ev,
            )
        } < 0
        {
            return Err(io::Error::last_os_error()).context("epoll_ctl(ADD) on mapped buffer");
        }
        self.buffers.push(buffer);
        Ok(())
    }

    /// Copy everything the kernel has published in one buffer into the
    /// record queue. Signals the main reactor when the queue becomes
    /// non-empty or crosses the watermark.
    fn drain_buffer(&mut self, index: usize) {
        let Some(buffer) = self.buffers.get_mut(index) else {
            return;
        };
        if buffer.drain(&mut self.scratch) == 0 {
            return;
        }
        let default_attr = buffer.attr_index();
        let parser = &self.parser;
        let scratch = std::mem::take(&mut self.scratch);

        let mut record_buffer = self.record_buffer.lock().unwrap();
        let was_empty = record_buffer.is_empty();
        let mut pushed = false;
        parser.parse_frames(&scratch, default_attr, |record| {
            if self.exclude_perf {
                if let Some(pid) = parser.record_pid(&record) {
                    if pid == self.own_pid {
                        return;
                    }
                }
            }
            pushed |= record_buffer.push(record);
        });
        let wake = pushed && (was_empty || record_buffer.over_watermark());
        drop(record_buffer);
        self.scratch = scratch;
        if wake {
            self.data_wake.signal();
        }
    }

    fn drain_all(&mut self) {
        for index in 0..self.buffers.len() {
            self.drain_buffer(index);
        }
        // Teardown sync must hand over whatever is queued even if it is
        // below the watermark.
        if !self.record_buffer.lock().unwrap().is_empty() {
            self.data_wake.signal();
        }
    }

    fn run(&mut self, cmd_rx: Receiver<ReaderCommand>, cmd_wake: Arc<WakeFd>) {
        const MAX_READY: usize = 64;
        let mut ready = [libc::epoll_event { events: 0, u64: 0 }; MAX_READY];
        loop {
            let n = unsafe {
                libc::epoll_wait(
                    self.epoll_fd.as_raw_fd(),
                    ready.as_mut_ptr(),
                    MAX_READY as libc::c_int,
                    -1,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                tracing::warn!("record reader epoll_wait failed: {}", err);
                return;
            }
            for ev in &ready[..n as usize] {
                let slot = ev.u64;
                if slot == CMD_SLOT {
                    cmd_wake.clear();
                    while let Ok(cmd) = cmd_rx.try_recv() {
                        match cmd {
                            ReaderCommand::AddBuffers(buffers, ids) => {
                                for (attr_index, ids) in &ids {
                                    self.parser.add_ids(*attr_index, ids);
                                }
                                for buffer in buffers {
                                    if let Err(err) = self.add_buffer(buffer) {
                                        tracing::warn!("failed to watch mapped buffer: {}", err);
                                    }
                                }
                            }
                            ReaderCommand::Sync(ack) => {
                                self.drain_all();
                                let _ = ack.send(());
                            }
                            ReaderCommand::Stop => {
                                self.drain_all();
                                return;
                            }
                        }
                    }
                } else {
                    self.drain_buffer(slot as usize);
                }
            }
        }
    }
}

/// Handle to the reader thread. Owned by the selection set; `stop` must be
/// called (and the thread joined) before the counter fds are closed.
pub struct RecordReadThread {
    handle: Option<thread::JoinHandle<()>>,
    cmd_tx: Sender<ReaderCommand>,
    cmd_wake: Arc<WakeFd>,
    data_wake: Arc<WakeFd>,
    record_buffer: Arc<Mutex<RecordBuffer>>,
}

impl RecordReadThread {
    pub fn new(
        record_buffer_size: usize,
        sample_type: u64,
        sample_id_all: bool,
        single_attr: bool,
        exclude_perf: bool,
    ) -> Result<Self> {
        let epoll_fd = {
            let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if fd < 0 {
                return Err(io::Error::last_os_error()).context("epoll_create1 failed");
            }
            unsafe { OwnedFd::from_raw_fd(fd) }
        };
        let cmd_wake = Arc::new(WakeFd::new().context("eventfd failed")?);
        let data_wake = Arc::new(WakeFd::new().context("eventfd failed")?);
        let record_buffer = Arc::new(Mutex::new(RecordBuffer::new(record_buffer_size)));

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: CMD_SLOT,
        };
        if unsafe {
            libc::epoll_ctl(
                epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_ADD,
                cmd_wake.fd(),
                &mut ev,
            )
        } < 0
        {
            return Err(io::Error::last_os_error()).context("epoll_ctl(ADD) on command fd");
        }

        let (cmd_tx, cmd_rx) = channel();
        let mut state = ReaderState {
            epoll_fd,
            buffers: Vec::new(),
            parser: RecordParser::new(sample_type, sample_id_all, single_attr),
            scratch: Vec::new(),
            record_buffer: record_buffer.clone(),
            data_wake: data_wake.clone(),
            exclude_perf,
            own_pid: unsafe { libc::getpid() } as u32,
        };
        let thread_cmd_wake = cmd_wake.clone();
        let handle = thread::Builder::new()
            .name("record-reader".to_string())
            .spawn(move || state.run(cmd_rx, thread_cmd_wake))
            .context("failed to spawn record reader thread")?;

        Ok(RecordReadThread {
            handle: Some(handle),
            cmd_tx,
            cmd_wake,
            data_wake,
            record_buffer,
        })
    }

    /// The descriptor the main reactor watches for data availability.
    pub fn wake_fd(&self) -> RawFd {
        self.data_wake.fd()
    }

    /// Hand mapped buffers (and the kernel ids of the selections they
    /// belong to) over to the reader.
    pub fn add_buffers(
        &self,
        buffers: Vec<MappedBuffer>,
        ids: Vec<(usize, Vec<u64>)>,
    ) -> Result<()> {
        if self.handle.is_none() {
            bail!("record reader thread already stopped");
        }
        self.cmd_tx
            .send(ReaderCommand::AddBuffers(buffers, ids))
            .map_err(|_| anyhow::anyhow!("record reader thread is gone"))?;
        self.cmd_wake.signal();
        Ok(())
    }

    /// Checkpoint: copy everything the kernel has written so far into the
    /// record queue, then return.
    pub fn sync_kernel_buffer(&self) -> Result<()> {
        if self.handle.is_none() {
            return Ok(());
        }
        let (ack_tx, ack_rx) = channel();
        self.cmd_tx
            .send(ReaderCommand::Sync(ack_tx))
            .map_err(|_| anyhow::anyhow!("record reader thread is gone"))?;
        self.cmd_wake.signal();
        ack_rx
            .recv_timeout(Duration::from_secs(5))
            .context("record reader did not acknowledge sync")?;
        Ok(())
    }

    /// Pull one record; returns None when the queue is empty (and clears
    /// the wake signal so the reactor stops polling until more arrive).
    pub fn get_record(&self) -> Option<Record> {
        let mut buffer = self.record_buffer.lock().unwrap();
        match buffer.pop() {
            Some(record) => Some(record),
            None => {
                self.data_wake.clear();
                None
            }
        }
    }

    /// Lost-record counts per event selection index.
    pub fn lost_counts(&self) -> Vec<u64> {
        self.record_buffer.lock().unwrap().lost.clone()
    }

    /// Flush, unmap and join. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.cmd_tx.send(ReaderCommand::Stop);
        self.cmd_wake.signal();
        // Give the thread a grace period before blocking on the join, so a
        // wedged reader surfaces in the log rather than a silent hang.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if !handle.is_finished() {
            tracing::warn!("record reader thread is slow to stop; waiting");
        }
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("record reader thread panicked"))?;
        Ok(())
    }
}

impl Drop for RecordReadThread {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
