//! Single-threaded reactor over file-descriptor readability, signals and
//! timers, built on epoll with signalfd and timerfd so every event source
//! is just another pollable descriptor.
//!
//! Callbacks return `Result<()>`; an error terminates the loop with that
//! error. The loop exits cleanly only when a callback asks for it through
//! an [`ExitHandle`]. Within one wake-up pass, high-priority events are
//! dispatched before low-priority ones; ties are dispatched in an
//! unspecified order.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Lower value means higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IOEventPriority {
    High = 0,
    Low = 1,
}

pub type IOEventRef = usize;

pub type IOEventCallback = Box<dyn FnMut() -> Result<()>>;

enum EventKind {
    /// Readability or writability of a caller-owned descriptor.
    Fd { fd: RawFd, epoll_events: u32 },
    Signal { fd: OwnedFd },
    Timer {
        fd: OwnedFd,
        spec: libc::itimerspec,
        periodic: bool,
    },
}

struct IOEvent {
    kind: EventKind,
    priority: IOEventPriority,
    enabled: bool,
    callback: Option<IOEventCallback>,
}

impl IOEvent {
    fn raw_fd(&self) -> RawFd {
        match &self.kind {
            EventKind::Fd { fd, .. } => *fd,
            EventKind::Signal { fd } => fd.as_raw_fd(),
            EventKind::Timer { fd, .. } => fd.as_raw_fd(),
        }
    }

    fn epoll_events(&self) -> u32 {
        match &self.kind {
            EventKind::Fd { epoll_events, .. } => *epoll_events,
            _ => libc::EPOLLIN as u32,
        }
    }
}

/// Cloneable handle that asks the running loop to exit. The request takes
/// effect before the next callback is dispatched.
#[derive(Clone)]
pub struct ExitHandle(Arc<AtomicBool>);

impl ExitHandle {
    pub fn exit_loop(&self) {
        self.0.store(true, Ordering::Release);
    }
}

pub struct IOEventLoop {
    epoll_fd: OwnedFd,
    events: Vec<Option<IOEvent>>,
    exit: Arc<AtomicBool>,
    in_loop: bool,
}

fn duration_to_itimerspec(duration: Duration, periodic: bool) -> libc::itimerspec {
    // An all-zero it_value disarms a timerfd, so a zero duration is bumped
    // to the smallest arming value.
    let mut value = libc::timespec {
        tv_sec: duration.as_secs() as libc::time_t,
        tv_nsec: duration.subsec_nanos() as libc::c_long,
    };
    if value.tv_sec == 0 && value.tv_nsec == 0 {
        value.tv_nsec = 1;
    }
    let interval = if periodic {
        value
    } else {
        libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        }
    };
    libc::itimerspec {
        it_interval: interval,
        it_value: value,
    }
}

impl IOEventLoop {
    pub fn new() -> Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("epoll_create1 failed");
        }
        Ok(IOEventLoop {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: Vec::new(),
            exit: Arc::new(AtomicBool::new(false)),
            in_loop: false,
        })
    }

    pub fn exit_handle(&self) -> ExitHandle {
        ExitHandle(self.exit.clone())
    }

    fn register(&mut self, event: IOEvent) -> Result<IOEventRef> {
        let slot = self.events.len();
        self.epoll_add(event.raw_fd(), event.epoll_events(), slot)?;
        self.events.push(Some(event));
        Ok(slot)
    }

    fn epoll_add(&self, fd: RawFd, events: u32, slot: usize) -> Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: slot as u64,
        };
        if unsafe {
            libc::epoll_ctl(self.epoll_fd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut ev)
        } < 0
        {
            return Err(io::Error::last_os_error()).context("epoll_ctl(ADD) failed");
        }
        Ok(())
    }

    fn epoll_del(&self, fd: RawFd) -> Result<()> {
        if unsafe {
            libc::epoll_ctl(
                self.epoll_fd.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        } < 0
        {
            return Err(io::Error::last_os_error()).context("epoll_ctl(DEL) failed");
        }
        Ok(())
    }

    /// Call `callback` whenever reading `fd` would not block.
    pub fn add_read_event(
        &mut self,
        fd: RawFd,
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        self.register(IOEvent {
            kind: EventKind::Fd {
                fd,
                epoll_events: libc::EPOLLIN as u32,
            },
            priority,
            enabled: true,
            callback: Some(callback),
        })
    }

    /// Call `callback` whenever writing `fd` would not block.
    pub fn add_write_event(
        &mut self,
        fd: RawFd,
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        self.register(IOEvent {
            kind: EventKind::Fd {
                fd,
                epoll_events: libc::EPOLLOUT as u32,
            },
            priority,
            enabled: true,
            callback: Some(callback),
        })
    }

    pub fn add_signal_event(
        &mut self,
        sig: libc::c_int,
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        self.add_signal_events(&[sig], priority, callback)
    }

    /// Bind several signal numbers to one callback. The signals are blocked
    /// for this thread (and every thread spawned afterwards) and routed to
    /// a signalfd instead.
    pub fn add_signal_events(
        &mut self,
        sigs: &[libc::c_int],
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut mask);
            for &sig in sigs {
                libc::sigaddset(&mut mask, sig);
            }
            if libc::pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()) != 0 {
                bail!("pthread_sigmask failed: {}", io::Error::last_os_error());
            }
        }
        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_CLOEXEC | libc::SFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("signalfd failed");
        }
        self.register(IOEvent {
            kind: EventKind::Signal {
                fd: unsafe { OwnedFd::from_raw_fd(fd) },
            },
            priority,
            enabled: true,
            callback: Some(callback),
        })
    }

    /// Call `callback` every `duration`, measured on the monotonic clock.
    pub fn add_periodic_event(
        &mut self,
        duration: Duration,
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        self.add_timer_event(duration, true, priority, callback)
    }

    /// Call `callback` once, `duration` from now.
    pub fn add_one_time_event(
        &mut self,
        duration: Duration,
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        self.add_timer_event(duration, false, priority, callback)
    }

    fn add_timer_event(
        &mut self,
        duration: Duration,
        periodic: bool,
        priority: IOEventPriority,
        callback: IOEventCallback,
    ) -> Result<IOEventRef> {
        let fd = unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("timerfd_create failed");
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        let spec = duration_to_itimerspec(duration, periodic);
        if unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error()).context("timerfd_settime failed");
        }
        self.register(IOEvent {
            kind: EventKind::Timer { fd, spec, periodic },
            priority,
            enabled: true,
            callback: Some(callback),
        })
    }

    /// Suspend delivery of an event without unregistering it.
    pub fn disable_event(&mut self, event_ref: IOEventRef) -> Result<()> {
        let Some(event) = self.events.get_mut(event_ref).and_then(Option::as_mut) else {
            bail!("unknown event ref {}", event_ref);
        };
        if !event.enabled {
            return Ok(());
        }
        event.enabled = false;
        if let EventKind::Timer { fd, .. } = &event.kind {
            let disarm: libc::itimerspec = unsafe { std::mem::zeroed() };
            unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, &disarm, std::ptr::null_mut()) };
        }
        let fd = event.raw_fd();
        self.epoll_del(fd)
    }

    /// Resume a disabled event. Timers restart their full duration.
    pub fn enable_event(&mut self, event_ref: IOEventRef) -> Result<()> {
        let Some(event) = self.events.get_mut(event_ref).and_then(Option::as_mut) else {
            bail!("unknown event ref {}", event_ref);
        };
        if event.enabled {
            return Ok(());
        }
        event.enabled = true;
        if let EventKind::Timer { fd, spec, .. } = &event.kind {
            if unsafe { libc::timerfd_settime(fd.as_raw_fd(), 0, spec, std::ptr::null_mut()) } < 0 {
                return Err(io::Error::last_os_error()).context("timerfd_settime failed");
            }
        }
        let fd = event.raw_fd();
        let epoll_events = event.epoll_events();
        self.epoll_add(fd, epoll_events, event_ref)
    }

    /// Unregister an event. The ref becomes invalid.
    pub fn del_event(&mut self, event_ref: IOEventRef) -> Result<()> {
        let Some(event) = self.events.get_mut(event_ref) else {
            bail!("unknown event ref {}", event_ref);
        };
        let Some(inner) = event.take() else {
            bail!("event ref {} already deleted", event_ref);
        };
        if inner.enabled {
            self.epoll_del(inner.raw_fd())?;
        }
        Ok(())
    }

    /// Poll for events and dispatch callbacks until a callback requests
    /// exit or fails. Only one loop may run per reactor at a time.
    pub fn run_loop(&mut self) -> Result<()> {
        if self.in_loop {
            bail!("event loop is already running");
        }
        self.in_loop = true;
        let result = self.poll_loop();
        self.in_loop = false;
        self.exit.store(false, Ordering::Release);
        result
    }

    fn poll_loop(&mut self) -> Result<()> {
        const MAX_READY: usize = 64;
        let mut ready = [libc::epoll_event { events: 0, u64: 0 }; MAX_READY];
        while !self.exit.load(Ordering::Acquire) {
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
                return Err(err).context("epoll_wait failed");
            }
            let mut fired: Vec<(IOEventPriority, usize)> = ready[..n as usize]
                .iter()
                .filter_map(|ev| {
                    let slot = ev.u64 as usize;
                    self.events
                        .get(slot)
                        .and_then(Option::as_ref)
                        .map(|event| (event.priority, slot))
                })
                .collect();
            fired.sort_by_key(|(priority, _)| *priority);
            for (_, slot) in fired {
                if self.exit.load(Ordering::Acquire) {
                    break;
                }
                self.dispatch(slot)?;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, slot: usize) -> Result<()> {
        let Some(event) = self.events.get_mut(slot).and_then(Option::as_mut) else {
            return Ok(());
        };
        if !event.enabled {
            return Ok(());
        }
        let mut invocations = 1usize;
        let mut one_shot_fired = false;
        match &event.kind {
            EventKind::Timer { fd, periodic, .. } => {
                let mut expirations = 0u64;
                let n = unsafe {
                    libc::read(
                        fd.as_raw_fd(),
                        &mut expirations as *mut u64 as *mut libc::c_void,
                        8,
                    )
                };
                if n != 8 {
                    // Spurious wakeup; the timer hasn't actually expired.
                    return Ok(());
                }
                one_shot_fired = !*periodic;
            }
            EventKind::Signal { fd } => {
                // One callback per signal receipt; signalfd already
                // coalesces multiple pending deliveries of one signal.
                invocations = 0;
                let mut info: libc::signalfd_siginfo = unsafe { std::mem::zeroed() };
                loop {
                    let n = unsafe {
                        libc::read(
                            fd.as_raw_fd(),
                            &mut info as *mut _ as *mut libc::c_void,
                            std::mem::size_of::<libc::signalfd_siginfo>(),
                        )
                    };
                    if n != std::mem::size_of::<libc::signalfd_siginfo>() as isize {
                        break;
                    }
                    invocations += 1;
                }
                if invocations == 0 {
                    return Ok(());
                }
            }
            EventKind::Fd { .. } => {}
        }

        // Take the callback out of the slot so it can't alias the loop.
        let Some(mut callback) = event.callback.take() else {
            return Ok(());
        };
        let mut result = Ok(());
        for _ in 0..invocations {
            result = callback();
            if result.is_err() || self.exit.load(Ordering::Acquire) {
                break;
            }
        }
        if let Some(event) = self.events.get_mut(slot).and_then(Option::as_mut) {
            event.callback = Some(callback);
            if one_shot_fired {
                event.enabled = false;
                let fd = event.raw_fd();
                let _ = self.epoll_del(fd);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    #[test]
    fn one_time_timer_fires_once() {
        let mut event_loop = IOEventLoop::new().unwrap();
        let exit = event_loop.exit_handle();
        let count = Arc::new(Mutex::new(0));

        let fired = count.clone();
        event_loop
            .add_one_time_event(
                Duration::from_millis(10),
                IOEventPriority::Low,
                Box::new(move || {
                    *fired.lock().unwrap() += 1;
                    Ok(())
                }),
            )
            .unwrap();
        let exit2 = exit.clone();
        event_loop
            .add_one_time_event(
                Duration::from_millis(50),
                IOEventPriority::Low,
                Box::new(move || {
                    exit2.exit_loop();
                    Ok(())
                }),
            )
            .unwrap();
        event_loop.run_loop().unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn periodic_timer_fires_repeatedly_until_exit() {
        let mut event_loop = IOEventLoop::new().unwrap();
        let exit = event_loop.exit_handle();
        let count = Arc::new(Mutex::new(0));

        let fired = count.clone();
        event_loop
            .add_periodic_event(
                Duration::from_millis(5),
                IOEventPriority::Low,
                Box::new(move || {
                    let mut count = fired.lock().unwrap();
                    *count += 1;
                    if *count >= 4 {
                        exit.exit_loop();
                    }
                    Ok(())
                }),
            )
            .unwrap();
        let start = Instant::now();
        event_loop.run_loop().unwrap();
        assert_eq!(*count.lock().unwrap(), 4);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn read_event_sees_pipe_data() {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let mut event_loop = IOEventLoop::new().unwrap();
        let exit = event_loop.exit_handle();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen2 = seen.clone();
        event_loop
            .add_read_event(
                read_fd,
                IOEventPriority::Low,
                Box::new(move || {
                    let mut buf = [0u8; 16];
                    let n = unsafe {
                        libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 16)
                    };
                    seen2.lock().unwrap().extend_from_slice(&buf[..n as usize]);
                    exit.exit_loop();
                    Ok(())
                }),
            )
            .unwrap();

        unsafe { libc::write(write_fd, b"ping".as_ptr() as *const libc::c_void, 4) };
        event_loop.run_loop().unwrap();
        assert_eq!(&*seen.lock().unwrap(), b"ping");
        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
    }

    #[test]
    fn high_priority_dispatches_first() {
        let mut low_fds = [0i32; 2];
        let mut high_fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(low_fds.as_mut_ptr()) }, 0);
        assert_eq!(unsafe { libc::pipe(high_fds.as_mut_ptr()) }, 0);

        let mut event_loop = IOEventLoop::new().unwrap();
        let exit = event_loop.exit_handle();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_low = order.clone();
        let low_read = low_fds[0];
        let exit_low = exit.clone();
        event_loop
            .add_read_event(
                low_read,
                IOEventPriority::Low,
                Box::new(move || {
                    let mut buf = [0u8; 8];
                    unsafe { libc::read(low_read, buf.as_mut_ptr() as *mut libc::c_void, 8) };
                    order_low.lock().unwrap().push("low");
                    exit_low.exit_loop();
                    Ok(())
                }),
            )
            .unwrap();
        let order_high = order.clone();
        let high_read = high_fds[0];
        event_loop
            .add_read_event(
                high_read,
                IOEventPriority::High,
                Box::new(move || {
                    let mut buf = [0u8; 8];
                    unsafe { libc::read(high_read, buf.as_mut_ptr() as *mut libc::c_void, 8) };
                    order_high.lock().unwrap().push("high");
                    Ok(())
                }),
            )
            .unwrap();

        // Make both ready before the loop starts; they land in one pass.
        unsafe {
            libc::write(low_fds[1], b"x".as_ptr() as *const libc::c_void, 1);
            libc::write(high_fds[1], b"x".as_ptr() as *const libc::c_void, 1);
        }
        event_loop.run_loop().unwrap();
        let order = order.lock().unwrap();
        assert_eq!(order.first(), Some(&"high"));
        for fd in low_fds.iter().chain(high_fds.iter()) {
            unsafe { libc::close(*fd) };
        }
    }

    #[test]
    fn failing_callback_terminates_the_loop_with_error() {
        let mut event_loop = IOEventLoop::new().unwrap();
        event_loop
            .add_one_time_event(
                Duration::from_millis(1),
                IOEventPriority::Low,
                Box::new(|| anyhow::bail!("callback failed")),
            )
            .unwrap();
        let err = event_loop.run_loop().unwrap_err();
        assert!(err.to_string().contains("callback failed"));
    }

    #[test]
    fn signal_event_routes_through_signalfd() {
        let mut event_loop = IOEventLoop::new().unwrap();
        let exit = event_loop.exit_handle();
        let got_signal = Arc::new(AtomicBool::new(false));

        let got = got_signal.clone();
        event_loop
            .add_signal_event(
                libc::SIGUSR1,
                IOEventPriority::Low,
                Box::new(move || {
                    got.store(true, Ordering::Release);
                    exit.exit_loop();
                    Ok(())
                }),
            )
            .unwrap();
        event_loop
            .add_one_time_event(
                Duration::from_millis(5),
                IOEventPriority::Low,
                Box::new(|| {
                    unsafe { libc::raise(libc::SIGUSR1) };
                    Ok(())
                }),
            )
            .unwrap();
        event_loop.run_loop().unwrap();
        assert!(got_signal.load(Ordering::Acquire));
    }

    #[test]
    fn disabled_timer_does_not_fire() {
        let mut event_loop = IOEventLoop::new().unwrap();
        let exit = event_loop.exit_handle();
        let count = Arc::new(Mutex::new(0));

        let fired = count.clone();
        let timer_ref = event_loop
            .add_periodic_event(
                Duration::from_millis(2),
                IOEventPriority::Low,
                Box::new(move || {
                    *fired.lock().unwrap() += 1;
                    Ok(())
                }),
            )
            .unwrap();
        event_loop.disable_event(timer_ref).unwrap();
        event_loop
            .add_one_time_event(
                Duration::from_millis(20),
                IOEventPriority::Low,
                Box::new(move || {
                    exit.exit_loop();
                    Ok(())
                }),
            )
            .unwrap();
        event_loop.run_loop().unwrap();
        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn loop_can_be_run_again_after_exit() {
        let mut event_loop = IOEventLoop::new().unwrap();
        for _ in 0..2 {
            let exit = event_loop.exit_handle();
            event_loop
                .add_one_time_event(
                    Duration::from_millis(1),
                    IOEventPriority::Low,
                    Box::new(move || {
                        exit.exit_loop();
                        Ok(())
                    }),
                )
                .unwrap();
            event_loop.run_loop().unwrap();
        }
    }
}
