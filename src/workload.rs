//! Fork-pipe-exec support for profiling a command.
//!
//! The child is forked immediately so counters can be opened against its
//! pid (with enable_on_exec), but blocks on a pipe until [`Workload::start`]
//! is called. A second pipe with `O_CLOEXEC` on the write end lets the
//! parent distinguish a successful exec (EOF) from a failed one (errno
//! bytes).

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

#[derive(Debug)]
pub struct Workload {
    pid: libc::pid_t,
    command_name: String,
    /// Write end of the "start" pipe. Writing signals the child to exec.
    start_write_fd: Option<i32>,
    /// Read end of the "exec" pipe. EOF means exec succeeded.
    exec_read_fd: Option<i32>,
    waited: bool,
}

impl Workload {
    /// Fork a child that waits to exec the given command.
    ///
    /// Must be called before any profiling threads are spawned; the child
    /// path only uses async-signal-safe calls and never returns.
    pub fn create(args: &[String]) -> Result<Workload> {
        if args.is_empty() {
            bail!("no command specified to run");
        }
        let resolved_path = resolve_executable(&args[0])?;
        let path_cstr = CString::new(resolved_path.as_os_str().as_bytes())
            .context("command path contains null byte")?;
        let arg_cstrings: Vec<CString> = args
            .iter()
            .map(|arg| {
                CString::new(arg.as_bytes())
                    .with_context(|| format!("argument contains null byte: {}", arg))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut argv: Vec<*const libc::c_char> = arg_cstrings.iter().map(|s| s.as_ptr()).collect();
        argv.push(std::ptr::null());

        let mut start_fds = [0i32; 2];
        if unsafe { libc::pipe2(start_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            bail!("pipe2 failed: {}", std::io::Error::last_os_error());
        }
        let mut exec_fds = [0i32; 2];
        if unsafe { libc::pipe2(exec_fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
            unsafe {
                libc::close(start_fds[0]);
                libc::close(start_fds[1]);
            }
            bail!("pipe2 failed: {}", std::io::Error::last_os_error());
        }

        let pid = unsafe { libc::fork() };
        match pid {
            -1 => {
                unsafe {
                    libc::close(start_fds[0]);
                    libc::close(start_fds[1]);
                    libc::close(exec_fds[0]);
                    libc::close(exec_fds[1]);
                }
                bail!("fork failed: {}", std::io::Error::last_os_error());
            }
            0 => {
                // Child. Only async-signal-safe calls from here; always
                // exec or _exit.
                unsafe {
                    libc::close(start_fds[1]);
                    libc::close(exec_fds[0]);

                    // The parent may have signals blocked and routed to a
                    // signalfd; the mask survives exec, so clear it.
                    let mut empty: libc::sigset_t = std::mem::zeroed();
                    libc::sigemptyset(&mut empty);
                    libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

                    let mut buf = [0u8; 1];
                    let n = libc::read(start_fds[0], buf.as_mut_ptr() as *mut libc::c_void, 1);
                    libc::close(start_fds[0]);
                    if n <= 0 {
                        // EOF means the parent died or gave up.
                        libc::_exit(1);
                    }

                    libc::execv(path_cstr.as_ptr(), argv.as_ptr());

                    // exec failed; report errno through the CLOEXEC pipe.
                    let errno = *libc::__errno_location();
                    let errno_bytes = errno.to_ne_bytes();
                    libc::write(
                        exec_fds[1],
                        errno_bytes.as_ptr() as *const libc::c_void,
                        4,
                    );
                    libc::close(exec_fds[1]);
                    libc::_exit(127);
                }
            }
            child_pid => {
                unsafe {
                    libc::close(start_fds[0]);
                    libc::close(exec_fds[1]);
                }
                let command_name = Path::new(&args[0])
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| args[0].clone());
                Ok(Workload {
                    pid: child_pid,
                    command_name,
                    start_write_fd: Some(start_fds[1]),
                    exec_read_fd: Some(exec_fds[0]),
                    waited: false,
                })
            }
        }
    }

    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    pub fn command_name(&self) -> &str {
        &self.command_name
    }

    /// Signal the child to exec and wait until the exec outcome is known.
    pub fn start(&mut self) -> Result<()> {
        let Some(fd) = self.start_write_fd.take() else {
            bail!("workload already started");
        };
        let buf: [u8; 1] = [1];
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 1) };
        let write_err = (ret < 0).then(std::io::Error::last_os_error);
        unsafe { libc::close(fd) };
        if let Some(err) = write_err {
            bail!("failed to signal workload to exec: {}", err);
        }
        self.wait_for_exec()
    }

    fn wait_for_exec(&mut self) -> Result<()> {
        let Some(fd) = self.exec_read_fd.take() else {
            return Ok(());
        };
        let mut buf = [0u8; 4];
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
        let read_err = (n < 0).then(std::io::Error::last_os_error);
        unsafe { libc::close(fd) };
        if let Some(err) = read_err {
            bail!("failed to read exec status pipe: {}", err);
        }
        if n > 0 {
            let errno = if n >= 4 {
                i32::from_ne_bytes(buf)
            } else {
                buf[0] as i32
            };
            self.reap(0);
            bail!(
                "failed to exec {}: {}",
                self.command_name,
                std::io::Error::from_raw_os_error(errno)
            );
        }
        Ok(())
    }

    /// Reap the child if it has exited; returns its exit status when
    /// available.
    pub fn try_wait(&mut self) -> Option<i32> {
        self.reap(libc::WNOHANG)
    }

    fn reap(&mut self, options: libc::c_int) -> Option<i32> {
        if self.waited {
            return None;
        }
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(self.pid, &mut status, options) };
        if ret == self.pid {
            self.waited = true;
            return Some(status);
        }
        None
    }
}

impl Drop for Workload {
    fn drop(&mut self) {
        if let Some(fd) = self.start_write_fd.take() {
            // Never started; closing the pipe makes the child exit.
            unsafe { libc::close(fd) };
        }
        if let Some(fd) = self.exec_read_fd.take() {
            unsafe { libc::close(fd) };
        }
        if !self.waited {
            unsafe {
                libc::kill(self.pid, libc::SIGKILL);
            }
            self.reap(0);
        }
    }
}

/// Resolve a command name to a full path by searching PATH.
fn resolve_executable(name: &str) -> Result<PathBuf> {
    use std::os::unix::fs::PermissionsExt;

    let is_executable = |path: &Path| {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    };

    if name.contains('/') {
        let path = Path::new(name);
        if !is_executable(path) {
            bail!("command not found or not executable: {}", name);
        }
        return Ok(path.to_path_buf());
    }
    if let Ok(path_var) = std::env::var("PATH") {
        for dir in path_var.split(':') {
            let candidate = Path::new(dir).join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }
    bail!("command '{}' not found in PATH", name);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_runs_after_start() {
        let mut workload = Workload::create(&["true".to_string()]).unwrap();
        assert!(workload.pid() > 0);
        assert_eq!(workload.command_name(), "true");
        workload.start().unwrap();
        // The child runs `true` and exits 0.
        let mut status = None;
        for _ in 0..500 {
            status = workload.try_wait();
            if status.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let status = status.expect("child did not exit");
        assert!(libc::WIFEXITED(status));
        assert_eq!(libc::WEXITSTATUS(status), 0);
    }

    #[test]
    fn exec_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let not_executable = dir.path().join("data");
        std::fs::write(&not_executable, b"not a program").unwrap();
        let err = Workload::create(&[not_executable.to_string_lossy().to_string()]).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert!(Workload::create(&["definitely-not-a-command-xyz".to_string()]).is_err());
    }

    #[test]
    fn dropped_workload_does_not_leak_the_child() {
        let pid;
        {
            let workload = Workload::create(&["sleep".to_string(), "100".to_string()]).unwrap();
            pid = workload.pid();
        }
        // The drop killed and reaped the child.
        assert!(!crate::environment::is_thread_alive(pid));
    }
}
