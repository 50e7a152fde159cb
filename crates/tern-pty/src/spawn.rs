//! Fork/exec of a child whose controlling terminal is the PTY slave.
//!
//! [`ChildProcessLauncher::spawn`] does all of its allocation (CStrings,
//! argv/envp pointer tables) before the fork. The child runs a fixed
//! sequence of plain syscalls and nothing else: become session leader,
//! claim the slave as controlling terminal, put the new process group in
//! the foreground, duplicate the slave onto stdio, drop the master, change
//! directory, reset every signal disposition to default, exec. That window
//! between fork and exec must stay async-signal-safe; an allocation there
//! can deadlock on another thread's heap lock and hangs like that do not
//! reproduce on demand.
//!
//! Exec failure exits with [`EXEC_FAILED_STATUS`]; since the program never
//! ran, no output precedes the exit, which is how the session tells a
//! failed exec apart from a program that legitimately exits 127.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

use crate::error::PtyError;
use crate::pty::PtyHandle;

/// Exit status of the child when exec itself failed.
pub const EXEC_FAILED_STATUS: i32 = 127;

/// Lifecycle of a spawned child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    NotStarted,
    Running,
    /// Exited normally with the given code.
    Exited(i32),
    /// Terminated by the given signal.
    Crashed(i32),
}

impl ChildState {
    pub fn is_running(&self) -> bool {
        matches!(self, ChildState::Running)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, ChildState::Exited(_) | ChildState::Crashed(_))
    }
}

/// What to execute and in which environment.
#[derive(Debug, Clone, Default)]
pub struct SpawnCommand {
    /// Absolute path or bare name resolved against `PATH`.
    pub program: String,
    /// Full argument vector, `argv[0]` included.
    pub argv: Vec<String>,
    /// Complete child environment as `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Initial working directory; the parent's when `None`.
    pub workdir: Option<PathBuf>,
}

/// A forked child attached to a PTY. Transitions to `Exited`/`Crashed`
/// exactly once, through reaping.
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    state: ChildState,
}

impl ChildProcess {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn state(&self) -> ChildState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Non-blocking reap. Returns the final state once, at the transition.
    pub fn try_reap(&mut self) -> Result<Option<ChildState>, PtyError> {
        if !self.state.is_running() {
            return Ok(None);
        }

        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                self.state = ChildState::Exited(code);
                debug!("child {} exited with code {code}", self.pid);
                Ok(Some(self.state))
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                self.state = ChildState::Crashed(sig as i32);
                debug!("child {} killed by signal {sig}", self.pid);
                Ok(Some(self.state))
            }
            Ok(_) => Ok(None),
            Err(Errno::ECHILD) => {
                // Already reaped elsewhere; nothing more to learn.
                self.state = ChildState::Exited(0);
                Ok(Some(self.state))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking reap. Guarantees the process table entry is gone.
    pub fn wait_reap(&mut self) -> Result<ChildState, PtyError> {
        if !self.state.is_running() {
            return Ok(self.state);
        }

        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Exited(_, code)) => {
                    self.state = ChildState::Exited(code);
                    return Ok(self.state);
                }
                Ok(WaitStatus::Signaled(_, sig, _)) => {
                    self.state = ChildState::Crashed(sig as i32);
                    return Ok(self.state);
                }
                Ok(_) => continue,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    self.state = ChildState::Exited(0);
                    return Ok(self.state);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Deliver `sig` to the child's pid.
    pub fn signal(&self, sig: i32) -> Result<(), PtyError> {
        let signal = Signal::try_from(sig).map_err(PtyError::from)?;
        kill(self.pid, signal).map_err(PtyError::from)
    }

    /// Poll for exit until `timeout`; true if the child exited in time.
    pub fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool, PtyError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.try_reap()?.is_some() || !self.state.is_running() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Graceful termination: SIGTERM plus a short bounded wait.
    pub fn terminate(&mut self) -> Result<bool, PtyError> {
        if !self.state.is_running() {
            return Ok(true);
        }
        match kill(self.pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        self.wait_for_exit(Duration::from_secs(1))
    }

    /// Forceful termination: SIGKILL and an immediate blocking reap, so no
    /// zombie can remain. Calling this on an already-exited child is a
    /// no-op, never a double reap.
    pub fn kill(&mut self) -> Result<(), PtyError> {
        if !self.state.is_running() {
            return Ok(());
        }
        info!("killing child {}", self.pid);
        match kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(e.into()),
        }
        self.wait_reap()?;
        Ok(())
    }
}

/// Forks and execs a program on the slave side of a PTY.
pub struct ChildProcessLauncher;

impl ChildProcessLauncher {
    /// Fork and exec `cmd` with `pty`'s slave as the controlling terminal.
    ///
    /// On return the parent has closed its slave copy and the master is
    /// non-blocking. Fails synchronously when the program cannot be
    /// resolved to an executable file.
    pub fn spawn(cmd: &SpawnCommand, pty: &mut PtyHandle) -> Result<ChildProcess, PtyError> {
        let program = resolve_program(&cmd.program)?;

        // Everything the child will touch is allocated here, before fork.
        let c_program = cstring(program.as_os_str().as_bytes())?;
        let c_argv: Vec<CString> = cmd
            .argv
            .iter()
            .map(|a| cstring(a.as_bytes()))
            .collect::<Result<_, _>>()?;
        let c_env: Vec<CString> = cmd
            .env
            .iter()
            .map(|e| cstring(e.as_bytes()))
            .collect::<Result<_, _>>()?;
        let c_workdir = match &cmd.workdir {
            Some(dir) => Some(cstring(dir.as_os_str().as_bytes())?),
            None => None,
        };

        let mut argv_ptrs: Vec<*const libc::c_char> =
            c_argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut env_ptrs: Vec<*const libc::c_char> = c_env.iter().map(|e| e.as_ptr()).collect();
        env_ptrs.push(std::ptr::null());

        pty.open_slave()?;
        let slave_fd = pty
            .slave_raw_fd()
            .ok_or_else(|| PtyError::SpawnFailed("pty has no slave descriptor".to_string()))?;
        let master_fd = pty.master_raw_fd().unwrap_or(-1);

        // SAFETY: the child branch only runs the async-signal-safe sequence
        // in child_exec and never returns into this address space.
        let fork_result = unsafe { fork() }
            .map_err(|e| PtyError::SpawnFailed(format!("fork failed: {e}")))?;

        match fork_result {
            ForkResult::Child => {
                // SAFETY: pointers built above stay alive because this
                // branch never unwinds back; only syscalls run from here.
                unsafe {
                    child_exec(
                        c_program.as_ptr(),
                        argv_ptrs.as_ptr(),
                        env_ptrs.as_ptr(),
                        c_workdir.as_ref().map_or(std::ptr::null(), |c| c.as_ptr()),
                        slave_fd,
                        master_fd,
                    )
                }
            }
            ForkResult::Parent { child } => {
                info!("spawned {} as pid {child}", program.display());
                pty.close_slave();
                set_nonblocking(master_fd)?;
                Ok(ChildProcess {
                    pid: child,
                    state: ChildState::Running,
                })
            }
        }
    }
}

/// Child-side setup between fork and exec. Plain syscalls only; every
/// failure path ends in `_exit`, never a return into the parent's code.
unsafe fn child_exec(
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
    workdir: *const libc::c_char,
    slave_fd: RawFd,
    master_fd: RawFd,
) -> ! {
    // Session leadership and controlling terminal. Best effort: TIOCSCTTY
    // can fail on platforms where the first opened tty already attached.
    let _ = set_ctty_raw(slave_fd);

    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        libc::_exit(1);
    }

    if master_fd >= 0 {
        libc::close(master_fd);
    }
    if slave_fd > libc::STDERR_FILENO {
        libc::close(slave_fd);
    }

    if !workdir.is_null() && libc::chdir(workdir) < 0 {
        libc::_exit(1);
    }

    // Restore default signal dispositions so the exec'd program, not our
    // inherited handlers, decides how to react to SIGINT/SIGTSTP and
    // friends. 64 covers the POSIX set plus the Linux realtime range;
    // SIGKILL/SIGSTOP and out-of-range numbers refuse the call, which is
    // fine.
    for sig in 1..=64 as libc::c_int {
        libc::signal(sig, libc::SIG_DFL);
    }
    let mut empty_set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty_set);
    libc::sigprocmask(libc::SIG_SETMASK, &empty_set, std::ptr::null_mut());

    libc::execve(program, argv, envp);
    libc::_exit(EXEC_FAILED_STATUS);
}

/// `setsid` + `TIOCSCTTY` + `tcsetpgrp`: become session leader and make the
/// slave this session's controlling terminal, with our process group in the
/// foreground. Async-signal-safe; callable between fork and exec.
pub(crate) fn set_ctty_raw(slave_fd: RawFd) -> Result<(), Errno> {
    // SAFETY: plain syscalls on a descriptor the caller owns.
    unsafe {
        libc::setsid();
        if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0 as libc::c_int) < 0 {
            return Err(Errno::last());
        }
        let _ = libc::tcsetpgrp(slave_fd, libc::getpid());
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<(), PtyError> {
    // SAFETY: fcntl on an owned descriptor; F_GETFL/F_SETFL touch only
    // the status flag word.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Errno::last().into());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

fn cstring(bytes: &[u8]) -> Result<CString, PtyError> {
    CString::new(bytes)
        .map_err(|_| PtyError::SpawnFailed("argument contains nul byte".to_string()))
}

/// Resolve a program to an executable path: used verbatim when it contains
/// a slash, searched along `PATH` otherwise. Failing here is what makes
/// `run()` fail synchronously instead of forking a doomed child.
pub(crate) fn resolve_program(program: &str) -> Result<PathBuf, PtyError> {
    if program.is_empty() {
        return Err(PtyError::SpawnFailed("empty program name".to_string()));
    }

    if program.contains('/') {
        let path = PathBuf::from(program);
        if is_executable_file(&path) {
            return Ok(path);
        }
        return Err(PtyError::SpawnFailed(format!(
            "{program} does not exist or is not executable"
        )));
    }

    let search = std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string());
    for dir in search.split(':').filter(|d| !d.is_empty()) {
        let candidate = Path::new(dir).join(program);
        if is_executable_file(&candidate) {
            return Ok(candidate);
        }
    }

    warn!("program {program} not found in PATH");
    Err(PtyError::SpawnFailed(format!(
        "{program} not found in PATH"
    )))
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{poll_fd, read_no_intr};
    use std::io::Write;

    fn test_env() -> Vec<String> {
        vec!["PATH=/usr/bin:/bin".to_string(), "TERM=dumb".to_string()]
    }

    /// Read master output until `needle` appears or `timeout` elapses.
    fn read_until(pty: &PtyHandle, needle: &[u8], timeout: Duration) -> Vec<u8> {
        let fd = pty.master_raw_fd().expect("master fd");
        let deadline = Instant::now() + timeout;
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];

        while Instant::now() < deadline {
            let revents = match poll_fd(fd, libc::POLLIN, 100) {
                Ok(r) => r,
                Err(_) => break,
            };
            if revents == 0 {
                continue;
            }
            match read_no_intr(fd, &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&buf[..n]);
                    if out
                        .windows(needle.len().max(1))
                        .any(|w| w == needle)
                    {
                        break;
                    }
                }
                Err(Errno::EAGAIN) => continue,
                Err(_) => break,
            }
        }
        out
    }

    #[test]
    fn test_spawn_echo_and_reap() {
        let mut pty = PtyHandle::open().expect("open pty");
        let cmd = SpawnCommand {
            program: "/bin/echo".to_string(),
            argv: vec!["echo".to_string(), "spawn-test-ok".to_string()],
            env: test_env(),
            workdir: None,
        };

        let mut child = ChildProcessLauncher::spawn(&cmd, &mut pty).expect("spawn echo");
        assert!(child.is_running());
        assert!(child.pid() > 0);
        // The parent's slave copy is gone after the fork.
        assert!(pty.slave_raw_fd().is_none());

        let out = read_until(&pty, b"spawn-test-ok", Duration::from_secs(2));
        assert!(
            out.windows(13).any(|w| w == b"spawn-test-ok"),
            "expected echo output, got {:?}",
            String::from_utf8_lossy(&out)
        );

        assert!(
            child.wait_for_exit(Duration::from_secs(2)).expect("wait"),
            "echo did not exit in time"
        );
        assert_eq!(child.state(), ChildState::Exited(0));
    }

    #[test]
    fn test_spawn_workdir() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let canonical = std::fs::canonicalize(dir.path()).expect("canonicalize");

        let mut pty = PtyHandle::open().expect("open pty");
        let cmd = SpawnCommand {
            program: "/bin/sh".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "pwd".to_string()],
            env: test_env(),
            workdir: Some(dir.path().to_path_buf()),
        };

        let mut child = ChildProcessLauncher::spawn(&cmd, &mut pty).expect("spawn sh");
        let needle = canonical.as_os_str().as_bytes().to_vec();
        let out = read_until(&pty, &needle, Duration::from_secs(2));
        assert!(
            out.windows(needle.len()).any(|w| w == needle.as_slice()),
            "pwd output {:?} does not contain {:?}",
            String::from_utf8_lossy(&out),
            canonical
        );
        child.wait_for_exit(Duration::from_secs(2)).expect("wait");
    }

    #[test]
    fn test_kill_leaves_no_zombie() {
        let mut pty = PtyHandle::open().expect("open pty");
        let cmd = SpawnCommand {
            program: "/bin/sh".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            env: test_env(),
            workdir: None,
        };

        let mut child = ChildProcessLauncher::spawn(&cmd, &mut pty).expect("spawn sleep");
        let pid = child.pid();

        child.kill().expect("kill");
        assert_eq!(child.state(), ChildState::Crashed(libc::SIGKILL));

        // kill() already reaped: the process table holds no entry for the
        // pid any more (signal 0 probes existence without delivering).
        let err = kill(Pid::from_raw(pid), None).expect_err("pid must be gone");
        assert_eq!(err, Errno::ESRCH);

        // A second kill on the exited child is a no-op, not a double reap.
        child.kill().expect("second kill");
        assert_eq!(child.state(), ChildState::Crashed(libc::SIGKILL));
    }

    #[test]
    fn test_terminate_graceful() {
        let mut pty = PtyHandle::open().expect("open pty");
        let cmd = SpawnCommand {
            program: "/bin/sh".to_string(),
            argv: vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
            env: test_env(),
            workdir: None,
        };

        let mut child = ChildProcessLauncher::spawn(&cmd, &mut pty).expect("spawn sleep");
        let exited = child.terminate().expect("terminate");
        assert!(exited, "SIGTERM did not stop the child in time");
        assert_eq!(child.state(), ChildState::Crashed(libc::SIGTERM));
    }

    #[test]
    fn test_spawn_missing_program_fails_synchronously() {
        let mut pty = PtyHandle::open().expect("open pty");
        let cmd = SpawnCommand {
            program: "/nonexistent/really-not-a-program".to_string(),
            argv: vec!["really-not-a-program".to_string()],
            env: test_env(),
            workdir: None,
        };

        let err = ChildProcessLauncher::spawn(&cmd, &mut pty).expect_err("must fail");
        assert!(matches!(err, PtyError::SpawnFailed(_)), "got {err:?}");
    }

    #[test]
    fn test_exec_failure_distinguished_status() {
        // Executable permission but unrunnable content: resolution passes,
        // execve fails with ENOEXEC, the child exits with the sentinel.
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&[0x00, 0x01, 0x02, 0x03]).expect("write");
        let path = file.path().to_path_buf();
        let mut perm = std::fs::metadata(&path).expect("metadata").permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(&path, perm).expect("chmod");

        let mut pty = PtyHandle::open().expect("open pty");
        let cmd = SpawnCommand {
            program: path.to_string_lossy().into_owned(),
            argv: vec!["garbage".to_string()],
            env: test_env(),
            workdir: None,
        };

        let mut child = ChildProcessLauncher::spawn(&cmd, &mut pty).expect("fork succeeds");
        assert!(
            child.wait_for_exit(Duration::from_secs(2)).expect("wait"),
            "child did not exit"
        );
        assert_eq!(child.state(), ChildState::Exited(EXEC_FAILED_STATUS));
    }

    #[test]
    fn test_resolve_program() {
        let sh = resolve_program("sh").expect("sh should be on PATH");
        assert!(sh.is_absolute());
        assert!(is_executable_file(&sh));

        assert!(matches!(
            resolve_program("definitely-not-a-real-program-480"),
            Err(PtyError::SpawnFailed(_))
        ));
        assert!(matches!(
            resolve_program(""),
            Err(PtyError::SpawnFailed(_))
        ));

        // A plain data file is rejected even though it exists.
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let path = file.path().to_string_lossy().into_owned();
        assert!(matches!(
            resolve_program(&path),
            Err(PtyError::SpawnFailed(_))
        ));
    }
}
