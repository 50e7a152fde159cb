//! Terminal session lifecycle: program resolution, spawn, monitoring,
//! multi-view size negotiation and exit classification.
//!
//! A [`TerminalSession`] owns its PTY channel and child exclusively and
//! pushes everything outward through two capability interfaces wired at
//! construction: a [`PtyEventSink`] toward the external emulation (raw
//! bytes, EOF, write-drain), and an optional [`SessionObserver`] for
//! lifecycle and monitoring notifications. Keystrokes come back in through
//! the single [`TerminalSession::send_input`] path.
//!
//! State machine: `NotStarted → Starting → Running → Closing → Finished`,
//! with `Running → Finished` directly when the child exits unexpectedly.

use std::os::fd::{OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::rc::Weak;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::channel::AsyncPtyChannel;
use crate::error::PtyError;
use crate::pty::PtyHandle;
use crate::spawn::{
    ChildProcess, ChildProcessLauncher, ChildState, SpawnCommand, EXEC_FAILED_STATUS,
};

/// Unique identifier for a terminal session, handed out by the reactor's
/// monotonic factory.
pub type SessionId = u64;

/// Views narrower or shorter than this do not take part in size
/// negotiation, so a collapsed pane never shrinks the PTY to nothing.
const VIEW_LINES_THRESHOLD: u16 = 2;
const VIEW_COLUMNS_THRESHOLD: u16 = 2;

const DEFAULT_SHELL: &str = "/bin/sh";
const DEFAULT_TERM: &str = "xterm-256color";

/// Base variables copied from the parent environment when the caller did
/// not supply them, so a bare profile still yields a usable shell.
const INHERITED_VARS: &[&str] = &["PATH", "HOME", "USER", "SHELL", "LANG"];

/// Receiver for the session's byte stream, implemented by the external
/// emulation collaborator.
pub trait PtyEventSink {
    /// Called once per readiness-driven read with the bytes in child order.
    fn on_data(&mut self, bytes: &[u8]);

    /// The child closed its end of the PTY.
    fn on_eof(&mut self) {}

    /// The write buffer was flushed to the kernel completely.
    fn on_write_drained(&mut self) {}
}

/// Monitoring notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionNotification {
    /// First output after activity monitoring was armed.
    Activity,
    /// The silence timer elapsed with no output.
    Silence,
}

/// How a finished session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    NormalExit,
    NonZeroExit(i32),
    /// Abnormal termination by the given signal.
    Crashed(i32),
    UserRequested,
    /// Exec failed before the program produced any output.
    SpawnFailed,
}

/// Lifecycle notifications for embedders (tab chrome, notifications, ...).
pub trait SessionObserver {
    fn on_state_changed(&mut self, _state: SessionState) {}
    fn on_notification(&mut self, _note: SessionNotification) {}
    fn on_finished(&mut self, _outcome: ExitOutcome) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Starting,
    Running,
    Closing,
    Finished,
}

/// Size reporting interface of an attached display view. The session holds
/// views weakly; their lifetime belongs to the UI layer.
pub trait SessionView {
    fn lines(&self) -> u16;
    fn columns(&self) -> u16;
    fn is_hidden(&self) -> bool {
        false
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionProfile {
    /// Program to execute; falls back to `$SHELL`, then `/bin/sh`.
    pub program: Option<String>,
    /// Arguments appended after the program basename.
    pub arguments: Vec<String>,
    /// `KEY=VALUE` entries for the child environment.
    pub environment: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub initial_rows: u16,
    pub initial_cols: u16,
    /// Drives the `COLORFGBG` hint injected into the child environment.
    pub dark_background: bool,
    pub flow_control: bool,
    pub utf8_mode: bool,
    /// Erase control character; 0 leaves the platform default.
    pub erase_char: u8,
    /// Best-effort `WINDOWID` value for the child environment.
    pub window_id: u64,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            program: None,
            arguments: Vec::new(),
            environment: Vec::new(),
            working_dir: None,
            initial_rows: 24,
            initial_cols: 80,
            dark_background: false,
            flow_control: true,
            utf8_mode: true,
            erase_char: 0,
            window_id: 0,
        }
    }
}

/// One terminal tab's backend: a PTY channel, the child process and the
/// bookkeeping between them.
pub struct TerminalSession {
    id: SessionId,
    profile: SessionProfile,
    state: SessionState,

    channel: Option<AsyncPtyChannel>,
    child: Option<ChildProcess>,

    views: Vec<Weak<dyn SessionView>>,
    had_views: bool,

    monitor_activity: bool,
    monitor_silence: bool,
    notified_activity: bool,
    silence_seconds: u64,
    silence_deadline: Option<Instant>,

    auto_close: bool,
    wanted_close: bool,
    child_gone: bool,

    bytes_received: u64,
    exit_outcome: Option<ExitOutcome>,

    sink: Box<dyn PtyEventSink>,
    observer: Option<Box<dyn SessionObserver>>,

    scratch: Vec<u8>,
}

impl TerminalSession {
    pub fn new(id: SessionId, profile: SessionProfile, sink: Box<dyn PtyEventSink>) -> Self {
        Self {
            id,
            profile,
            state: SessionState::NotStarted,
            channel: None,
            child: None,
            views: Vec::new(),
            had_views: false,
            monitor_activity: false,
            monitor_silence: false,
            notified_activity: false,
            silence_seconds: 10,
            silence_deadline: None,
            auto_close: true,
            wanted_close: false,
            child_gone: false,
            bytes_received: 0,
            exit_outcome: None,
            sink,
            observer: None,
            scratch: Vec::new(),
        }
    }

    pub fn set_observer(&mut self, observer: Box<dyn SessionObserver>) {
        self.observer = Some(observer);
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, SessionState::Running)
    }

    /// Pid of the terminal process, once spawned.
    pub fn process_id(&self) -> Option<i32> {
        self.child.as_ref().map(ChildProcess::pid)
    }

    /// Total bytes delivered to the sink so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// How the session ended, once `Finished`.
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit_outcome
    }

    /// Whether the session tears down when its last view detaches.
    pub fn set_auto_close(&mut self, auto_close: bool) {
        self.auto_close = auto_close;
    }

    /// Direct access to the channel, e.g. for the bounded synchronous
    /// waits or suspend/resume. `None` before `run()` and after close.
    pub fn channel_mut(&mut self) -> Option<&mut AsyncPtyChannel> {
        self.channel.as_mut()
    }

    pub fn channel(&self) -> Option<&AsyncPtyChannel> {
        self.channel.as_ref()
    }

    /// Start the terminal process.
    ///
    /// Resolves the program through the fallback chain (explicit program,
    /// `$SHELL`, then the default shell), builds argv with the program
    /// basename as `argv[0]`, assembles the child environment, opens the
    /// PTY and spawns. `OpenFailed`/`SpawnFailed` are returned here
    /// synchronously; no started notification precedes a failed run.
    pub fn run(&mut self) -> Result<(), PtyError> {
        if self.state != SessionState::NotStarted {
            return Err(PtyError::SpawnFailed(format!(
                "session {} already started",
                self.id
            )));
        }

        let exec = self.resolve_exec();
        let argv = self.build_argv(&exec);
        let env = self.build_environment();

        let mut pty = PtyHandle::open()?;
        self.apply_terminal_settings(&pty);

        let (rows, cols) = self
            .negotiated_size()
            .unwrap_or((self.profile.initial_rows, self.profile.initial_cols));
        if let Err(e) = pty.set_win_size(rows, cols) {
            warn!("session {}: initial resize failed: {e}", self.id);
        }

        self.set_state(SessionState::Starting);

        let cmd = SpawnCommand {
            program: exec.clone(),
            argv,
            env,
            workdir: self.profile.working_dir.clone(),
        };

        match ChildProcessLauncher::spawn(&cmd, &mut pty) {
            Ok(child) => {
                info!(
                    "session {}: started {} as pid {}",
                    self.id,
                    exec,
                    child.pid()
                );
                self.child = Some(child);
                self.channel = Some(AsyncPtyChannel::new(pty));
                self.set_state(SessionState::Running);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::NotStarted);
                Err(e)
            }
        }
    }

    /// Drive an externally owned PTY master with no child process of our
    /// own; used to display or control a terminal another component runs.
    pub fn run_attached(&mut self, master: OwnedFd) -> Result<(), PtyError> {
        if self.state != SessionState::NotStarted {
            return Err(PtyError::SpawnFailed(format!(
                "session {} already started",
                self.id
            )));
        }

        let pty = PtyHandle::open_with_fd(master)?;
        self.apply_terminal_settings(&pty);

        self.set_state(SessionState::Starting);
        self.channel = Some(AsyncPtyChannel::new(pty));
        self.set_state(SessionState::Running);
        debug!("session {}: attached to external pty", self.id);
        Ok(())
    }

    fn resolve_exec(&self) -> String {
        let configured = self.profile.program.clone().unwrap_or_default();
        let mut exec = configured;

        if exec.is_empty() || (exec.starts_with('/') && !Path::new(&exec).exists()) {
            exec = std::env::var("SHELL").unwrap_or_default();
        }
        if exec.is_empty() || (exec.starts_with('/') && !Path::new(&exec).exists()) {
            warn!(
                "session {}: neither the configured program nor $SHELL resolves, \
                 falling back to {DEFAULT_SHELL}",
                self.id
            );
            exec = DEFAULT_SHELL.to_string();
        }
        exec
    }

    fn build_argv(&self, exec: &str) -> Vec<String> {
        let argv0 = if exec.contains('/') {
            Path::new(exec)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| exec.to_string())
        } else {
            exec.to_string()
        };

        let mut argv = vec![argv0];
        argv.extend(self.profile.arguments.iter().cloned());
        argv
    }

    fn build_environment(&self) -> Vec<String> {
        let mut env = self.profile.environment.clone();

        for key in INHERITED_VARS {
            if !has_var(&env, key) {
                if let Ok(value) = std::env::var(key) {
                    env.push(format!("{key}={value}"));
                }
            }
        }

        // An injected TERM never silently overwrites a caller-supplied one.
        if !has_var(&env, "TERM") {
            env.push(format!("TERM={DEFAULT_TERM}"));
        }
        set_var(&mut env, "COLORTERM", "truecolor");
        let fgbg = if self.profile.dark_background {
            "15;0"
        } else {
            "0;15"
        };
        set_var(&mut env, "COLORFGBG", fgbg);
        set_var(&mut env, "WINDOWID", &self.profile.window_id.to_string());

        env
    }

    fn apply_terminal_settings(&self, pty: &PtyHandle) {
        if let Err(e) = pty.set_flow_control(self.profile.flow_control) {
            warn!("session {}: cannot set flow control: {e}", self.id);
        }
        if let Err(e) = pty.set_utf8_mode(self.profile.utf8_mode) {
            warn!("session {}: cannot set utf8 mode: {e}", self.id);
        }
        if self.profile.erase_char != 0 {
            if let Err(e) = pty.set_erase(self.profile.erase_char) {
                warn!("session {}: cannot set erase char: {e}", self.id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Views and size negotiation
    // ------------------------------------------------------------------

    /// Attach a view. The session never owns view lifetime; a dropped view
    /// behaves like a removed one.
    pub fn add_view(&mut self, view: Weak<dyn SessionView>) {
        self.views.push(view);
        self.had_views = true;
        self.update_size();
    }

    /// Detach a view. Removing the last view auto-closes the session when
    /// auto-close is on.
    pub fn remove_view(&mut self, view: &Weak<dyn SessionView>) {
        self.views.retain(|w| !w.ptr_eq(view));
        if self.views.is_empty() && self.had_views {
            if self.auto_close {
                self.close();
            }
        } else {
            self.update_size();
        }
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Minimum rows/columns over all visible views at or above the 2x2
    /// threshold; `None` when no view qualifies.
    fn negotiated_size(&self) -> Option<(u16, u16)> {
        let mut min_rows: Option<u16> = None;
        let mut min_cols: Option<u16> = None;

        for weak in &self.views {
            let Some(view) = weak.upgrade() else { continue };
            if view.is_hidden() {
                continue;
            }
            let (rows, cols) = (view.lines(), view.columns());
            if rows < VIEW_LINES_THRESHOLD || cols < VIEW_COLUMNS_THRESHOLD {
                continue;
            }
            min_rows = Some(min_rows.map_or(rows, |m| m.min(rows)));
            min_cols = Some(min_cols.map_or(cols, |m| m.min(cols)));
        }

        min_rows.zip(min_cols)
    }

    /// Recompute the common view size and propagate it to the PTY and the
    /// foreground process group.
    pub fn update_size(&mut self) {
        self.prune_views();
        if let Some((rows, cols)) = self.negotiated_size() {
            self.set_window_size(rows, cols);
        }
    }

    /// Set the PTY size directly and signal the window change.
    pub fn set_window_size(&mut self, rows: u16, cols: u16) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        if let Err(e) = channel.pty().set_win_size(rows, cols) {
            warn!("session {}: resize to {rows}x{cols} failed: {e}", self.id);
            return;
        }
        debug!("session {}: resized to {rows}x{cols}", self.id);
        self.signal_window_change();
    }

    /// Nudge the child to redraw by bouncing the window size.
    pub fn refresh(&mut self) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };
        if let Ok((rows, cols)) = channel.pty().get_win_size() {
            let _ = channel.pty().set_win_size(rows, cols + 1);
            let _ = channel.pty().set_win_size(rows, cols);
            self.signal_window_change();
        }
    }

    fn signal_window_change(&self) {
        match self.foreground_process_group() {
            Some(pgrp) if pgrp > 0 => {
                let _ = killpg(Pid::from_raw(pgrp), Signal::SIGWINCH);
            }
            _ => {
                // No foreground group readable; fall back to the child pid.
                if let Some(child) = self.child.as_ref() {
                    if child.is_running() {
                        let _ = child.signal(libc::SIGWINCH);
                    }
                }
            }
        }
    }

    /// Process group currently reading the terminal, per `tcgetpgrp`.
    pub fn foreground_process_group(&self) -> Option<i32> {
        let fd = self.channel.as_ref()?.pty().master_raw_fd()?;
        // SAFETY: tcgetpgrp only queries the descriptor.
        let pgrp = unsafe { libc::tcgetpgrp(fd) };
        if pgrp > 0 {
            Some(pgrp)
        } else {
            None
        }
    }

    fn prune_views(&mut self) {
        self.views.retain(|w| w.strong_count() > 0);
        if self.views.is_empty()
            && self.had_views
            && self.auto_close
            && matches!(self.state, SessionState::Running)
        {
            self.close();
        }
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Arm or disarm activity monitoring. Arming resets the one-shot
    /// notification latch.
    pub fn set_monitor_activity(&mut self, monitor: bool) {
        self.monitor_activity = monitor;
        self.notified_activity = false;
    }

    pub fn is_monitor_activity(&self) -> bool {
        self.monitor_activity
    }

    /// Arm or disarm silence monitoring with the given window. The timer
    /// is single-shot and re-armed by every activity event.
    pub fn set_monitor_silence(&mut self, monitor: bool, seconds: u64) {
        self.silence_seconds = seconds;
        self.monitor_silence = monitor;
        self.silence_deadline = if monitor {
            Some(Instant::now() + Duration::from_secs(seconds))
        } else {
            None
        };
    }

    pub fn is_monitor_silence(&self) -> bool {
        self.monitor_silence
    }

    fn note_activity(&mut self) {
        if self.monitor_silence {
            self.silence_deadline =
                Some(Instant::now() + Duration::from_secs(self.silence_seconds));
        }
        // Notify on the first output after arming, then stay quiet until
        // the silence timer resets the latch; repeated bursts inside the
        // same window do not re-notify.
        if self.monitor_activity && !self.notified_activity {
            self.notified_activity = true;
            self.notify(SessionNotification::Activity);
        }
    }

    // ------------------------------------------------------------------
    // Reactor entry points
    // ------------------------------------------------------------------

    /// Which descriptor and readiness the reactor should watch, if any.
    pub(crate) fn poll_interest(&self) -> Option<(RawFd, i16)> {
        if !matches!(self.state, SessionState::Running | SessionState::Closing) {
            return None;
        }
        let channel = self.channel.as_ref()?;
        let mut events: i16 = 0;
        if channel.wants_read() {
            events |= libc::POLLIN;
        }
        if channel.wants_write() {
            events |= libc::POLLOUT;
        }
        if events == 0 {
            return None;
        }
        Some((channel.pty().master_raw_fd()?, events))
    }

    /// Earliest monitoring deadline, bounding the reactor's poll timeout.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    /// Read readiness: drain the kernel into the read buffer and forward
    /// one batch to the sink, in child order.
    pub(crate) fn on_readable(&mut self) {
        let mut data_len = 0usize;
        let mut saw_eof = false;
        let mut failed = false;

        match self.channel.as_mut() {
            None => return,
            Some(channel) => match channel.handle_readable() {
                Ok(event) => {
                    saw_eof = event.eof;
                    if event.bytes_read > 0 {
                        let available = channel.bytes_available();
                        if self.scratch.len() < available {
                            self.scratch.resize(available, 0);
                        }
                        data_len = channel.read(&mut self.scratch);
                    }
                }
                Err(e) => {
                    // A broken PTY and a dead child are the same observable
                    // event; route it into the normal reap path.
                    warn!("session {}: channel error, treating as exit: {e}", self.id);
                    failed = true;
                }
            },
        }

        if data_len > 0 {
            self.bytes_received += data_len as u64;
            self.note_activity();
            self.sink.on_data(&self.scratch[..data_len]);
        }
        if saw_eof {
            self.sink.on_eof();
        }
        if saw_eof || failed {
            self.child_gone = true;
            self.try_finish();
        }
    }

    /// Write readiness: flush what the kernel accepts and report when the
    /// queue drains.
    pub(crate) fn on_writable(&mut self) {
        let mut drained = false;
        let mut failed = false;

        match self.channel.as_mut() {
            None => return,
            Some(channel) => match channel.handle_writable() {
                Ok(written) => {
                    drained = written > 0 && channel.bytes_to_write() == 0;
                }
                Err(e) => {
                    warn!("session {}: write error, treating as exit: {e}", self.id);
                    failed = true;
                }
            },
        }

        if drained {
            self.sink.on_write_drained();
        }
        if failed {
            self.child_gone = true;
            self.try_finish();
        }
    }

    /// Timer and reaping tick, called once per reactor iteration.
    pub(crate) fn tick(&mut self, now: Instant) {
        if let Some(deadline) = self.silence_deadline {
            if now >= deadline {
                self.silence_deadline = None;
                if self.monitor_silence {
                    self.notify(SessionNotification::Silence);
                }
                // The silence timer is also what re-arms the activity
                // notification.
                self.notified_activity = false;
            }
        }

        if self.child_gone && matches!(self.state, SessionState::Running) {
            self.try_finish();
        }
    }

    // ------------------------------------------------------------------
    // Input and signals
    // ------------------------------------------------------------------

    /// Queue keystrokes or back-channel bytes for the child. All writes
    /// funnel through here, which serializes them on the reactor thread.
    pub fn send_input(&mut self, bytes: &[u8]) -> Result<(), PtyError> {
        match self.channel.as_mut() {
            Some(channel)
                if matches!(self.state, SessionState::Running | SessionState::Closing) =>
            {
                channel.send(bytes);
                Ok(())
            }
            _ => Err(PtyError::OpenFailed(format!(
                "session {} is not running",
                self.id
            ))),
        }
    }

    /// Deliver `sig` to the child and wait up to a second for it to exit.
    /// Returns whether it did.
    pub fn send_signal(&mut self, sig: i32) -> bool {
        let reaped = {
            let Some(child) = self.child.as_mut() else {
                return false;
            };
            if !child.is_running() {
                return false;
            }
            if child.signal(sig).is_err() {
                return false;
            }
            match child.wait_for_exit(Duration::from_secs(1)) {
                Ok(true) => Some(child.state()),
                _ => None,
            }
        };

        match reaped {
            Some(state) => {
                self.finish_from_child_state(state);
                true
            }
            None => false,
        }
    }

    /// Close the session: kill the child, reap it, and emit exactly one
    /// terminal notification. Safe to call from any state, any number of
    /// times.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Closing | SessionState::Finished) {
            return;
        }
        self.wanted_close = true;

        if self.state == SessionState::NotStarted {
            self.finish(ExitOutcome::UserRequested);
            return;
        }

        self.set_state(SessionState::Closing);

        let child_state = match self.child.as_mut() {
            Some(child) => {
                if let Err(e) = child.kill() {
                    warn!("session {}: kill failed: {e}", self.id);
                }
                Some(child.state())
            }
            None => None,
        };

        match child_state {
            Some(state) if state.is_finished() => self.finish_from_child_state(state),
            _ => self.finish(ExitOutcome::UserRequested),
        }
    }

    // ------------------------------------------------------------------
    // Exit classification
    // ------------------------------------------------------------------

    fn try_finish(&mut self) {
        if self.state == SessionState::Finished {
            return;
        }

        let reaped = match self.child.as_mut() {
            Some(child) => {
                if let Err(e) = child.try_reap() {
                    warn!("session {}: reap failed: {e}", self.id);
                }
                child.state()
            }
            None => {
                // Attached mode: EOF alone ends the session.
                let outcome = if self.wanted_close {
                    ExitOutcome::UserRequested
                } else {
                    ExitOutcome::NormalExit
                };
                self.finish(outcome);
                return;
            }
        };

        if reaped.is_finished() {
            self.finish_from_child_state(reaped);
        }
        // Still running: the child holds the PTY open elsewhere or has not
        // been reaped yet; the next tick retries.
    }

    fn finish_from_child_state(&mut self, state: ChildState) {
        match state {
            ChildState::Exited(code) => self.on_child_exited(code, None),
            ChildState::Crashed(sig) => self.on_child_exited(0, Some(sig)),
            _ => {}
        }
    }

    /// Classify the child's end and finish exactly once.
    fn on_child_exited(&mut self, code: i32, crashed: Option<i32>) {
        if self.state == SessionState::Finished {
            return;
        }

        let outcome = if self.wanted_close {
            ExitOutcome::UserRequested
        } else if let Some(sig) = crashed {
            ExitOutcome::Crashed(sig)
        } else if code == EXEC_FAILED_STATUS && self.bytes_received == 0 {
            // The distinguished exec-failure status with no preceding
            // output; a program that really exits 127 after producing
            // output is an ordinary non-zero exit.
            ExitOutcome::SpawnFailed
        } else if code == 0 {
            ExitOutcome::NormalExit
        } else {
            ExitOutcome::NonZeroExit(code)
        };

        self.finish(outcome);
    }

    fn finish(&mut self, outcome: ExitOutcome) {
        if self.state == SessionState::Finished {
            return;
        }
        if let Some(channel) = self.channel.as_mut() {
            channel.close();
        }
        self.exit_outcome = Some(outcome);
        self.set_state(SessionState::Finished);
        info!("session {} finished: {outcome:?}", self.id);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_finished(outcome);
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        self.state = state;
        if let Some(observer) = self.observer.as_mut() {
            observer.on_state_changed(state);
        }
    }

    fn notify(&mut self, note: SessionNotification) {
        debug!("session {}: {note:?}", self.id);
        if let Some(observer) = self.observer.as_mut() {
            observer.on_notification(note);
        }
    }
}

fn has_var(env: &[String], key: &str) -> bool {
    env.iter()
        .any(|entry| entry.len() > key.len() && entry.starts_with(key) && entry.as_bytes()[key.len()] == b'=')
}

fn set_var(env: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{key}={value}");
    for existing in env.iter_mut() {
        if has_var(std::slice::from_ref(existing), key) {
            *existing = entry;
            return;
        }
    }
    env.push(entry);
}
