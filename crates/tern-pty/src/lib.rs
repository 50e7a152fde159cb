//! tern-pty: the PTY session engine behind tern's terminal tabs.
//!
//! This crate sits between the kernel's pseudo-terminal layer and the
//! external emulation/view collaborators. It allocates PTY pairs, forks
//! and execs the shell (or ssh) with the slave as its controlling
//! terminal, multiplexes non-blocking I/O through ring buffers on a
//! single-threaded poll reactor, and manages session lifecycle from spawn
//! to exit classification.
//!
//! # Architecture
//!
//! - [`RingBuffer`] — chunked FIFO byte queue for buffered reads/writes.
//! - [`PtyHandle`] — master/slave pair allocation and termios control,
//!   behind the [`PtyProvider`] seam.
//! - [`AsyncPtyChannel`] — readiness-driven I/O over a handle, with
//!   bounded synchronous fallbacks.
//! - [`ChildProcessLauncher`] — fork/exec with an allocation-free,
//!   async-signal-safe child setup window.
//! - [`TerminalSession`] — lifecycle, monitoring and multi-view size
//!   negotiation for one terminal tab.
//! - [`SessionGroup`] — master/slave input fan-out bookkeeping.
//! - [`Reactor`] — the process-wide readiness loop and session factory.
//!
//! Bytes the child writes reach the emulation through
//! [`PtyEventSink::on_data`] in exact production order; keystrokes flow
//! back through [`Reactor::send_input`], the engine's single write path.

pub mod channel;
pub mod error;
pub mod group;
pub mod pty;
pub mod reactor;
pub mod ring;
pub mod session;
pub mod spawn;

pub use channel::{AsyncPtyChannel, ReadEvent};
pub use error::PtyError;
pub use group::{MasterMode, SessionGroup};
pub use pty::{LegacyPtyProvider, NativePtyProvider, PtyHandle, PtyPair, PtyProvider};
pub use reactor::{GroupId, Reactor};
pub use ring::RingBuffer;
pub use session::{
    ExitOutcome, PtyEventSink, SessionId, SessionNotification, SessionObserver, SessionProfile,
    SessionState, SessionView, TerminalSession,
};
pub use spawn::{
    ChildProcess, ChildProcessLauncher, ChildState, SpawnCommand, EXEC_FAILED_STATUS,
};
