//! The process-wide readiness loop that drives every session.
//!
//! One single-threaded [`Reactor`] owns all sessions and their PTY master
//! descriptors. Each [`Reactor::poll_once`] tick builds the `pollfd` set
//! from the sessions' current interests, bounds the wait by the nearest
//! monitoring deadline, dispatches read/write readiness into the sessions,
//! and runs their timer/reap ticks. The only OS-level concurrency anywhere
//! is the forked children themselves.
//!
//! The reactor is also the session factory: ids come from an explicit
//! monotonic counter owned here, and keystroke input funnels through
//! [`Reactor::send_input`], where group fan-out is applied.

use std::collections::{BTreeMap, BTreeSet};
use std::os::fd::OwnedFd;
use std::time::{Duration, Instant};

use log::debug;
use nix::errno::Errno;

use crate::error::PtyError;
use crate::group::SessionGroup;
use crate::session::{
    PtyEventSink, SessionId, SessionProfile, SessionState, TerminalSession,
};

/// Identifier of a session group registered with the reactor.
pub type GroupId = u64;

/// Owns and drives all terminal sessions of the process.
pub struct Reactor {
    sessions: BTreeMap<SessionId, TerminalSession>,
    groups: BTreeMap<GroupId, SessionGroup>,
    next_session_id: SessionId,
    next_group_id: GroupId,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            groups: BTreeMap::new(),
            next_session_id: 1,
            next_group_id: 1,
        }
    }

    /// Create and start a session. Fails synchronously (and registers
    /// nothing) when the PTY cannot open or the program cannot spawn.
    pub fn create_session(
        &mut self,
        profile: SessionProfile,
        sink: Box<dyn PtyEventSink>,
    ) -> Result<SessionId, PtyError> {
        let id = self.alloc_session_id();
        let mut session = TerminalSession::new(id, profile, sink);
        session.run()?;
        self.sessions.insert(id, session);
        Ok(id)
    }

    /// Create a session driving an externally owned PTY master.
    pub fn create_session_attached(
        &mut self,
        master: OwnedFd,
        sink: Box<dyn PtyEventSink>,
    ) -> Result<SessionId, PtyError> {
        let id = self.alloc_session_id();
        let mut session = TerminalSession::new(id, SessionProfile::default(), sink);
        session.run_attached(master)?;
        self.sessions.insert(id, session);
        Ok(id)
    }

    fn alloc_session_id(&mut self) -> SessionId {
        let id = self.next_session_id;
        self.next_session_id += 1;
        id
    }

    pub fn session(&self, id: SessionId) -> Option<&TerminalSession> {
        self.sessions.get(&id)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut TerminalSession> {
        self.sessions.get_mut(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Close (if needed) and unregister a session, detaching it from every
    /// group.
    pub fn remove_session(&mut self, id: SessionId) -> Option<TerminalSession> {
        for group in self.groups.values_mut() {
            group.remove_session(id);
        }
        let mut session = self.sessions.remove(&id)?;
        session.close();
        Some(session)
    }

    /// Unregister every finished session and return their ids.
    pub fn drain_finished(&mut self) -> Vec<SessionId> {
        let finished: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state() == SessionState::Finished)
            .map(|(id, _)| *id)
            .collect();
        for id in &finished {
            for group in self.groups.values_mut() {
                group.remove_session(*id);
            }
            self.sessions.remove(id);
        }
        finished
    }

    pub fn create_group(&mut self) -> GroupId {
        let id = self.next_group_id;
        self.next_group_id += 1;
        self.groups.insert(id, SessionGroup::new());
        id
    }

    pub fn group(&self, id: GroupId) -> Option<&SessionGroup> {
        self.groups.get(&id)
    }

    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut SessionGroup> {
        self.groups.get_mut(&id)
    }

    /// The single serialized keystroke path.
    ///
    /// Bytes go to `source`; when `source` is a group master with input
    /// copying enabled, the same bytes are mirrored to every fan-out
    /// target. A target that cannot take input is skipped, never fatal.
    pub fn send_input(&mut self, source: SessionId, bytes: &[u8]) -> Result<(), PtyError> {
        let mut targets: BTreeSet<SessionId> = BTreeSet::new();
        for group in self.groups.values() {
            if group.contains(source) {
                targets.extend(group.fan_out_targets(source));
            }
        }
        targets.remove(&source);

        let session = self
            .sessions
            .get_mut(&source)
            .ok_or_else(|| PtyError::OpenFailed(format!("no session {source}")))?;
        session.send_input(bytes)?;

        for id in targets {
            if let Some(peer) = self.sessions.get_mut(&id) {
                if let Err(e) = peer.send_input(bytes) {
                    debug!("input fan-out to session {id} skipped: {e}");
                }
            }
        }
        Ok(())
    }

    /// One reactor iteration: wait for readiness at most `timeout` (bounded
    /// further by monitoring deadlines), dispatch it, then run every
    /// session's timer/reap tick. Returns how many sessions had readiness
    /// serviced.
    pub fn poll_once(&mut self, timeout: Duration) -> Result<usize, PtyError> {
        let now = Instant::now();
        let mut timeout_ms = clamp_ms(timeout);

        if let Some(deadline) = self
            .sessions
            .values()
            .filter_map(TerminalSession::next_deadline)
            .min()
        {
            let until = clamp_ms(deadline.saturating_duration_since(now));
            timeout_ms = timeout_ms.min(until);
        }

        let mut fds: Vec<libc::pollfd> = Vec::new();
        let mut ids: Vec<SessionId> = Vec::new();
        for (id, session) in &self.sessions {
            if let Some((fd, events)) = session.poll_interest() {
                fds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                ids.push(*id);
            }
        }

        let ready = poll_all(&mut fds, timeout_ms)?;

        let mut serviced = 0usize;
        if ready > 0 {
            for (pfd, id) in fds.iter().zip(&ids) {
                if pfd.revents == 0 {
                    continue;
                }
                let Some(session) = self.sessions.get_mut(id) else {
                    continue;
                };
                if pfd.revents
                    & (libc::POLLIN | libc::POLLHUP | libc::POLLERR | libc::POLLNVAL)
                    != 0
                {
                    session.on_readable();
                }
                if pfd.revents & libc::POLLOUT != 0 {
                    session.on_writable();
                }
                serviced += 1;
            }
        }

        let now = Instant::now();
        for session in self.sessions.values_mut() {
            session.tick(now);
        }

        Ok(serviced)
    }

    /// Drive the loop until every registered session is finished or
    /// `deadline` passes; returns whether all finished in time.
    pub fn run_until_all_finished(&mut self, deadline: Duration) -> Result<bool, PtyError> {
        let end = Instant::now() + deadline;
        loop {
            if self
                .sessions
                .values()
                .all(|s| s.state() == SessionState::Finished)
            {
                return Ok(true);
            }
            if Instant::now() >= end {
                return Ok(false);
            }
            self.poll_once(Duration::from_millis(50))?;
        }
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_ms(duration: Duration) -> i32 {
    duration.as_millis().min(i32::MAX as u128) as i32
}

/// `poll(2)` over the whole fd set with EINTR retry. An empty set just
/// sleeps out the timeout (there may still be timers to fire).
fn poll_all(fds: &mut [libc::pollfd], timeout_ms: i32) -> Result<usize, PtyError> {
    if fds.is_empty() {
        if timeout_ms > 0 {
            std::thread::sleep(Duration::from_millis(timeout_ms as u64));
        }
        return Ok(0);
    }

    loop {
        // SAFETY: fds points at initialized pollfd entries for the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let errno = Errno::last();
        if errno != Errno::EINTR {
            return Err(errno.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::MasterMode;
    use crate::session::ExitOutcome;
    use std::cell::RefCell;
    use std::rc::Rc;

    const WAIT: Duration = Duration::from_secs(2);

    struct CollectSink(Rc<RefCell<Vec<u8>>>);

    impl PtyEventSink for CollectSink {
        fn on_data(&mut self, bytes: &[u8]) {
            self.0.borrow_mut().extend_from_slice(bytes);
        }
    }

    fn sink() -> (Box<dyn PtyEventSink>, Rc<RefCell<Vec<u8>>>) {
        let shared = Rc::new(RefCell::new(Vec::new()));
        (Box::new(CollectSink(shared.clone())), shared)
    }

    fn echo_profile(text: &str) -> SessionProfile {
        SessionProfile {
            program: Some("/bin/echo".to_string()),
            arguments: vec![text.to_string()],
            ..SessionProfile::default()
        }
    }

    fn cat_profile() -> SessionProfile {
        SessionProfile {
            program: Some("/bin/cat".to_string()),
            ..SessionProfile::default()
        }
    }

    fn contains(haystack: &[u8], needle: &[u8]) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle)
    }

    #[test]
    fn test_session_ids_are_monotonic() {
        let mut reactor = Reactor::new();
        let (s1, _) = sink();
        let (s2, _) = sink();
        let (s3, _) = sink();

        let a = reactor.create_session(echo_profile("a"), s1).expect("a");
        let b = reactor.create_session(echo_profile("b"), s2).expect("b");
        assert_eq!((a, b), (1, 2));

        reactor.remove_session(a);
        // Ids never get reused after a removal.
        let c = reactor.create_session(echo_profile("c"), s3).expect("c");
        assert_eq!(c, 3);

        reactor.run_until_all_finished(WAIT).expect("drive");
    }

    #[test]
    fn test_failed_create_registers_nothing() {
        let mut reactor = Reactor::new();
        let (s, _) = sink();
        let err = reactor
            .create_session(
                SessionProfile {
                    program: Some("definitely-not-a-real-program-480".to_string()),
                    ..SessionProfile::default()
                },
                s,
            )
            .expect_err("must fail");
        assert!(matches!(err, PtyError::SpawnFailed(_)));
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_two_sessions_run_to_completion() {
        let mut reactor = Reactor::new();
        let (s1, d1) = sink();
        let (s2, d2) = sink();

        let a = reactor
            .create_session(echo_profile("alpha-output"), s1)
            .expect("a");
        let b = reactor
            .create_session(echo_profile("beta-output"), s2)
            .expect("b");

        let all_done = reactor.run_until_all_finished(WAIT).expect("drive");
        assert!(all_done, "echo sessions did not finish in time");

        assert_eq!(
            reactor.session(a).and_then(|s| s.exit_outcome()),
            Some(ExitOutcome::NormalExit)
        );
        assert_eq!(
            reactor.session(b).and_then(|s| s.exit_outcome()),
            Some(ExitOutcome::NormalExit)
        );
        assert!(contains(&d1.borrow(), b"alpha-output"));
        assert!(contains(&d2.borrow(), b"beta-output"));
        // Each session's bytes stay on its own channel.
        assert!(!contains(&d1.borrow(), b"beta-output"));
        assert!(!contains(&d2.borrow(), b"alpha-output"));

        let drained = reactor.drain_finished();
        assert_eq!(drained, vec![a, b]);
        assert!(reactor.is_empty());
    }

    #[test]
    fn test_input_fan_out_to_group() {
        let mut reactor = Reactor::new();
        let (s1, d1) = sink();
        let (s2, d2) = sink();

        let master = reactor.create_session(cat_profile(), s1).expect("master");
        let slave = reactor.create_session(cat_profile(), s2).expect("slave");
        for id in [master, slave] {
            reactor
                .session(id)
                .expect("session")
                .channel()
                .expect("channel")
                .pty()
                .set_echo(false)
                .expect("echo off");
        }

        let group = reactor.create_group();
        {
            let group = reactor.group_mut(group).expect("group");
            group.set_master_mode(MasterMode::COPY_INPUT_TO_ALL);
            group.add_session(master);
            group.add_session(slave);
            group.set_master_status(master, true);
        }

        reactor
            .send_input(master, b"mirrored-line\n")
            .expect("send_input");

        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            reactor.poll_once(Duration::from_millis(50)).expect("poll");
            if contains(&d1.borrow(), b"mirrored-line")
                && contains(&d2.borrow(), b"mirrored-line")
            {
                break;
            }
        }

        assert!(
            contains(&d1.borrow(), b"mirrored-line"),
            "master session never echoed its own input"
        );
        assert!(
            contains(&d2.borrow(), b"mirrored-line"),
            "input was not mirrored to the group member"
        );

        reactor.session_mut(master).expect("master").close();
        reactor.session_mut(slave).expect("slave").close();
    }

    #[test]
    fn test_input_from_non_master_is_not_mirrored() {
        let mut reactor = Reactor::new();
        let (s1, d1) = sink();
        let (s2, d2) = sink();

        let master = reactor.create_session(cat_profile(), s1).expect("master");
        let member = reactor.create_session(cat_profile(), s2).expect("member");
        for id in [master, member] {
            reactor
                .session(id)
                .expect("session")
                .channel()
                .expect("channel")
                .pty()
                .set_echo(false)
                .expect("echo off");
        }

        let group = reactor.create_group();
        {
            let group = reactor.group_mut(group).expect("group");
            group.set_master_mode(MasterMode::COPY_INPUT_TO_ALL);
            group.add_session(master);
            group.add_session(member);
            group.set_master_status(master, true);
        }

        reactor
            .send_input(member, b"private-line\n")
            .expect("send_input");

        let deadline = Instant::now() + Duration::from_millis(500);
        while Instant::now() < deadline {
            reactor.poll_once(Duration::from_millis(50)).expect("poll");
        }

        assert!(
            contains(&d2.borrow(), b"private-line"),
            "member session lost its own input"
        );
        assert!(
            !contains(&d1.borrow(), b"private-line"),
            "non-master input must not be mirrored"
        );

        reactor.session_mut(master).expect("master").close();
        reactor.session_mut(member).expect("member").close();
    }

    #[test]
    fn test_send_input_to_unknown_session() {
        let mut reactor = Reactor::new();
        let err = reactor.send_input(42, b"x").expect_err("must fail");
        assert!(matches!(err, PtyError::OpenFailed(_)));
    }

    #[test]
    fn test_remove_session_detaches_from_groups() {
        let mut reactor = Reactor::new();
        let (s1, _) = sink();
        let (s2, _) = sink();

        let a = reactor.create_session(cat_profile(), s1).expect("a");
        let b = reactor.create_session(cat_profile(), s2).expect("b");

        let group = reactor.create_group();
        {
            let group = reactor.group_mut(group).expect("group");
            group.set_master_mode(MasterMode::COPY_INPUT_TO_ALL);
            group.add_session(a);
            group.add_session(b);
            group.set_master_status(a, true);
        }

        let removed = reactor.remove_session(b).expect("remove");
        assert_eq!(removed.state(), SessionState::Finished);
        assert!(!reactor.group(group).expect("group").contains(b));
        assert!(reactor
            .group(group)
            .expect("group")
            .fan_out_targets(a)
            .is_empty());

        reactor.session_mut(a).expect("a").close();
    }

    #[test]
    fn test_poll_once_with_no_sessions_sleeps_out() {
        let mut reactor = Reactor::new();
        let start = Instant::now();
        let serviced = reactor
            .poll_once(Duration::from_millis(30))
            .expect("poll_once");
        assert_eq!(serviced, 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }
}
