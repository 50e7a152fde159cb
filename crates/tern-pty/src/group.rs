//! Master/slave input fan-out across sessions.
//!
//! A [`SessionGroup`] is purely relational: it maps session ids to a
//! master flag and maintains the explicit set of master-to-member pairings
//! implied by the current [`MasterMode`]. It owns no I/O resources; the
//! reactor consults [`SessionGroup::fan_out_targets`] on every input send
//! and mirrors the bytes itself.

use std::collections::{BTreeMap, BTreeSet};

use bitflags::bitflags;
use log::debug;

use crate::session::SessionId;

bitflags! {
    /// Which master-session activity propagates to the rest of the group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MasterMode: u32 {
        /// Keystrokes sent to a master are mirrored to every other
        /// session in the group.
        const COPY_INPUT_TO_ALL = 1;
    }
}

/// A group of sessions with zero or more masters.
///
/// Pairings are torn down and rebuilt whenever master status or the mode
/// changes; removing a session removes it from every pairing without
/// affecting the other pairs.
pub struct SessionGroup {
    members: BTreeMap<SessionId, bool>,
    mode: MasterMode,
    pairs: BTreeSet<(SessionId, SessionId)>,
}

impl SessionGroup {
    pub fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            mode: MasterMode::empty(),
            pairs: BTreeSet::new(),
        }
    }

    /// Add a session as a non-master member.
    pub fn add_session(&mut self, session: SessionId) {
        self.members.entry(session).or_insert(false);
        self.rebuild_pairs();
    }

    /// Remove a session and every pairing it takes part in.
    pub fn remove_session(&mut self, session: SessionId) {
        self.members.remove(&session);
        self.pairs
            .retain(|(master, other)| *master != session && *other != session);
    }

    pub fn contains(&self, session: SessionId) -> bool {
        self.members.contains_key(&session)
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        self.members.keys().copied().collect()
    }

    pub fn masters(&self) -> Vec<SessionId> {
        self.members
            .iter()
            .filter(|(_, is_master)| **is_master)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn master_status(&self, session: SessionId) -> bool {
        self.members.get(&session).copied().unwrap_or(false)
    }

    /// Promote or demote a member; pairings follow immediately.
    pub fn set_master_status(&mut self, session: SessionId, master: bool) {
        let Some(entry) = self.members.get_mut(&session) else {
            return;
        };
        if *entry == master {
            return;
        }
        *entry = master;
        debug!("session {session} master status -> {master}");
        self.rebuild_pairs();
    }

    pub fn master_mode(&self) -> MasterMode {
        self.mode
    }

    /// Change which activity propagates; all pairings are re-derived.
    pub fn set_master_mode(&mut self, mode: MasterMode) {
        self.mode = mode;
        self.rebuild_pairs();
    }

    /// Sessions that must receive a copy of input sent to `source`.
    ///
    /// Empty unless `source` is a master and input copying is on.
    pub fn fan_out_targets(&self, source: SessionId) -> Vec<SessionId> {
        self.pairs
            .iter()
            .filter(|(master, _)| *master == source)
            .map(|(_, other)| *other)
            .collect()
    }

    fn rebuild_pairs(&mut self) {
        self.pairs.clear();
        if !self.mode.contains(MasterMode::COPY_INPUT_TO_ALL) {
            return;
        }
        for (&master, &is_master) in &self.members {
            if !is_master {
                continue;
            }
            for &other in self.members.keys() {
                if other != master {
                    self.pairs.insert((master, other));
                }
            }
        }
    }
}

impl Default for SessionGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn copy_group(ids: &[SessionId]) -> SessionGroup {
        let mut group = SessionGroup::new();
        group.set_master_mode(MasterMode::COPY_INPUT_TO_ALL);
        for &id in ids {
            group.add_session(id);
        }
        group
    }

    #[test]
    fn test_membership() {
        let mut group = SessionGroup::new();
        group.add_session(1);
        group.add_session(2);

        assert!(group.contains(1));
        assert!(!group.contains(3));
        assert_eq!(group.sessions(), vec![1, 2]);
        assert!(group.masters().is_empty());

        group.remove_session(1);
        assert_eq!(group.sessions(), vec![2]);
    }

    #[test]
    fn test_master_fan_out() {
        let mut group = copy_group(&[1, 2, 3]);
        group.set_master_status(1, true);

        assert_eq!(group.fan_out_targets(1), vec![2, 3]);
        // Non-masters never fan out.
        assert!(group.fan_out_targets(2).is_empty());
        assert!(group.fan_out_targets(3).is_empty());
    }

    #[test]
    fn test_no_fan_out_without_mode_flag() {
        let mut group = SessionGroup::new();
        group.add_session(1);
        group.add_session(2);
        group.set_master_status(1, true);

        // Master status alone does not mirror input.
        assert!(group.fan_out_targets(1).is_empty());

        group.set_master_mode(MasterMode::COPY_INPUT_TO_ALL);
        assert_eq!(group.fan_out_targets(1), vec![2]);

        group.set_master_mode(MasterMode::empty());
        assert!(group.fan_out_targets(1).is_empty());
    }

    #[test]
    fn test_demotion_tears_down_pairs() {
        let mut group = copy_group(&[1, 2]);
        group.set_master_status(1, true);
        assert_eq!(group.fan_out_targets(1), vec![2]);

        group.set_master_status(1, false);
        assert!(group.fan_out_targets(1).is_empty());
    }

    #[test]
    fn test_two_masters() {
        let mut group = copy_group(&[1, 2, 3]);
        group.set_master_status(1, true);
        group.set_master_status(2, true);

        assert_eq!(group.fan_out_targets(1), vec![2, 3]);
        assert_eq!(group.fan_out_targets(2), vec![1, 3]);
    }

    #[test]
    fn test_removal_preserves_other_pairs() {
        let mut group = copy_group(&[1, 2, 3]);
        group.set_master_status(1, true);

        group.remove_session(2);
        assert_eq!(group.fan_out_targets(1), vec![3]);
        assert!(!group.contains(2));
    }

    #[test]
    fn test_late_member_joins_existing_master() {
        let mut group = copy_group(&[1]);
        group.set_master_status(1, true);
        assert!(group.fan_out_targets(1).is_empty());

        group.add_session(2);
        assert_eq!(group.fan_out_targets(1), vec![2]);
    }

    #[test]
    fn test_set_master_status_on_unknown_session() {
        let mut group = copy_group(&[1]);
        // Unknown ids are ignored rather than implicitly added.
        group.set_master_status(99, true);
        assert!(!group.contains(99));
        assert!(group.masters().is_empty());
    }
}
