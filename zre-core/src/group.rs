//! Group registry: group name -> member peer identities.

use std::collections::{BTreeSet, HashMap};

use crate::identity::NodeId;
use crate::peer::Peer;

/// A named set of peers.
#[derive(Debug, Clone, Default)]
pub struct Group {
    name: String,
    members: BTreeSet<NodeId>,
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            members: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Groups observed among remote peers. Groups are created on first reference
/// and kept (possibly empty) afterwards.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<String, Group>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, name: &str) -> &mut Group {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Group::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Members of `name`, or `None` if the group was never referenced.
    pub fn peers_of(&self, name: &str) -> Option<Vec<NodeId>> {
        self.get(name).map(|g| g.members.iter().copied().collect())
    }

    /// Add `peer` to `name` and bump its status counter.
    pub fn join(&mut self, peer: &mut Peer, name: &str) {
        self.get_or_create(name).members.insert(peer.identity());
        peer.groups_mut().insert(name.to_string());
        peer.on_update();
    }

    /// Remove `peer` from `name` and bump its status counter.
    pub fn leave(&mut self, peer: &mut Peer, name: &str) {
        self.get_or_create(name).members.remove(&peer.identity());
        peer.groups_mut().remove(name);
        peer.on_update();
    }

    /// Drop `peer` from every group without touching its counters (peer removal).
    pub fn remove_peer(&mut self, peer: &NodeId) {
        for group in self.groups.values_mut() {
            group.members.remove(peer);
        }
    }

    /// Call `deliver` once per member of `name`, over a snapshot of the
    /// membership taken now. Returns false if the group is unknown.
    pub fn fanout<F>(&self, name: &str, mut deliver: F) -> bool
    where
        F: FnMut(NodeId),
    {
        match self.peers_of(name) {
            Some(members) => {
                for id in members {
                    deliver(id);
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn join_and_leave_track_membership_and_status() {
        let mut reg = GroupRegistry::new();
        let mut peer = Peer::new(NodeId::generate(), Instant::now());
        reg.join(&mut peer, "home");
        assert_eq!(peer.status(), 1);
        assert_eq!(reg.peers_of("home").unwrap(), vec![peer.identity()]);
        assert_eq!(peer.groups().collect::<Vec<_>>(), vec!["home"]);

        reg.leave(&mut peer, "home");
        assert_eq!(peer.status(), 2);
        assert!(reg.peers_of("home").unwrap().is_empty());
        assert_eq!(peer.groups().count(), 0);
    }

    #[test]
    fn unknown_group_has_no_members() {
        let reg = GroupRegistry::new();
        assert!(reg.peers_of("nowhere").is_none());
        assert!(!reg.fanout("nowhere", |_| panic!("no members")));
    }

    #[test]
    fn empty_groups_are_retained() {
        let mut reg = GroupRegistry::new();
        let mut peer = Peer::new(NodeId::generate(), Instant::now());
        reg.join(&mut peer, "lab");
        reg.remove_peer(&peer.identity());
        let group = reg.get("lab").unwrap();
        assert!(group.is_empty());
        assert_eq!(group.name(), "lab");
    }

    #[test]
    fn fanout_visits_every_member() {
        let mut reg = GroupRegistry::new();
        let mut a = Peer::new(NodeId::generate(), Instant::now());
        let mut b = Peer::new(NodeId::generate(), Instant::now());
        reg.join(&mut a, "g");
        reg.join(&mut b, "g");
        let mut seen = Vec::new();
        assert!(reg.fanout("g", |id| seen.push(id)));
        seen.sort();
        let mut expected = vec![a.identity(), b.identity()];
        expected.sort();
        assert_eq!(seen, expected);
    }
}
