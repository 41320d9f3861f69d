//! Pending-registration table
//!
//! Two-sided rendezvous between topology submission and host registration.
//! Submission opens one slot per (cluster, host group); a registration either
//! claims a slot or is remembered until a topology for its cluster arrives.

use std::collections::{BTreeSet, HashMap};

use clusterforge_models::RequestId;

#[derive(Debug)]
struct Slot {
    request_id: RequestId,
    /// `None` keeps the slot open-ended
    expected: Option<u32>,
    claimed: BTreeSet<String>,
}

impl Slot {
    fn outstanding(&self) -> u32 {
        self.expected
            .map_or(0, |expected| expected.saturating_sub(self.claimed.len() as u32))
    }

    fn is_full(&self) -> bool {
        self.expected
            .map_or(false, |expected| self.claimed.len() as u32 >= expected)
    }
}

/// Result of offering a registered host to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Claimed(RequestId),
    AlreadyClaimed(RequestId),
    Full(RequestId),
    /// The active request's topology has no such group
    UnknownGroup(RequestId),
    /// No active request for the cluster
    NoRequest,
}

#[derive(Debug, Default)]
pub(crate) struct PendingRegistrations {
    active: HashMap<String, RequestId>,
    slots: HashMap<(String, String), Slot>,
    registered: HashMap<String, BTreeSet<String>>,
}

impl PendingRegistrations {
    /// Open one slot per group for a newly accepted request, replacing the
    /// slots of the cluster's previous request
    pub fn open_request(
        &mut self,
        cluster_id: &str,
        request_id: RequestId,
        groups: impl IntoIterator<Item = (String, Option<u32>)>,
    ) {
        self.slots.retain(|(cluster, _), _| cluster != cluster_id);
        self.active.insert(cluster_id.to_string(), request_id);
        for (group, expected) in groups {
            self.slots.insert(
                (cluster_id.to_string(), group),
                Slot {
                    request_id,
                    expected,
                    claimed: BTreeSet::new(),
                },
            );
        }
    }

    pub fn active_request(&self, cluster_id: &str) -> Option<RequestId> {
        self.active.get(cluster_id).copied()
    }

    pub fn record_registration(&mut self, cluster_id: &str, hostname: &str) {
        self.registered
            .entry(cluster_id.to_string())
            .or_default()
            .insert(hostname.to_string());
    }

    pub fn forget_registration(&mut self, cluster_id: &str, hostname: &str) {
        if let Some(hosts) = self.registered.get_mut(cluster_id) {
            hosts.remove(hostname);
            if hosts.is_empty() {
                self.registered.remove(cluster_id);
            }
        }
    }

    pub fn registered_hosts(&self, cluster_id: &str) -> Vec<String> {
        self.registered
            .get(cluster_id)
            .map(|hosts| hosts.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn try_claim(&mut self, cluster_id: &str, host_group: &str, hostname: &str) -> Claim {
        let Some(request_id) = self.active_request(cluster_id) else {
            return Claim::NoRequest;
        };
        let Some(slot) = self
            .slots
            .get_mut(&(cluster_id.to_string(), host_group.to_string()))
        else {
            return Claim::UnknownGroup(request_id);
        };

        if slot.claimed.contains(hostname) {
            Claim::AlreadyClaimed(slot.request_id)
        } else if slot.is_full() {
            Claim::Full(slot.request_id)
        } else {
            slot.claimed.insert(hostname.to_string());
            Claim::Claimed(slot.request_id)
        }
    }

    /// Hosts still expected by the bounded slots of a request
    pub fn outstanding(&self, request_id: RequestId) -> u32 {
        self.slots
            .values()
            .filter(|slot| slot.request_id == request_id)
            .map(Slot::outstanding)
            .sum()
    }

    /// Drop every slot of an aborted or purged request
    pub fn close_request(&mut self, request_id: RequestId) {
        self.slots.retain(|_, slot| slot.request_id != request_id);
        self.active.retain(|_, active| *active != request_id);
    }
}
