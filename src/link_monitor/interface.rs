//! Interface state with flap dampening
//!
//! Tracks one interface's kernel attributes and addresses. A transition
//! to DOWN charges an exponential backoff; while the backoff runs, the
//! interface reports inactive regardless of its true state, which is what
//! dampens link flaps. The backoff clears after a quiet period of twice
//! the maximum window.

use crate::protocol::{InterfaceInfo, IpPrefix, PrefixEntry, PrefixType};
use crate::utils::ExponentialBackoff;
use ipnet::IpNet;
use std::collections::HashSet;
use std::time::Duration;

/// One tracked interface
#[derive(Debug)]
pub struct InterfaceEntry {
    if_name: String,
    if_index: i32,
    is_up: bool,
    weight: u64,
    networks: HashSet<IpNet>,
    backoff: ExponentialBackoff,
}

impl InterfaceEntry {
    /// Track a new interface with the given flap backoff window
    pub fn new(
        if_name: impl Into<String>,
        init_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            if_name: if_name.into(),
            if_index: 0,
            is_up: false,
            weight: 1,
            networks: HashSet::new(),
            backoff: ExponentialBackoff::new(init_backoff, max_backoff),
        }
    }

    /// Interface name
    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    /// Kernel interface index
    pub fn if_index(&self) -> i32 {
        self.if_index
    }

    /// Raw kernel up/down state (before dampening)
    pub fn is_up(&self) -> bool {
        self.is_up
    }

    /// ECMP weight
    pub fn weight(&self) -> u64 {
        self.weight
    }

    /// Assigned networks
    pub fn networks(&self) -> &HashSet<IpNet> {
        &self.networks
    }

    /// Apply a kernel attribute update; returns true when anything changed
    pub fn update_attrs(&mut self, if_index: i32, is_up: bool, weight: u64) -> bool {
        let was_up = self.is_up;
        let mut updated = false;
        updated |= std::mem::replace(&mut self.if_index, if_index) != if_index;
        updated |= std::mem::replace(&mut self.is_up, is_up) != is_up;
        updated |= std::mem::replace(&mut self.weight, weight) != weight;

        // a transition to DOWN charges the flap backoff
        if was_up && !is_up {
            self.backoff.report_error();
        }
        updated
    }

    /// Apply an address update; returns true when anything changed
    pub fn update_addr(&mut self, network: IpNet, is_valid: bool) -> bool {
        if is_valid {
            self.networks.insert(network)
        } else {
            self.networks.remove(&network)
        }
    }

    /// Is this interface usable right now?
    ///
    /// Up, and not inside a flap-backoff window. A quiet period longer
    /// than the maximum window clears the accumulated backoff.
    pub fn is_active(&mut self) -> bool {
        if !self.is_up {
            return false;
        }
        if let Some(elapsed) = self.backoff.time_since_last_error() {
            if elapsed > self.backoff.max_backoff() {
                self.backoff.report_success();
            }
        }
        self.backoff.can_try_now()
    }

    /// Time left inside the current flap-backoff window
    pub fn backoff_remaining(&self) -> Duration {
        self.backoff.time_remaining_until_retry()
    }

    /// Wire form of this interface, with dampening applied to `is_up`
    pub fn interface_info(&mut self) -> InterfaceInfo {
        let is_active = self.is_active();
        InterfaceInfo {
            if_name: self.if_name.clone(),
            is_up: is_active,
            if_index: self.if_index,
            weight: self.weight,
            networks: self
                .networks
                .iter()
                .map(IpPrefix::from_ipnet)
                .collect(),
        }
    }

    /// Global unicast prefixes eligible for redistribution
    pub fn global_unicast_prefixes(&self, enable_v4: bool) -> Vec<PrefixEntry> {
        let mut prefixes = Vec::new();
        for network in &self.networks {
            let addr = network.addr();
            if addr.is_loopback() || addr.is_multicast() {
                continue;
            }
            match network {
                IpNet::V4(_) if !enable_v4 => continue,
                IpNet::V6(v6) => {
                    // skip link-locals
                    if (v6.addr().segments()[0] & 0xffc0) == 0xfe80 {
                        continue;
                    }
                }
                _ => {}
            }
            // advertise the covering network, not the host address
            let masked = network.trunc();
            prefixes.push(PrefixEntry {
                prefix: Some(IpPrefix::from_ipnet(&masked)),
                prefix_type: PrefixType::Loopback as i32,
                data: Vec::new(),
                forwarding_type: crate::protocol::ForwardingType::Ip as i32,
                forwarding_algorithm: crate::protocol::ForwardingAlgorithm::SpEcmp as i32,
                ephemeral: false,
                mv: None,
            });
        }
        prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> InterfaceEntry {
        InterfaceEntry::new(
            "eth0",
            Duration::from_millis(50),
            Duration::from_millis(400),
        )
    }

    #[test]
    fn test_update_attrs_detects_changes() {
        let mut entry = entry();
        assert!(entry.update_attrs(3, true, 1));
        assert!(!entry.update_attrs(3, true, 1));
        assert!(entry.update_attrs(3, true, 5));
        assert_eq!(entry.weight(), 5);
    }

    #[test]
    fn test_down_transition_charges_backoff() {
        let mut entry = entry();
        entry.update_attrs(3, true, 1);
        assert!(entry.is_active());

        // flap: down then immediately up
        entry.update_attrs(3, false, 1);
        entry.update_attrs(3, true, 1);
        // up again, but dampened
        assert!(entry.is_up());
        assert!(!entry.is_active());
        assert!(entry.backoff_remaining() > Duration::ZERO);
    }

    #[test]
    fn test_repeated_flaps_grow_backoff() {
        let mut entry = entry();
        entry.update_attrs(3, true, 1);
        entry.update_attrs(3, false, 1);
        let first = entry.backoff_remaining();
        entry.update_attrs(3, true, 1);
        entry.update_attrs(3, false, 1);
        entry.update_attrs(3, true, 1);
        let second = entry.backoff_remaining();
        assert!(second > first);
    }

    #[test]
    fn test_address_updates() {
        let mut entry = entry();
        let network: IpNet = "2001:db8::1/64".parse().unwrap();
        assert!(entry.update_addr(network, true));
        assert!(!entry.update_addr(network, true));
        assert_eq!(entry.networks().len(), 1);
        assert!(entry.update_addr(network, false));
        assert!(entry.networks().is_empty());
    }

    #[test]
    fn test_interface_info_reports_dampened_state() {
        let mut entry = entry();
        entry.update_attrs(3, true, 1);
        entry.update_attrs(3, false, 1);
        entry.update_attrs(3, true, 1);
        let info = entry.interface_info();
        // physically up, logically down while dampened
        assert!(entry.is_up());
        assert!(!info.is_up);
    }

    #[test]
    fn test_global_unicast_prefixes() {
        let mut entry = entry();
        entry.update_addr("2001:db8::5/64".parse().unwrap(), true);
        entry.update_addr("fe80::5/64".parse().unwrap(), true);
        entry.update_addr("10.0.0.5/24".parse().unwrap(), true);

        let v6_only = entry.global_unicast_prefixes(false);
        assert_eq!(v6_only.len(), 1);
        assert_eq!(
            v6_only[0].prefix.as_ref().unwrap().to_string(),
            "2001:db8::/64"
        );
        assert_eq!(v6_only[0].prefix_type, PrefixType::Loopback as i32);

        let with_v4 = entry.global_unicast_prefixes(true);
        assert_eq!(with_v4.len(), 2);
    }
}
