//! ARP cache for the tap's own assigned addresses.
//!
//! The overlay side consults this to answer address resolution for the
//! virtual interface without involving the stack.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::mac::Mac;

/// Maps locally assigned IPv4 addresses to the tap hardware address.
#[derive(Debug, Default)]
pub struct ArpCache {
    entries: HashMap<Ipv4Addr, Mac>,
}

impl ArpCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ip` as reachable at `mac`. Replaces an existing entry.
    pub fn add_local(&mut self, ip: Ipv4Addr, mac: Mac) {
        self.entries.insert(ip, mac);
    }

    /// Retire the entry for `ip`. Returns whether one existed.
    pub fn remove(&mut self, ip: Ipv4Addr) -> bool {
        self.entries.remove(&ip).is_some()
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.entries.contains_key(&ip)
    }

    pub fn entries(&self) -> impl Iterator<Item = (Ipv4Addr, Mac)> + '_ {
        self.entries.iter().map(|(ip, mac)| (*ip, *mac))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
