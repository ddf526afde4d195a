//! IP-to-hostname cache
//!
//! Maps addresses observed in DNS answers to the last name that resolved
//! to them, so a later connection to the bare address can be labeled
//! before (or without) DPI. Bounded by strict least-recently-used
//! eviction; entries never expire by time.

use std::collections::HashMap;
use std::net::IpAddr;

use tracing::debug;

/// Default cache capacity.
pub const DEFAULT_HOST_CACHE_SIZE: usize = 128;

#[derive(Debug, Clone)]
struct Slot {
    host: String,
    last_used: u64,
}

/// Fixed-capacity LRU map from IP address to hostname.
///
/// Lookups promote the entry; insertion beyond capacity evicts the
/// least-recently-used slot. Recency is a monotonic tick, so eviction
/// scans are bounded by the (small, fixed) capacity.
#[derive(Debug)]
pub struct HostLru {
    entries: HashMap<IpAddr, Slot>,
    capacity: usize,
    tick: u64,
}

impl HostLru {
    /// Create a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            tick: 0,
        }
    }

    /// Insert or refresh a mapping, evicting the LRU entry when full.
    pub fn add(&mut self, ip: IpAddr, host: impl Into<String>) {
        self.tick += 1;
        let tick = self.tick;

        if let Some(slot) = self.entries.get_mut(&ip) {
            slot.host = host.into();
            slot.last_used = tick;
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict_lru();
        }

        self.entries.insert(
            ip,
            Slot {
                host: host.into(),
                last_used: tick,
            },
        );
    }

    /// Look up the name for an address, promoting the entry on hit.
    /// Returns an owned copy.
    #[must_use]
    pub fn find(&mut self, ip: IpAddr) -> Option<String> {
        self.tick += 1;
        let tick = self.tick;
        let slot = self.entries.get_mut(&ip)?;
        slot.last_used = tick;
        Some(slot.host.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_lru(&mut self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(ip, _)| *ip);
        if let Some(ip) = victim {
            debug!("host cache evict: {ip}");
            self.entries.remove(&ip);
        }
    }
}

impl Default for HostLru {
    fn default() -> Self {
        Self::new(DEFAULT_HOST_CACHE_SIZE)
    }
}
