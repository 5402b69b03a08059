//! Host private addresses and change detection between polls

use std::collections::HashSet;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr};

/// Source of the host's current private IPv4 addresses
pub trait AddressSource: Send + Sync {
    fn private_ipv4_addrs(&self) -> Vec<Ipv4Addr>;
}

/// Reads addresses from the host's interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct InterfaceAddresses;

impl AddressSource for InterfaceAddresses {
    fn private_ipv4_addrs(&self) -> Vec<Ipv4Addr> {
        match if_addrs::get_if_addrs() {
            Ok(interfaces) => {
                let addrs: Vec<Ipv4Addr> = interfaces
                    .iter()
                    .filter(|iface| !iface.is_loopback())
                    .filter_map(|iface| match iface.ip() {
                        IpAddr::V4(v4) if v4.is_private() => Some(v4),
                        _ => None,
                    })
                    .collect();
                union_ordered(&addrs, &[])
            }
            Err(e) => {
                tracing::warn!("Failed to enumerate network interfaces: {}", e);
                Vec::new()
            }
        }
    }
}

/// Every element of `a`, then every element of `b` not yet seen, each once
pub fn union_ordered<T: Clone + Eq + Hash>(a: &[T], b: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(a.len() + b.len());
    a.iter()
        .chain(b.iter())
        .filter(|item| seen.insert((*item).clone()))
        .cloned()
        .collect()
}

/// Elements of `a` absent from `b`, in `a`'s order. Repeats in `a` are kept.
pub fn difference<T: Clone + Eq + Hash>(a: &[T], b: &[T]) -> Vec<T> {
    let exclude: HashSet<&T> = b.iter().collect();
    a.iter()
        .filter(|item| !exclude.contains(item))
        .cloned()
        .collect()
}

/// What changed between two polls
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressChange {
    pub added: Vec<Ipv4Addr>,
    pub removed: Vec<Ipv4Addr>,
}

impl AddressChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Remembers the previous poll and diffs each new one against it
#[derive(Debug, Clone, Default)]
pub struct AddressTracker {
    previous: Vec<Ipv4Addr>,
}

impl AddressTracker {
    pub fn new(initial: Vec<Ipv4Addr>) -> Self {
        Self {
            previous: union_ordered(&initial, &[]),
        }
    }

    pub fn current(&self) -> &[Ipv4Addr] {
        &self.previous
    }

    pub fn update(&mut self, polled: &[Ipv4Addr]) -> AddressChange {
        let polled = union_ordered(polled, &[]);
        let change = AddressChange {
            added: difference(&polled, &self.previous),
            removed: difference(&self.previous, &polled),
        };
        self.previous = polled;
        change
    }
}
