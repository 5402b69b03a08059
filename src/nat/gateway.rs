//! Candidate gateway selection
//!
//! Home routers overwhelmingly sit on a handful of well-known addresses. For
//! every private address the host owns, the candidate gateway is the table
//! entry sharing the longest bit prefix with it.

use std::net::Ipv4Addr;

/// Common default gateway addresses, in tie-break order
pub const COMMON_GATEWAYS: [Ipv4Addr; 18] = [
    Ipv4Addr::new(192, 168, 0, 1),
    Ipv4Addr::new(192, 168, 1, 1),
    Ipv4Addr::new(192, 168, 2, 1),
    Ipv4Addr::new(192, 168, 3, 1),
    Ipv4Addr::new(192, 168, 8, 1),
    Ipv4Addr::new(192, 168, 10, 1),
    Ipv4Addr::new(192, 168, 11, 1),
    Ipv4Addr::new(192, 168, 15, 1),
    Ipv4Addr::new(192, 168, 50, 1),
    Ipv4Addr::new(192, 168, 100, 1),
    Ipv4Addr::new(192, 168, 123, 254),
    Ipv4Addr::new(192, 168, 254, 254),
    Ipv4Addr::new(10, 0, 0, 1),
    Ipv4Addr::new(10, 0, 0, 138),
    Ipv4Addr::new(10, 0, 1, 1),
    Ipv4Addr::new(10, 1, 1, 1),
    Ipv4Addr::new(172, 16, 0, 1),
    Ipv4Addr::new(172, 16, 1, 1),
];

/// Number of leading bits shared by two addresses
pub fn prefix_len(a: Ipv4Addr, b: Ipv4Addr) -> u32 {
    (u32::from(a) ^ u32::from(b)).leading_zeros()
}

/// Longest-prefix matcher over a fixed gateway table
#[derive(Debug, Clone)]
pub struct GatewayLocator {
    table: Vec<Ipv4Addr>,
}

impl Default for GatewayLocator {
    fn default() -> Self {
        Self::new(COMMON_GATEWAYS.to_vec())
    }
}

impl GatewayLocator {
    pub fn new(table: Vec<Ipv4Addr>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &[Ipv4Addr] {
        &self.table
    }

    /// Best table entry for one private address; the first maximal match wins
    pub fn best_match(&self, private_ip: Ipv4Addr) -> Option<Ipv4Addr> {
        let mut best: Option<(Ipv4Addr, u32)> = None;
        for &gateway in &self.table {
            let len = prefix_len(private_ip, gateway);
            match best {
                Some((_, best_len)) if len <= best_len => {}
                _ => best = Some((gateway, len)),
            }
        }
        best.map(|(gateway, _)| gateway)
    }

    /// One candidate per private address, in input order.
    ///
    /// An empty input (no usable interface) gives an empty list; callers
    /// decide whether that is fatal.
    pub fn locate(&self, private_ips: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
        private_ips
            .iter()
            .filter_map(|&ip| self.best_match(ip))
            .collect()
    }
}
