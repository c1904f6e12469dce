//! First-fit address allocation over the configured prefixes
//!
//! The allocator holds no reservations. Every call reads the held set fresh,
//! so two calls without a persist in between return the same addresses. Two
//! concurrent registrations can therefore pick the same candidate; the store's
//! UNIQUE address index rejects the second write.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use meshgate_common::{Error, MachineAddresses, Result};
use tracing::debug;

use crate::store::CoordinatorDb;

/// Source of the addresses currently held by machines
pub trait UsedAddresses {
    fn used_addresses(&self) -> Result<Vec<IpAddr>>;
}

impl UsedAddresses for CoordinatorDb {
    fn used_addresses(&self) -> Result<Vec<IpAddr>> {
        CoordinatorDb::used_addresses(self)
    }
}

impl UsedAddresses for Vec<IpAddr> {
    fn used_addresses(&self) -> Result<Vec<IpAddr>> {
        Ok(self.clone())
    }
}

/// Allocates one address per configured prefix
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    prefixes: Vec<IpNetwork>,
}

impl AddressAllocator {
    pub fn new(prefixes: Vec<IpNetwork>) -> Result<Self> {
        if prefixes.is_empty() {
            return Err(Error::InvalidConfig(
                "at least one address prefix is required".to_string(),
            ));
        }
        Ok(Self { prefixes })
    }

    pub fn prefixes(&self) -> &[IpNetwork] {
        &self.prefixes
    }

    /// Pick the lowest free address in every prefix, in configuration order.
    ///
    /// Fails with `AddressPoolExhausted` naming the first prefix with no
    /// candidate; nothing is returned for the other prefixes in that case.
    pub fn allocate(&self, store: &impl UsedAddresses) -> Result<MachineAddresses> {
        let used: HashSet<IpAddr> = store.used_addresses()?.into_iter().collect();

        let mut addresses = Vec::with_capacity(self.prefixes.len());
        for prefix in &self.prefixes {
            let ip = first_free(*prefix, &used).ok_or(Error::AddressPoolExhausted(*prefix))?;
            debug!(%prefix, %ip, "Selected address");
            addresses.push(ip);
        }
        Ok(MachineAddresses(addresses))
    }
}

/// Scan from the address after the network address up to, not including,
/// the last address of the prefix.
fn first_free(prefix: IpNetwork, used: &HashSet<IpAddr>) -> Option<IpAddr> {
    let (network, last) = bounds(prefix);
    let mut candidate = network.checked_add(1)?;

    while candidate < last {
        let ip = to_ip(prefix, candidate);
        if !ip.is_unspecified() && !ip.is_loopback() && !used.contains(&ip) {
            return Some(ip);
        }
        candidate += 1;
    }
    None
}

fn bounds(prefix: IpNetwork) -> (u128, u128) {
    let (network, width) = match prefix.network() {
        IpAddr::V4(addr) => (u128::from(u32::from(addr)), 32u32),
        IpAddr::V6(addr) => (u128::from(addr), 128u32),
    };
    let host_bits = width - u32::from(prefix.prefix());
    let span = match host_bits {
        0 => 0,
        128 => u128::MAX,
        bits => (1u128 << bits) - 1,
    };
    (network, network | span)
}

fn to_ip(prefix: IpNetwork, value: u128) -> IpAddr {
    match prefix {
        // Values stay inside the v4 prefix so the truncation is lossless
        IpNetwork::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
        IpNetwork::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(prefixes: &[&str]) -> AddressAllocator {
        AddressAllocator::new(prefixes.iter().map(|p| p.parse().unwrap()).collect()).unwrap()
    }

    fn none() -> Vec<IpAddr> {
        Vec::new()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_empty_prefix_list_rejected() {
        assert!(matches!(AddressAllocator::new(Vec::new()), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_first_address() {
        let alloc = allocator(&["10.27.0.0/23"]);
        let addrs = alloc.allocate(&none()).unwrap();
        assert_eq!(addrs.0, vec![ip("10.27.0.1")]);
    }

    #[test]
    fn test_sequential_fill_crosses_octet_boundary() {
        let alloc = allocator(&["10.27.0.0/23"]);
        let mut used: Vec<IpAddr> = Vec::new();
        for _ in 0..350 {
            let addrs = alloc.allocate(&used).unwrap();
            used.push(addrs.0[0]);
        }

        assert_eq!(used[0], ip("10.27.0.1"));
        assert_eq!(used[9], ip("10.27.0.10"));
        assert_eq!(used[49], ip("10.27.0.50"));
        // .255 and .0 in the middle of a /23 are ordinary hosts
        assert_eq!(used[254], ip("10.27.0.255"));
        assert_eq!(used[255], ip("10.27.1.0"));
        assert_eq!(used[300], ip("10.27.1.45"));

        let distinct: HashSet<_> = used.iter().collect();
        assert_eq!(distinct.len(), 350);

        // Nothing reserved between calls
        let next = alloc.allocate(&used).unwrap();
        assert_eq!(next.0, vec![ip("10.27.1.95")]);
        assert_eq!(alloc.allocate(&used).unwrap(), next);
    }

    #[test]
    fn test_fills_gaps_first() {
        let alloc = allocator(&["10.0.0.0/24"]);
        let used = vec![ip("10.0.0.1"), ip("10.0.0.3")];
        assert_eq!(alloc.allocate(&used).unwrap().0, vec![ip("10.0.0.2")]);
    }

    #[test]
    fn test_small_prefixes_exhaust() {
        let alloc = allocator(&["192.168.5.0/30"]);
        let mut used: Vec<IpAddr> = Vec::new();
        used.push(alloc.allocate(&used).unwrap().0[0]);
        used.push(alloc.allocate(&used).unwrap().0[0]);
        assert_eq!(used, vec![ip("192.168.5.1"), ip("192.168.5.2")]);

        let err = alloc.allocate(&used).unwrap_err();
        assert!(matches!(err, Error::AddressPoolExhausted(p) if p.to_string() == "192.168.5.0/30"));

        for prefix in ["192.168.5.0/31", "192.168.5.7/32"] {
            let err = allocator(&[prefix]).allocate(&none()).unwrap_err();
            assert!(matches!(err, Error::AddressPoolExhausted(_)));
        }
    }

    #[test]
    fn test_loopback_skipped() {
        let alloc = allocator(&["127.0.0.0/30"]);
        assert!(matches!(alloc.allocate(&none()), Err(Error::AddressPoolExhausted(_))));

        let alloc = allocator(&["::/126"]);
        // ::1 is loopback, ::3 is the last address
        assert_eq!(alloc.allocate(&none()).unwrap().0, vec![ip("::2")]);
    }

    #[test]
    fn test_dual_stack_in_prefix_order() {
        let alloc = allocator(&["100.64.0.0/10", "fd7a:115c:a1e0::/48"]);
        let first = alloc.allocate(&none()).unwrap();
        assert_eq!(first.0, vec![ip("100.64.0.1"), ip("fd7a:115c:a1e0::1")]);

        let second = alloc.allocate(&first.0).unwrap();
        assert_eq!(second.0, vec![ip("100.64.0.2"), ip("fd7a:115c:a1e0::2")]);
    }

    #[test]
    fn test_one_exhausted_prefix_fails_whole_allocation() {
        let alloc = allocator(&["10.0.0.0/24", "10.1.0.0/32"]);
        let err = alloc.allocate(&none()).unwrap_err();
        assert!(matches!(err, Error::AddressPoolExhausted(p) if p.to_string() == "10.1.0.0/32"));
    }

    #[test]
    fn test_addresses_outside_prefix_ignored() {
        let alloc = allocator(&["10.0.0.0/24"]);
        let used = vec![ip("10.0.1.1"), ip("fd00::1")];
        assert_eq!(alloc.allocate(&used).unwrap().0, vec![ip("10.0.0.1")]);
    }
}
