// Guest IP Allocation
//
// Hands out guest addresses from the configured bridge subnet. The pool is
// the full address range of the CIDR block minus the bridge address, scanned
// lowest-first so allocation order is deterministic.

use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// A guest address paired with the subnet prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestIp {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl fmt::Display for GuestIp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

/// Parse an `a.b.c.d/len` string into (address, prefix length).
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u8)> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| Error::InvalidConfig(format!("not a CIDR: {cidr}")))?;
    let addr: Ipv4Addr = addr
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad address in CIDR: {cidr}")))?;
    let len: u8 = len
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("bad prefix length in CIDR: {cidr}")))?;
    if len > 32 {
        return Err(Error::InvalidConfig(format!(
            "prefix length out of range in CIDR: {cidr}"
        )));
    }
    Ok((addr, len))
}

fn netmask(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

/// Allocator over the guest subnet.
pub struct IpPool {
    first: u32,
    last: u32,
    prefix_len: u8,
    bridge: u32,
    allocated: Mutex<BTreeSet<u32>>,
}

impl IpPool {
    /// Build a pool over `subnet_cidr`, excluding the bridge address.
    ///
    /// `bridge_ip` may be given in CIDR form (`10.20.1.1/24`) or bare.
    pub fn new(subnet_cidr: &str, bridge_ip: &str) -> Result<Self> {
        let (addr, prefix_len) = parse_cidr(subnet_cidr)?;
        let mask = netmask(prefix_len);
        let network = u32::from(addr) & mask;

        let bridge_text = bridge_ip.split('/').next().unwrap_or(bridge_ip);
        let bridge: Ipv4Addr = bridge_text
            .parse()
            .map_err(|_| Error::InvalidConfig(format!("bad bridge address: {bridge_ip}")))?;

        Ok(Self {
            first: network,
            last: network | !mask,
            prefix_len,
            bridge: u32::from(bridge),
            allocated: Mutex::new(BTreeSet::new()),
        })
    }

    /// Allocate the numerically lowest free address in the subnet.
    pub fn allocate(&self) -> Result<GuestIp> {
        let mut allocated = self.allocated.lock().unwrap();
        for raw in self.first..=self.last {
            if raw == self.bridge || allocated.contains(&raw) {
                continue;
            }
            allocated.insert(raw);
            return Ok(GuestIp {
                addr: Ipv4Addr::from(raw),
                prefix_len: self.prefix_len,
            });
        }
        Err(Error::Exhausted("IP"))
    }

    /// Return an address to the pool.
    pub fn free(&self, addr: Ipv4Addr) -> Result<()> {
        let mut allocated = self.allocated.lock().unwrap();
        if !allocated.remove(&u32::from(addr)) {
            return Err(Error::NotAllocated(format!("IP {addr}")));
        }
        Ok(())
    }

    /// Number of addresses currently handed out.
    pub fn in_use(&self) -> usize {
        self.allocated.lock().unwrap().len()
    }
}
