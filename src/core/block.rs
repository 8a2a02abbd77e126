//! Address block algebra
//!
//! An [`AddressBlock`] is a power-of-two sized range of addresses identified by
//! its first address and a prefix length, i.e. a canonical CIDR block.
//!
//! The buddy tree is never stored anywhere. Halves, parents and buddies are
//! derived from the address bits on demand:
//! - the buddy of a `/n` block flips bit `n-1`
//! - the upper half of a `/n` block sets bit `n` and becomes a `/n+1`
//! - the lower half keeps the address and becomes a `/n+1`
//!
//! Bit indices count from the most significant bit of the address, so bit 0 of
//! `128.0.0.0` is set.

use crate::error::{PoolError, Result};
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Width of an IPv4 address in bits
pub const IPV4_BITS: u8 = 32;

/// Width of an IPv6 address in bits
pub const IPV6_BITS: u8 = 128;

/// A canonical CIDR block
///
/// Invariants (enforced by every constructor):
/// - `prefix_len <= max_prefix_len()`
/// - every address bit at index `>= prefix_len` is zero
///
/// Ordering is by family (IPv4 first), then address, then prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AddressBlock {
    addr: IpAddr,
    prefix_len: u8,
}

impl AddressBlock {
    /// Create a block from its first address and prefix length
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` if `prefix_len` exceeds the address width
    /// - `NonCanonicalAddress` if `addr` has bits set beyond `prefix_len`
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self> {
        let width = width_of(&addr);
        if prefix_len > width {
            return Err(PoolError::InvalidArgument(format!(
                "prefix length /{} exceeds address width of {} bits",
                prefix_len, width
            )));
        }

        let block = AddressBlock { addr, prefix_len };
        if block.to_bits() & host_mask(width, prefix_len) != 0 {
            return Err(PoolError::NonCanonicalAddress(format!(
                "{}/{}",
                addr, prefix_len
            )));
        }

        Ok(block)
    }

    /// Parse canonical CIDR notation
    ///
    /// Dotted-decimal input always yields an IPv4 block; only input with a
    /// colon yields an IPv6 block.
    ///
    /// # Examples
    ///
    /// ```
    /// use cidr_pool::AddressBlock;
    ///
    /// let block = AddressBlock::parse("192.168.4.0/23").unwrap();
    /// assert_eq!(block.prefix_len(), 23);
    /// assert!(block.is_ipv4());
    ///
    /// assert!(AddressBlock::parse("192.168.5.0/23").is_err()); // not the first address
    /// ```
    pub fn parse(text: &str) -> Result<Self> {
        let net = IpNet::from_str(text).map_err(|e| {
            PoolError::InvalidFormat(format!("{:?}: {}", text, e))
        })?;

        if net.addr() != net.network() {
            return Err(PoolError::NonCanonicalAddress(text.to_string()));
        }

        AddressBlock::try_from(net)
    }

    /// First address of the block
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Number of leading bits shared by every address in the block
    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Address width in bits (32 or 128)
    pub fn max_prefix_len(&self) -> u8 {
        width_of(&self.addr)
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    /// log2 of the number of addresses in the block
    pub fn size_log2(&self) -> u8 {
        self.max_prefix_len() - self.prefix_len
    }

    /// Last address of the block
    pub fn last_addr(&self) -> IpAddr {
        let last = self.to_bits() | host_mask(self.max_prefix_len(), self.prefix_len);
        self.addr_from_bits(last)
    }

    /// Whether this block is the lower half of its parent
    ///
    /// A `/0` block has no parent and is never the lower half.
    pub fn is_lower(&self) -> bool {
        if self.prefix_len == 0 {
            return false;
        }
        !self.bit(self.prefix_len - 1)
    }

    /// The buddy block: same size, same parent, bit `prefix_len - 1` flipped
    ///
    /// `b.buddy()?.buddy()? == b` for every block with a buddy.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a `/0` block, which spans the whole address space.
    pub fn buddy(&self) -> Result<Self> {
        if self.prefix_len == 0 || self.prefix_len > self.max_prefix_len() {
            return Err(PoolError::InvalidOperation(format!(
                "{} has no buddy",
                self
            )));
        }

        let bits = self.to_bits() ^ self.bit_mask(self.prefix_len - 1);
        Ok(AddressBlock {
            addr: self.addr_from_bits(bits),
            prefix_len: self.prefix_len,
        })
    }

    /// Upper half of the block
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a single-address block.
    pub fn upper_half(&self) -> Result<Self> {
        self.ensure_splittable()?;

        let bits = self.to_bits() | self.bit_mask(self.prefix_len);
        Ok(AddressBlock {
            addr: self.addr_from_bits(bits),
            prefix_len: self.prefix_len + 1,
        })
    }

    /// Lower half of the block (same address, one more prefix bit)
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a single-address block.
    pub fn lower_half(&self) -> Result<Self> {
        self.ensure_splittable()?;

        Ok(AddressBlock {
            addr: self.addr,
            prefix_len: self.prefix_len + 1,
        })
    }

    /// The block that this block and its buddy together make up
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a `/0` block.
    pub fn parent(&self) -> Result<Self> {
        if self.prefix_len == 0 {
            return Err(PoolError::InvalidOperation(format!(
                "{} has no parent",
                self
            )));
        }

        let prefix_len = self.prefix_len - 1;
        let bits = self.to_bits() & !host_mask(self.max_prefix_len(), prefix_len);
        Ok(AddressBlock {
            addr: self.addr_from_bits(bits),
            prefix_len,
        })
    }

    /// Check if `other` lies entirely within this block
    pub fn contains(&self, other: &AddressBlock) -> bool {
        if self.is_ipv4() != other.is_ipv4() || other.prefix_len < self.prefix_len {
            return false;
        }
        let network = !host_mask(self.max_prefix_len(), self.prefix_len);
        other.to_bits() & network == self.to_bits()
    }

    /// Check if the two blocks share any address
    ///
    /// Blocks of different families never overlap.
    pub fn overlaps(&self, other: &AddressBlock) -> bool {
        self.contains(other) || other.contains(self)
    }

    fn ensure_splittable(&self) -> Result<()> {
        if self.prefix_len >= self.max_prefix_len() {
            return Err(PoolError::InvalidOperation(format!(
                "cannot split single-address block {}",
                self
            )));
        }
        Ok(())
    }

    fn to_bits(&self) -> u128 {
        match self.addr {
            IpAddr::V4(a) => u128::from(u32::from(a)),
            IpAddr::V6(a) => u128::from(a),
        }
    }

    fn addr_from_bits(&self, bits: u128) -> IpAddr {
        match self.addr {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
        }
    }

    /// Mask selecting bit `index`, counted from the most significant bit
    fn bit_mask(&self, index: u8) -> u128 {
        1u128 << (self.max_prefix_len() - 1 - index)
    }

    fn bit(&self, index: u8) -> bool {
        self.to_bits() & self.bit_mask(index) != 0
    }
}

fn width_of(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => IPV4_BITS,
        IpAddr::V6(_) => IPV6_BITS,
    }
}

/// Mask of the bits past `prefix_len` in an address of `width` bits
fn host_mask(width: u8, prefix_len: u8) -> u128 {
    let host_bits = u32::from(width - prefix_len);
    if host_bits == 0 {
        0
    } else {
        u128::MAX >> (128 - host_bits)
    }
}

/// Compressed hex form of an IPv6 address
///
/// Same as RFC 5952 except that IPv4-mapped addresses keep hex groups
/// instead of a dotted tail.
fn write_ipv6(f: &mut fmt::Formatter<'_>, addr: &Ipv6Addr) -> fmt::Result {
    let segments = addr.segments();

    // Longest run of zero groups, leftmost on ties
    let (mut run_start, mut run_len) = (0, 0);
    let mut start = 0;
    for i in 0..=segments.len() {
        if i == segments.len() || segments[i] != 0 {
            if i - start > run_len {
                run_start = start;
                run_len = i - start;
            }
            start = i + 1;
        }
    }

    if run_len < 2 {
        return write_groups(f, &segments);
    }
    write_groups(f, &segments[..run_start])?;
    f.write_str("::")?;
    write_groups(f, &segments[run_start + run_len..])
}

fn write_groups(f: &mut fmt::Formatter<'_>, groups: &[u16]) -> fmt::Result {
    for (i, group) in groups.iter().enumerate() {
        if i > 0 {
            f.write_str(":")?;
        }
        write!(f, "{:x}", group)?;
    }
    Ok(())
}

impl fmt::Display for AddressBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            IpAddr::V4(addr) => write!(f, "{}", addr)?,
            IpAddr::V6(addr) => write_ipv6(f, addr)?,
        }
        write!(f, "/{}", self.prefix_len)
    }
}

impl FromStr for AddressBlock {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self> {
        AddressBlock::parse(s)
    }
}

impl TryFrom<IpNet> for AddressBlock {
    type Error = PoolError;

    fn try_from(net: IpNet) -> Result<Self> {
        AddressBlock::new(net.addr(), net.prefix_len())
    }
}

impl Serialize for AddressBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for AddressBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        AddressBlock::parse(&text).map_err(serde::de::Error::custom)
    }
}
