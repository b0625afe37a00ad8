//! IPv4 CIDR parsing and containment checks.
//!
//! Used to pick the externally reachable address out of the set the
//! hypervisor reports for an instance (NAT, bridged, and extra adapters all
//! show up in the same list).

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when parsing CIDR notation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CidrError {
    /// Raised when the value has no `/prefix` component.
    #[error("CIDR '{value}' is missing a '/prefix' component")]
    MissingPrefix {
        /// Raw input.
        value: String,
    },
    /// Raised when the address part is not a dotted-quad IPv4 address.
    #[error("CIDR '{value}' has an invalid IPv4 address")]
    InvalidAddress {
        /// Raw input.
        value: String,
    },
    /// Raised when the prefix length is not an integer in `0..=32`.
    #[error("CIDR '{value}' has an invalid prefix length (expected 0-32)")]
    InvalidPrefix {
        /// Raw input.
        value: String,
    },
}

/// An IPv4 range in `a.b.c.d/n` notation.
///
/// Parsing is strict: every octet must be in `0..=255` and the prefix length
/// in `0..=32`. The address is kept exactly as written; host bits are not
/// cleared.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    address: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Builds a CIDR from its parts.
    ///
    /// # Errors
    ///
    /// Returns [`CidrError::InvalidPrefix`] when `prefix` exceeds 32.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self, CidrError> {
        if prefix > 32 {
            return Err(CidrError::InvalidPrefix {
                value: format!("{address}/{prefix}"),
            });
        }
        Ok(Self { address, prefix })
    }

    /// Address component as written.
    #[must_use]
    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    /// Prefix length in bits.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Mask with the leading `prefix` bits set.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        match self.prefix {
            0 => 0,
            bits => u32::MAX << (32 - bits),
        }
    }

    /// Lowest address of the range (all host bits cleared).
    #[must_use]
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask())
    }

    /// Highest address of the range (all host bits set).
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network()) | !self.mask())
    }

    /// Shorthand for [`ip_in_cidr`] with default options.
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        ip_in_cidr(self, ip, CidrMatchOptions::default())
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let Some((address_text, prefix_text)) = trimmed.split_once('/') else {
            return Err(CidrError::MissingPrefix {
                value: value.to_owned(),
            });
        };

        let address =
            Ipv4Addr::from_str(address_text).map_err(|_| CidrError::InvalidAddress {
                value: value.to_owned(),
            })?;

        let prefix = prefix_text
            .parse::<u8>()
            .ok()
            .filter(|bits| *bits <= 32 && !prefix_text.starts_with('+'))
            .ok_or_else(|| CidrError::InvalidPrefix {
                value: value.to_owned(),
            })?;

        Ok(Self { address, prefix })
    }
}

impl TryFrom<String> for Cidr {
    type Error = CidrError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

/// Opt-in exclusions applied by [`ip_in_cidr`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CidrMatchOptions {
    /// Reject the network address (all-zero host suffix).
    pub exclude_network: bool,
    /// Reject the broadcast address (all-one host suffix).
    pub exclude_broadcast: bool,
}

impl CidrMatchOptions {
    /// Excludes both the network and broadcast addresses.
    #[must_use]
    pub const fn hosts_only() -> Self {
        Self {
            exclude_network: true,
            exclude_broadcast: true,
        }
    }
}

/// Returns `true` when the leading `prefix` bits of `ip` equal those of the
/// CIDR's address.
///
/// Exclusions only apply to prefixes shorter than 31 bits; `/31` and `/32`
/// ranges have no distinct network or broadcast address.
#[must_use]
pub fn ip_in_cidr(cidr: &Cidr, ip: Ipv4Addr, options: CidrMatchOptions) -> bool {
    let mask = cidr.mask();
    let candidate = u32::from(ip);
    if candidate & mask != u32::from(cidr.address) & mask {
        return false;
    }

    if cidr.prefix < 31 {
        if options.exclude_network && ip == cidr.network() {
            return false;
        }
        if options.exclude_broadcast && ip == cidr.broadcast() {
            return false;
        }
    }

    true
}

/// Picks the first address matching `filter`, or the first address overall
/// when no filter is given.
#[must_use]
pub fn select_address(addresses: &[Ipv4Addr], filter: Option<&Cidr>) -> Option<Ipv4Addr> {
    match filter {
        None => addresses.first().copied(),
        Some(cidr) => addresses.iter().copied().find(|ip| cidr.contains(*ip)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn cidr(value: &str) -> Cidr {
        value
            .parse()
            .unwrap_or_else(|err| panic!("fixture CIDR {value} should parse: {err}"))
    }

    fn ip(value: &str) -> Ipv4Addr {
        value
            .parse()
            .unwrap_or_else(|err| panic!("fixture IP {value} should parse: {err}"))
    }

    fn bits(addr: Ipv4Addr) -> String {
        addr.octets()
            .iter()
            .map(|octet| format!("{octet:08b}"))
            .collect()
    }

    #[rstest]
    #[case("10.254.254.0/24", "10.254.254.5", true)]
    #[case("10.254.254.0/24", "10.254.255.5", false)]
    #[case("0.0.0.0/0", "203.0.113.9", true)]
    #[case("192.168.64.7/32", "192.168.64.7", true)]
    #[case("192.168.64.7/32", "192.168.64.8", false)]
    #[case("172.16.0.0/12", "172.31.255.255", true)]
    #[case("172.16.0.0/12", "172.32.0.0", false)]
    fn ip_in_cidr_matches_examples(#[case] range: &str, #[case] addr: &str, #[case] expected: bool) {
        assert_eq!(
            ip_in_cidr(&cidr(range), ip(addr), CidrMatchOptions::default()),
            expected
        );
    }

    #[test]
    fn ip_in_cidr_agrees_with_bit_string_prefix_comparison() {
        let ranges = ["10.0.0.0/8", "10.254.248.0/21", "192.168.1.128/25", "0.0.0.0/0"];
        let candidates = [
            "10.1.2.3",
            "10.254.249.1",
            "10.254.240.1",
            "192.168.1.129",
            "192.168.1.127",
            "8.8.8.8",
        ];

        for range in ranges {
            let parsed = cidr(range);
            let prefix = usize::from(parsed.prefix());
            let network_bits = bits(parsed.address());
            for candidate in candidates {
                let candidate_bits = bits(ip(candidate));
                let manual = network_bits.get(..prefix) == candidate_bits.get(..prefix);
                assert_eq!(
                    ip_in_cidr(&parsed, ip(candidate), CidrMatchOptions::default()),
                    manual,
                    "{candidate} in {range}"
                );
            }
        }
    }

    #[rstest]
    #[case("10.0.0.0", false)]
    #[case("10.0.0.1", true)]
    #[case("10.0.0.2", true)]
    #[case("10.0.0.3", false)]
    fn slash_30_excludes_network_and_broadcast(#[case] addr: &str, #[case] expected: bool) {
        assert_eq!(
            ip_in_cidr(&cidr("10.0.0.0/30"), ip(addr), CidrMatchOptions::hosts_only()),
            expected
        );
    }

    #[test]
    fn exclusion_is_opt_in() {
        let range = cidr("10.0.0.0/30");
        assert!(range.contains(ip("10.0.0.0")));
        assert!(range.contains(ip("10.0.0.3")));
    }

    #[test]
    fn slash_31_ignores_exclusions() {
        let range = cidr("10.0.0.0/31");
        assert!(ip_in_cidr(&range, ip("10.0.0.0"), CidrMatchOptions::hosts_only()));
        assert!(ip_in_cidr(&range, ip("10.0.0.1"), CidrMatchOptions::hosts_only()));
    }

    #[rstest]
    #[case("10.0.0.0")]
    #[case("10.0.0.256/24")]
    #[case("10.0.0/24")]
    #[case("10.0.0.0/33")]
    #[case("10.0.0.0/-1")]
    #[case("10.0.0.0/+8")]
    #[case("10.0.0.0/abc")]
    fn parse_rejects_malformed_values(#[case] value: &str) {
        assert!(value.parse::<Cidr>().is_err(), "{value} should be rejected");
    }

    #[test]
    fn display_round_trips_input() {
        assert_eq!(cidr("10.254.244.0/22").to_string(), "10.254.244.0/22");
    }

    #[test]
    fn select_address_prefers_filter_match() {
        let addresses = [ip("192.168.64.5"), ip("10.0.0.9")];
        assert_eq!(select_address(&addresses, None), Some(ip("192.168.64.5")));
        assert_eq!(
            select_address(&addresses, Some(&cidr("10.0.0.0/24"))),
            Some(ip("10.0.0.9"))
        );
        assert_eq!(select_address(&addresses, Some(&cidr("172.16.0.0/16"))), None);
        assert_eq!(select_address(&[], None), None);
    }
}
