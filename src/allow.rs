use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use n0_error::e;

use crate::error::ConfigError;

/// One network prefix from the allow specification.
///
/// Exact addresses are stored with a full-width prefix (32 or 128).
#[derive(Debug, Clone, Copy)]
struct NetPrefix {
    base: IpAddr,
    prefix_len: u8,
}

impl NetPrefix {
    fn parse(entry: &str) -> Option<Self> {
        match entry.split_once('/') {
            Some((addr, len)) => {
                let base: IpAddr = addr.parse().ok()?;
                let prefix_len: u8 = len.parse().ok()?;
                (prefix_len <= max_prefix(&base)).then_some(Self { base, prefix_len })
            }
            None => {
                let base: IpAddr = entry.parse().ok()?;
                let prefix_len = max_prefix(&base);
                Some(Self { base, prefix_len })
            }
        }
    }

    fn contains(&self, addr: IpAddr) -> bool {
        match (self.base, addr) {
            (IpAddr::V4(base), IpAddr::V4(addr)) => {
                let mask = mask_v4(self.prefix_len);
                u32::from(base) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(base), IpAddr::V6(addr)) => {
                let mask = mask_v6(self.prefix_len);
                u128::from(base) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

fn max_prefix(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else {
        u128::MAX << (128 - prefix_len)
    }
}

/// The set of client networks admitted by the proxy.
///
/// Parsed once at startup and never mutated; containment is the only
/// predicate, so entry order is irrelevant.
#[derive(Debug, Clone)]
pub struct AllowList {
    entries: Vec<NetPrefix>,
}

impl AllowList {
    /// Parses a comma-separated list of prefixes and addresses.
    ///
    /// `"*"` admits every address of both families. Empty segments are
    /// skipped, but a specification with no surviving entries is rejected.
    pub fn parse(spec: &str) -> Result<Self, ConfigError> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err(e!(ConfigError::EmptyAllowList));
        }
        if spec == "*" {
            return Ok(Self {
                entries: vec![
                    NetPrefix {
                        base: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                        prefix_len: 0,
                    },
                    NetPrefix {
                        base: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                        prefix_len: 0,
                    },
                ],
            });
        }

        let mut entries = Vec::new();
        for part in spec.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let entry = NetPrefix::parse(part).ok_or_else(|| {
                e!(ConfigError::InvalidEntry {
                    entry: part.to_string()
                })
            })?;
            entries.push(entry);
        }
        if entries.is_empty() {
            return Err(e!(ConfigError::EmptyAllowList));
        }
        Ok(Self { entries })
    }

    /// True iff `addr` is contained in at least one entry.
    ///
    /// IPv4-mapped IPv6 addresses are canonicalized first so clients
    /// arriving through a dual-stack listener match v4 prefixes.
    pub fn is_allowed(&self, addr: IpAddr) -> bool {
        let addr = addr.to_canonical();
        self.entries.iter().any(|entry| entry.contains(addr))
    }
}
