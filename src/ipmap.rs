use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How two address ranges relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overlap {
    None,
    AInB,
    BInA,
    Partial,
    Identical,
}

/// A parsed CIDR prefix. A bare address parses as a host prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpPrefix {
    start: u128,
    end: u128,
    v6: bool,
}

fn ip_to_u128(ip: IpAddr) -> (u128, bool) {
    match ip {
        IpAddr::V4(v4) => (u32::from(v4) as u128, false),
        IpAddr::V6(v6) => (u128::from(v6), true),
    }
}

impl IpPrefix {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let (addr, bits) = match text.split_once('/') {
            Some((addr, bits)) => (addr, Some(bits.parse::<u32>()?)),
            None => (text, None),
        };
        let ip: IpAddr = addr.trim().parse()?;
        let (value, v6) = ip_to_u128(ip);
        let width = if v6 { 128 } else { 32 };
        let bits = bits.unwrap_or(width);
        if bits > width {
            anyhow::bail!("prefix length {bits} too long for {addr}");
        }
        let host_bits = width - bits;
        let mask = if host_bits >= 128 { 0 } else { u128::MAX << host_bits };
        let start = value & mask;
        let end = start | !mask & (if v6 { u128::MAX } else { u32::MAX as u128 });
        Ok(Self { start, end, v6 })
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        let (value, v6) = ip_to_u128(ip);
        Self {
            start: value,
            end: value,
            v6,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        matches!(
            self.overlap(&IpPrefix::from_ip(ip)),
            Overlap::BInA | Overlap::Identical
        )
    }

    /// Classify the overlap of `self` (A) against `other` (B).
    pub fn overlap(&self, other: &IpPrefix) -> Overlap {
        if self.v6 != other.v6 {
            return Overlap::None;
        }
        if self.end < other.start || other.end < self.start {
            return Overlap::None;
        }
        if self.start == other.start && self.end == other.end {
            return Overlap::Identical;
        }
        if self.start >= other.start && self.end <= other.end {
            return Overlap::AInB;
        }
        if other.start >= self.start && other.end <= self.end {
            return Overlap::BInA;
        }
        Overlap::Partial
    }
}

/// Rewrites applied to a matched peer.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IpMapEntry {
    pub ip: Option<IpAddr>,
    pub helo: Option<String>,
}

/// The configured `ip_map`, with prefixes pre-parsed and held in sorted
/// key order so overlapping prefixes resolve deterministically (lowest key
/// wins).
#[derive(Debug, Clone, Default)]
pub struct IpMap {
    entries: Vec<(String, IpPrefix, IpMapEntry)>,
}

impl IpMap {
    pub fn parse(raw: &std::collections::HashMap<String, IpMapEntry>) -> anyhow::Result<Self> {
        let mut keys: Vec<&String> = raw.keys().collect();
        keys.sort();
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let prefix = IpPrefix::parse(key)
                .map_err(|e| anyhow::anyhow!("bad ip_map prefix {key:?}: {e}"))?;
            entries.push((key.clone(), prefix, raw[key].clone()));
        }
        Ok(Self { entries })
    }

    /// First entry whose prefix overlaps the peer address.
    pub fn lookup(&self, ip: IpAddr) -> Option<&IpMapEntry> {
        let peer = IpPrefix::from_ip(ip);
        self.entries
            .iter()
            .find(|(_, prefix, _)| peer.overlap(prefix) != Overlap::None)
            .map(|(_, _, entry)| entry)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn prefix_parsing_and_containment() {
        let net = IpPrefix::parse("198.51.100.0/24").unwrap();
        assert!(net.contains("198.51.100.77".parse().unwrap()));
        assert!(!net.contains("198.51.101.1".parse().unwrap()));
        let host = IpPrefix::parse("192.0.2.5").unwrap();
        assert!(host.contains("192.0.2.5".parse().unwrap()));
    }

    #[test]
    fn overlap_classification() {
        let a = IpPrefix::parse("10.0.0.0/8").unwrap();
        let b = IpPrefix::parse("10.1.0.0/16").unwrap();
        assert_eq!(b.overlap(&a), Overlap::AInB);
        assert_eq!(a.overlap(&b), Overlap::BInA);
        assert_eq!(a.overlap(&a), Overlap::Identical);
        let c = IpPrefix::parse("192.168.0.0/16").unwrap();
        assert_eq!(a.overlap(&c), Overlap::None);
    }

    #[test]
    fn families_never_overlap() {
        let v4 = IpPrefix::parse("0.0.0.0/0").unwrap();
        let v6 = IpPrefix::parse("::/0").unwrap();
        assert_eq!(v4.overlap(&v6), Overlap::None);
    }

    #[test]
    fn lowest_key_wins_for_overlapping_prefixes() {
        let mut raw = HashMap::new();
        raw.insert(
            "198.51.100.0/24".to_string(),
            IpMapEntry {
                ip: Some("192.0.2.5".parse().unwrap()),
                helo: None,
            },
        );
        raw.insert(
            "198.51.100.0/25".to_string(),
            IpMapEntry {
                ip: Some("192.0.2.99".parse().unwrap()),
                helo: None,
            },
        );
        let map = IpMap::parse(&raw).unwrap();
        let entry = map.lookup("198.51.100.10".parse().unwrap()).unwrap();
        // "…/24" sorts before "…/25".
        assert_eq!(entry.ip, Some("192.0.2.5".parse().unwrap()));
    }

    #[test]
    fn lookup_miss_returns_none() {
        let map = IpMap::parse(&HashMap::new()).unwrap();
        assert!(map.lookup("203.0.113.1".parse().unwrap()).is_none());
    }
}
