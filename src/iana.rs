//! IANA protocol-number registry.
//!
//! The handful of assignments that actually show up in flow telemetry,
//! looked up when rendering protocol breakdowns for humans. Unknown numbers
//! fall back to their decimal form.

use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Protocols {
    by_number: BTreeMap<u8, &'static str>,
}

impl Default for Protocols {
    fn default() -> Self {
        Self::new()
    }
}

impl Protocols {
    pub fn new() -> Self {
        let by_number = BTreeMap::from([
            (0, "HOPOPT"),
            (1, "ICMP"),
            (2, "IGMP"),
            (4, "IPv4"),
            (6, "TCP"),
            (8, "EGP"),
            (17, "UDP"),
            (41, "IPv6"),
            (43, "IPv6-Route"),
            (44, "IPv6-Frag"),
            (46, "RSVP"),
            (47, "GRE"),
            (50, "ESP"),
            (51, "AH"),
            (58, "IPv6-ICMP"),
            (59, "IPv6-NoNxt"),
            (60, "IPv6-Opts"),
            (88, "EIGRP"),
            (89, "OSPFIGP"),
            (94, "IPIP"),
            (103, "PIM"),
            (112, "VRRP"),
            (115, "L2TP"),
            (132, "SCTP"),
            (136, "UDPLite"),
            (137, "MPLS-in-IP"),
        ]);
        Protocols { by_number }
    }

    pub fn name(&self, number: u8) -> Option<&'static str> {
        self.by_number.get(&number).copied()
    }

    /// All known assignments, for the `/protocols` endpoint.
    pub fn all(&self) -> &BTreeMap<u8, &'static str> {
        &self.by_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_protocols() {
        let p = Protocols::new();
        assert_eq!(p.name(6), Some("TCP"));
        assert_eq!(p.name(17), Some("UDP"));
        assert_eq!(p.name(254), None);
    }
}
