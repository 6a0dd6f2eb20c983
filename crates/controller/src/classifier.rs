//! Classification of VPN client output lines
//!
//! Every line is matched against a marker table of literal substrings. When
//! several markers match the same line the longest pattern wins; equal
//! lengths go to the entry that comes first in the table. Matching is
//! case-sensitive. Lines that match nothing are passed through unclassified.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// What a marker signals about the connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    /// Interactive username prompt
    UsernamePrompt,
    /// Interactive password prompt
    PasswordPrompt,
    /// Server rejected the credentials
    AuthFailed,
    /// Tunnel device created; line names the interface
    InterfaceOpened,
    /// Address configured on the tunnel device
    AddressAssigned,
    /// Tunnel fully up
    TunnelEstablished,
    /// Client is shutting down
    ProcessExiting,
    /// Client reported an unrecoverable error
    FatalError,
}

impl MarkerKind {
    pub fn is_prompt(&self) -> bool {
        matches!(self, MarkerKind::UsernamePrompt | MarkerKind::PasswordPrompt)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Marker {
    pub pattern: String,
    pub kind: MarkerKind,
}

impl Marker {
    pub fn new(pattern: impl Into<String>, kind: MarkerKind) -> Self {
        Self {
            pattern: pattern.into(),
            kind,
        }
    }
}

/// Result of classifying one line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub kind: Option<MarkerKind>,
    pub interface: Option<String>,
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerTable {
    markers: Vec<Marker>,
}

impl Default for MarkerTable {
    /// Markers printed by OpenVPN 2.4 - 2.6
    fn default() -> Self {
        use MarkerKind::*;
        Self {
            markers: vec![
                Marker::new("Enter Auth Username:", UsernamePrompt),
                Marker::new("Enter Auth Password:", PasswordPrompt),
                Marker::new("AUTH_FAILED", AuthFailed),
                Marker::new("SIGTERM[soft,auth-failure]", AuthFailed),
                Marker::new("TUN/TAP device", InterfaceOpened),
                Marker::new("net_addr_v4_add:", AddressAssigned),
                Marker::new("ip addr add dev", AddressAssigned),
                Marker::new("/sbin/ifconfig", AddressAssigned),
                Marker::new("Initialization Sequence Completed", TunnelEstablished),
                Marker::new("process exiting", ProcessExiting),
                Marker::new("Exiting due to fatal error", FatalError),
                Marker::new("Options error:", FatalError),
            ],
        }
    }
}

impl MarkerTable {
    pub fn new(markers: Vec<Marker>) -> Self {
        Self { markers }
    }

    pub fn push(&mut self, marker: Marker) {
        self.markers.push(marker);
    }

    pub fn markers(&self) -> &[Marker] {
        &self.markers
    }

    /// Patterns of prompt markers, for the line codec
    pub fn prompt_patterns(&self) -> Vec<String> {
        self.markers
            .iter()
            .filter(|m| m.kind.is_prompt())
            .map(|m| m.pattern.clone())
            .collect()
    }

    /// The most specific marker found in `line`
    pub fn matching(&self, line: &str) -> Option<&Marker> {
        let mut best: Option<&Marker> = None;
        for marker in &self.markers {
            if marker.pattern.is_empty() || !line.contains(marker.pattern.as_str()) {
                continue;
            }
            // Strictly longer only, so earlier entries win ties
            if best.map_or(true, |b| marker.pattern.len() > b.pattern.len()) {
                best = Some(marker);
            }
        }
        best
    }

    pub fn classify(&self, line: &str) -> Classification {
        let Some(marker) = self.matching(line) else {
            return Classification::default();
        };

        let mut result = Classification {
            kind: Some(marker.kind),
            ..Default::default()
        };
        match marker.kind {
            MarkerKind::InterfaceOpened => {
                result.interface = extract_interface(line);
            }
            MarkerKind::AddressAssigned | MarkerKind::TunnelEstablished => {
                result.interface = extract_interface(line);
                result.address = extract_address(line);
            }
            _ => {}
        }
        result
    }
}

fn tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| c.is_whitespace() || c == ',')
        .map(|t| t.trim_matches(|c: char| matches!(c, '[' | ']' | '(' | ')' | '\'' | '"')))
        .filter(|t| !t.is_empty())
}

/// First token that looks like a tunnel device name (tun0, tap1, utun3)
pub fn extract_interface(line: &str) -> Option<String> {
    tokens(line)
        .map(|t| t.trim_end_matches([':', '.', ';']))
        .find(|t| {
            ["tun", "tap", "utun"].iter().any(|prefix| {
                t.strip_prefix(prefix)
                    .map(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
        .map(str::to_string)
}

/// First IP address in the line, without prefix length ("10.8.0.2/24")
pub fn extract_address(line: &str) -> Option<String> {
    tokens(line)
        .map(|t| t.split('/').next().unwrap_or(t))
        .map(|t| t.trim_end_matches([',', ';', '.']))
        .find_map(|t| t.parse::<IpAddr>().ok())
        .map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognised_line_passes_through() {
        let table = MarkerTable::default();
        let result = table.classify("2024-10-18 12:00:01 UDPv4 link remote: [AF_INET]1.2.3.4:1194");
        assert_eq!(result, Classification::default());
    }

    #[test]
    fn test_prompt_markers() {
        let table = MarkerTable::default();
        assert_eq!(
            table.classify("Enter Auth Username:").kind,
            Some(MarkerKind::UsernamePrompt)
        );
        assert_eq!(
            table.classify("Enter Auth Password:").kind,
            Some(MarkerKind::PasswordPrompt)
        );
        assert_eq!(
            table.prompt_patterns(),
            vec!["Enter Auth Username:", "Enter Auth Password:"]
        );
    }

    #[test]
    fn test_longest_marker_wins() {
        let table = MarkerTable::default();
        // Both "process exiting" and the auth-failure signal match
        let line = "2024-10-18 SIGTERM[soft,auth-failure] received, process exiting";
        assert_eq!(table.classify(line).kind, Some(MarkerKind::AuthFailed));

        let line = "2024-10-18 SIGTERM[hard,] received, process exiting";
        assert_eq!(table.classify(line).kind, Some(MarkerKind::ProcessExiting));
    }

    #[test]
    fn test_equal_length_tie_goes_to_first_entry() {
        let table = MarkerTable::new(vec![
            Marker::new("ABCD", MarkerKind::FatalError),
            Marker::new("WXYZ", MarkerKind::ProcessExiting),
        ]);
        assert_eq!(table.classify("WXYZ ABCD").kind, Some(MarkerKind::FatalError));
    }

    #[test]
    fn test_extends_with_custom_marker() {
        let mut table = MarkerTable::default();
        table.push(Marker::new("Peer Connection Initiated", MarkerKind::InterfaceOpened));
        assert_eq!(
            table.classify("[server] Peer Connection Initiated with [AF_INET]1.2.3.4:1194").kind,
            Some(MarkerKind::InterfaceOpened)
        );
    }

    #[test]
    fn test_established_line_metadata() {
        let table = MarkerTable::default();
        let result = table.classify(
            "2024-10-18 12:00:05 Initialization Sequence Completed interface tun0 address 10.8.0.2",
        );
        assert_eq!(result.kind, Some(MarkerKind::TunnelEstablished));
        assert_eq!(result.interface.as_deref(), Some("tun0"));
        assert_eq!(result.address.as_deref(), Some("10.8.0.2"));
    }

    #[test]
    fn test_openvpn_device_lines() {
        let table = MarkerTable::default();

        let opened = table.classify("2024-10-18 12:00:04 TUN/TAP device tun0 opened");
        assert_eq!(opened.kind, Some(MarkerKind::InterfaceOpened));
        assert_eq!(opened.interface.as_deref(), Some("tun0"));

        let addr = table.classify("2024-10-18 12:00:04 net_addr_v4_add: 10.8.0.6/24 dev tun0");
        assert_eq!(addr.kind, Some(MarkerKind::AddressAssigned));
        assert_eq!(addr.address.as_deref(), Some("10.8.0.6"));
        assert_eq!(addr.interface.as_deref(), Some("tun0"));

        let legacy = table.classify(
            "/sbin/ip addr add dev tap1 172.16.4.10/24 broadcast 172.16.4.255",
        );
        assert_eq!(legacy.interface.as_deref(), Some("tap1"));
        assert_eq!(legacy.address.as_deref(), Some("172.16.4.10"));
    }

    #[test]
    fn test_timestamps_are_not_addresses() {
        assert_eq!(extract_address("Mon Oct 18 12:00:05 2024 nothing here"), None);
        assert_eq!(extract_interface("tunnel tunx tun"), None);
    }
}
