//! Structured mDNS records and the text adapter for mdns log lines.
//!
//! The log format handled here is:
//!
//! ```text
//! answer _vortideck._tcp.local. PTR studio._vortideck._tcp.local.
//! additional studio._vortideck._tcp.local. SRV vortideck.local. priority 0 weight 0 port 9001
//! additional vortideck.local. A 192.168.1.10
//! ```

/// One record relevant to resolving a service instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MdnsRecord {
    /// Service type -> instance name
    Ptr { instance: String },
    /// Instance -> target host and port. `port` is kept wide so out-of-range
    /// values reach validation instead of wrapping.
    Srv { target: String, port: u32 },
    /// Host -> IPv4 literal, unvalidated
    A { owner: String, address: String },
}

/// Dotted-quad IPv4 check: four non-empty decimal parts, each 0-255.
pub fn is_valid_ip_address(ip: &str) -> bool {
    if ip.is_empty() || ip.len() > 15 {
        return false;
    }

    let mut parts = 0;
    for part in ip.split('.') {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        match part.parse::<u16>() {
            Ok(n) if n <= 255 => {}
            _ => return false,
        }
        parts += 1;
    }

    parts == 4
}

/// Port 0 is reserved.
pub fn is_valid_port(port: u32) -> bool {
    (1..=65535).contains(&port)
}

/// Token following `keyword` in a whitespace-split line
fn token_after<'a>(tokens: &[&'a str], keyword: &str) -> Option<&'a str> {
    let idx = tokens.iter().position(|t| *t == keyword)?;
    tokens.get(idx + 1).copied()
}

/// Leading decimal digits of `token`, parsed. Unparsable ports map to 0.
fn parse_port(token: &str) -> u32 {
    let digits: String = token.chars().take_while(|c| c.is_ascii_digit()).collect();
    match digits.parse::<u32>() {
        Ok(port) => port,
        Err(e) => {
            tracing::warn!("Failed to parse port from {:?}: {}", token, e);
            0
        }
    }
}

/// Classify one log line. Lines that are not PTR/SRV/A records for
/// `service_type` yield `None`.
pub fn parse_log_line(line: &str, service_type: &str) -> Option<MdnsRecord> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let ptr_marker = format!("answer {} PTR", service_type);

    if line.contains(&ptr_marker) {
        let instance = token_after(&tokens, "PTR")?;
        return Some(MdnsRecord::Ptr {
            instance: instance.to_string(),
        });
    }

    if line.contains("SRV") && line.contains("port") {
        let target = token_after(&tokens, "SRV")?;
        let port = token_after(&tokens, "port").map(parse_port).unwrap_or(0);
        return Some(MdnsRecord::Srv {
            target: target.to_string(),
            port,
        });
    }

    if line.contains("additional") && tokens.contains(&"A") {
        let idx = tokens.iter().position(|t| *t == "A")?;
        let owner = if idx > 0 { tokens[idx - 1] } else { "" };
        let address = tokens.get(idx + 1)?;
        return Some(MdnsRecord::A {
            owner: owner.to_string(),
            address: address.to_string(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: &str = "_vortideck._tcp.local.";

    #[test]
    fn test_valid_ip_addresses() {
        for ip in ["192.168.1.10", "0.0.0.0", "255.255.255.255", "10.0.0.5", "01.2.3.4"] {
            assert!(is_valid_ip_address(ip), "{} should be valid", ip);
        }
    }

    #[test]
    fn test_invalid_ip_addresses() {
        for ip in [
            "",
            "256.1.1.1",
            "1.2.3",
            "1.2.3.4.5",
            "1..2.3",
            ".1.2.3",
            "1.2.3.",
            "a.b.c.d",
            "1.2.3.-4",
            "1.2.3.4 ",
            "1234.1.1.1",
            "100.100.100.1000",
            "::1",
        ] {
            assert!(!is_valid_ip_address(ip), "{:?} should be invalid", ip);
        }
    }

    #[test]
    fn test_ip_longer_than_fifteen_chars() {
        assert!(!is_valid_ip_address("192.168.100.1000"));
    }

    #[test]
    fn test_port_range() {
        assert!(!is_valid_port(0));
        assert!(is_valid_port(1));
        assert!(is_valid_port(9001));
        assert!(is_valid_port(65535));
        assert!(!is_valid_port(65536));
        assert!(!is_valid_port(u32::MAX));
    }

    #[test]
    fn test_parse_ptr() {
        let record = parse_log_line("answer _vortideck._tcp.local. PTR foo._vortideck._tcp.local.", TYPE);
        assert_eq!(
            record,
            Some(MdnsRecord::Ptr { instance: "foo._vortideck._tcp.local.".to_string() })
        );
    }

    #[test]
    fn test_ptr_for_other_type_is_ignored() {
        assert_eq!(parse_log_line("answer _http._tcp.local. PTR web._http._tcp.local.", TYPE), None);
    }

    #[test]
    fn test_parse_srv() {
        let record = parse_log_line(
            "additional foo._vortideck._tcp.local. SRV vortideck.local. priority 0 weight 0 port 9001\n",
            TYPE,
        );
        assert_eq!(
            record,
            Some(MdnsRecord::Srv { target: "vortideck.local.".to_string(), port: 9001 })
        );
    }

    #[test]
    fn test_srv_with_garbage_port() {
        let record = parse_log_line(
            "additional foo._vortideck._tcp.local. SRV vortideck.local. priority 0 weight 0 port x9",
            TYPE,
        );
        assert_eq!(
            record,
            Some(MdnsRecord::Srv { target: "vortideck.local.".to_string(), port: 0 })
        );
    }

    #[test]
    fn test_srv_port_out_of_u16_range_is_kept_wide() {
        let record = parse_log_line(
            "additional foo._vortideck._tcp.local. SRV vortideck.local. priority 0 weight 0 port 70000",
            TYPE,
        );
        assert_eq!(
            record,
            Some(MdnsRecord::Srv { target: "vortideck.local.".to_string(), port: 70000 })
        );
    }

    #[test]
    fn test_parse_a() {
        let record = parse_log_line("additional vortideck.local. A 10.0.0.5", TYPE);
        assert_eq!(
            record,
            Some(MdnsRecord::A { owner: "vortideck.local.".to_string(), address: "10.0.0.5".to_string() })
        );
    }

    #[test]
    fn test_unrelated_lines() {
        assert_eq!(parse_log_line("Opened 2 sockets", TYPE), None);
        assert_eq!(parse_log_line("additional vortideck.local. AAAA fe80::1", TYPE), None);
        assert_eq!(parse_log_line("", TYPE), None);
    }
}
