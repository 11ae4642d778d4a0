use crate::error::{DiscoveryError, Result};
use std::net::Ipv4Addr;

/// Default HTTP port of the player's embedded web server.
pub const DEFAULT_PORT: u16 = 80;

/// Parse a dotted-quad IPv4 address as typed by a user.
///
/// Accepted: exactly four `.`-separated groups of 1 to 3 ASCII digits, each
/// with a value in 0..=255. Leading zeros are tolerated (`192.168.001.10`),
/// surrounding whitespace is trimmed.
pub fn parse_ipv4(s: &str) -> Result<Ipv4Addr> {
    let s = s.trim();
    let invalid = || DiscoveryError::InvalidAddress(s.to_string());

    let mut octets = [0u8; 4];
    let mut count = 0usize;
    for part in s.split('.') {
        if count == 4 {
            return Err(invalid());
        }
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let val: u16 = part.parse().map_err(|_| invalid())?;
        if val > 255 {
            return Err(invalid());
        }
        octets[count] = val as u8;
        count += 1;
    }
    if count != 4 {
        return Err(invalid());
    }
    Ok(Ipv4Addr::from(octets))
}

/// Boolean form of [`parse_ipv4`].
pub fn is_valid_ipv4(s: &str) -> bool {
    parse_ipv4(s).is_ok()
}

/// Parse a TCP port in 1..=65535.
pub fn parse_port(s: &str) -> Result<u16> {
    let s = s.trim();
    let val: u32 = s
        .parse::<u32>()
        .map_err(|_| DiscoveryError::InvalidPort(s.to_string()))?;
    check_port(val)
}

/// Range-check a numeric port coming from JSON or the CLI.
pub fn check_port(val: u32) -> Result<u16> {
    if val == 0 || val > 65535 {
        return Err(DiscoveryError::InvalidPort(val.to_string()));
    }
    Ok(val as u16)
}

/// IR codes are short hex strings such as `AC534040`.
pub fn check_ir_code(code: &str) -> Result<&str> {
    let code = code.trim();
    if code.is_empty() || code.len() > 16 || !code.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(DiscoveryError::InvalidIrCode(code.to_string()));
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_dotted_quads() {
        assert_eq!(parse_ipv4("192.168.1.10").unwrap(), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(parse_ipv4("0.0.0.0").unwrap(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(parse_ipv4(" 255.255.255.255 ").unwrap(), Ipv4Addr::BROADCAST);
        assert_eq!(parse_ipv4("10.01.002.3").unwrap(), Ipv4Addr::new(10, 1, 2, 3));
    }

    #[test]
    fn rejects_bad_octet_count_or_range() {
        for s in [
            "192.168.1",
            "192.168.1.256",
            "192.168.1.1.1",
            "192.168..1",
            "192.168.1.",
            "1920.168.1.1",
            "a.b.c.d",
            "192.168.1.-1",
            "",
        ] {
            assert!(!is_valid_ipv4(s), "{s} should be rejected");
        }
    }

    #[test]
    fn port_bounds() {
        assert_eq!(parse_port("80").unwrap(), 80);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("http").is_err());
    }

    #[test]
    fn ir_codes_must_be_hex() {
        assert_eq!(check_ir_code("AC534040").unwrap(), "AC534040");
        assert!(check_ir_code("").is_err());
        assert!(check_ir_code("AC53&x=1").is_err());
    }
}
