use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Checks `ip` against a list of addresses and CIDR ranges.
/// Returns `None` when no list is configured.
pub fn is_ip_listed(ip: IpAddr, entries: Option<&[String]>) -> Result<Option<bool>> {
    let Some(entries) = entries else {
        return Ok(None);
    };

    for entry in entries {
        if let Ok(listed) = entry.parse::<IpAddr>() {
            if ip == listed {
                return Ok(Some(true));
            }
        } else if let Ok(net) = entry.parse::<IpNet>() {
            if net.contains(&ip) {
                return Ok(Some(true));
            }
        } else {
            return Err(anyhow!("Invalid IP address or CIDR in address list: {entry}"));
        }
    }

    Ok(Some(false))
}

/// Validates every entry up front so a typo fails at startup rather than on
/// the first connection.
pub fn validate_ip_list(entries: Option<&[String]>) -> Result<()> {
    for entry in entries.unwrap_or_default() {
        if entry.parse::<IpAddr>().is_err() && entry.parse::<IpNet>().is_err() {
            return Err(anyhow!("Invalid IP address or CIDR in address list: {entry}"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> Vec<String> {
        entries.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn no_list_configured() {
        assert_eq!(is_ip_listed("10.0.0.1".parse().unwrap(), None).unwrap(), None);
    }

    #[test]
    fn matches_single_addresses_and_ranges() {
        let entries = list(&["192.0.2.7", "10.0.0.0/8", "2001:db8::/32"]);
        let entries = Some(entries.as_slice());

        for ip in ["192.0.2.7", "10.20.30.40", "2001:db8::1"] {
            assert_eq!(is_ip_listed(ip.parse().unwrap(), entries).unwrap(), Some(true), "{ip}");
        }
        for ip in ["192.0.2.8", "11.0.0.1", "2001:db9::1"] {
            assert_eq!(is_ip_listed(ip.parse().unwrap(), entries).unwrap(), Some(false), "{ip}");
        }
    }

    #[test]
    fn invalid_entry() {
        let entries = list(&["not-an-ip"]);
        assert!(is_ip_listed("10.0.0.1".parse().unwrap(), Some(entries.as_slice())).is_err());
        assert!(validate_ip_list(Some(entries.as_slice())).is_err());
        assert!(validate_ip_list(Some(list(&["10.0.0.0/8", "::1"]).as_slice())).is_ok());
        assert!(validate_ip_list(None).is_ok());
    }
}
