use std::net::{IpAddr, Ipv4Addr};
use anyhow::{Result, anyhow};
use ipnet::IpNet;

/// Expand a target spec into host strings. Hostnames are kept as given and
/// resolved by the dialer at probe time.
pub fn parse_targets(target_spec: &str) -> Result<Vec<String>> {
    let mut targets = Vec::new();

    for part in target_spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if part.contains('/') {
            targets.extend(parse_cidr(part)?.into_iter().map(|ip| ip.to_string()));
        } else if part.contains('-') && part.parse::<IpAddr>().is_err() && looks_like_ip_range(part) {
            targets.extend(parse_ip_range(part)?.into_iter().map(|ip| ip.to_string()));
        } else {
            targets.push(part.to_string());
        }
    }

    if targets.is_empty() {
        return Err(anyhow!("No targets specified"));
    }

    let mut seen = std::collections::HashSet::new();
    targets.retain(|t| seen.insert(t.clone()));

    Ok(targets)
}

fn looks_like_ip_range(part: &str) -> bool {
    part.split('-').all(|p| p.trim().parse::<IpAddr>().is_ok())
}

fn parse_cidr(cidr: &str) -> Result<Vec<IpAddr>> {
    let network: IpNet = cidr.parse()
        .map_err(|_| anyhow!("Invalid CIDR notation: {}", cidr))?;

    match network {
        IpNet::V4(net) => Ok(net.hosts().map(IpAddr::V4).collect()),
        IpNet::V6(net) => Ok(net.hosts().take(1000).map(IpAddr::V6).collect()),
    }
}

fn parse_ip_range(range: &str) -> Result<Vec<IpAddr>> {
    let parts: Vec<&str> = range.split('-').collect();
    if parts.len() != 2 {
        return Err(anyhow!("Invalid IP range format: {}", range));
    }

    let start_ip: IpAddr = parts[0].trim().parse()
        .map_err(|_| anyhow!("Invalid start IP: {}", parts[0]))?;
    let end_ip: IpAddr = parts[1].trim().parse()
        .map_err(|_| anyhow!("Invalid end IP: {}", parts[1]))?;

    match (start_ip, end_ip) {
        (IpAddr::V4(start), IpAddr::V4(end)) => {
            let start_u32 = u32::from(start);
            let end_u32 = u32::from(end);

            if start_u32 > end_u32 {
                return Err(anyhow!("Start IP must be less than or equal to end IP"));
            }

            if end_u32 - start_u32 > 10000 {
                return Err(anyhow!("IP range too large (max 10000 addresses)"));
            }

            Ok((start_u32..=end_u32).map(|ip| IpAddr::V4(Ipv4Addr::from(ip))).collect())
        }
        (IpAddr::V6(_), IpAddr::V6(_)) => {
            Err(anyhow!("IPv6 ranges not yet supported"))
        }
        _ => {
            Err(anyhow!("Start and end IP must be the same version"))
        }
    }
}

/// Parse `3389`, `3389,3390` or `3380-3390` into a sorted, deduplicated list.
pub fn parse_ports(ports_spec: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();

    for part in ports_spec.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let start: u16 = start.trim().parse()
                .map_err(|_| anyhow!("Invalid port: {}", start))?;
            let end: u16 = end.trim().parse()
                .map_err(|_| anyhow!("Invalid port: {}", end))?;
            if start > end {
                return Err(anyhow!("Invalid port range: {}", part));
            }
            ports.extend(start..=end);
        } else {
            ports.push(part.parse().map_err(|_| anyhow!("Invalid port: {}", part))?);
        }
    }

    if ports.is_empty() {
        return Err(anyhow!("No ports specified"));
    }

    ports.sort_unstable();
    ports.dedup();
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_ip() {
        let targets = parse_targets("192.168.1.1").unwrap();
        assert_eq!(targets, vec!["192.168.1.1".to_string()]);
    }

    #[test]
    fn test_hostname_kept_verbatim() {
        let targets = parse_targets("acme.test,rdp-gw.acme.test").unwrap();
        assert_eq!(targets, vec!["acme.test".to_string(), "rdp-gw.acme.test".to_string()]);
    }

    #[test]
    fn test_parse_cidr() {
        let targets = parse_targets("192.168.1.0/30").unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.contains(&"192.168.1.1".to_string()));
        assert!(targets.contains(&"192.168.1.2".to_string()));
    }

    #[test]
    fn test_parse_ip_range() {
        let targets = parse_targets("192.168.1.1-192.168.1.3").unwrap();
        assert_eq!(targets.len(), 3);
        assert!(targets.contains(&"192.168.1.2".to_string()));
    }

    #[test]
    fn test_parse_mixed_and_dedup() {
        let targets = parse_targets("192.168.1.1,192.168.1.1-192.168.1.2").unwrap();
        assert_eq!(targets, vec!["192.168.1.1".to_string(), "192.168.1.2".to_string()]);
    }

    #[test]
    fn test_invalid_cidr() {
        assert!(parse_targets("192.168.1.0/99").is_err());
    }

    #[test]
    fn test_large_range_rejected() {
        assert!(parse_targets("0.0.0.0-255.255.255.255").is_err());
    }

    #[test]
    fn test_parse_ports() {
        assert_eq!(parse_ports("3389").unwrap(), vec![3389]);
        assert_eq!(parse_ports("3390,3389").unwrap(), vec![3389, 3390]);
        assert_eq!(parse_ports("3388-3390,3389").unwrap(), vec![3388, 3389, 3390]);
        assert!(parse_ports("3390-3389").is_err());
        assert!(parse_ports("rdp").is_err());
        assert!(parse_ports("70000").is_err());
    }
}
