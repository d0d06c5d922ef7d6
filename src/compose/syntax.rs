//! Compose short syntax parsing
//!
//! Expands `"8080:80/udp"` style ports and `"src:dst:ro"` style volumes into
//! their long forms.

use super::config::{
    ServiceBindOptions, ServicePortConfig, ServiceVolumeConfig, ServiceVolumeOptions,
};

/// Volume mount types
pub mod mount_types {
    pub const VOLUME: &str = "volume";
    pub const BIND: &str = "bind";
    pub const TMPFS: &str = "tmpfs";
    pub const NPIPE: &str = "npipe";
    pub const CLUSTER: &str = "cluster";
}

const PROPAGATION_MODES: &[&str] = &["private", "rprivate", "shared", "rshared", "slave", "rslave"];
const CONSISTENCY_MODES: &[&str] = &["cached", "delegated", "consistent"];

/// Parse a short port specification into one entry per port
pub fn parse_port_spec(spec: &str) -> Result<Vec<ServicePortConfig>, String> {
    let (rest, protocol) = match spec.rsplit_once('/') {
        Some((rest, proto)) => (rest, proto.to_lowercase()),
        None => (spec, "tcp".to_string()),
    };
    if !matches!(protocol.as_str(), "tcp" | "udp" | "sctp") {
        return Err(format!("invalid proto: {}", protocol));
    }

    let parts: Vec<&str> = rest.rsplitn(3, ':').collect();
    let (host_ip, published, target) = match parts.as_slice() {
        [target] => (None, None, *target),
        [target, published] => (None, Some(*published), *target),
        [target, published, ip] => (
            Some(ip.trim_start_matches('[').trim_end_matches(']')),
            Some(*published),
            *target,
        ),
        _ => return Err(format!("invalid port spec: {}", spec)),
    };

    let (target_start, target_end) = parse_port_range(target)
        .ok_or_else(|| format!("invalid containerPort: {}", target))?;

    let published = match published.filter(|p| !p.is_empty()) {
        Some(p) => Some(parse_port_range(p).ok_or_else(|| format!("invalid hostPort: {}", p))?),
        None => None,
    };

    if let Some((start, end)) = published {
        if end - start != target_end - target_start {
            return Err(format!(
                "invalid ranges specified for container and host Ports: {} and {}",
                target,
                published_text(start, end)
            ));
        }
    }

    let host_ip = host_ip.filter(|ip| !ip.is_empty()).map(str::to_string);
    Ok((0..=target_end - target_start)
        .map(|offset| ServicePortConfig {
            mode: Some("ingress".to_string()),
            host_ip: host_ip.clone(),
            target: target_start + offset,
            published: published.map(|(start, _)| start + offset),
            protocol: Some(protocol.clone()),
        })
        .collect())
}

fn published_text(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{}-{}", start, end)
    }
}

pub(crate) fn parse_port_range(text: &str) -> Option<(u32, u32)> {
    let (start, end) = match text.split_once('-') {
        Some((s, e)) => (s.parse::<u32>().ok()?, e.parse::<u32>().ok()?),
        None => {
            let port = text.parse::<u32>().ok()?;
            (port, port)
        }
    };
    if start == 0 || end > 65535 || end < start {
        return None;
    }
    Some((start, end))
}

/// Parse a short volume specification
pub fn parse_volume_spec(spec: &str) -> Result<ServiceVolumeConfig, String> {
    let parts = split_volume_spec(spec);
    if parts.iter().any(|p| p.is_empty()) {
        return Err(format!("invalid empty volume spec in {:?}", spec));
    }

    let mut volume = ServiceVolumeConfig::default();
    let (source, target, mode) = match parts.as_slice() {
        [target] => (None, target.clone(), None),
        [source, target] => (Some(source.clone()), target.clone(), None),
        [source, target, mode] => (Some(source.clone()), target.clone(), Some(mode.clone())),
        _ => return Err(format!("invalid spec: {}: too many colons", spec)),
    };

    volume.target = target;
    volume.volume_type = match source.as_deref() {
        Some(src) if is_file_path(src) => mount_types::BIND.to_string(),
        _ => mount_types::VOLUME.to_string(),
    };
    volume.source = source;

    if let Some(mode) = mode {
        for option in mode.split(',') {
            match option {
                "ro" => volume.read_only = true,
                "rw" => volume.read_only = false,
                "nocopy" => {
                    volume
                        .volume
                        .get_or_insert_with(ServiceVolumeOptions::default)
                        .nocopy = true;
                }
                "z" | "Z" => {
                    volume
                        .bind
                        .get_or_insert_with(ServiceBindOptions::default)
                        .selinux = Some(option.to_string());
                }
                o if PROPAGATION_MODES.contains(&o) => {
                    volume
                        .bind
                        .get_or_insert_with(ServiceBindOptions::default)
                        .propagation = Some(o.to_string());
                }
                o if CONSISTENCY_MODES.contains(&o) => {
                    volume.consistency = Some(o.to_string());
                }
                other => return Err(format!("invalid mode {:?} in {:?}", other, spec)),
            }
        }
    }

    Ok(volume)
}

/// Host paths, as opposed to named volumes
pub fn is_file_path(source: &str) -> bool {
    if source.starts_with('.') || source.starts_with('/') || source.starts_with('~') {
        return true;
    }
    if source.starts_with("\\\\") {
        return true;
    }
    is_windows_drive(source)
}

fn is_windows_drive(source: &str) -> bool {
    let bytes = source.as_bytes();
    bytes.len() >= 2
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes.len() == 2 || bytes[2] == b'\\' || bytes[2] == b'/')
}

/// Split on colons, keeping Windows drive letters attached to their path
fn split_volume_spec(spec: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let chars: Vec<char> = spec.chars().collect();

    for (i, c) in chars.iter().enumerate() {
        if *c == ':' {
            let drive = current.len() == 1
                && current.chars().all(|ch| ch.is_ascii_alphabetic())
                && matches!(chars.get(i + 1), Some('\\') | Some('/'));
            if !drive {
                parts.push(std::mem::take(&mut current));
                continue;
            }
        }
        current.push(*c);
    }
    parts.push(current);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_target_only() {
        let ports = parse_port_spec("80").unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].target, 80);
        assert_eq!(ports[0].published, None);
        assert_eq!(ports[0].protocol.as_deref(), Some("tcp"));
        assert_eq!(ports[0].mode.as_deref(), Some("ingress"));
    }

    #[test]
    fn test_port_published_udp() {
        let ports = parse_port_spec("8080:80/udp").unwrap();
        assert_eq!(ports[0].published, Some(8080));
        assert_eq!(ports[0].target, 80);
        assert_eq!(ports[0].protocol.as_deref(), Some("udp"));
    }

    #[test]
    fn test_port_with_ip_and_range() {
        let ports = parse_port_spec("127.0.0.1:9000-9001:80-81").unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[1].published, Some(9001));
        assert_eq!(ports[1].target, 81);
        assert_eq!(ports[0].host_ip.as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_port_mismatched_range() {
        assert!(parse_port_spec("9000-9002:80-81").is_err());
        assert!(parse_port_spec("abc").is_err());
        assert!(parse_port_spec("80/icmp").is_err());
    }

    #[test]
    fn test_volume_anonymous() {
        let v = parse_volume_spec("/data").unwrap();
        assert_eq!(v.volume_type, "volume");
        assert_eq!(v.source, None);
        assert_eq!(v.target, "/data");
    }

    #[test]
    fn test_volume_named_read_only() {
        let v = parse_volume_spec("dbdata:/var/lib/db:ro,nocopy").unwrap();
        assert_eq!(v.volume_type, "volume");
        assert_eq!(v.source.as_deref(), Some("dbdata"));
        assert!(v.read_only);
        assert!(v.volume.unwrap().nocopy);
    }

    #[test]
    fn test_volume_bind_with_propagation() {
        let v = parse_volume_spec("./conf:/etc/app:rshared").unwrap();
        assert_eq!(v.volume_type, "bind");
        assert_eq!(v.bind.unwrap().propagation.as_deref(), Some("rshared"));
    }

    #[test]
    fn test_volume_windows_drive() {
        let v = parse_volume_spec("C:\\data:C:\\app").unwrap();
        assert_eq!(v.volume_type, "bind");
        assert_eq!(v.source.as_deref(), Some("C:\\data"));
        assert_eq!(v.target, "C:\\app");
    }

    #[test]
    fn test_volume_bad_mode() {
        assert!(parse_volume_spec("a:/b:bogus").is_err());
        assert!(parse_volume_spec("a:/b:ro:x").is_err());
    }
}
