use std::net::{IpAddr, Ipv4Addr};

use ipnetwork::IpNetwork;
use semver::Version;
use serde::Deserialize;
use serde_json::Value;

use crate::{Error, Result};

/// A delegate result, narrowed to one of the two wire shapes this plugin
/// understands. Anything else is rejected rather than probed field by field.
enum DelegateResult {
    /// cniVersion 1.x
    Current(CurrentResult),
    /// cniVersion 0.3.x / 0.4.x
    Legacy(LegacyResult),
}

#[derive(Debug, Deserialize)]
struct CurrentResult {
    #[serde(default)]
    ips: Vec<CurrentIp>,
}

#[derive(Debug, Deserialize)]
struct CurrentIp {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LegacyResult {
    #[serde(default)]
    ips: Vec<LegacyIp>,
}

#[derive(Debug, Deserialize)]
struct LegacyIp {
    /// "4" or "6" in the legacy format
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    address: Option<String>,
}

/// Returns the first IPv4 address of a delegate result, skipping malformed
/// and non-IPv4 entries.
pub fn extract_pod_ip(result: Option<&Value>) -> Result<Ipv4Addr> {
    let Some(result) = result else {
        return Err(Error::MissingResult);
    };
    match classify(result)? {
        DelegateResult::Current(r) => first_ipv4_current(&r.ips),
        DelegateResult::Legacy(r) => first_ipv4_legacy(&r.ips),
    }
}

fn classify(result: &Value) -> Result<DelegateResult> {
    let version = result
        .get("cniVersion")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::UnsupportedResultVersion("cniVersion missing".into()))?;
    let version: Version = version
        .parse()
        .map_err(|_| Error::UnsupportedResultVersion(version.into()))?;
    match (version.major, version.minor) {
        (1, _) => Ok(DelegateResult::Current(serde_json::from_value(
            result.clone(),
        )?)),
        (0, 3) | (0, 4) => Ok(DelegateResult::Legacy(serde_json::from_value(
            result.clone(),
        )?)),
        _ => Err(Error::UnsupportedResultVersion(version.to_string())),
    }
}

fn first_ipv4_current(ips: &[CurrentIp]) -> Result<Ipv4Addr> {
    if ips.is_empty() {
        return Err(Error::NoAddresses);
    }
    for entry in ips {
        if let Some(ip) = parse_ipv4(entry.address.as_deref()) {
            return Ok(ip);
        }
    }
    Err(Error::NoIpv4Addresses)
}

fn first_ipv4_legacy(ips: &[LegacyIp]) -> Result<Ipv4Addr> {
    if ips.is_empty() {
        return Err(Error::NoAddresses);
    }
    for entry in ips {
        if matches!(entry.version.as_deref(), Some("6")) {
            continue;
        }
        if let Some(ip) = parse_ipv4(entry.address.as_deref()) {
            return Ok(ip);
        }
    }
    Err(Error::NoIpv4Addresses)
}

fn parse_ipv4(address: Option<&str>) -> Option<Ipv4Addr> {
    let network: IpNetwork = address?.parse().ok()?;
    match network.ip() {
        IpAddr::V4(ip) => Some(ip),
        IpAddr::V6(_) => None,
    }
}
