//! Host networking facts and route mutation, per platform.
//!
//! Everything here shells out to the platform's own tooling (`ip`,
//! `netstat`, `route`, PowerShell) with an explicit deadline. The parsing
//! halves are pure functions so they stay testable on any OS.

use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{CoreError, CoreResult};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

async fn run_command(program: &str, args: &[&str]) -> CoreResult<String> {
    let output = timeout(COMMAND_TIMEOUT, Command::new(program).args(args).output())
        .await
        .map_err(|_| CoreError::Overlay(format!("{program} timed out")))?
        .map_err(CoreError::Io)?;

    let merged = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    if !output.status.success() {
        return Err(CoreError::Overlay(format!(
            "{program} failed: {}",
            merged.trim()
        )));
    }
    Ok(merged)
}

/// IPv4 networks currently assigned to local interfaces.
pub async fn collect_local_ipv4_nets() -> CoreResult<Vec<Ipv4Net>> {
    match std::env::consts::OS {
        "linux" => {
            let out = run_command("ip", &["-4", "-o", "addr", "show"]).await?;
            Ok(parse_ip_addr_nets(&out))
        }
        "macos" => {
            let out = run_command("ifconfig", &[]).await?;
            Ok(parse_ifconfig_nets(&out))
        }
        "windows" => {
            let script = "Get-NetIPAddress -AddressFamily IPv4 -ErrorAction SilentlyContinue | ForEach-Object { \"$($_.IPAddress)/$($_.PrefixLength)\" }";
            let out = run_command("powershell", &["-NoProfile", "-Command", script]).await?;
            Ok(parse_cidr_lines(&out))
        }
        other => Err(CoreError::Overlay(format!(
            "interface scan unsupported on {other}"
        ))),
    }
}

/// Parse `ip -4 -o addr show` output: one line per address, fourth field
/// is `a.b.c.d/len`.
pub fn parse_ip_addr_nets(text: &str) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    for line in text.lines() {
        for field in line.split_whitespace() {
            if let Some(net) = parse_masked_net(field) {
                out.push(net);
                break;
            }
        }
    }
    out
}

/// Parse BSD `ifconfig` output: `inet a.b.c.d netmask 0xffffff00 ...`.
pub fn parse_ifconfig_nets(text: &str) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(inet_idx) = fields.iter().position(|f| *f == "inet") else {
            continue;
        };
        let Some(addr) = fields.get(inet_idx + 1) else { continue };
        let Ok(ip) = addr.parse::<std::net::Ipv4Addr>() else { continue };
        let mask_idx = fields.iter().position(|f| *f == "netmask");
        let prefix = mask_idx
            .and_then(|i| fields.get(i + 1))
            .and_then(|m| parse_hex_netmask(m))
            .unwrap_or(32);
        if let Ok(net) = Ipv4Net::new(ip, prefix) {
            out.push(net.trunc());
        }
    }
    out
}

fn parse_hex_netmask(mask: &str) -> Option<u8> {
    let hex = mask.strip_prefix("0x")?;
    let bits = u32::from_str_radix(hex, 16).ok()?;
    Some(bits.count_ones() as u8)
}

fn parse_cidr_lines(text: &str) -> Vec<Ipv4Net> {
    text.lines().filter_map(parse_masked_net).collect()
}

fn parse_masked_net(field: &str) -> Option<Ipv4Net> {
    let net: Ipv4Net = field.trim().parse().ok()?;
    Some(net.trunc())
}

/// IPv4 prefixes present in the system routing table.
pub async fn collect_route_ipv4_nets() -> CoreResult<Vec<Ipv4Net>> {
    let out = match std::env::consts::OS {
        "macos" => run_command("netstat", &["-rn", "-f", "inet"]).await?,
        "linux" => run_command("ip", &["-4", "route", "show"]).await?,
        "windows" => {
            let script = "Get-NetRoute -AddressFamily IPv4 -ErrorAction SilentlyContinue | Select-Object -ExpandProperty DestinationPrefix";
            run_command("powershell", &["-NoProfile", "-Command", script]).await?
        }
        other => {
            return Err(CoreError::Overlay(format!(
                "route scan unsupported on {other}"
            )))
        }
    };
    Ok(parse_route_nets(&out))
}

/// Extract IPv4 prefixes from routing-table text, deduplicated in order.
///
/// Accepts `ip route`, `netstat -rn`, and `Get-NetRoute` shapes: the first
/// column is the destination, and any later column containing `/` is taken
/// as an explicit CIDR too.
pub fn parse_route_nets(text: &str) -> Vec<Ipv4Net> {
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.to_lowercase().starts_with("destination") {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }

        let mut raw_prefixes = vec![fields[0]];
        raw_prefixes.extend(fields[1..].iter().filter(|f| f.contains('/')));

        for raw in raw_prefixes {
            let Some(prefix) = normalize_route_prefix(raw) else {
                continue;
            };
            let Ok(net) = prefix.parse::<Ipv4Net>() else { continue };
            if seen.insert(net) {
                out.push(net);
            }
        }
    }
    out
}

fn normalize_route_prefix(raw: &str) -> Option<String> {
    let v = raw.trim();
    if v.is_empty() {
        return None;
    }
    let lower = v.to_lowercase();
    if lower == "default" || lower.starts_with("link#") || lower.starts_with("on-link") {
        return None;
    }
    if v.contains('/') {
        return Some(v.to_string());
    }
    let ip: std::net::Ipv4Addr = v.parse().ok()?;
    Some(format!("{ip}/32"))
}

/// Name of the interface owning the given IPv4 address.
pub async fn interface_by_ipv4(ipv4: &str) -> CoreResult<String> {
    let target: std::net::Ipv4Addr = ipv4
        .trim()
        .parse()
        .map_err(|_| CoreError::Overlay(format!("invalid ipv4: {ipv4:?}")))?;

    match std::env::consts::OS {
        "linux" => {
            let out = run_command("ip", &["-4", "-o", "addr", "show"]).await?;
            find_interface_in_ip_addr(&out, target)
                .ok_or_else(|| CoreError::Overlay(format!("no interface owns ip {ipv4}")))
        }
        "macos" => {
            let out = run_command("ifconfig", &[]).await?;
            find_interface_in_ifconfig(&out, target)
                .ok_or_else(|| CoreError::Overlay(format!("no interface owns ip {ipv4}")))
        }
        "windows" => {
            let script = format!(
                "Get-NetIPAddress -AddressFamily IPv4 -IPAddress '{target}' -ErrorAction SilentlyContinue | Select-Object -First 1 -ExpandProperty InterfaceAlias"
            );
            let out = run_command("powershell", &["-NoProfile", "-Command", &script]).await?;
            let name = out.trim().to_string();
            if name.is_empty() {
                Err(CoreError::Overlay(format!("no interface owns ip {ipv4}")))
            } else {
                Ok(name)
            }
        }
        other => Err(CoreError::Overlay(format!(
            "interface lookup unsupported on {other}"
        ))),
    }
}

/// `ip -4 -o addr show` lines look like:
/// `3: utun9    inet 10.1.2.1/24 brd ... scope global utun9`.
pub fn find_interface_in_ip_addr(text: &str, target: std::net::Ipv4Addr) -> Option<String> {
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let Ok(net) = fields[3].parse::<Ipv4Net>() else { continue };
        if net.addr() == target {
            return Some(fields[1].trim_end_matches(':').to_string());
        }
    }
    None
}

/// `ifconfig` sections start with `name: flags=...`; addresses are on
/// indented `inet` lines below.
pub fn find_interface_in_ifconfig(text: &str, target: std::net::Ipv4Addr) -> Option<String> {
    let mut current = String::new();
    for line in text.lines() {
        if !line.starts_with(char::is_whitespace) {
            if let Some((name, _)) = line.split_once(':') {
                current = name.trim().to_string();
            }
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let Some(inet_idx) = fields.iter().position(|f| *f == "inet") else {
            continue;
        };
        if let Some(addr) = fields.get(inet_idx + 1) {
            if addr.parse::<std::net::Ipv4Addr>().ok() == Some(target) && !current.is_empty() {
                return Some(current);
            }
        }
    }
    None
}

/// Interface the system would route `target_ip` through (macOS/Windows).
pub async fn route_interface_for_target(target_ip: &str) -> CoreResult<String> {
    let target = valid_ipv4(target_ip)?;

    match std::env::consts::OS {
        "macos" => {
            let out = run_command("route", &["-n", "get", &target]).await?;
            for line in out.lines() {
                let line = line.trim();
                if let Some(rest) = line.strip_prefix("interface:") {
                    return Ok(rest.trim().to_string());
                }
            }
            Err(CoreError::Overlay("route interface not found".into()))
        }
        "windows" => {
            let script = format!(
                "$r=Get-NetRoute -DestinationPrefix '{target}/32' -ErrorAction SilentlyContinue | Sort-Object -Property RouteMetric,ifMetric | Select-Object -First 1 -ExpandProperty InterfaceAlias; if($null -ne $r){{$r}}"
            );
            let out = run_command("powershell", &["-NoProfile", "-Command", &script]).await?;
            let iface = out.trim().to_string();
            if iface.is_empty() {
                Err(CoreError::Overlay("route interface not found".into()))
            } else {
                Ok(iface)
            }
        }
        other => Err(CoreError::Overlay(format!(
            "route interface check unsupported on {other}"
        ))),
    }
}

/// Pin a /32 host route for `target_ip` through `tun_device`.
pub async fn add_host_route(target_ip: &str, tun_device: &str) -> CoreResult<()> {
    let target = valid_ipv4(target_ip)?;
    let iface = valid_iface(tun_device)?;

    match std::env::consts::OS {
        "macos" => {
            match run_command("route", &["-n", "add", "-host", &target, "-interface", &iface]).await
            {
                Ok(_) => Ok(()),
                // Retries hit an existing route; that is the desired state.
                Err(e) if e.to_string().to_lowercase().contains("file exists") => Ok(()),
                Err(e) => Err(e),
            }
        }
        "linux" => {
            let prefix = format!("{target}/32");
            run_command("ip", &["route", "replace", &prefix, "dev", &iface]).await?;
            Ok(())
        }
        "windows" => {
            let alias = escape_powershell_single_quoted(&iface);
            let script = format!(
                "if(-not (Get-NetRoute -DestinationPrefix '{target}/32' -InterfaceAlias '{alias}' -ErrorAction SilentlyContinue)){{New-NetRoute -DestinationPrefix '{target}/32' -InterfaceAlias '{alias}' -NextHop '0.0.0.0' -PolicyStore ActiveStore | Out-Null}}"
            );
            run_command("powershell", &["-NoProfile", "-Command", &script]).await?;
            Ok(())
        }
        other => Err(CoreError::Overlay(format!(
            "host route add unsupported on {other}"
        ))),
    }
}

/// Remove the /32 host route. Missing routes are treated as success.
pub async fn remove_host_route(target_ip: &str, tun_device: &str) -> CoreResult<()> {
    let target = valid_ipv4(target_ip)?;
    let iface = valid_iface(tun_device)?;

    match std::env::consts::OS {
        "macos" => {
            match run_command(
                "route",
                &["-n", "delete", "-host", &target, "-interface", &iface],
            )
            .await
            {
                Ok(_) => Ok(()),
                Err(e) if e.to_string().to_lowercase().contains("not in table") => Ok(()),
                Err(e) => Err(e),
            }
        }
        "linux" => {
            let prefix = format!("{target}/32");
            match run_command("ip", &["route", "del", &prefix, "dev", &iface]).await {
                Ok(_) => Ok(()),
                Err(e) if e.to_string().to_lowercase().contains("no such process") => Ok(()),
                Err(e) => Err(e),
            }
        }
        "windows" => {
            let alias = escape_powershell_single_quoted(&iface);
            let script = format!(
                "Get-NetRoute -DestinationPrefix '{target}/32' -InterfaceAlias '{alias}' -ErrorAction SilentlyContinue | Remove-NetRoute -Confirm:$false -ErrorAction SilentlyContinue"
            );
            run_command("powershell", &["-NoProfile", "-Command", &script]).await?;
            Ok(())
        }
        other => Err(CoreError::Overlay(format!(
            "host route delete unsupported on {other}"
        ))),
    }
}

/// Route-owner verification only means something where the route table is
/// queried per destination.
pub fn should_check_route_ownership() -> bool {
    matches!(std::env::consts::OS, "macos" | "windows")
}

fn valid_ipv4(value: &str) -> CoreResult<String> {
    let v = value.trim();
    v.parse::<std::net::Ipv4Addr>()
        .map(|ip| ip.to_string())
        .map_err(|_| CoreError::Overlay(format!("invalid target ip: {value:?}")))
}

fn valid_iface(value: &str) -> CoreResult<String> {
    let v = value.trim();
    if v.is_empty() {
        return Err(CoreError::Overlay("empty tun device".into()));
    }
    Ok(v.to_string())
}

fn escape_powershell_single_quoted(v: &str) -> String {
    v.trim().replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linux_route_table() {
        let text = "default via 192.168.1.1 dev eth0\n\
                    10.1.0.0/16 dev wg0 proto kernel scope link\n\
                    192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.10\n";
        let nets = parse_route_nets(text);
        let strs: Vec<String> = nets.iter().map(|n| n.to_string()).collect();
        assert!(strs.contains(&"10.1.0.0/16".to_string()));
        assert!(strs.contains(&"192.168.1.0/24".to_string()));
        assert!(!strs.iter().any(|s| s.starts_with("default")));
    }

    #[test]
    fn parses_netstat_table_with_header_and_link_rows() {
        let text = "Routing tables\n\n\
                    Internet:\n\
                    Destination        Gateway            Flags\n\
                    default            192.168.1.1        UGSc\n\
                    10.77.0/24         link#18            UC\n\
                    127.0.0.1          127.0.0.1          UH\n";
        let nets = parse_route_nets(text);
        let strs: Vec<String> = nets.iter().map(|n| n.to_string()).collect();
        assert!(strs.contains(&"10.77.0.0/24".to_string()) || strs.contains(&"127.0.0.1/32".to_string()));
        // Bare host entries become /32.
        assert!(strs.contains(&"127.0.0.1/32".to_string()));
    }

    #[test]
    fn route_prefixes_deduplicate() {
        let text = "10.0.0.0/24 dev a\n10.0.0.0/24 dev b\n";
        assert_eq!(parse_route_nets(text).len(), 1);
    }

    #[test]
    fn finds_interface_in_ip_addr_output() {
        let text = "1: lo    inet 127.0.0.1/8 scope host lo\n\
                    7: tun0    inet 10.9.8.1/24 scope global tun0\n";
        let found = find_interface_in_ip_addr(text, "10.9.8.1".parse().unwrap());
        assert_eq!(found.as_deref(), Some("tun0"));
        assert!(find_interface_in_ip_addr(text, "10.9.8.2".parse().unwrap()).is_none());
    }

    #[test]
    fn finds_interface_in_ifconfig_output() {
        let text = "en0: flags=8863<UP> mtu 1500\n\
                    \tinet 192.168.1.5 netmask 0xffffff00 broadcast 192.168.1.255\n\
                    utun9: flags=8051<UP> mtu 1380\n\
                    \tinet 10.44.0.1 netmask 0xffffff00\n";
        let found = find_interface_in_ifconfig(text, "10.44.0.1".parse().unwrap());
        assert_eq!(found.as_deref(), Some("utun9"));
    }

    #[test]
    fn ifconfig_nets_respect_hex_netmask() {
        let text = "en0: flags=8863<UP> mtu 1500\n\
                    \tinet 192.168.1.5 netmask 0xffff0000 broadcast 192.168.255.255\n";
        let nets = parse_ifconfig_nets(text);
        assert_eq!(nets.len(), 1);
        assert_eq!(nets[0].to_string(), "192.168.0.0/16");
    }
}
