//! Request validation: function names and git source URLs.
//!
//! The git URL check is an SSRF guard: hosts that resolve only to loopback,
//! private, link-local, multicast or otherwise non-global addresses are
//! rejected before the clone is attempted.

use std::net::IpAddr;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{GatewayError, Result};

static FUNCTION_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").unwrap());

/// Strip OpenFaaS namespace suffixes clients append to function names.
pub fn normalize_function_name(name: &str) -> String {
    let name = name.trim();
    for suffix in [".openfaas-fn", ".openfaas"] {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name.to_string()
}

pub fn validate_function_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(GatewayError::bad_request("function name is required"));
    }
    if !FUNCTION_NAME_PATTERN.is_match(name) {
        return Err(GatewayError::bad_request(format!(
            "invalid function name: {name}"
        )));
    }
    Ok(())
}

/// Validate a git source URL: scheme, host blocklist, and address ranges.
/// Hostnames are resolved so that DNS entries pointing at internal ranges
/// are caught as well.
pub async fn validate_git_url(raw: &str) -> Result<()> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GatewayError::bad_request("git url is required"));
    }

    let (scheme, host) = parse_git_host(raw)?;
    match scheme.as_str() {
        "https" | "http" | "git" | "ssh" => {}
        other => {
            return Err(GatewayError::bad_request(format!(
                "unsupported git url scheme: {other}"
            )))
        }
    }

    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return Err(GatewayError::bad_request("git url host is required"));
    }
    if is_blocked_hostname(&host) {
        return Err(GatewayError::bad_request(format!(
            "git url host is not allowed: {host}"
        )));
    }

    let host = strip_host_port(&host);
    if let Ok(ip) = IpAddr::from_str(&host) {
        if is_blocked_ip(&ip) {
            return Err(GatewayError::bad_request(format!(
                "git url host is not allowed: {host}"
            )));
        }
        return Ok(());
    }

    let addrs = tokio::net::lookup_host((host.as_str(), 443))
        .await
        .map_err(|_| GatewayError::bad_request(format!("failed to resolve git host: {host}")))?;
    for addr in addrs {
        if is_blocked_ip(&addr.ip()) {
            return Err(GatewayError::bad_request(format!(
                "git url host resolves to private address: {host}"
            )));
        }
    }

    Ok(())
}

/// Split a git URL into (scheme, host). Accepts scheme://host/... forms and
/// the scp-like user@host:path form, which is treated as ssh.
fn parse_git_host(raw: &str) -> Result<(String, String)> {
    if let Some((scheme, rest)) = raw.split_once("://") {
        let after_auth = rest.split('/').next().unwrap_or("");
        let host = after_auth
            .rsplit_once('@')
            .map(|(_, h)| h)
            .unwrap_or(after_auth);
        if host.is_empty() {
            return Err(GatewayError::bad_request("git url host is required"));
        }
        return Ok((scheme.to_ascii_lowercase(), host.to_string()));
    }

    if let Some(at) = raw.rfind('@') {
        let rest = &raw[at + 1..];
        if let Some(colon) = rest.find(':') {
            let host = &rest[..colon];
            if host.is_empty() {
                return Err(GatewayError::bad_request("git url host is required"));
            }
            return Ok(("ssh".to_string(), host.to_string()));
        }
    }

    Err(GatewayError::bad_request(
        "git url must include a scheme or user@host:path",
    ))
}

fn is_blocked_hostname(host: &str) -> bool {
    if host == "localhost" || host == "localhost.localdomain" {
        return true;
    }
    [".local", ".internal", ".lan"]
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

fn strip_host_port(hostport: &str) -> String {
    if let Some(inner) = hostport.strip_prefix('[') {
        return inner.split(']').next().unwrap_or(inner).to_string();
    }
    if hostport.matches(':').count() == 1 {
        if let Some((host, port)) = hostport.rsplit_once(':') {
            if port.chars().all(|c| c.is_ascii_digit()) {
                return host.to_string();
            }
        }
    }
    hostport.to_string()
}

/// True when the address must not be reached from the build pipeline:
/// anything that is not a public unicast address.
fn is_blocked_ip(ip: &IpAddr) -> bool {
    if ip.is_loopback() || ip.is_multicast() || ip.is_unspecified() {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_link_local() || v4.is_broadcast() || v4.is_documentation()
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            // fe80::/10 link-local and fc00::/7 unique-local
            (segments[0] & 0xffc0) == 0xfe80 || (segments[0] & 0xfe00) == 0xfc00
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_simple_names() {
        for name in ["echo", "fn-1", "a", "Fn_2.v1", "0abc"] {
            assert!(validate_function_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn rejects_bad_names() {
        for name in ["", "-echo", "_fn", ".dot", "has space", "slash/x", "a$b"] {
            assert!(validate_function_name(name).is_err(), "{name:?}");
        }
    }

    #[test]
    fn strips_openfaas_suffixes() {
        assert_eq!(normalize_function_name("echo.openfaas-fn"), "echo");
        assert_eq!(normalize_function_name("echo.openfaas"), "echo");
        assert_eq!(normalize_function_name("  echo  "), "echo");
        assert_eq!(normalize_function_name("echo"), "echo");
    }

    #[tokio::test]
    async fn rejects_loopback_and_private_hosts() {
        for url in [
            "http://127.0.0.1/x.git",
            "https://10.0.0.8/repo.git",
            "https://192.168.1.4/repo.git",
            "https://169.254.1.1/repo.git",
            "http://localhost/repo.git",
            "https://gitea.internal/repo.git",
            "git@host.lan:me/repo.git",
            "https://[::1]/repo.git",
            "https://0.0.0.0/repo.git",
        ] {
            assert!(validate_git_url(url).await.is_err(), "{url}");
        }
    }

    #[tokio::test]
    async fn accepts_public_hosts() {
        assert!(validate_git_url("https://8.8.8.8/x.git").await.is_ok());
        assert!(validate_git_url("git@1.1.1.1:me/repo.git").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_unknown_schemes_and_missing_hosts() {
        assert!(validate_git_url("ftp://8.8.8.8/x.git").await.is_err());
        assert!(validate_git_url("not-a-url").await.is_err());
        assert!(validate_git_url("").await.is_err());
    }

    #[test]
    fn parses_scp_form_as_ssh() {
        let (scheme, host) = parse_git_host("git@github.com:me/repo.git").unwrap();
        assert_eq!(scheme, "ssh");
        assert_eq!(host, "github.com");
    }

    #[test]
    fn strips_ports() {
        assert_eq!(strip_host_port("example.com:8443"), "example.com");
        assert_eq!(strip_host_port("[::1]:22"), "::1");
        assert_eq!(strip_host_port("example.com"), "example.com");
    }
}
