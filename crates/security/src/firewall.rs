//! Optional iptables rules duplicating node admission at the SYN layer.
//!
//! The node server already refuses peers other than the trusted coordinator
//! IP after `accept()`. These rules make the kernel drop such SYNs before a
//! socket exists. Requires root; callers treat failures as non-fatal.

use std::net::Ipv4Addr;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("invalid IPv4 address: {0}")]
    InvalidAddress(String),

    #[error("iptables not available: {0}")]
    Unavailable(String),

    #[error("iptables command failed: {0}")]
    CommandFailed(String),
}

pub struct KernelFirewall;

impl KernelFirewall {
    /// Allow TCP to `port` from the trusted coordinator only; drop the rest.
    pub fn configure_node_firewall(
        port: u16,
        trusted_coordinator_ip: &str,
        dry_run: bool,
    ) -> Result<(), FirewallError> {
        let ip = parse_ipv4(trusted_coordinator_ip)?;

        let accept = accept_rule(port, &ip);
        let drop = drop_rule(port);

        if !rule_exists(&accept) {
            run_iptables(&with_action("-I", &accept), dry_run)?;
        }
        if !rule_exists(&drop) {
            run_iptables(&with_action("-A", &drop), dry_run)?;
        }

        info!(port, trusted = %ip, dry_run, "kernel firewall configured");
        Ok(())
    }

    /// Remove the rules installed by [`Self::configure_node_firewall`].
    pub fn remove_node_firewall(
        port: u16,
        trusted_coordinator_ip: &str,
        dry_run: bool,
    ) -> Result<(), FirewallError> {
        let ip = parse_ipv4(trusted_coordinator_ip)?;

        let accept = accept_rule(port, &ip);
        let drop = drop_rule(port);

        if rule_exists(&accept) {
            run_iptables(&with_action("-D", &accept), dry_run)?;
        }
        if rule_exists(&drop) {
            run_iptables(&with_action("-D", &drop), dry_run)?;
        }

        info!(port, trusted = %ip, dry_run, "kernel firewall removed");
        Ok(())
    }

    /// Whether the drop rule for `port` is currently installed.
    pub fn is_configured(port: u16) -> bool {
        rule_exists(&drop_rule(port))
    }

    pub fn has_root_privilege() -> bool {
        Command::new("id")
            .arg("-u")
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).trim() == "0")
            .unwrap_or(false)
    }
}

fn parse_ipv4(raw: &str) -> Result<Ipv4Addr, FirewallError> {
    raw.parse()
        .map_err(|_| FirewallError::InvalidAddress(raw.to_string()))
}

fn accept_rule(port: u16, ip: &Ipv4Addr) -> Vec<String> {
    vec![
        "INPUT".into(),
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        port.to_string(),
        "-s".into(),
        ip.to_string(),
        "-j".into(),
        "ACCEPT".into(),
    ]
}

fn drop_rule(port: u16) -> Vec<String> {
    vec![
        "INPUT".into(),
        "-p".into(),
        "tcp".into(),
        "--dport".into(),
        port.to_string(),
        "-j".into(),
        "DROP".into(),
    ]
}

fn with_action(action: &str, rule: &[String]) -> Vec<String> {
    let mut args = vec![action.to_string()];
    args.extend_from_slice(rule);
    args
}

fn rule_exists(rule: &[String]) -> bool {
    Command::new("iptables")
        .arg("-C")
        .args(rule)
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

fn run_iptables(args: &[String], dry_run: bool) -> Result<(), FirewallError> {
    if dry_run {
        info!(command = %format!("iptables {}", args.join(" ")), "dry run");
        return Ok(());
    }
    let output = Command::new("iptables")
        .args(args)
        .output()
        .map_err(|e| FirewallError::Unavailable(e.to_string()))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(command = %format!("iptables {}", args.join(" ")), %stderr, "iptables failed");
        return Err(FirewallError::CommandFailed(stderr.trim().to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_address_rejected() {
        assert!(matches!(
            KernelFirewall::configure_node_firewall(9000, "not-an-ip", true),
            Err(FirewallError::InvalidAddress(_))
        ));
        assert!(matches!(
            KernelFirewall::configure_node_firewall(9000, "::1", true),
            Err(FirewallError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_dry_run_does_not_touch_iptables() {
        // Dry run must succeed regardless of privileges.
        KernelFirewall::configure_node_firewall(19999, "127.0.0.1", true).unwrap();
        KernelFirewall::remove_node_firewall(19999, "127.0.0.1", true).unwrap();
    }
}
