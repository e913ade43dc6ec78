//! Node configuration resolved from the named environment.

use mpc_common::{ConfigError, Environment};
use mpc_common::observability::LogLevel;
use mpc_network::TlsTimeouts;
use mpc_types::PlatformType;
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub platform: PlatformType,
    pub bind_address: String,
    pub port: u16,
    pub shard_index: u32,
    pub trusted_coordinator_ip: Ipv4Addr,
    pub handler_threads: usize,
    pub enable_kernel_firewall: bool,
    pub resource_dir: String,
    pub secrets_dir: String,
    pub ca_cert_path: String,
    pub server_cert_path: String,
    pub server_key_id: String,
    pub runtime_log_level: LogLevel,
    pub compile_log_level: LogLevel,
    pub timeouts: TlsTimeouts,
}

impl NodeConfig {
    /// Resolve this node's slot from the `NODE_IDS`/`NODE_HOSTS` tables and
    /// the TLS material keys.
    pub fn from_env(env: &Environment, node_id: &str) -> Result<Self, ConfigError> {
        let node_ids = env.get_csv("NODE_IDS");
        let index = node_ids
            .iter()
            .position(|id| id == node_id)
            .ok_or_else(|| ConfigError::InvalidValue {
                key: "NODE_IDS".to_string(),
                value: node_ids.join(","),
                reason: format!("node id '{node_id}' not listed"),
            })?;

        let hosts = env.get_csv("NODE_HOSTS");
        let host = hosts.get(index).ok_or_else(|| ConfigError::InvalidValue {
            key: "NODE_HOSTS".to_string(),
            value: hosts.join(","),
            reason: format!("no host entry for node index {index}"),
        })?;
        let (_, port_str) = host.rsplit_once(':').ok_or_else(|| ConfigError::InvalidValue {
            key: "NODE_HOSTS".to_string(),
            value: host.clone(),
            reason: "expected host:port".to_string(),
        })?;
        let port: u16 = port_str.parse().map_err(|_| ConfigError::InvalidValue {
            key: "NODE_HOSTS".to_string(),
            value: host.clone(),
            reason: "invalid port".to_string(),
        })?;

        let platforms = env.get_csv("NODE_PLATFORMS");
        let platform = match platforms.get(index) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "NODE_PLATFORMS".to_string(),
                value: raw.clone(),
                reason: "unknown platform".to_string(),
            })?,
            None => PlatformType::Local,
        };

        let shard_indices = env.get_csv("NODE_SHARD_INDICES");
        let shard_index = match shard_indices.get(index) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "NODE_SHARD_INDICES".to_string(),
                value: raw.clone(),
                reason: "invalid shard index".to_string(),
            })?,
            None => index as u32,
        };

        let trusted_coordinator_ip: Ipv4Addr = env
            .require("TRUSTED_COORDINATOR_IP")?
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "TRUSTED_COORDINATOR_IP".to_string(),
                value: env.get_or("TRUSTED_COORDINATOR_IP", "").to_string(),
                reason: "expected one IPv4 address".to_string(),
            })?;

        let upper_id = node_id.to_ascii_uppercase().replace('-', "_");
        let server_cert_path = env
            .get(&format!("TLS_CERT_NODE_{upper_id}"))
            .or_else(|| env.get("TLS_CERT_SERVER"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{node_id}.pem"));
        let server_key_id = env
            .get(&format!("TLS_KMS_NODE_{upper_id}_KEY_ID"))
            .or_else(|| env.get("TLS_KMS_SERVER_KEY_ID"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("{node_id}.key"));

        Ok(Self {
            node_id: node_id.to_string(),
            platform,
            bind_address: env.get_or("NODE_BIND", "0.0.0.0").to_string(),
            port,
            shard_index,
            trusted_coordinator_ip,
            handler_threads: env.parse_or::<u16>("NODE_HANDLER_THREADS", 4)? as usize,
            enable_kernel_firewall: env.get_bool("ENABLE_KERNEL_FIREWALL", false)?,
            resource_dir: env.get_or("RESOURCE_BASE_DIR", "resources").to_string(),
            secrets_dir: env.get_or("KMS_SECRETS_DIR", "secrets").to_string(),
            ca_cert_path: env.get_or("TLS_CERT_CA", "ca.pem").to_string(),
            server_cert_path,
            server_key_id,
            runtime_log_level: env
                .get_or("RUNTIME_LOG_LEVEL", "INFO")
                .parse()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: "RUNTIME_LOG_LEVEL".to_string(),
                    value: env.get_or("RUNTIME_LOG_LEVEL", "INFO").to_string(),
                    reason,
                })?,
            compile_log_level: env
                .get_or("COMPILE_LOG_LEVEL", "DEBUG")
                .parse()
                .map_err(|reason| ConfigError::InvalidValue {
                    key: "COMPILE_LOG_LEVEL".to_string(),
                    value: env.get_or("COMPILE_LOG_LEVEL", "DEBUG").to_string(),
                    reason,
                })?,
            timeouts: timeouts_from_env(env)?,
        })
    }

    /// The player id this node signs as.
    pub fn player_id(&self) -> u64 {
        self.shard_index as u64
    }
}

pub(crate) fn timeouts_from_env(env: &Environment) -> Result<TlsTimeouts, ConfigError> {
    let defaults = TlsTimeouts::default();
    Ok(TlsTimeouts {
        handshake: Duration::from_millis(
            env.parse_or("TLS_HANDSHAKE_TIMEOUT_MS", defaults.handshake.as_millis() as u64)?,
        ),
        read: Duration::from_millis(
            env.parse_or("TLS_READ_TIMEOUT_MS", defaults.read.as_millis() as u64)?,
        ),
        write: Duration::from_millis(
            env.parse_or("TLS_WRITE_TIMEOUT_MS", defaults.write.as_millis() as u64)?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<String, String> {
        HashMap::from([
            ("NODE_IDS".to_string(), "n1,n2,n3".to_string()),
            (
                "NODE_HOSTS".to_string(),
                "127.0.0.1:19101,127.0.0.1:19102,127.0.0.1:19103".to_string(),
            ),
            ("NODE_SHARD_INDICES".to_string(), "0,1,2".to_string()),
            ("TRUSTED_COORDINATOR_IP".to_string(), "127.0.0.1".to_string()),
        ])
    }

    #[test]
    fn test_resolves_slot_by_node_id() {
        let env = Environment::from_map("test", base_env());
        let config = NodeConfig::from_env(&env, "n2").unwrap();
        assert_eq!(config.port, 19102);
        assert_eq!(config.shard_index, 1);
        assert_eq!(config.player_id(), 1);
        assert_eq!(config.platform, PlatformType::Local);
        assert_eq!(config.handler_threads, 4);
        assert_eq!(config.server_cert_path, "n2.pem");
    }

    #[test]
    fn test_unknown_node_id_rejected() {
        let env = Environment::from_map("test", base_env());
        assert!(NodeConfig::from_env(&env, "n9").is_err());
    }

    #[test]
    fn test_per_node_cert_override() {
        let mut map = base_env();
        map.insert("TLS_CERT_NODE_N1".to_string(), "certs/one.pem".to_string());
        map.insert(
            "TLS_KMS_NODE_N1_KEY_ID".to_string(),
            "keys/one.key".to_string(),
        );
        let env = Environment::from_map("test", map);
        let config = NodeConfig::from_env(&env, "n1").unwrap();
        assert_eq!(config.server_cert_path, "certs/one.pem");
        assert_eq!(config.server_key_id, "keys/one.key");
    }

    #[test]
    fn test_missing_trusted_ip_rejected() {
        let mut map = base_env();
        map.remove("TRUSTED_COORDINATOR_IP");
        let env = Environment::from_map("test", map);
        assert!(NodeConfig::from_env(&env, "n1").is_err());
    }
}
