//! Coordinator configuration resolved from the named environment.

use mpc_common::observability::LogLevel;
use mpc_common::{ConfigError, Environment};
use mpc_network::client::NodeConnectionInfo;
use mpc_network::TlsTimeouts;
use mpc_types::PlatformType;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub coordinator_id: String,
    pub platform: PlatformType,
    pub https_bind: String,
    pub https_port: u16,
    pub nodes: Vec<NodeConnectionInfo>,
    pub threshold: u32,
    pub total_shards: u32,
    pub handler_threads: usize,
    pub max_requests_per_connection: usize,
    pub idle_timeout: Duration,
    pub resource_dir: String,
    pub secrets_dir: String,
    pub ca_cert_path: String,
    pub https_cert_path: String,
    pub https_key_id: String,
    pub runtime_log_level: LogLevel,
    pub compile_log_level: LogLevel,
    pub timeouts: TlsTimeouts,
}

impl CoordinatorConfig {
    pub fn from_env(env: &Environment) -> Result<Self, ConfigError> {
        let platform: PlatformType = env
            .get_or("COORDINATOR_PLATFORM", "LOCAL")
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                key: "COORDINATOR_PLATFORM".to_string(),
                value: env.get_or("COORDINATOR_PLATFORM", "LOCAL").to_string(),
                reason: "unknown platform".to_string(),
            })?;

        let nodes = parse_nodes(env)?;
        let total_shards = env.parse_or("MPC_TOTAL_SHARDS", nodes.len() as u32)?;
        let threshold = env.parse_or("MPC_THRESHOLD", 2u32)?;
        if threshold == 0 || (!nodes.is_empty() && threshold > total_shards) {
            return Err(ConfigError::InvalidValue {
                key: "MPC_THRESHOLD".to_string(),
                value: threshold.to_string(),
                reason: format!("threshold must be in 1..={total_shards}"),
            });
        }

        let https_cert_path = env
            .get("TLS_CERT_HTTPS")
            .or_else(|| env.get("TLS_CERT_COORDINATOR"))
            .map(str::to_string)
            .unwrap_or_else(|| "coordinator.pem".to_string());
        let https_key_id = env
            .get("TLS_KMS_HTTPS_KEY_ID")
            .or_else(|| env.get("TLS_KMS_COORDINATOR_KEY_ID"))
            .map(str::to_string)
            .unwrap_or_else(|| "coordinator.key".to_string());

        Ok(Self {
            coordinator_id: env.get_or("COORDINATOR_ID", "coordinator-1").to_string(),
            platform,
            https_bind: env.get_or("COORDINATOR_HTTPS_BIND", "0.0.0.0").to_string(),
            https_port: env.parse_or("COORDINATOR_HTTPS_PORT", 8443u16)?,
            nodes,
            threshold,
            total_shards,
            handler_threads: env.parse_or::<u16>("COORDINATOR_HANDLER_THREADS", 8)? as usize,
            max_requests_per_connection: env.parse_or::<u32>("HTTPS_MAX_REQUESTS", 1000)? as usize,
            idle_timeout: Duration::from_millis(env.parse_or("HTTPS_IDLE_TIMEOUT_MS", 60_000u64)?),
            resource_dir: env.get_or("RESOURCE_BASE_DIR", "resources").to_string(),
            secrets_dir: env.get_or("KMS_SECRETS_DIR", "secrets").to_string(),
            ca_cert_path: env.get_or("TLS_CERT_CA", "ca.pem").to_string(),
            https_cert_path,
            https_key_id,
            runtime_log_level: parse_level(env, "RUNTIME_LOG_LEVEL", "INFO")?,
            compile_log_level: parse_level(env, "COMPILE_LOG_LEVEL", "DEBUG")?,
            timeouts: timeouts_from_env(env)?,
        })
    }
}

fn parse_level(env: &Environment, key: &str, default: &str) -> Result<LogLevel, ConfigError> {
    env.get_or(key, default)
        .parse()
        .map_err(|reason| ConfigError::InvalidValue {
            key: key.to_string(),
            value: env.get_or(key, default).to_string(),
            reason,
        })
}

fn timeouts_from_env(env: &Environment) -> Result<TlsTimeouts, ConfigError> {
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

/// Zip the `NODE_*` tables into per-node registrations.
fn parse_nodes(env: &Environment) -> Result<Vec<NodeConnectionInfo>, ConfigError> {
    let ids = env.get_csv("NODE_IDS");
    let hosts = env.get_csv("NODE_HOSTS");
    if hosts.len() != ids.len() {
        return Err(ConfigError::InvalidValue {
            key: "NODE_HOSTS".to_string(),
            value: hosts.join(","),
            reason: format!("expected {} entries to match NODE_IDS", ids.len()),
        });
    }
    let platforms = env.get_csv("NODE_PLATFORMS");
    let shard_indices = env.get_csv("NODE_SHARD_INDICES");

    let mut nodes = Vec::with_capacity(ids.len());
    for (index, node_id) in ids.iter().enumerate() {
        let host = &hosts[index];
        let (address, port_str) =
            host.rsplit_once(':')
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: "NODE_HOSTS".to_string(),
                    value: host.clone(),
                    reason: "expected host:port".to_string(),
                })?;
        let port: u16 = port_str.parse().map_err(|_| ConfigError::InvalidValue {
            key: "NODE_HOSTS".to_string(),
            value: host.clone(),
            reason: "invalid port".to_string(),
        })?;

        let platform = match platforms.get(index) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "NODE_PLATFORMS".to_string(),
                value: raw.clone(),
                reason: "unknown platform".to_string(),
            })?,
            None => PlatformType::Local,
        };
        let shard_index = match shard_indices.get(index) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                key: "NODE_SHARD_INDICES".to_string(),
                value: raw.clone(),
                reason: "invalid shard index".to_string(),
            })?,
            None => index as u32,
        };

        // Client certificate presented to this node; `TLS_CERT_CLIENT_<ID>`
        // overrides the shared coordinator certificate.
        let upper_id = node_id.to_ascii_uppercase().replace('-', "_");
        let certificate_path = env
            .get(&format!("TLS_CERT_CLIENT_{upper_id}"))
            .or_else(|| env.get("TLS_CERT_COORDINATOR"))
            .map(str::to_string)
            .unwrap_or_else(|| "coordinator.pem".to_string());
        let private_key_id = env
            .get(&format!("TLS_KMS_CLIENT_{upper_id}_KEY_ID"))
            .or_else(|| env.get("TLS_KMS_COORDINATOR_KEY_ID"))
            .map(str::to_string)
            .unwrap_or_else(|| "coordinator.key".to_string());

        nodes.push(NodeConnectionInfo {
            node_id: node_id.clone(),
            platform,
            address: address.to_string(),
            port,
            shard_index,
            certificate_path,
            private_key_id,
        });
    }
    Ok(nodes)
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
            ("MPC_THRESHOLD".to_string(), "2".to_string()),
            ("MPC_TOTAL_SHARDS".to_string(), "3".to_string()),
            ("COORDINATOR_HTTPS_PORT".to_string(), "18443".to_string()),
        ])
    }

    #[test]
    fn test_parses_node_table() {
        let env = Environment::from_map("test", base_env());
        let config = CoordinatorConfig::from_env(&env).unwrap();
        assert_eq!(config.nodes.len(), 3);
        assert_eq!(config.nodes[1].node_id, "n2");
        assert_eq!(config.nodes[1].port, 19102);
        assert_eq!(config.nodes[1].shard_index, 1);
        assert_eq!(config.https_port, 18443);
        assert_eq!(config.threshold, 2);
        assert_eq!(config.total_shards, 3);
    }

    #[test]
    fn test_mismatched_host_table_rejected() {
        let mut map = base_env();
        map.insert("NODE_HOSTS".to_string(), "127.0.0.1:19101".to_string());
        let env = Environment::from_map("test", map);
        assert!(CoordinatorConfig::from_env(&env).is_err());
    }

    #[test]
    fn test_threshold_bounds_checked() {
        let mut map = base_env();
        map.insert("MPC_THRESHOLD".to_string(), "5".to_string());
        let env = Environment::from_map("test", map);
        assert!(CoordinatorConfig::from_env(&env).is_err());
    }
}
