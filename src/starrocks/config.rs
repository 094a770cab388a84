//! StarRocks configuration file resolution
//!
//! Component configuration lives in a user ConfigMap as a `key = value`
//! text file (`fe.conf`, `be.conf`, `cn.conf`). The operator only needs the
//! port settings out of it, so values are kept as raw strings and resolved
//! on demand.

use std::collections::BTreeMap;

/// FE http port
pub const HTTP_PORT: &str = "http_port";
/// FE thrift rpc port
pub const RPC_PORT: &str = "rpc_port";
/// FE MySQL protocol port
pub const QUERY_PORT: &str = "query_port";
/// FE edit log replication port
pub const EDIT_LOG_PORT: &str = "edit_log_port";
/// BE/CN data port
pub const BE_PORT: &str = "be_port";
/// CN thrift port
pub const THRIFT_PORT: &str = "thrift_port";
/// BE/CN http port (superseded by `be_http_port`)
pub const WEBSERVER_PORT: &str = "webserver_port";
/// Newer name for the BE/CN http port
pub const BE_HTTP_PORT: &str = "be_http_port";
/// BE/CN heartbeat port
pub const HEARTBEAT_SERVICE_PORT: &str = "heartbeat_service_port";
/// BE/CN brpc port
pub const BRPC_PORT: &str = "brpc_port";

/// Parsed configuration file
pub type ConfigMapData = BTreeMap<String, String>;

/// Built-in port defaults
pub fn default_port(key: &str) -> Option<i32> {
    let port = match key {
        HTTP_PORT => 8030,
        RPC_PORT => 9020,
        QUERY_PORT => 9030,
        EDIT_LOG_PORT => 9010,
        BE_PORT => 9060,
        THRIFT_PORT => 9060,
        WEBSERVER_PORT | BE_HTTP_PORT => 8040,
        HEARTBEAT_SERVICE_PORT => 9050,
        BRPC_PORT => 8060,
        _ => return None,
    };
    Some(port)
}

/// Parse a `key = value` configuration file.
///
/// Blank lines and `#` comments are skipped. Lines without `=` are ignored.
/// Later assignments win.
pub fn parse_config(text: &str) -> ConfigMapData {
    let mut data = ConfigMapData::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value.trim().trim_matches('"');
        data.insert(key.to_string(), value.to_string());
    }
    data
}

/// Resolve a port value, falling back to the built-in default.
///
/// Never fails: missing, malformed or out-of-range values fall through to the
/// next candidate. `webserver_port` is looked up as `be_http_port` first
/// because newer releases renamed it.
pub fn resolve_port(config: &ConfigMapData, key: &str) -> i32 {
    let candidates: &[&str] = match key {
        WEBSERVER_PORT | BE_HTTP_PORT => &[BE_HTTP_PORT, WEBSERVER_PORT],
        _ => std::slice::from_ref(&key),
    };

    candidates
        .iter()
        .find_map(|candidate| config.get(*candidate).and_then(|v| parse_port(v)))
        .or_else(|| default_port(key))
        .unwrap_or(0)
}

fn parse_port(value: &str) -> Option<i32> {
    value
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|port| (1..=65535).contains(port))
}

/// Ports used by an FE
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FePorts {
    pub http: i32,
    pub rpc: i32,
    pub query: i32,
    pub edit_log: i32,
}

impl FePorts {
    pub fn resolve(config: &ConfigMapData) -> Self {
        Self {
            http: resolve_port(config, HTTP_PORT),
            rpc: resolve_port(config, RPC_PORT),
            query: resolve_port(config, QUERY_PORT),
            edit_log: resolve_port(config, EDIT_LOG_PORT),
        }
    }
}

impl Default for FePorts {
    fn default() -> Self {
        Self::resolve(&ConfigMapData::new())
    }
}

/// Ports used by a BE or CN
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendPorts {
    /// `be_port` for BE, `thrift_port` for CN
    pub thrift: i32,
    pub webserver: i32,
    pub heartbeat: i32,
    pub brpc: i32,
}

impl BackendPorts {
    /// Resolve BE ports
    pub fn resolve_be(config: &ConfigMapData) -> Self {
        Self::resolve_with(config, BE_PORT)
    }

    /// Resolve CN ports
    pub fn resolve_cn(config: &ConfigMapData) -> Self {
        Self::resolve_with(config, THRIFT_PORT)
    }

    fn resolve_with(config: &ConfigMapData, thrift_key: &str) -> Self {
        Self {
            thrift: resolve_port(config, thrift_key),
            webserver: resolve_port(config, WEBSERVER_PORT),
            heartbeat: resolve_port(config, HEARTBEAT_SERVICE_PORT),
            brpc: resolve_port(config, BRPC_PORT),
        }
    }
}
