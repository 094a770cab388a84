//! Compute node registration through the FE HTTP SQL API
//!
//! Compute nodes register themselves with the FE on start. When CN pods go
//! away for good the operator drops their registrations first, otherwise the
//! FE keeps routing work to dead nodes.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::controller::error::{Error, Result};

#[cfg(test)]
use mockall::automock;

/// Path of the FE HTTP SQL endpoint
const SQL_PATH: &str = "/api/v1/catalogs/default_catalog/sql";

/// A node as reported by the FE
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisteredNode {
    /// Host the node registered with (IP or FQDN)
    pub ip: String,
    pub alive: bool,
}

/// Credentials for the FE HTTP API
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeCredentials {
    pub user: String,
    pub password: String,
}

impl Default for NodeCredentials {
    fn default() -> Self {
        Self {
            user: "root".to_string(),
            password: String::new(),
        }
    }
}

/// Node registration interface of the database
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeRegistry: Send + Sync {
    /// List compute nodes registered with the FE at `endpoint`
    async fn list_nodes(
        &self,
        endpoint: &str,
        credentials: &NodeCredentials,
    ) -> Result<Vec<RegisteredNode>>;

    /// Drop the compute node registered as `address` (`host:heartbeat_port`)
    async fn drop_node(
        &self,
        endpoint: &str,
        credentials: &NodeCredentials,
        address: &str,
    ) -> Result<()>;
}

/// [`NodeRegistry`] backed by the FE HTTP SQL API
#[derive(Clone, Default)]
pub struct HttpNodeRegistry {
    http: reqwest::Client,
}

impl HttpNodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn query(
        &self,
        endpoint: &str,
        credentials: &NodeCredentials,
        statement: &str,
    ) -> Result<String> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), SQL_PATH);
        debug!(url = %url, statement, "Sending FE query");

        let response = self
            .http
            .post(&url)
            .basic_auth(&credentials.user, Some(&credentials.password))
            .json(&json!({ "query": statement }))
            .send()
            .await
            .map_err(|e| Error::NodeRegistry(format!("request to {} failed: {}", url, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::NodeRegistry(format!("reading response from {}: {}", url, e)))?;

        if !status.is_success() {
            return Err(Error::NodeRegistry(format!(
                "{} returned {}: {}",
                url, status, body
            )));
        }
        Ok(body)
    }
}

#[async_trait]
impl NodeRegistry for HttpNodeRegistry {
    async fn list_nodes(
        &self,
        endpoint: &str,
        credentials: &NodeCredentials,
    ) -> Result<Vec<RegisteredNode>> {
        let body = self
            .query(endpoint, credentials, "SHOW COMPUTE NODES")
            .await?;
        parse_show_nodes(&body)
    }

    async fn drop_node(
        &self,
        endpoint: &str,
        credentials: &NodeCredentials,
        address: &str,
    ) -> Result<()> {
        let statement = format!("ALTER SYSTEM DROP COMPUTE NODE \"{}\"", address);
        self.query(endpoint, credentials, &statement).await?;
        Ok(())
    }
}

/// One line of the newline-delimited SQL API response
#[derive(Deserialize)]
struct ResponseLine {
    #[serde(default)]
    meta: Option<Vec<ColumnMeta>>,
    #[serde(default)]
    data: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    status: Option<ErrorStatus>,
}

#[derive(Deserialize)]
struct ColumnMeta {
    name: String,
}

#[derive(Deserialize)]
struct ErrorStatus {
    #[serde(default, rename = "errorMsg")]
    error_msg: Option<String>,
}

/// Parse the SQL API response of `SHOW COMPUTE NODES`.
///
/// The response is one JSON document per line: a `meta` line naming the
/// columns, then one `data` line per row.
pub fn parse_show_nodes(body: &str) -> Result<Vec<RegisteredNode>> {
    let mut ip_column = None;
    let mut alive_column = None;
    let mut nodes = Vec::new();

    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let parsed: ResponseLine = serde_json::from_str(line)?;

        if let Some(status) = parsed.status
            && let Some(msg) = status.error_msg
        {
            return Err(Error::NodeRegistry(msg));
        }

        if let Some(meta) = parsed.meta {
            ip_column = meta.iter().position(|c| c.name == "IP");
            alive_column = meta.iter().position(|c| c.name == "Alive");
            continue;
        }

        let Some(row) = parsed.data else {
            continue;
        };
        let (Some(ip_idx), Some(alive_idx)) = (ip_column, alive_column) else {
            return Err(Error::NodeRegistry(
                "response rows arrived before column metadata".to_string(),
            ));
        };

        let ip = row.get(ip_idx).and_then(|v| v.as_str()).unwrap_or_default();
        let alive = match row.get(alive_idx) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        };
        if !ip.is_empty() {
            nodes.push(RegisteredNode {
                ip: ip.to_string(),
                alive,
            });
        }
    }

    Ok(nodes)
}
