//! JSON-RPC client for the Odoo external API.
//!
//! Talks to the single `/jsonrpc` endpoint. Authentication goes through the
//! `common` service (`authenticate`), model access through the `object`
//! service (`execute_kw`). The client caches the authenticated uid and
//! re-authenticates lazily when the session is lost.
//!
//! # Example
//!
//! ```ignore
//! let client = OdooClient::new(OdooConfig {
//!     base_url: "https://erp.example.com".into(),
//!     database: "prod".into(),
//!     username: "sync@example.com".into(),
//!     api_key: "secret".into(),
//! })?;
//!
//! let ids = client.search("res.partner", json!([["email", "=", "a@b.c"]]), None, None).await?;
//! ```

mod error;
mod models;

pub use error::OdooRpcError;
pub use models::{FaultData, JsonRpcFault, JsonRpcRequest, JsonRpcResponse};

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Session error codes that invalidate the cached uid.
const SESSION_FAULT_CODE: i64 = 100;

/// Connection settings for an Odoo server.
#[derive(Debug, Clone)]
pub struct OdooConfig {
    /// Base URL without trailing slash, e.g. `https://erp.example.com`.
    pub base_url: String,
    /// Database name.
    pub database: String,
    /// Login of the integration user.
    pub username: String,
    /// API key (or password) of the integration user.
    pub api_key: String,
}

/// Client for one Odoo server / database pair.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct OdooClient {
    http: reqwest::Client,
    config: OdooConfig,
    uid: RwLock<Option<i64>>,
    next_id: AtomicU64,
}

impl OdooClient {
    /// Create a client. Fails only if the HTTP client cannot be built.
    pub fn new(config: OdooConfig) -> Result<Self, OdooRpcError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            http,
            config,
            uid: RwLock::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/jsonrpc", self.config.base_url.trim_end_matches('/'))
    }

    /// Raw JSON-RPC call against a service.
    async fn call(
        &self,
        service: &'static str,
        method: String,
        args: Vec<Value>,
    ) -> Result<Value, OdooRpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(service, method, args, id);

        let response = self
            .http
            .post(self.endpoint())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(OdooRpcError::Http {
                status: status.as_u16(),
            });
        }

        let envelope: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| OdooRpcError::Decode(e.to_string()))?;

        if let Some(fault) = envelope.error {
            if fault.code == SESSION_FAULT_CODE {
                *self.uid.write().await = None;
            }
            return Err(OdooRpcError::Fault {
                code: fault.code,
                message: fault.description(),
            });
        }

        envelope
            .result
            .ok_or_else(|| OdooRpcError::Decode("response had neither result nor error".into()))
    }

    /// Authenticate and cache the uid.
    pub async fn authenticate(&self) -> Result<i64, OdooRpcError> {
        let result = self
            .call(
                "common",
                "authenticate".to_string(),
                vec![
                    json!(self.config.database),
                    json!(self.config.username),
                    json!(self.config.api_key),
                    json!({}),
                ],
            )
            .await?;

        // Odoo returns `false` for bad credentials instead of a fault.
        let uid = result
            .as_i64()
            .filter(|uid| *uid > 0)
            .ok_or_else(|| OdooRpcError::Auth(format!("login rejected for {}", self.config.username)))?;

        debug!(uid, database = %self.config.database, "authenticated against odoo");
        *self.uid.write().await = Some(uid);
        Ok(uid)
    }

    async fn ensure_uid(&self) -> Result<i64, OdooRpcError> {
        if let Some(uid) = *self.uid.read().await {
            return Ok(uid);
        }
        self.authenticate().await
    }

    /// `execute_kw` against a model method.
    pub async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, OdooRpcError> {
        let uid = self.ensure_uid().await?;

        let result = self
            .call(
                "object",
                "execute_kw".to_string(),
                vec![
                    json!(self.config.database),
                    json!(uid),
                    json!(self.config.api_key),
                    json!(model),
                    json!(method),
                    args.clone(),
                    kwargs.clone(),
                ],
            )
            .await;

        // One re-auth attempt when the session died under us.
        match result {
            Err(OdooRpcError::Fault { code, .. }) if code == SESSION_FAULT_CODE => {
                warn!(model, method, "odoo session expired, re-authenticating");
                let uid = self.authenticate().await?;
                self.call(
                    "object",
                    "execute_kw".to_string(),
                    vec![
                        json!(self.config.database),
                        json!(uid),
                        json!(self.config.api_key),
                        json!(model),
                        json!(method),
                        args,
                        kwargs,
                    ],
                )
                .await
            }
            other => other,
        }
    }

    /// Search for record ids matching a domain.
    pub async fn search(
        &self,
        model: &str,
        domain: Value,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Vec<i64>, OdooRpcError> {
        let mut kwargs = Map::new();
        if let Some(offset) = offset {
            kwargs.insert("offset".to_string(), json!(offset));
        }
        if let Some(limit) = limit {
            kwargs.insert("limit".to_string(), json!(limit));
        }

        let result = self
            .execute_kw(model, "search", json!([domain]), Value::Object(kwargs))
            .await?;

        decode_id_list(&result)
    }

    /// Count records matching a domain.
    pub async fn search_count(&self, model: &str, domain: Value) -> Result<i64, OdooRpcError> {
        let result = self
            .execute_kw(model, "search_count", json!([domain]), json!({}))
            .await?;
        result
            .as_i64()
            .ok_or_else(|| OdooRpcError::Decode("search_count did not return an integer".into()))
    }

    /// Search and read in one round trip.
    pub async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
        let result = self
            .execute_kw(
                model,
                "search_read",
                json!([domain]),
                json!({ "fields": fields, "offset": offset, "limit": limit }),
            )
            .await?;

        decode_record_list(result)
    }

    /// Read records by id.
    pub async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
        let kwargs = match fields {
            Some(fields) => json!({ "fields": fields }),
            None => json!({}),
        };

        let result = self
            .execute_kw(model, "read", json!([ids]), kwargs)
            .await?;

        decode_record_list(result)
    }

    /// Create one record, returning its id.
    pub async fn create(
        &self,
        model: &str,
        values: Map<String, Value>,
    ) -> Result<i64, OdooRpcError> {
        let result = self
            .execute_kw(model, "create", json!([values]), json!({}))
            .await?;
        result
            .as_i64()
            .ok_or_else(|| OdooRpcError::Decode("create did not return an id".into()))
    }

    /// Create many records in one call, returning ids in input order.
    pub async fn create_batch(
        &self,
        model: &str,
        values_list: Vec<Map<String, Value>>,
    ) -> Result<Vec<i64>, OdooRpcError> {
        let result = self
            .execute_kw(model, "create", json!([values_list]), json!({}))
            .await?;

        decode_id_list(&result)
    }

    /// Write values onto existing records.
    pub async fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: Map<String, Value>,
    ) -> Result<bool, OdooRpcError> {
        let result = self
            .execute_kw(model, "write", json!([ids, values]), json!({}))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Delete records.
    pub async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, OdooRpcError> {
        let result = self
            .execute_kw(model, "unlink", json!([ids]), json!({}))
            .await?;
        Ok(result.as_bool().unwrap_or(false))
    }

    /// Arbitrary model method with positional args.
    pub async fn execute(
        &self,
        model: &str,
        method: &str,
        args: Value,
    ) -> Result<Value, OdooRpcError> {
        self.execute_kw(model, method, args, json!({})).await
    }

    /// Company of the integration user, for multi-company installs.
    pub async fn get_company_id(&self) -> Result<Option<i64>, OdooRpcError> {
        let uid = self.ensure_uid().await?;
        let records = self.read("res.users", &[uid], Some(&["company_id"])).await?;

        Ok(records
            .first()
            .and_then(|record| record.get("company_id"))
            .and_then(many2one_id))
    }
}

/// Extract the id from an Odoo many2one value (`[id, display_name]` or `false`).
fn many2one_id(value: &Value) -> Option<i64> {
    match value {
        Value::Array(pair) => pair.first().and_then(Value::as_i64),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn decode_id_list(value: &Value) -> Result<Vec<i64>, OdooRpcError> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .ok_or_else(|| OdooRpcError::Decode("expected a list of ids".into()))
}

fn decode_record_list(value: Value) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(map),
                other => Err(OdooRpcError::Decode(format!(
                    "expected a record object, got {}",
                    other
                ))),
            })
            .collect(),
        other => Err(OdooRpcError::Decode(format!(
            "expected a list of records, got {}",
            other
        ))),
    }
}
