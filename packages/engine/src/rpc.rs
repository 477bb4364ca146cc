//! Transport seam between the engine and the remote ERP.
//!
//! The engine only ever talks to [`ErpTransport`]; production wires in
//! [`odoo_rpc::OdooClient`], tests wire in the mock from
//! [`crate::testing`].

use async_trait::async_trait;
use odoo_rpc::{OdooClient, OdooRpcError};
use serde_json::{Map, Value};

/// Operations the engine needs from the remote system.
#[async_trait]
pub trait ErpTransport: Send + Sync {
    async fn search(
        &self,
        model: &str,
        domain: Value,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Vec<i64>, OdooRpcError>;

    async fn search_count(&self, model: &str, domain: Value) -> Result<i64, OdooRpcError>;

    async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError>;

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError>;

    async fn create(&self, model: &str, values: Map<String, Value>) -> Result<i64, OdooRpcError>;

    async fn create_batch(
        &self,
        model: &str,
        values_list: Vec<Map<String, Value>>,
    ) -> Result<Vec<i64>, OdooRpcError>;

    async fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: Map<String, Value>,
    ) -> Result<bool, OdooRpcError>;

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, OdooRpcError>;

    async fn execute(&self, model: &str, method: &str, args: Value) -> Result<Value, OdooRpcError>;

    async fn get_company_id(&self) -> Result<Option<i64>, OdooRpcError>;
}

#[async_trait]
impl ErpTransport for OdooClient {
    async fn search(
        &self,
        model: &str,
        domain: Value,
        offset: Option<u32>,
        limit: Option<u32>,
    ) -> Result<Vec<i64>, OdooRpcError> {
        OdooClient::search(self, model, domain, offset, limit).await
    }

    async fn search_count(&self, model: &str, domain: Value) -> Result<i64, OdooRpcError> {
        OdooClient::search_count(self, model, domain).await
    }

    async fn search_read(
        &self,
        model: &str,
        domain: Value,
        fields: &[&str],
        offset: u32,
        limit: u32,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
        OdooClient::search_read(self, model, domain, fields, offset, limit).await
    }

    async fn read(
        &self,
        model: &str,
        ids: &[i64],
        fields: Option<&[&str]>,
    ) -> Result<Vec<Map<String, Value>>, OdooRpcError> {
        OdooClient::read(self, model, ids, fields).await
    }

    async fn create(&self, model: &str, values: Map<String, Value>) -> Result<i64, OdooRpcError> {
        OdooClient::create(self, model, values).await
    }

    async fn create_batch(
        &self,
        model: &str,
        values_list: Vec<Map<String, Value>>,
    ) -> Result<Vec<i64>, OdooRpcError> {
        OdooClient::create_batch(self, model, values_list).await
    }

    async fn write(
        &self,
        model: &str,
        ids: &[i64],
        values: Map<String, Value>,
    ) -> Result<bool, OdooRpcError> {
        OdooClient::write(self, model, ids, values).await
    }

    async fn unlink(&self, model: &str, ids: &[i64]) -> Result<bool, OdooRpcError> {
        OdooClient::unlink(self, model, ids).await
    }

    async fn execute(&self, model: &str, method: &str, args: Value) -> Result<Value, OdooRpcError> {
        OdooClient::execute(self, model, method, args).await
    }

    async fn get_company_id(&self) -> Result<Option<i64>, OdooRpcError> {
        OdooClient::get_company_id(self).await
    }
}
