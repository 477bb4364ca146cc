use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use odoo_rpc::OdooConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub odoo_url: String,
    pub odoo_database: String,
    pub odoo_username: String,
    pub odoo_api_key: String,
    pub site_id: i64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            odoo_url: env::var("ODOO_URL").context("ODOO_URL must be set")?,
            odoo_database: env::var("ODOO_DB").context("ODOO_DB must be set")?,
            odoo_username: env::var("ODOO_USERNAME").context("ODOO_USERNAME must be set")?,
            odoo_api_key: env::var("ODOO_API_KEY").context("ODOO_API_KEY must be set")?,
            site_id: env::var("SITE_ID")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("SITE_ID must be a valid number")?,
        })
    }

    /// Connection settings for the Odoo transport.
    pub fn odoo(&self) -> OdooConfig {
        OdooConfig {
            base_url: self.odoo_url.clone(),
            database: self.odoo_database.clone(),
            username: self.odoo_username.clone(),
            api_key: self.odoo_api_key.clone(),
        }
    }
}
