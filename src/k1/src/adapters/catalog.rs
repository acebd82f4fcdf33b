//! Catalog application index (gitops-catalog `index.yaml`).

use super::http;
use async_trait::async_trait;
use provision::adapters::{CatalogAdapter, CatalogApp, CatalogSelection};
use provision::error::{AdapterError, AdapterErrorKind};
use provision::resolver::EnvSource;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_INDEX_URL: &str =
    "https://raw.githubusercontent.com/kubefirst/gitops-catalog/main/index.yaml";

#[derive(Debug, Deserialize)]
struct KeyEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexEntry {
    name: String,
    #[serde(default)]
    secret_keys: Vec<KeyEntry>,
    #[serde(default)]
    config_keys: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
pub struct CatalogIndex {
    apps: Vec<IndexEntry>,
}

impl CatalogIndex {
    pub fn parse(yaml: &str) -> Result<Self, AdapterError> {
        serde_yaml::from_str(yaml).map_err(|e| {
            AdapterError::new(AdapterErrorKind::CommandFailed, format!("invalid catalog index: {}", e))
        })
    }

    /// Resolve requested ids, listing unknown ids and unset variables.
    pub fn select(&self, apps: &[String], env: &dyn EnvSource) -> CatalogSelection {
        let mut selection = CatalogSelection::default();
        for id in apps {
            let Some(entry) = self.apps.iter().find(|a| &a.name == id) else {
                selection.unknown.push(id.clone());
                continue;
            };
            let app = CatalogApp {
                name: entry.name.clone(),
                secret_keys: entry.secret_keys.iter().map(|k| k.name.clone()).collect(),
                config_keys: entry.config_keys.iter().map(|k| k.name.clone()).collect(),
            };
            for key in app.secret_keys.iter().chain(app.config_keys.iter()) {
                if !env.is_set(key) {
                    selection.missing.push((app.name.clone(), key.clone()));
                }
            }
            selection.apps.push(app);
        }
        selection
    }
}

pub struct HttpCatalog {
    index_url: String,
    client: Client,
}

impl HttpCatalog {
    pub fn new(index_url: impl Into<String>) -> Result<Self, AdapterError> {
        Ok(Self {
            index_url: index_url.into(),
            client: http::client()?,
        })
    }
}

#[async_trait]
impl CatalogAdapter for HttpCatalog {
    async fn validate(
        &self,
        apps: &[String],
        env: &dyn EnvSource,
        cancel: &CancellationToken,
    ) -> Result<CatalogSelection, AdapterError> {
        let response = http::send(self.client.get(&self.index_url), "catalog index", cancel).await?;
        let body = response
            .text()
            .await
            .map_err(|e| AdapterError::transient(format!("catalog index: {}", e)))?;
        let selection = CatalogIndex::parse(&body)?.select(apps, env);
        tracing::info!(
            "[Catalog] {} apps resolved, {} unknown, {} settings missing",
            selection.apps.len(),
            selection.unknown.len(),
            selection.missing.len()
        );
        Ok(selection)
    }
}
