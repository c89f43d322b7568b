// Toronto Open Data is a CKAN instance; datasets are "packages", each holding
// downloadable "resources". https://docs.ckan.org/en/latest/api/

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::PipelineError;

pub static BASE_URL: &str = "https://ckan0.cf.opendata.inter.prod-toronto.ca/api/3/action/";

/// Package holding one zip archive of service requests per year.
pub static RESOURCE_ID: &str = "311-service-requests-customer-initiated";

/// Resolved archive location for one dataset year. Immutable, one per run.
#[derive(Debug, Clone)]
pub struct DatasetDescriptor {
    pub year: u16,
    pub resource_id: String,
    pub url: String,
}

impl DatasetDescriptor {
    /// Archive filename taken from the last path segment of the resolved URL.
    pub fn archive_name(&self) -> Result<String, PipelineError> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| PipelineError::not_found(self.year.to_string(), e.to_string()))?;
        url.path_segments()
            .and_then(|segments| segments.last())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::not_found(
                    self.year.to_string(),
                    format!("resource url {} has no filename", self.url),
                )
            })
    }

    /// Archive filename minus its `.zip` extension.
    pub fn archive_stem(&self) -> Result<String, PipelineError> {
        let name = self.archive_name()?;
        Ok(name
            .strip_suffix(".zip")
            .map(str::to_string)
            .unwrap_or(name))
    }
}

/// Remote catalog lookup: year → downloadable archive URL.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn resolve(&self, year: u16) -> Result<DatasetDescriptor, PipelineError>;
}

#[derive(Debug, Deserialize)]
struct PackageResponse {
    result: PackageResult,
}

#[derive(Debug, Deserialize)]
struct PackageResult {
    #[serde(default)]
    resources: Vec<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(default)]
    name: String,
    #[serde(default)]
    url: String,
}

/// CKAN-backed [`Catalog`].
pub struct CkanCatalog {
    client: Client,
    base_url: String,
    resource_id: String,
    timeout: Duration,
}

impl CkanCatalog {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            base_url: BASE_URL.to_string(),
            resource_id: RESOURCE_ID.to_string(),
            timeout,
        }
    }

    async fn package_show(&self) -> Result<PackageResponse, reqwest::Error> {
        self.client
            .get(format!("{}package_show", self.base_url))
            .query(&[("id", self.resource_id.as_str())])
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json::<PackageResponse>()
            .await
    }
}

#[async_trait]
impl Catalog for CkanCatalog {
    async fn resolve(&self, year: u16) -> Result<DatasetDescriptor, PipelineError> {
        let package = self
            .package_show()
            .await
            .map_err(|e| PipelineError::not_found(year.to_string(), e.to_string()))?;

        let token = year.to_string();
        let matches: Vec<&Resource> = package
            .result
            .resources
            .iter()
            .filter(|r| r.name.contains(&token))
            .collect();
        debug!(year, candidates = matches.len(), "catalog lookup");

        if matches.len() > 1 {
            // Known limitation carried from the source portal: names are the
            // only discriminator, so the first match wins.
            warn!(year, count = matches.len(), "multiple resources match; taking first");
        }
        match matches.first() {
            Some(resource) => Ok(DatasetDescriptor {
                year,
                resource_id: self.resource_id.clone(),
                url: resource.url.clone(),
            }),
            None => Err(PipelineError::not_found(
                token,
                format!("no resource name contains the year in package {}", self.resource_id),
            )),
        }
    }
}
