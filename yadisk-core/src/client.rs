use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://cloud-api.yandex.net";

#[derive(Debug, Error)]
pub enum YadiskError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("resource is not a directory: {0}")]
    NotADirectory(String),
}

#[derive(Clone)]
pub struct YadiskClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl YadiskClient {
    pub fn new(token: impl Into<String>) -> Result<Self, YadiskError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, YadiskError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Metadata of a single resource, without its listing.
    pub async fn get_resource(&self, path: &str) -> Result<Resource, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut().append_pair("path", path);
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: ResourceResponse = Self::handle_response(response).await?;
        Ok(payload.resource)
    }

    /// One page of a directory listing together with the directory resource.
    pub async fn list_directory_page(
        &self,
        path: &str,
        limit: u32,
        offset: u32,
    ) -> Result<DirectoryPage, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("limit", &limit.max(1).to_string())
            .append_pair("offset", &offset.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: ResourceResponse = Self::handle_response(response).await?;
        let Some(embedded) = payload.embedded else {
            return Err(YadiskError::NotADirectory(path.to_string()));
        };
        Ok(DirectoryPage {
            directory: payload.resource,
            items: embedded.items,
            limit: embedded.limit,
            offset,
            total: embedded.total,
        })
    }

    /// Resources the account has published, newest first.
    pub async fn list_public_resources(
        &self,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Resource>, YadiskError> {
        let mut url = self.endpoint("/v1/disk/resources/public")?;
        url.query_pairs_mut()
            .append_pair("limit", &limit.max(1).to_string())
            .append_pair("offset", &offset.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        let payload: PublicResourceList = Self::handle_response(response).await?;
        Ok(payload.items)
    }

    fn auth_header_value(&self) -> String {
        format!("OAuth {}", self.token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, YadiskError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, YadiskError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(YadiskError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Resource {
    pub path: String,
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Every other field the API returns (size, mime_type, modified, preview, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Clone)]
pub struct DirectoryPage {
    pub directory: Resource,
    pub items: Vec<Resource>,
    pub limit: u32,
    /// The offset that was requested. The API's echo of it is optional.
    pub offset: u32,
    pub total: u32,
}

impl DirectoryPage {
    pub fn next_offset(&self) -> Option<u32> {
        let next = self.offset.saturating_add(self.items.len() as u32);
        (!self.items.is_empty() && next < self.total).then_some(next)
    }
}

#[derive(Debug, Deserialize)]
struct ResourceResponse {
    #[serde(rename = "_embedded", default)]
    embedded: Option<EmbeddedList>,
    #[serde(flatten)]
    resource: Resource,
}

#[derive(Debug, Deserialize)]
struct EmbeddedList {
    #[serde(default)]
    items: Vec<Resource>,
    #[serde(default)]
    limit: u32,
    #[serde(default)]
    total: u32,
}

#[derive(Debug, Deserialize)]
struct PublicResourceList {
    #[serde(default)]
    items: Vec<Resource>,
}
