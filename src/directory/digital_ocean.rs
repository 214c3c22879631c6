//! DigitalOcean droplet listing.

use std::net::Ipv4Addr;
use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use super::{DirectoryError, DirectoryFuture, Instance, InstanceDirectory, InstancePage};

/// Default DigitalOcean API root.
pub const DEFAULT_API_BASE_URL: &str = "https://api.digitalocean.com";

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
const PAGE_SIZE: u32 = 200;

/// Lists droplets through the DigitalOcean v2 API.
#[derive(Clone, Debug)]
pub struct DigitalOceanDirectory {
    client: reqwest::Client,
    token: String,
    api_base_url: String,
}

impl DigitalOceanDirectory {
    /// Creates a directory client authenticated with `token`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Client`] when `api_base_url` is not an
    /// absolute URL or the HTTP client cannot be built.
    pub fn new(
        token: impl Into<String>,
        api_base_url: impl Into<String>,
    ) -> Result<Self, DirectoryError> {
        let api_base_url = api_base_url.into();
        Url::parse(&api_base_url).map_err(|err| DirectoryError::Client {
            message: format!("invalid API base URL '{api_base_url}': {err}"),
        })?;
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|err| DirectoryError::Client {
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            token: token.into(),
            api_base_url,
        })
    }

    /// API root requests are sent to.
    #[must_use]
    pub fn api_base_url(&self) -> &str {
        &self.api_base_url
    }

    async fn fetch_page(&self, page: u32) -> Result<InstancePage, DirectoryError> {
        let url = format!(
            "{}/v2/droplets?page={page}&per_page={PAGE_SIZE}",
            self.api_base_url.trim_end_matches('/')
        );
        debug!(%url, "listing droplets");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(provider_error)?;

        let status = response.status();
        let body = response.text().await.map_err(provider_error)?;
        if !status.is_success() {
            return Err(DirectoryError::Provider {
                message: format!("HTTP {status}: {}", body.trim()),
            });
        }
        decode_page(&body)
    }
}

impl InstanceDirectory for DigitalOceanDirectory {
    fn list_page(&self, page: u32) -> DirectoryFuture<'_, InstancePage> {
        Box::pin(self.fetch_page(page))
    }
}

fn provider_error(err: reqwest::Error) -> DirectoryError {
    DirectoryError::Provider {
        message: err.to_string(),
    }
}

#[derive(Deserialize)]
struct DropletsResponse {
    #[serde(default)]
    droplets: Vec<Droplet>,
    #[serde(default)]
    links: Links,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    name: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    networks: Networks,
}

#[derive(Default, Deserialize)]
struct Networks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Default, Deserialize)]
struct Links {
    #[serde(default)]
    pages: Pages,
}

#[derive(Default, Deserialize)]
struct Pages {
    next: Option<String>,
}

impl Droplet {
    fn into_instance(self) -> Result<Instance, DirectoryError> {
        let public_ipv4 = self
            .networks
            .v4
            .iter()
            .find(|network| network.kind == "public")
            .map(|network| {
                network
                    .ip_address
                    .parse::<Ipv4Addr>()
                    .map_err(|err| DirectoryError::Provider {
                        message: format!(
                            "droplet {} reported invalid address '{}': {err}",
                            self.name, network.ip_address
                        ),
                    })
            })
            .transpose()?;
        Ok(Instance {
            id: self.id,
            name: self.name,
            tags: self.tags,
            public_ipv4,
        })
    }
}

/// Decodes one `GET /v2/droplets` response body.
pub(super) fn decode_page(body: &str) -> Result<InstancePage, DirectoryError> {
    let response: DropletsResponse =
        serde_json::from_str(body).map_err(|err| DirectoryError::Provider {
            message: format!("failed to decode droplet list: {err}"),
        })?;
    let next_page = response
        .links
        .pages
        .next
        .as_deref()
        .map(page_number)
        .transpose()?;
    let instances = response
        .droplets
        .into_iter()
        .map(Droplet::into_instance)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(InstancePage {
        instances,
        next_page,
    })
}

fn page_number(link: &str) -> Result<u32, DirectoryError> {
    let invalid = |detail: String| DirectoryError::Provider {
        message: format!("invalid next page link '{link}': {detail}"),
    };
    let url = Url::parse(link).map_err(|err| invalid(err.to_string()))?;
    let (_, value) = url
        .query_pairs()
        .find(|(key, _)| key == "page")
        .ok_or_else(|| invalid(String::from("missing page parameter")))?;
    value.parse().map_err(|err: std::num::ParseIntError| invalid(err.to_string()))
}
