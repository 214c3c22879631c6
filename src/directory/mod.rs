//! Read-only view of the live instances held by the cloud provider.
//!
//! The directory is pagination-aware: [`list_instances`] walks every page the
//! provider reports and concatenates the results. Nothing in this module
//! creates, tags, or destroys instances.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::pin::Pin;

use thiserror::Error;

mod digital_ocean;

pub use digital_ocean::{DEFAULT_API_BASE_URL, DigitalOceanDirectory};

/// A live instance as reported by the provider.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Instance {
    /// Provider identifier.
    pub id: u64,
    /// Instance name; matched against fleet node names.
    pub name: String,
    /// Tags attached to the instance.
    pub tags: Vec<String>,
    /// Public IPv4 address, once the provider has assigned one.
    pub public_ipv4: Option<Ipv4Addr>,
}

impl Instance {
    /// Creates an instance record without tags or address.
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tags: Vec::new(),
            public_ipv4: None,
        }
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Sets the public IPv4 address.
    #[must_use]
    pub const fn with_public_ipv4(mut self, address: Ipv4Addr) -> Self {
        self.public_ipv4 = Some(address);
        self
    }

    /// Returns `true` when the instance carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|candidate| candidate == tag)
    }

    /// Resolves the address used for SSH.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::MissingPublicAddress`] when the provider has
    /// not assigned a public IPv4 address.
    pub fn public_address(&self) -> Result<IpAddr, DirectoryError> {
        self.public_ipv4
            .map(IpAddr::V4)
            .ok_or_else(|| DirectoryError::MissingPublicAddress {
                instance: self.name.clone(),
            })
    }
}

/// One page of directory results.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstancePage {
    /// Instances on this page.
    pub instances: Vec<Instance>,
    /// Next page number, or `None` on the last page.
    pub next_page: Option<u32>,
}

/// Errors raised by directory lookups.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DirectoryError {
    /// Raised when the provider client cannot be constructed.
    #[error("failed to create instance directory client: {message}")]
    Client {
        /// Construction error message.
        message: String,
    },
    /// Raised when the provider API call or its decoding fails.
    #[error("instance directory request failed: {message}")]
    Provider {
        /// Provider or transport error message.
        message: String,
    },
    /// Raised when the provider reports a page that does not move forward.
    #[error("instance directory returned page {next} after page {current}")]
    Pagination {
        /// Page just fetched.
        current: u32,
        /// Page the provider asked for next.
        next: u32,
    },
    /// Raised when an instance has no public IPv4 address.
    #[error("instance {instance} has no public IPv4 address")]
    MissingPublicAddress {
        /// Instance name.
        instance: String,
    },
}

/// Future returned by directory operations.
pub type DirectoryFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, DirectoryError>> + Send + 'a>>;

/// Minimal interface implemented by instance providers.
pub trait InstanceDirectory {
    /// Fetches one page of instances. Pages are numbered from 1.
    fn list_page(&self, page: u32) -> DirectoryFuture<'_, InstancePage>;
}

/// Lists every live instance, following pagination until the last page.
///
/// # Errors
///
/// Returns the first page error, or [`DirectoryError::Pagination`] when the
/// provider reports a next page that is not after the current one.
pub async fn list_instances<D>(directory: &D) -> Result<Vec<Instance>, DirectoryError>
where
    D: InstanceDirectory + ?Sized,
{
    let mut instances = Vec::new();
    let mut page = 1;
    loop {
        let InstancePage {
            instances: batch,
            next_page,
        } = directory.list_page(page).await?;
        instances.extend(batch);
        match next_page {
            None => return Ok(instances),
            Some(next) if next > page => page = next,
            Some(next) => {
                return Err(DirectoryError::Pagination {
                    current: page,
                    next,
                });
            }
        }
    }
}

/// Keeps the instances carrying `tag`, preserving order.
#[must_use]
pub fn filter_by_tag(instances: &[Instance], tag: &str) -> Vec<Instance> {
    instances
        .iter()
        .filter(|instance| instance.has_tag(tag))
        .cloned()
        .collect()
}
