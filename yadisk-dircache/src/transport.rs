use futures_util::future::BoxFuture;
use futures_util::stream::{self, BoxStream};
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use thiserror::Error;
use yadisk_core::{Resource, ResourceType, YadiskClient, YadiskError};

use crate::paths;
use crate::tree::EntryPayload;

const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("api error: {0}")]
    Api(#[from] YadiskError),
    #[error("{0}")]
    Other(String),
}

pub type EntryStream = BoxStream<'static, Result<EntryPayload, TransportError>>;

/// Remote source of directory listings and single-entry metadata.
pub trait DirectoryTransport: Send + Sync {
    /// Streams the entries of `path`. The directory itself may be yielded
    /// at any position; the stream ends when the listing is complete.
    fn list_directory(&self, path: &str, include_hidden: bool) -> EntryStream;

    fn stat(&self, path: &str) -> BoxFuture<'static, Result<EntryPayload, TransportError>>;
}

/// [`DirectoryTransport`] over the Yandex Disk REST API. Listings are paged
/// and each page is yielded as soon as it arrives.
#[derive(Clone)]
pub struct YadiskTransport {
    client: YadiskClient,
    page_size: u32,
}

impl YadiskTransport {
    pub fn new(client: YadiskClient) -> Self {
        Self {
            client,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Canonical paths of published directories, for the `/Public` group.
    pub async fn public_roots(&self) -> Result<Vec<String>, TransportError> {
        let mut roots = Vec::new();
        let mut offset = 0u32;
        loop {
            let items = self
                .client
                .list_public_resources(self.page_size, offset)
                .await?;
            let fetched = items.len() as u32;
            roots.extend(
                items
                    .into_iter()
                    .filter(|item| item.resource_type == ResourceType::Dir)
                    .filter_map(|item| paths::normalize(&item.path)),
            );
            if fetched < self.page_size {
                break;
            }
            offset = offset.saturating_add(fetched);
        }
        Ok(roots)
    }
}

impl DirectoryTransport for YadiskTransport {
    fn list_directory(&self, path: &str, _include_hidden: bool) -> EntryStream {
        let client = self.client.clone();
        let page_size = self.page_size;
        let path = path.to_string();
        stream::try_unfold(Some(0u32), move |offset| {
            next_page(client.clone(), path.clone(), page_size, offset)
        })
        .map_ok(|entries| stream::iter(entries.into_iter().map(Ok)))
        .try_flatten()
        .boxed()
    }

    fn stat(&self, path: &str) -> BoxFuture<'static, Result<EntryPayload, TransportError>> {
        let client = self.client.clone();
        let path = path.to_string();
        async move { Ok(resource_to_entry(client.get_resource(&path).await?)) }.boxed()
    }
}

/// One page of entries plus the offset of the following page, if any.
async fn next_page(
    client: YadiskClient,
    path: String,
    page_size: u32,
    offset: Option<u32>,
) -> Result<Option<(Vec<EntryPayload>, Option<u32>)>, TransportError> {
    let Some(offset) = offset else {
        return Ok(None);
    };
    let page = client.list_directory_page(&path, page_size, offset).await?;
    let next = page.next_offset();
    let mut entries = Vec::with_capacity(page.items.len() + 1);
    if offset == 0 {
        entries.push(resource_to_entry(page.directory));
    }
    entries.extend(page.items.into_iter().map(resource_to_entry));
    Ok(Some((entries, next)))
}

fn resource_to_entry(resource: Resource) -> EntryPayload {
    EntryPayload {
        path: Some(resource.path),
        name: Some(resource.name),
        is_dir: Some(resource.resource_type == ResourceType::Dir),
        attributes: resource.extra,
    }
}
