//! Lazy paginated view over a remote listing.
use super::{ListPage, ObjectEntry, ObjectStorage, StorageError};
use futures::stream::{self, Stream, StreamExt, TryStreamExt};

/// Pages through `list_page` on demand. Nothing is fetched until the stream
/// is polled, and a listing can be restarted from any saved continuation
/// token.
pub struct RemoteListing<'a> {
    storage: &'a dyn ObjectStorage,
    prefix: String,
    page_size: u32,
}

impl<'a> RemoteListing<'a> {
    pub fn new(storage: &'a dyn ObjectStorage, prefix: impl Into<String>, page_size: u32) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            page_size: page_size.max(1),
        }
    }

    /// Pages starting at `start_token` (`None` for the beginning). Ends when
    /// the provider reports no further pages.
    pub fn pages(
        &self,
        start_token: Option<String>,
    ) -> impl Stream<Item = Result<ListPage, StorageError>> + Send + '_ {
        stream::try_unfold(Some(start_token), move |state| async move {
            let Some(token) = state else {
                return Ok(None);
            };
            let page = self
                .storage
                .list_page(&self.prefix, self.page_size, token.as_deref())
                .await?;
            let next = match (&page.next_token, page.is_truncated) {
                (Some(next), true) => {
                    if token.as_deref() == Some(next.as_str()) {
                        return Err(StorageError::InvalidResponse(format!(
                            "listing of '{}' repeated continuation token",
                            self.prefix
                        )));
                    }
                    Some(Some(next.clone()))
                }
                _ => None,
            };
            Ok(Some((page, next)))
        })
    }

    /// Every entry under the prefix, page by page.
    pub fn entries(&self) -> impl Stream<Item = Result<ObjectEntry, StorageError>> + Send + '_ {
        self.pages(None)
            .map_ok(|page| stream::iter(page.entries.into_iter().map(Ok)))
            .try_flatten()
            .boxed()
    }
}
