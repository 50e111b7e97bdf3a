use serde_json::Value;

use crate::api::PageSource;
use crate::error::Result;
use crate::sync::SyncProgress;

/// Fetch every page of a collection and accumulate the raw items in memory.
///
/// Terminates when the provider reports no further pages, when an empty page
/// comes back, or when `max_pages` (0 = unlimited) is reached. A failure on
/// the first page is the caller's problem; a failure on any later page (after
/// the source's own retries) truncates the result to what was fetched so far
/// and is logged, not thrown — callers must tolerate a partial collection.
///
/// Appropriate for small and medium collections only; huge collections go
/// through the resumable page-sync loop instead.
pub async fn fetch_all_pages(
    source: &dyn PageSource,
    max_pages: u32,
    entity: &str,
    progress: &dyn SyncProgress,
) -> Result<Vec<Value>> {
    let mut items = Vec::new();
    let mut page: u32 = 1;

    progress.on_fetch_start(entity);

    loop {
        let fetched = match source.fetch_page(page).await {
            Ok(p) => p,
            Err(e) if page == 1 => return Err(e),
            Err(e) => {
                log::error!(
                    "{entity}: page {page} failed after retries, returning partial result \
                     ({} items): {e}",
                    items.len()
                );
                break;
            }
        };

        let count = fetched.items.len();
        items.extend(fetched.items);
        progress.on_page_fetched(entity, page, count, items.len());

        if count == 0 || !fetched.has_more {
            break;
        }
        if max_pages > 0 && page >= max_pages {
            log::warn!("{entity}: stopping early at page cap {max_pages}");
            break;
        }
        page += 1;
    }

    Ok(items)
}
