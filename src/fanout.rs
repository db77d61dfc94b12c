//! Concurrent per-item fetches with isolated failures.

use std::future::Future;
use tokio::task::JoinSet;

use crate::error::{CmsError, CmsResult};

const CHUNK: usize = 50;

/// Run `f` for every item concurrently, at most 50 at a time, and return
/// each outcome in input order. One item failing (or panicking) never
/// affects the others.
pub async fn map_settled<T, I, F, O, Fut>(input: I, f: F) -> Vec<CmsResult<O>>
where
    I: IntoIterator<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = CmsResult<O>> + Send + 'static,
    T: Send + 'static,
    O: Send + 'static,
{
    let mut iter = input.into_iter().enumerate().peekable();
    let mut slots: Vec<Option<CmsResult<O>>> = Vec::new();

    while iter.peek().is_some() {
        let mut set = JoinSet::new();
        for (i, item) in iter.by_ref().take(CHUNK) {
            slots.push(None);
            let fut = f(item);
            set.spawn(async move { (i, fut.await) });
        }
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((i, res)) => slots[i] = Some(res),
                Err(e) => tracing::warn!("fan-out task failed: {}", e),
            }
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(CmsError::Internal("task aborted".into()))))
        .collect()
}
