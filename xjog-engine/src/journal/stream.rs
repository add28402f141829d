//! Subscription streams over the journal. Each subscription keeps a
//! high-water-mark id and re-queries on every wakeup, so subscribers never
//! see duplicate or out-of-order ids. Wakeups come from the in-process
//! notification channel, with a polling tick as the cross-instance fallback.

use super::{
    FullStateRecord, JournalEntryRecord, JournalNotification, JournalQuery, JournalStore,
    QueryOrdering,
};
use crate::error::{EngineError, Result};
use futures::{stream, Stream, StreamExt};
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::sync::broadcast;

struct Subscription<T> {
    query: JournalQuery,
    rx: broadcast::Receiver<JournalNotification>,
    poll: Duration,
    last_id: Option<i64>,
    buffer: VecDeque<T>,
    closed: bool,
}

impl<T> Subscription<T> {
    /// Waits for the next wakeup. Returns `false` once the notification
    /// channel is gone, i.e. the store was dropped.
    async fn wait(&mut self) -> bool {
        tokio::select! {
            received = self.rx.recv() => match received {
                Ok(_) => true,
                // a lagged receiver just re-queries from its mark
                Err(broadcast::error::RecvError::Lagged(_)) => true,
                Err(broadcast::error::RecvError::Closed) => false,
            },
            _ = tokio::time::sleep(self.poll) => true,
        }
    }
}

fn subscription_stream<T, FetchFn, Fut>(
    store: &JournalStore,
    query: JournalQuery,
    fetch: FetchFn,
) -> impl Stream<Item = Result<T>> + Send
where
    T: Send + 'static,
    FetchFn: Fn(JournalQuery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Vec<T>, Option<i64>)>> + Send,
{
    let state = Subscription {
        query,
        rx: store.subscribe_notifications(),
        poll: store.polling_frequency(),
        last_id: None,
        buffer: VecDeque::new(),
        closed: false,
    };

    let fetch = Arc::new(fetch);
    stream::unfold(state, move |mut state| {
        let fetch = Arc::clone(&fetch);
        async move {
            loop {
                if state.closed {
                    return None;
                }
                if let Some(record) = state.buffer.pop_front() {
                    return Some((Ok(record), state));
                }

                let seeding = state.last_id.is_none();
                let mut query = state.query.clone();
                query.after = Some(state.last_id.unwrap_or(0));
                query.order = QueryOrdering::Ascending;
                match (*fetch)(query).await {
                    Ok((records, max_id)) => {
                        if let Some(max_id) = max_id {
                            state.last_id = Some(state.last_id.unwrap_or(0).max(max_id));
                        } else if seeding {
                            state.last_id = Some(0);
                        }
                        // the first query only seeds the mark; history before
                        // the subscription is not replayed
                        if !seeding && !records.is_empty() {
                            state.buffer.extend(records);
                            continue;
                        }
                    }
                    Err(err) => {
                        // background policy: log and retry on the next wakeup
                        tracing::warn!(error = ?err, "journal subscription query failed");
                    }
                }

                if !state.wait().await {
                    state.closed = true;
                    return Some((Err(EngineError::SubscriptionClosed), state));
                }
            }
        }
    })
}

impl JournalStore {
    /// New journal entries matching the query, strictly after the point of
    /// subscription, in id order without duplicates.
    pub fn new_journal_entries(
        &self,
        query: JournalQuery,
    ) -> futures::stream::BoxStream<'static, Result<JournalEntryRecord>> {
        let store = self.clone();
        subscription_stream(self, query, move |query| {
            let store = store.clone();
            async move {
                let records = store.query_entries(&query).await?;
                let max_id = records.iter().map(|record| record.id).max();
                Ok((records, max_id))
            }
        })
        .boxed()
    }

    /// New full-state snapshots matching the query, in journal-id order.
    pub fn new_full_state_entries(
        &self,
        query: JournalQuery,
    ) -> futures::stream::BoxStream<'static, Result<FullStateRecord>> {
        let store = self.clone();
        subscription_stream(self, query, move |query| {
            let store = store.clone();
            async move {
                let records = store.query_full_states(&query).await?;
                let max_id = records.iter().map(|record| record.id).max();
                Ok((records, max_id))
            }
        })
        .boxed()
    }
}
