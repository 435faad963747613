use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::broadcast;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::engine::TableUpdate;

/// A stream of table change notifications, optionally filtered by table name.
///
/// A subscriber that falls behind the broadcast buffer skips the missed
/// notifications; the gap is logged and the stream continues.
pub struct UpdateStream {
    inner: BroadcastStream<TableUpdate>,
    filter_tables: Option<Vec<String>>,
}

impl UpdateStream {
    #[must_use]
    pub fn new(receiver: broadcast::Receiver<TableUpdate>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            filter_tables: None,
        }
    }

    /// Only yield updates for the named tables.
    #[must_use]
    pub fn filter_tables(mut self, tables: Vec<String>) -> Self {
        self.filter_tables = Some(tables);
        self
    }
}

impl Stream for UpdateStream {
    type Item = TableUpdate;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(update))) => {
                    if let Some(tables) = &self.filter_tables
                        && !tables.contains(&update.table)
                    {
                        continue;
                    }
                    return Poll::Ready(Some(update));
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    warn!(missed, "update subscriber lagged; notifications skipped");
                    continue;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
