//! Lazy feed consumers
//!
//! Nothing is sent to the exchange until the first `next()`. A consumer then
//! starts the dispatcher if needed, subscribes, waits for the acknowledgment
//! and yields every item of its queue until the connection terminates.
//! Consumers are not restartable.

use std::sync::Arc;

use futures_util::stream::{self, Stream};
use tracing::{debug, info, warn};

use crate::error::{FeedError, Result};
use crate::feed::{Feed, SubscriptionKey, Symbol};
use crate::messages::BookUpdate;
use crate::orderbook::{Applied, BookReconstructor, FullBookView, SpreadPairer};
use crate::queues::{FeedReceiver, Queued};
use crate::websocket::{ensure_started, Confirmation};
use crate::FeedState;

enum Phase<S> {
    Pending,
    Streaming(S),
    Done,
}

/// What the start sequence resolved to
enum Started<S> {
    Streaming(S),
    /// Confirmation timed out or the connection terminated
    Empty,
}

/// Subscribe and wait for the acknowledgment
///
/// A rejection forgets the key and surfaces as `FeedError::Subscribe`.
async fn subscribe_confirmed(
    state: &FeedState,
    key: &SubscriptionKey,
    token: Option<String>,
) -> Result<bool> {
    state
        .subscriptions
        .subscribe(&state.supervisor, key, token)
        .await?;

    let cancel = state.supervisor.cancellation();
    match state
        .subscriptions
        .wait_confirmed(key, state.config.subscription_timeout(), &cancel)
        .await
    {
        Confirmation::Confirmed => {
            info!(key = %key, "Subscription confirmed");
            Ok(true)
        }
        Confirmation::Rejected(reason) => {
            state.subscriptions.forget(key);
            Err(FeedError::Subscribe {
                key: key.to_string(),
                reason,
            })
        }
        Confirmation::TimedOut => {
            state.subscriptions.forget(key);
            Ok(false)
        }
        Confirmation::Terminated => Ok(false),
    }
}

/// Pass-through consumer for one feed
pub struct FeedStream<T: Queued> {
    state: Arc<FeedState>,
    key: SubscriptionKey,
    token: Option<String>,
    phase: Phase<FeedReceiver<T>>,
}

impl<T: Queued> FeedStream<T> {
    pub(crate) fn new(state: Arc<FeedState>, key: SubscriptionKey, token: Option<String>) -> Self {
        Self {
            state,
            key,
            token,
            phase: Phase::Pending,
        }
    }

    pub fn key(&self) -> &SubscriptionKey {
        &self.key
    }

    /// Next item, or `None` once the sequence has ended
    pub async fn next(&mut self) -> Option<Result<T>> {
        loop {
            match &mut self.phase {
                Phase::Done => return None,
                Phase::Pending => match self.start().await {
                    Ok(Started::Streaming(rx)) => self.phase = Phase::Streaming(rx),
                    Ok(Started::Empty) => {
                        self.phase = Phase::Done;
                        return None;
                    }
                    Err(e) => {
                        self.phase = Phase::Done;
                        return Some(Err(e));
                    }
                },
                Phase::Streaming(rx) => {
                    let cancel = self.state.supervisor.cancellation();
                    if cancel.is_cancelled() || !self.state.subscriptions.is_requested(&self.key) {
                        debug!(key = %self.key, "Consumer ended");
                        self.phase = Phase::Done;
                        return None;
                    }

                    let item = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        item = rx.recv() => item,
                    };

                    return match item {
                        None => {
                            self.phase = Phase::Done;
                            None
                        }
                        Some(Err(e)) if e.is_terminal() => {
                            self.phase = Phase::Done;
                            Some(Err(e))
                        }
                        Some(item) => Some(item),
                    };
                }
            }
        }
    }

    async fn start(&self) -> Result<Started<FeedReceiver<T>>> {
        ensure_started(&self.state)?;

        // Attach first so nothing published after the acknowledgment is missed
        let rx = T::queue(&self.state.queues).attach_key(&self.key);
        if subscribe_confirmed(&self.state, &self.key, self.token.clone()).await? {
            Ok(Started::Streaming(rx))
        } else {
            Ok(Started::Empty)
        }
    }

    /// Adapt into a `futures_util::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<T>> {
        stream::unfold(self, |mut consumer| async move {
            consumer.next().await.map(|item| (item, consumer))
        })
    }
}

struct BookSync {
    books: FeedReceiver<BookUpdate>,
    pairer: SpreadPairer,
    reconstructor: BookReconstructor,
}

/// Stateful order book consumer
///
/// Co-subscribes to the spread feed of the same symbol and prunes every
/// delta against the spread observed closest in time to it.
pub struct BookStream {
    state: Arc<FeedState>,
    symbol: Symbol,
    depth: u32,
    phase: Phase<BookSync>,
}

impl BookStream {
    pub(crate) fn new(state: Arc<FeedState>, symbol: Symbol, depth: u32) -> Self {
        Self {
            state,
            symbol,
            depth,
            phase: Phase::Pending,
        }
    }

    pub fn book_key(&self) -> SubscriptionKey {
        SubscriptionKey::new(Feed::OrderBook, self.symbol.clone()).with_depth(self.depth)
    }

    pub fn spread_key(&self) -> SubscriptionKey {
        SubscriptionKey::new(Feed::Spread, self.symbol.clone())
    }

    /// Next reconstructed book, or `None` once the sequence has ended
    pub async fn next(&mut self) -> Option<Result<FullBookView>> {
        loop {
            match &mut self.phase {
                Phase::Done => return None,
                Phase::Pending => match self.start().await {
                    Ok(Started::Streaming(sync)) => self.phase = Phase::Streaming(sync),
                    Ok(Started::Empty) => {
                        self.phase = Phase::Done;
                        return None;
                    }
                    Err(e) => {
                        self.phase = Phase::Done;
                        return Some(Err(e));
                    }
                },
                Phase::Streaming(sync) => {
                    let cancel = self.state.supervisor.cancellation();
                    let book_key = SubscriptionKey::new(Feed::OrderBook, self.symbol.clone())
                        .with_depth(self.depth);
                    if cancel.is_cancelled() || !self.state.subscriptions.is_requested(&book_key) {
                        debug!(symbol = %self.symbol, "Book consumer ended");
                        self.phase = Phase::Done;
                        return None;
                    }

                    let update = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => None,
                        update = sync.books.recv() => update,
                    };

                    let result = match update {
                        None => {
                            self.phase = Phase::Done;
                            return None;
                        }
                        Some(Ok(update)) => {
                            apply(sync, &update, self.state.config.spread_pairing_timeout()).await
                        }
                        Some(Err(e)) => Err(e),
                    };

                    if matches!(&result, Err(e) if e.is_terminal()) {
                        self.phase = Phase::Done;
                    }
                    return Some(result);
                }
            }
        }
    }

    async fn start(&self) -> Result<Started<BookSync>> {
        ensure_started(&self.state)?;

        let book_key = self.book_key();
        let spread_key = self.spread_key();
        let books = self.state.queues.books.attach_key(&book_key);
        let spreads = self.state.queues.spread_observer.attach_key(&spread_key);

        if !subscribe_confirmed(&self.state, &spread_key, None).await? {
            return Ok(Started::Empty);
        }
        match subscribe_confirmed(&self.state, &book_key, None).await {
            Ok(true) => {}
            outcome => {
                self.release_spread(&spread_key).await;
                return outcome.map(|_| Started::Empty);
            }
        }

        Ok(Started::Streaming(BookSync {
            books,
            pairer: SpreadPairer::new(spreads),
            reconstructor: BookReconstructor::new(self.symbol.clone(), self.depth as usize),
        }))
    }

    /// Drop the co-subscribed spread when the book itself never started
    async fn release_spread(&self, spread_key: &SubscriptionKey) {
        if let Err(e) = self
            .state
            .subscriptions
            .unsubscribe(&self.state.supervisor, spread_key)
            .await
        {
            debug!(key = %spread_key, error = %e, "Spread unsubscribe not sent");
        }
    }

    /// Adapt into a `futures_util::Stream`
    pub fn into_stream(self) -> impl Stream<Item = Result<FullBookView>> {
        stream::unfold(self, |mut consumer| async move {
            consumer.next().await.map(|item| (item, consumer))
        })
    }
}

async fn apply(
    sync: &mut BookSync,
    update: &BookUpdate,
    pairing_timeout: std::time::Duration,
) -> Result<FullBookView> {
    match sync.reconstructor.apply(update)? {
        Applied::Snapshot => sync.reconstructor.view(),
        Applied::Delta => match sync.pairer.pair(update.time, pairing_timeout).await? {
            Some(spread) => {
                sync.reconstructor.prune(&spread);
                sync.reconstructor.view()
            }
            None => {
                sync.reconstructor.trim();
                warn!(symbol = %update.symbol, "No spread observation to prune against");
                Err(unpaired(update, pairing_timeout))
            }
        },
    }
}

fn unpaired(update: &BookUpdate, waited: std::time::Duration) -> FeedError {
    FeedError::ReconstructionPrecondition(format!(
        "no spread observation for {} within {}ms",
        update.symbol,
        waited.as_millis()
    ))
}

