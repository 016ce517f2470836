use std::{
    collections::VecDeque,
    sync::{Mutex, PoisonError},
};

use futures::{StreamExt, stream::BoxStream};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const DEFAULT_CAPACITY: usize = 10_000;
const LIVE_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Clone)]
enum Event<T: Clone> {
    Msg(T),
    Finished,
}

/// Bounded history plus live fan-out for captured output.
///
/// Readers either replay history and then follow the live feed
/// (`history_plus_stream`) or subscribe from "now" (`live_stream`). Streams
/// terminate when the producer calls [`MsgStore::finish`].
pub struct MsgStore<T: Clone + Send + 'static> {
    state: Mutex<State<T>>,
    live: broadcast::Sender<Event<T>>,
    capacity: usize,
}

struct State<T> {
    history: VecDeque<T>,
    finished: bool,
}

impl<T: Clone + Send + 'static> Default for MsgStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> MsgStore<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` bounds retained history; live subscribers are unaffected.
    pub fn with_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                history: VecDeque::new(),
                finished: false,
            }),
            live,
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, msg: T) {
        let mut state = self.lock();
        if state.finished {
            tracing::warn!("message pushed to a finished store, dropping");
            return;
        }
        state.history.push_back(msg.clone());
        if state.history.len() > self.capacity {
            state.history.pop_front();
        }
        // Sent under the lock so subscribers never observe a gap between
        // their history snapshot and the live feed.
        let _ = self.live.send(Event::Msg(msg));
    }

    pub fn finish(&self) {
        let mut state = self.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        let _ = self.live.send(Event::Finished);
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    pub fn len(&self) -> usize {
        self.lock().history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().history.is_empty()
    }

    /// Last `n` retained entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<T> {
        let state = self.lock();
        let skip = state.history.len().saturating_sub(n);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Replays retained history, then follows the live feed until finished.
    pub fn history_plus_stream(&self) -> BoxStream<'static, T> {
        let (snapshot, finished, rx) = {
            let state = self.lock();
            (
                state.history.iter().cloned().collect::<Vec<_>>(),
                state.finished,
                self.live.subscribe(),
            )
        };
        let head = futures::stream::iter(snapshot);
        if finished {
            return head.boxed();
        }
        head.chain(Self::follow(rx)).boxed()
    }

    /// Follows the live feed only; history is not replayed.
    pub fn live_stream(&self) -> BoxStream<'static, T> {
        let (finished, rx) = {
            let state = self.lock();
            (state.finished, self.live.subscribe())
        };
        if finished {
            return futures::stream::empty().boxed();
        }
        Self::follow(rx).boxed()
    }

    fn follow(rx: broadcast::Receiver<Event<T>>) -> impl futures::Stream<Item = T> + Send {
        BroadcastStream::new(rx)
            // Lagged receivers skip ahead; dropped entries are still in no
            // worse shape than the bounded history.
            .filter_map(|item| futures::future::ready(item.ok()))
            .take_while(|event| futures::future::ready(matches!(event, Event::Msg(_))))
            .filter_map(|event| {
                futures::future::ready(match event {
                    Event::Msg(msg) => Some(msg),
                    Event::Finished => None,
                })
            })
    }
}
