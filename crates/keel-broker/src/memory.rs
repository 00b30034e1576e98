//! In-process broker with per-topic logs and group-wide committed offsets.
//!
//! An uncommitted message stays at the head of its topic and is delivered
//! again on a later poll, so a message that keeps failing blocks its own
//! topic while the other topics keep flowing. Polls rotate across topics.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::transport::{Incoming, MessageSink, MessageSource, PendingAck};

#[derive(Debug, Default)]
struct State {
    logs: BTreeMap<String, Vec<Vec<u8>>>,
    committed: BTreeMap<String, usize>,
    deliveries: BTreeMap<(String, usize), usize>,
    injected: VecDeque<BrokerError>,
    failing: Option<String>,
    polls: usize,
    rejected: HashSet<String>,
    stalled: HashSet<String>,
    unreachable: bool,
    commits: usize,
    closes: usize,
}

/// Shared handle to an in-process broker.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a raw body to `topic`, bypassing the producer.
    pub fn publish_raw(&self, topic: &str, body: impl Into<Vec<u8>>) {
        self.lock()
            .logs
            .entry(topic.to_owned())
            .or_default()
            .push(body.into());
    }

    /// Bodies stored on `topic`, oldest first.
    #[must_use]
    pub fn messages(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock().logs.get(topic).cloned().unwrap_or_default()
    }

    /// Number of messages stored on `topic`.
    #[must_use]
    pub fn topic_len(&self, topic: &str) -> usize {
        self.lock().logs.get(topic).map_or(0, Vec::len)
    }

    /// Next offset the consumer group will read from `topic`.
    #[must_use]
    pub fn committed_offset(&self, topic: &str) -> usize {
        self.lock().committed.get(topic).copied().unwrap_or(0)
    }

    /// How often the message at `offset` of `topic` has been delivered.
    #[must_use]
    pub fn delivery_count(&self, topic: &str, offset: usize) -> usize {
        self.lock()
            .deliveries
            .get(&(topic.to_owned(), offset))
            .copied()
            .unwrap_or(0)
    }

    /// Total successful commits.
    #[must_use]
    pub fn commit_count(&self) -> usize {
        self.lock().commits
    }

    /// Number of consumers closed.
    #[must_use]
    pub fn close_count(&self) -> usize {
        self.lock().closes
    }

    /// The next poll fails with `error` instead of delivering.
    pub fn inject_poll_error(&self, error: BrokerError) {
        self.lock().injected.push_back(error);
    }

    /// Every poll from now on fails with a receive error.
    pub fn fail_every_poll(&self, reason: &str) {
        self.lock().failing = Some(reason.to_owned());
    }

    /// Total polls made by all consumers.
    #[must_use]
    pub fn poll_count(&self) -> usize {
        self.lock().polls
    }

    /// Messages sent to `topic` are negatively acknowledged.
    pub fn reject_topic(&self, topic: &str) {
        self.lock().rejected.insert(topic.to_owned());
    }

    /// Messages sent to `topic` are never acknowledged.
    pub fn stall_topic(&self, topic: &str) {
        self.lock().stalled.insert(topic.to_owned());
    }

    /// Toggles whether sends reach the broker at all.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Opens a consumer for the group.
    #[must_use]
    pub fn consumer(&self) -> InMemoryConsumer {
        InMemoryConsumer {
            broker: self.clone(),
            topics: Vec::new(),
            cursor: 0,
            polls: 0,
            stop: None,
        }
    }
}

#[async_trait]
impl MessageSink for InMemoryBroker {
    async fn send(&self, topic: &str, body: Vec<u8>) -> Result<PendingAck, BrokerError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(BrokerError::Connection("broker unreachable".into()));
        }
        if state.stalled.contains(topic) {
            return Ok(futures::future::pending().boxed());
        }
        if state.rejected.contains(topic) {
            let err = BrokerError::Publish {
                topic: topic.to_owned(),
                reason: "rejected by broker".into(),
            };
            return Ok(futures::future::ready(Err(err)).boxed());
        }
        state.logs.entry(topic.to_owned()).or_default().push(body);
        Ok(futures::future::ready(Ok(())).boxed())
    }
}

/// A message delivered by [`InMemoryConsumer`].
#[derive(Debug, Clone)]
pub struct InMemoryMessage {
    topic: String,
    offset: usize,
    body: Vec<u8>,
}

impl InMemoryMessage {
    /// Position of the message in its topic.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl Incoming for InMemoryMessage {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn body(&self) -> &[u8] {
        &self.body
    }
}

#[derive(Debug)]
enum Stop {
    WhenIdle(CancellationToken),
    AfterPolls(usize, CancellationToken),
}

/// Consumer side of an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    topics: Vec<String>,
    cursor: usize,
    polls: usize,
    stop: Option<Stop>,
}

impl InMemoryConsumer {
    /// Cancels `token` on the first poll that finds nothing to deliver.
    #[must_use]
    pub fn stop_when_idle(mut self, token: CancellationToken) -> Self {
        self.stop = Some(Stop::WhenIdle(token));
        self
    }

    /// Cancels `token` once `polls` polls have been made.
    #[must_use]
    pub fn stop_after_polls(mut self, polls: usize, token: CancellationToken) -> Self {
        self.stop = Some(Stop::AfterPolls(polls, token));
        self
    }

    /// Adds a subscription no handler will claim.
    #[must_use]
    pub fn with_extra_subscription(mut self, topic: &str) -> Self {
        self.topics.push(topic.to_owned());
        self
    }

    fn next_message(&mut self) -> Option<InMemoryMessage> {
        let mut state = self.broker.lock();
        let count = self.topics.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let topic = &self.topics[index];
            let offset = state.committed.get(topic).copied().unwrap_or(0);
            let Some(body) = state.logs.get(topic).and_then(|log| log.get(offset)).cloned() else {
                continue;
            };
            *state
                .deliveries
                .entry((topic.clone(), offset))
                .or_default() += 1;
            self.cursor = index + 1;
            return Some(InMemoryMessage {
                topic: topic.clone(),
                offset,
                body,
            });
        }
        None
    }
}

#[async_trait]
impl MessageSource for InMemoryConsumer {
    type Message = InMemoryMessage;

    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        for topic in topics {
            if !self.topics.contains(topic) {
                self.topics.push(topic.clone());
            }
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Option<InMemoryMessage>, BrokerError> {
        self.polls += 1;
        if let Some(Stop::AfterPolls(limit, token)) = &self.stop {
            if self.polls >= *limit {
                token.cancel();
            }
        }

        {
            let mut state = self.broker.lock();
            state.polls += 1;
            if let Some(err) = state.injected.pop_front() {
                return Err(err);
            }
            if let Some(reason) = &state.failing {
                return Err(BrokerError::Receive(reason.clone()));
            }
        }
        if let Some(message) = self.next_message() {
            return Ok(Some(message));
        }

        if let Some(Stop::WhenIdle(token)) = &self.stop {
            token.cancel();
        }
        tokio::time::sleep(timeout.min(Duration::from_millis(1))).await;
        Ok(None)
    }

    async fn commit(&mut self, message: &InMemoryMessage) -> Result<(), BrokerError> {
        let mut state = self.broker.lock();
        let next = state.committed.entry(message.topic.clone()).or_default();
        *next = (*next).max(message.offset + 1);
        state.commits += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.broker.lock().closes += 1;
        Ok(())
    }
}
