//! Outbound request side of the relay pool and the messages coming back.
//!
//! Connection management lives outside this crate. The feed engine only
//! sends subscription requests and receives [`RelayMessage`]s on a channel.
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::record::{AuthorId, Record, RecordId};

/// Subscription filter; empty vectors mean "unconstrained".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub ids: Vec<RecordId>,
    pub authors: Vec<AuthorId>,
    pub kinds: Vec<u32>,
    /// Records referencing any of these ids through `e` tags.
    pub referenced: Vec<RecordId>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub limit: Option<usize>,
}

impl RequestFilter {
    pub fn ids(ids: impl IntoIterator<Item = RecordId>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn authors(authors: impl IntoIterator<Item = AuthorId>, kinds: &[u32]) -> Self {
        Self {
            authors: authors.into_iter().collect(),
            kinds: kinds.to_vec(),
            ..Default::default()
        }
    }

    pub fn since(mut self, since: i64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: i64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Record {
        subscription_id: String,
        record: Record,
    },
    /// The relays finished sending stored records for this subscription.
    EndOfStored { subscription_id: String },
}

impl RelayMessage {
    pub fn subscription_id(&self) -> &str {
        match self {
            RelayMessage::Record {
                subscription_id, ..
            }
            | RelayMessage::EndOfStored { subscription_id } => subscription_id,
        }
    }
}

/// Outbound half of the relay pool. Calls must not block.
pub trait RelayClient: Send + Sync {
    fn send_request(&self, filter: RequestFilter, subscription_id: &str);

    fn close_subscription(&self, subscription_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentRequest {
    Subscribe {
        subscription_id: String,
        filter: RequestFilter,
    },
    Close {
        subscription_id: String,
    },
}

/// Relay client that never reaches the network and keeps a log of what it
/// was asked to do. Used for offline runs and in tests.
#[derive(Debug, Default)]
pub struct MemoryRelay {
    sent: Mutex<Vec<SentRequest>>,
    /// When set, every subscription is answered with end-of-stored at once.
    answer: Option<mpsc::Sender<RelayMessage>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A relay with nothing stored: subscriptions end immediately on `inbound`.
    pub fn offline(inbound: mpsc::Sender<RelayMessage>) -> Self {
        Self {
            sent: Mutex::default(),
            answer: Some(inbound),
        }
    }

    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Subscribe requests whose id starts with `prefix`.
    pub fn requests_with_prefix(&self, prefix: &str) -> Vec<(String, RequestFilter)> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                SentRequest::Subscribe {
                    subscription_id,
                    filter,
                } if subscription_id.starts_with(prefix) => Some((subscription_id, filter)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, request: SentRequest) {
        self.sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request);
    }
}

impl RelayClient for MemoryRelay {
    fn send_request(&self, filter: RequestFilter, subscription_id: &str) {
        tracing::debug!(
            subscription_id,
            ids = filter.ids.len(),
            authors = filter.authors.len(),
            since = ?filter.since,
            until = ?filter.until,
            "Relay request (offline)"
        );
        self.push(SentRequest::Subscribe {
            subscription_id: subscription_id.to_string(),
            filter,
        });
        if let Some(inbound) = &self.answer {
            let message = RelayMessage::EndOfStored {
                subscription_id: subscription_id.to_string(),
            };
            if inbound.try_send(message).is_err() {
                tracing::warn!(subscription_id, "Inbound channel full or closed, dropping end-of-stored");
            }
        }
    }

    fn close_subscription(&self, subscription_id: &str) {
        self.push(SentRequest::Close {
            subscription_id: subscription_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_memory_relay_records_requests_in_order() {
        let relay = MemoryRelay::new();
        relay.send_request(RequestFilter::ids([Arc::from("p")]), "parents-1");
        relay.send_request(
            RequestFilter::authors([Arc::from("alice")], &[1]).since(100),
            "following",
        );
        relay.close_subscription("parents-1");

        let sent = relay.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(
            sent[2],
            SentRequest::Close {
                subscription_id: "parents-1".to_string()
            }
        );

        let parents = relay.requests_with_prefix("parents-");
        assert_eq!(parents.len(), 1);
        assert_eq!(parents[0].1.ids, vec![Arc::<str>::from("p")]);
    }

    #[tokio::test]
    async fn test_offline_relay_ends_every_subscription() {
        let (tx, mut rx) = mpsc::channel(4);
        let relay = MemoryRelay::offline(tx);
        relay.send_request(RequestFilter::default(), "bootstrap-home");
        relay.close_subscription("bootstrap-home");

        assert_eq!(
            rx.recv().await,
            Some(RelayMessage::EndOfStored {
                subscription_id: "bootstrap-home".to_string()
            })
        );
        assert!(rx.try_recv().is_err());
    }
}
