//! Last-result channel
//!
//! Holds the most recent search response per agent so other components
//! (context summaries, rank fusion) can read it without re-running the
//! query. Populated explicitly by the service after each search.

use std::collections::HashMap;

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::domain::search::SearchResponse;

/// Default broadcast buffer
const DEFAULT_CAPACITY: usize = 32;

/// A published search result
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedResult {
    pub agent_id: String,
    pub response: SearchResponse,
}

/// Latest search response per agent, with a broadcast feed
pub struct QueryResultChannel {
    latest: RwLock<HashMap<String, SearchResponse>>,
    sender: broadcast::Sender<PublishedResult>,
}

impl Default for QueryResultChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl QueryResultChannel {
    /// Create a channel whose subscribers buffer up to `capacity` results
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            latest: RwLock::new(HashMap::new()),
            sender,
        }
    }

    /// Store a response as the agent's latest and notify subscribers
    pub async fn publish(&self, response: SearchResponse) {
        let agent_id = response.agent_id.clone();
        self.latest
            .write()
            .await
            .insert(agent_id.clone(), response.clone());

        // No subscribers is fine
        let receivers = self
            .sender
            .send(PublishedResult {
                agent_id: agent_id.clone(),
                response,
            })
            .unwrap_or(0);
        debug!(agent_id = %agent_id, receivers = receivers, "Search result published");
    }

    /// Latest response for an agent
    pub async fn last_result(&self, agent_id: &str) -> Option<SearchResponse> {
        self.latest.read().await.get(agent_id).cloned()
    }

    /// Forget an agent's latest response
    pub async fn clear(&self, agent_id: &str) -> bool {
        self.latest.write().await.remove(agent_id).is_some()
    }

    /// Receive every result published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PublishedResult> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_result_per_agent() {
        let channel = QueryResultChannel::default();
        assert!(channel.last_result("main").await.is_none());

        let mut first = SearchResponse::empty("main");
        first.entities = vec!["chris".to_string()];
        channel.publish(first).await;
        channel.publish(SearchResponse::empty("other")).await;

        let mut second = SearchResponse::empty("main");
        second.entities = vec!["dan".to_string()];
        channel.publish(second.clone()).await;

        assert_eq!(channel.last_result("main").await, Some(second));
        assert!(channel.last_result("other").await.is_some());
        assert!(channel.clear("other").await);
        assert!(channel.last_result("other").await.is_none());
    }

    #[tokio::test]
    async fn test_subscribers_receive_published_results() {
        let channel = QueryResultChannel::new(4);
        let mut receiver = channel.subscribe();

        channel.publish(SearchResponse::empty("main")).await;

        let published = receiver.recv().await.unwrap();
        assert_eq!(published.agent_id, "main");
        assert!(published.response.is_empty());
    }
}
