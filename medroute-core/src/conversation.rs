//! Conversation history store.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::types::Message;

/// Persists conversation messages. Messages are appended, never mutated.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Up to `limit` most recent messages of a conversation, oldest first.
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Vec<Message>;

    async fn append(&self, message: Message);
}

/// Process-local store keyed by conversation id.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: RwLock<HashMap<String, Vec<Message>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self, conversation_id: &str) -> usize {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Vec<Message> {
        let conversations = self.conversations.read().await;
        match conversations.get(conversation_id) {
            Some(messages) => {
                let skip = messages.len().saturating_sub(limit);
                messages[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    async fn append(&self, message: Message) {
        self.conversations
            .write()
            .await
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recent_messages_window() {
        let store = InMemoryConversationStore::new();
        for i in 0..5 {
            store.append(Message::user("c1", format!("m{i}"))).await;
        }
        store.append(Message::user("c2", "other")).await;

        let recent = store.recent_messages("c1", 2).await;
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert_eq!(store.len("c1").await, 5);
        assert_eq!(store.recent_messages("c1", 0).await.len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_empty() {
        let store = InMemoryConversationStore::new();
        assert!(store.recent_messages("missing", 10).await.is_empty());
    }
}
