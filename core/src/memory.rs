//! Memoria conversazionale.
//!
//! La memoria è l'unica risorsa mutabile condivisa fra richieste. Le
//! scritture sulla stessa conversazione sono serializzate da un mutex
//! dedicato; conversazioni diverse non si contendono nulla oltre al
//! breve lock in lettura sulla mappa.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::model::ChatMessage;

/// Log append-only dei messaggi di ogni conversazione.
#[async_trait]
pub trait ConversationMemory: Send + Sync {
    /// Ultimi `limit` messaggi della conversazione, dal più vecchio.
    async fn recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>>;

    /// Aggiunge `messages` in coda, atomicamente rispetto ad altre
    /// scritture sulla stessa conversazione.
    async fn append(&self, conversation_id: Uuid, messages: Vec<ChatMessage>) -> Result<()>;
}

type Log = Arc<Mutex<Vec<ChatMessage>>>;

/// Memoria in RAM, con un lock per conversazione.
#[derive(Debug, Default)]
pub struct InMemoryConversationMemory {
    logs: RwLock<HashMap<Uuid, Log>>,
}

impl InMemoryConversationMemory {
    /// Memoria vuota.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn log(&self, conversation_id: Uuid) -> Log {
        if let Some(log) = self.logs.read().await.get(&conversation_id) {
            return Arc::clone(log);
        }
        Arc::clone(self.logs.write().await.entry(conversation_id).or_default())
    }

    /// Numero totale di messaggi della conversazione.
    pub async fn len(&self, conversation_id: Uuid) -> usize {
        match self.logs.read().await.get(&conversation_id) {
            Some(log) => log.lock().await.len(),
            None => 0,
        }
    }

    /// `true` se la conversazione non ha messaggi.
    pub async fn is_empty(&self, conversation_id: Uuid) -> bool {
        self.len(conversation_id).await == 0
    }
}

#[async_trait]
impl ConversationMemory for InMemoryConversationMemory {
    async fn recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<ChatMessage>> {
        let Some(log) = self.logs.read().await.get(&conversation_id).map(Arc::clone) else {
            return Ok(Vec::new());
        };
        let messages = log.lock().await;
        let skip = messages.len().saturating_sub(limit);
        Ok(messages[skip..].to_vec())
    }

    async fn append(&self, conversation_id: Uuid, messages: Vec<ChatMessage>) -> Result<()> {
        let log = self.log(conversation_id).await;
        log.lock().await.extend(messages);
        Ok(())
    }
}
