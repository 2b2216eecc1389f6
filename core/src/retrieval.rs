//! Collaboratori per i documenti: recupero del contesto e ingestione.
//!
//! L'indice vettoriale vero vive fuori da questo crate. Qui ci sono solo
//! i trait usati dalla pipeline e uno store in memoria per test e demo,
//! che restituisce i documenti della conversazione senza alcun ranking.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

/// Recupera i documenti di supporto per una domanda.
#[async_trait]
pub trait DocumentRetriever: Send + Sync {
    /// Documenti rilevanti per `question` nella conversazione data.
    async fn retrieve(&self, question: &str, conversation_id: Uuid) -> Result<Vec<String>>;
}

/// Formato del file da ingerire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContentType {
    /// Documento PDF.
    Pdf,
    /// Testo semplice o Markdown.
    Txt,
}

/// File da aggiungere all'indice di una chat.
#[derive(Debug, Clone)]
pub struct IngestDocument {
    /// Contenuto grezzo.
    pub file: Bytes,
    /// Nome originale del file, se noto.
    pub file_name: Option<String>,
    /// Formato del contenuto.
    pub content_type: ContentType,
    /// Chat a cui il documento appartiene.
    pub chat_id: Uuid,
}

/// Aggiunge documenti all'indice.
#[async_trait]
pub trait DocumentIngestor: Send + Sync {
    /// Ingerisce `document`. Gli errori vengono solo loggati dal chiamante.
    async fn ingest(&self, document: IngestDocument) -> Result<()>;
}

/// Retriever che non trova mai nulla.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRetrieval;

#[async_trait]
impl DocumentRetriever for NoRetrieval {
    async fn retrieve(&self, _question: &str, _conversation_id: Uuid) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Store di documenti in memoria, partizionato per conversazione.
#[derive(Debug)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<Uuid, Vec<String>>>,
    top_k: usize,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new(3)
    }
}

impl InMemoryDocumentStore {
    /// Store che restituisce al massimo `top_k` documenti per domanda.
    #[must_use]
    pub fn new(top_k: usize) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            top_k,
        }
    }

    /// Aggiunge un documento testuale alla conversazione.
    pub async fn add(&self, conversation_id: Uuid, text: impl Into<String>) {
        self.documents
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .push(text.into());
    }
}

#[async_trait]
impl DocumentRetriever for InMemoryDocumentStore {
    async fn retrieve(&self, _question: &str, conversation_id: Uuid) -> Result<Vec<String>> {
        let documents = self.documents.read().await;
        Ok(documents
            .get(&conversation_id)
            .map(|docs| docs.iter().take(self.top_k).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl DocumentIngestor for InMemoryDocumentStore {
    async fn ingest(&self, document: IngestDocument) -> Result<()> {
        let name = document
            .file_name
            .clone()
            .unwrap_or_else(|| format!("{}.txt", Uuid::new_v4()));

        if document.content_type != ContentType::Txt {
            bail!("{name}: only text documents are supported by the in-memory store");
        }

        let text = String::from_utf8(document.file.to_vec())
            .with_context(|| format!("{name} is not valid UTF-8"))?;
        self.add(document.chat_id, text).await;
        info!(file = %name, chat_id = %document.chat_id, "document stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn documents_are_scoped_by_conversation_and_capped() {
        let store = InMemoryDocumentStore::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.add(a, "one").await;
        store.add(a, "two").await;
        store.add(a, "three").await;
        store.add(b, "other").await;

        assert_eq!(store.retrieve("q", a).await.expect("docs"), ["one", "two"]);
        assert_eq!(store.retrieve("q", b).await.expect("docs"), ["other"]);
        assert!(store.retrieve("q", Uuid::new_v4()).await.expect("docs").is_empty());
    }

    #[tokio::test]
    async fn ingest_accepts_text_and_rejects_pdf() {
        let store = InMemoryDocumentStore::default();
        let chat = Uuid::new_v4();

        store
            .ingest(IngestDocument {
                file: Bytes::from_static(b"reactor manual"),
                file_name: Some("manual.txt".into()),
                content_type: ContentType::Txt,
                chat_id: chat,
            })
            .await
            .expect("text ingest");
        assert_eq!(store.retrieve("q", chat).await.expect("docs"), ["reactor manual"]);

        let pdf = store
            .ingest(IngestDocument {
                file: Bytes::from_static(b"%PDF-1.7"),
                file_name: None,
                content_type: ContentType::Pdf,
                chat_id: chat,
            })
            .await;
        assert!(pdf.is_err());
    }
}
