#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

//! Eseguibile di demo per GuardRAG.
//!
//! Collega la `Pipeline` del crate `guardrag-core` a modelli finti, uno
//! per stage, e a store in memoria. Serve per verificare il flusso
//! completo: domanda → censore → assistente ⇄ moderatore → redattore.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use guardrag_core::api::{embed_file, handle_query, EmbedFileRequest, QueryRequest};
use guardrag_core::memory::InMemoryConversationMemory;
use guardrag_core::retrieval::{ContentType, DocumentIngestor, InMemoryDocumentStore};
use guardrag_core::{Collaborators, ModelRequest, Pipeline, PipelineConfig, StageModels, TextModel};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const BLOCKED_WORDS: [&str; 3] = ["password", "secret", "weapon"];

/// Censore finto: respinge le domande con parole bloccate.
struct KeywordCensor;

#[async_trait]
impl TextModel for KeywordCensor {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let question = request.last_user_message().unwrap_or_default().to_lowercase();
        let reply = if BLOCKED_WORDS.iter().any(|w| question.contains(w)) {
            serde_json::json!({"decision": "NO", "reason": "Restricted topic", "flags": ["restricted"]})
        } else {
            serde_json::json!({"decision": "YES", "flags": ["allowed"], "confidence": 95})
        };
        Ok(reply.to_string())
    }
}

/// Assistente finto: riporta i documenti ricevuti nel prompt.
struct ContextEcho;

#[async_trait]
impl TextModel for ContextEcho {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let documents = request
            .system_prompt()
            .and_then(|s| s.split_once("Documents:\n"))
            .map(|(_, docs)| docs.trim())
            .unwrap_or_default();
        if documents.is_empty() {
            Ok("The documents do not contain the answer.".to_string())
        } else {
            Ok(format!("According to the documents: {documents}"))
        }
    }
}

/// Moderatore finto: approva sempre.
struct Approver;

#[async_trait]
impl TextModel for Approver {
    async fn complete(&self, _request: &ModelRequest) -> Result<String> {
        Ok(serde_json::json!({"answer": "", "isApproved": true, "alerts": []}).to_string())
    }
}

/// Post-moderatore finto: restituisce la risposta approvata così com'è;
/// la sanificazione la fa il `Sanitizer`.
struct PassThroughEditor;

#[async_trait]
impl TextModel for PassThroughEditor {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let approved = request
            .messages
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(serde_json::json!({ "answer": approved }).to_string())
    }
}

fn load_config() -> Result<PipelineConfig> {
    match std::env::var("GUARDRAG_CONFIG") {
        Ok(path) => PipelineConfig::from_yaml(Path::new(&path)),
        Err(_) => PipelineConfig::from_env(),
    }
}

/// Entry-point dell'eseguibile di demo.
///
/// Avvia un piccolo REPL:
/// - `/doc <testo>` aggiunge un documento alla conversazione,
/// - `/stats` stampa i contatori della pipeline,
/// - qualsiasi altra riga è una domanda.
///
/// Digita `exit` o `quit` per uscire.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;
    let store = Arc::new(InMemoryDocumentStore::default());
    let pipeline = Pipeline::new(
        config,
        Collaborators {
            models: StageModels {
                censor: Arc::new(KeywordCensor),
                assistant: Arc::new(ContextEcho),
                moderator: Arc::new(Approver),
                redactor: Arc::new(PassThroughEditor),
            },
            retriever: store.clone(),
            memory: Arc::new(InMemoryConversationMemory::new()),
        },
    )?;
    let conversation_id = Uuid::new_v4();
    info!(%conversation_id, "demo started");

    println!("GuardRAG — demo CLI");
    println!("Scrivi una domanda, oppure '/doc <testo>' per aggiungere un documento.");
    println!("Digita 'exit' o 'quit' per uscire.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        print!("> ");
        stdout.flush()?;

        if stdin.read_line(&mut buffer)? == 0 {
            println!("\nEOF rilevato, esco.");
            break;
        }

        let line = buffer.trim();
        if line.eq_ignore_ascii_case("exit") || line.eq_ignore_ascii_case("quit") {
            println!("Ciao!");
            break;
        }

        if line == "/stats" {
            println!("{:#?}", pipeline.observer().snapshot());
            continue;
        }

        if let Some(text) = line.strip_prefix("/doc ") {
            let status = embed_file(
                Arc::clone(&store) as Arc<dyn DocumentIngestor>,
                EmbedFileRequest {
                    file: Bytes::from(text.to_string()),
                    file_name: None,
                    content_type: ContentType::Txt,
                    chat_id: conversation_id,
                },
            );
            println!("[{status}] documento in coda");
            continue;
        }

        let response = handle_query(
            &pipeline,
            QueryRequest {
                question: line.to_string(),
                conversation_id,
            },
        )
        .await;

        println!("---");
        println!("Status: {}", response.status);
        println!("Risposta:\n{}\n", response.body);
    }

    Ok(())
}
