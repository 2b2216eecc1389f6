//! Contratto dei controller HTTP, indipendente dal trasporto.
//!
//! Il server vero (routing, (de)serializzazione del body) vive fuori dal
//! crate; qui c'è solo la mappatura esito → status code.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::contracts::{PipelineStatus, Request};
use crate::pipeline::Pipeline;
use crate::retrieval::{ContentType, DocumentIngestor, IngestDocument};

/// Corpo di risposta per una domanda respinta dal censore.
pub const CENSOR_REJECTED_BODY: &str = "ERROR: Content did not pass censor validation.";
/// Corpo di risposta quando la pipeline non produce una risposta valida.
pub const ASSISTANT_FAILED_BODY: &str = "ERROR: Assistant failed to provide a valid answer.";
/// Corpo di risposta per una domanda vuota.
pub const EMPTY_QUESTION_BODY: &str = "ERROR: Question must not be empty.";

/// Richiesta `POST /query`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Testo della domanda.
    pub question: String,
    /// Conversazione a cui appartiene.
    pub conversation_id: Uuid,
}

/// Risposta del controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResponse {
    /// Status HTTP.
    pub status: u16,
    /// Risposta finale o messaggio diagnostico.
    pub body: String,
}

impl QueryResponse {
    fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Esegue la pipeline e mappa l'esito: 200 / 400 / 500.
pub async fn handle_query(pipeline: &Pipeline, request: QueryRequest) -> QueryResponse {
    if request.question.trim().is_empty() {
        return QueryResponse::new(400, EMPTY_QUESTION_BODY);
    }

    let result = pipeline
        .run(&Request::new(request.question, request.conversation_id))
        .await;

    match (result.status, result.answer) {
        (PipelineStatus::Success, Some(answer)) => QueryResponse::new(200, answer),
        (PipelineStatus::PolicyRejected, _) => QueryResponse::new(400, CENSOR_REJECTED_BODY),
        _ => QueryResponse::new(500, ASSISTANT_FAILED_BODY),
    }
}

/// Richiesta `POST /embed` (multipart lato server).
#[derive(Debug, Clone)]
pub struct EmbedFileRequest {
    /// Contenuto del file.
    pub file: Bytes,
    /// Nome del file.
    pub file_name: Option<String>,
    /// Formato.
    pub content_type: ContentType,
    /// Chat di destinazione.
    pub chat_id: Uuid,
}

/// Avvia l'ingestione in background e risponde subito 200.
///
/// Gli errori di ingestione vengono solo loggati. Va chiamata dentro un
/// runtime tokio.
pub fn embed_file(ingestor: Arc<dyn DocumentIngestor>, request: EmbedFileRequest) -> u16 {
    let document = IngestDocument {
        file: request.file,
        file_name: request.file_name,
        content_type: request.content_type,
        chat_id: request.chat_id,
    };
    let chat_id = document.chat_id;

    tokio::spawn(async move {
        match ingestor.ingest(document).await {
            Ok(()) => info!(%chat_id, "document ingested"),
            Err(err) => error!(%chat_id, error = %err, "document ingestion failed"),
        }
    });
    200
}
