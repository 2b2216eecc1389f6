//! Astrazione del modello testuale.
//!
//! La pipeline non conosce il backend: parla con un [`TextModel`] e ogni
//! chiamata passa da [`call_model`], che impone il timeout esterno.
//! Un timeout è un tentativo fallito come un altro.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ModelCallFailure;

/// Ruolo di un messaggio in una conversazione con il modello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Istruzioni di sistema.
    System,
    /// Messaggio dell'utente.
    User,
    /// Messaggio dell'assistente.
    Assistant,
}

/// Singolo messaggio di chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Ruolo dell'autore.
    pub role: ChatRole,
    /// Contenuto testuale.
    pub content: String,
}

impl ChatMessage {
    /// Messaggio di sistema.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// Messaggio utente.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    /// Messaggio dell'assistente.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Richiesta completa inviata al modello, in ordine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelRequest {
    /// Messaggi, dal più vecchio al più recente.
    pub messages: Vec<ChatMessage>,
}

impl ModelRequest {
    /// Aggiunge un messaggio in coda.
    #[must_use]
    pub fn with(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Contenuto del primo messaggio di sistema, se c'è.
    #[must_use]
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.as_str())
    }

    /// Contenuto dell'ultimo messaggio utente, se c'è.
    #[must_use]
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}

/// Capacità di generazione testuale usata da tutti gli stage.
///
/// L'implementazione può bloccare a lungo: il timeout lo applica la
/// pipeline, non il modello.
#[async_trait]
pub trait TextModel: Send + Sync {
    /// Genera il testo di risposta per `request`.
    async fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// Chiama `model` imponendo `timeout`.
pub(crate) async fn call_model(
    model: &dyn TextModel,
    request: &ModelRequest,
    timeout: Duration,
) -> Result<String, ModelCallFailure> {
    match tokio::time::timeout(timeout, model.complete(request)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(ModelCallFailure::Backend(err)),
        Err(_) => Err(ModelCallFailure::Timeout(timeout)),
    }
}

/// Passo di un [`ScriptedModel`].
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Risponde con il testo dato.
    Reply(String),
    /// Fallisce con l'errore dato.
    Fail(String),
    /// Non risponde mai (utile per verificare i timeout).
    Stall,
}

/// Modello deterministico che recita una sequenza di risposte.
///
/// Registra ogni richiesta ricevuta. Finito lo script risponde con il
/// testo di fallback, oppure fallisce se non è stato impostato.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    steps: Mutex<VecDeque<ScriptStep>>,
    fallback: Option<String>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    /// Modello con lo script dato e nessun fallback.
    pub fn new(steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Modello che risponde sempre con `text`.
    pub fn always(text: impl Into<String>) -> Self {
        Self::default().with_fallback(text)
    }

    /// Modello che risponde con i testi dati, in ordine.
    pub fn replies<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(|t| ScriptStep::Reply(t.into())))
    }

    /// Imposta la risposta usata quando lo script è finito.
    #[must_use]
    pub fn with_fallback(mut self, text: impl Into<String>) -> Self {
        self.fallback = Some(text.into());
        self
    }

    /// Numero di richieste ricevute.
    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Copia delle richieste ricevute, in ordine.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl TextModel for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let step = self
            .steps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();

        match step {
            Some(ScriptStep::Reply(text)) => Ok(text),
            Some(ScriptStep::Fail(message)) => Err(anyhow!(message)),
            Some(ScriptStep::Stall) => std::future::pending::<Result<String>>().await,
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("scripted model has no more replies")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_model_plays_steps_then_fallback() {
        let model = ScriptedModel::new([
            ScriptStep::Reply("one".into()),
            ScriptStep::Fail("boom".into()),
        ])
        .with_fallback("again");
        let req = ModelRequest::default().with(ChatMessage::user("hi"));

        assert_eq!(model.complete(&req).await.expect("reply"), "one");
        assert!(model.complete(&req).await.is_err());
        assert_eq!(model.complete(&req).await.expect("fallback"), "again");
        assert_eq!(model.calls(), 3);
        assert_eq!(model.requests()[0].last_user_message(), Some("hi"));
    }

    #[tokio::test(start_paused = true)]
    async fn call_model_times_out_on_stall() {
        let model = ScriptedModel::new([ScriptStep::Stall]);
        let req = ModelRequest::default();
        let err = call_model(&model, &req, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, ModelCallFailure::Timeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn call_model_wraps_backend_errors() {
        let model = ScriptedModel::default();
        let err = call_model(&model, &ModelRequest::default(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ModelCallFailure::Backend(_)));
    }

    #[test]
    fn request_helpers_find_roles() {
        let req = ModelRequest::default()
            .with(ChatMessage::system("sys"))
            .with(ChatMessage::user("first"))
            .with(ChatMessage::assistant("reply"))
            .with(ChatMessage::user("second"));
        assert_eq!(req.system_prompt(), Some("sys"));
        assert_eq!(req.last_user_message(), Some("second"));
    }
}
