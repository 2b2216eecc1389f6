//! Generator (assistente): produce la risposta candidata.
//!
//! Il prompt è composto da istruzioni di sistema con i documenti
//! recuperati, gli ultimi messaggi della conversazione e il turno utente.
//! Dopo un rifiuto del moderatore il turno utente è il blocco di feedback
//! invece della domanda nuda.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::contracts::{ModerationVerdict, Request};
use crate::memory::ConversationMemory;
use crate::model::{call_model, ChatMessage, ModelRequest, TextModel};
use crate::template::{render, PromptTemplates};

/// Assistente con accesso a contesto e memoria.
pub struct Generator {
    model: Arc<dyn TextModel>,
    memory: Arc<dyn ConversationMemory>,
    templates: Arc<PromptTemplates>,
    memory_window: usize,
    timeout: Duration,
}

impl Generator {
    /// Crea il generatore dalla configurazione della pipeline.
    pub fn new(
        model: Arc<dyn TextModel>,
        memory: Arc<dyn ConversationMemory>,
        templates: Arc<PromptTemplates>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            model,
            memory,
            templates,
            memory_window: config.memory_window,
            timeout: config.model_timeout(),
        }
    }

    /// Genera una risposta candidata.
    ///
    /// Restituisce `None` se il modello produce testo vuoto o la chiamata
    /// fallisce: per la pipeline entrambi i casi consumano un round.
    pub async fn generate(
        &self,
        request: &Request,
        context: &str,
        feedback: Option<&str>,
    ) -> Option<String> {
        let history = match self
            .memory
            .recent(request.conversation_id, self.memory_window)
            .await
        {
            Ok(history) => history,
            Err(err) => {
                warn!(conversation_id = %request.conversation_id, error = %err, "memory unavailable, continuing without history");
                Vec::new()
            }
        };

        let today = time::OffsetDateTime::now_utc().date().to_string();
        let mut model_request = ModelRequest::default().with(ChatMessage::system(render(
            &self.templates.assistant,
            &[("CONTEXT", context), ("DATE", &today)],
        )));
        model_request.messages.extend(history);
        let model_request =
            model_request.with(ChatMessage::user(feedback.unwrap_or(request.question.as_str())));

        debug!(
            conversation_id = %request.conversation_id,
            with_feedback = feedback.is_some(),
            "assistant request"
        );

        match call_model(self.model.as_ref(), &model_request, self.timeout).await {
            Ok(text) if !text.trim().is_empty() => Some(text),
            Ok(_) => None,
            Err(err) => {
                warn!(conversation_id = %request.conversation_id, error = %err, "assistant call failed");
                None
            }
        }
    }

    /// Costruisce il blocco di feedback dopo un rifiuto del moderatore.
    #[must_use]
    pub fn feedback(&self, question: &str, rejected_answer: &str, verdict: &ModerationVerdict) -> String {
        let rejection = rejection_text(verdict);
        render(
            &self.templates.feedback,
            &[
                ("QUESTION", question),
                ("PREVIOUS_ANSWER", rejected_answer),
                ("REJECTION", &rejection),
            ],
        )
    }
}

/// `"commento - motivo"`, oppure solo il motivo se il commento è vuoto.
pub(crate) fn rejection_text(verdict: &ModerationVerdict) -> String {
    let reason = verdict.rejection_reason().unwrap_or_default();
    if verdict.comment().trim().is_empty() {
        reason.to_string()
    } else {
        format!("{} - {reason}", verdict.comment())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::memory::InMemoryConversationMemory;
    use crate::model::ScriptedModel;
    use uuid::Uuid;

    fn generator(model: Arc<ScriptedModel>, memory: Arc<InMemoryConversationMemory>) -> Generator {
        Generator::new(
            model,
            memory,
            Arc::new(PromptTemplates::default()),
            &PipelineConfig::default(),
        )
    }

    #[tokio::test]
    async fn prompt_carries_context_memory_and_question() {
        let model = Arc::new(ScriptedModel::always("Answer."));
        let memory = Arc::new(InMemoryConversationMemory::new());
        let request = Request::new("What is VVER?", Uuid::new_v4());
        for i in 0..4 {
            memory
                .append(request.conversation_id, vec![ChatMessage::user(format!("old {i}"))])
                .await
                .expect("append");
        }

        let out = generator(Arc::clone(&model), memory)
            .generate(&request, "VVER is a reactor type.", None)
            .await;
        assert_eq!(out.as_deref(), Some("Answer."));

        let sent = &model.requests()[0];
        assert!(sent.system_prompt().expect("system").contains("VVER is a reactor type."));
        let contents: Vec<_> = sent.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(&contents[1..], ["old 1", "old 2", "old 3", "What is VVER?"]);
    }

    #[tokio::test]
    async fn prompt_carries_current_date() {
        let model = Arc::new(ScriptedModel::always("Answer."));
        let request = Request::new("What day is it?", Uuid::new_v4());
        generator(Arc::clone(&model), Arc::new(InMemoryConversationMemory::new()))
            .generate(&request, "", None)
            .await;

        let today = time::OffsetDateTime::now_utc().date().to_string();
        let system = model.requests()[0].system_prompt().expect("system").to_string();
        assert!(!system.contains("<DATE>"));
        assert!(system.contains(&format!("Current date: {today}")));
    }

    #[tokio::test]
    async fn blank_or_failed_output_is_none() {
        let model = Arc::new(ScriptedModel::replies(["  \n"]));
        let gen = generator(Arc::clone(&model), Arc::new(InMemoryConversationMemory::new()));
        let request = Request::new("q", Uuid::new_v4());
        assert_eq!(gen.generate(&request, "", None).await, None);
        // script esaurito → errore del backend
        assert_eq!(gen.generate(&request, "", None).await, None);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn feedback_replaces_the_user_turn() {
        let model = Arc::new(ScriptedModel::always("Better answer."));
        let gen = generator(Arc::clone(&model), Arc::new(InMemoryConversationMemory::new()));
        let verdict: ModerationVerdict = decode(
            r#"{"answer":"Too vague.","isApproved":false,"rejectionReason":"No specifics","alerts":[]}"#,
        )
        .expect("verdict");
        let request = Request::new("How to restart pump 2?", Uuid::new_v4());

        let feedback = gen.feedback(&request.question, "Just restart it.", &verdict);
        assert!(feedback.contains("'Just restart it.'"));
        assert!(feedback.contains("Too vague. - No specifics"));
        assert!(feedback.contains("How to restart pump 2?"));

        gen.generate(&request, "", Some(&feedback)).await;
        assert_eq!(model.requests()[0].last_user_message(), Some(feedback.as_str()));
    }
}
