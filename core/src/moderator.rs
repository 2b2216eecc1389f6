//! ResponseModerator: verifica la risposta candidata.
//!
//! Una sola chiamata per round, nessun retry interno: è la pipeline a
//! decidere se rigenerare.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::PipelineConfig;
use crate::contracts::ModerationVerdict;
use crate::decoder::decode;
use crate::error::StageFailure;
use crate::model::{call_model, ChatMessage, ModelRequest, TextModel};
use crate::template::{render, PromptTemplates};

/// Moderatore delle risposte.
pub struct ResponseModerator {
    model: Arc<dyn TextModel>,
    templates: Arc<PromptTemplates>,
    timeout: Duration,
}

impl ResponseModerator {
    /// Crea il moderatore dalla configurazione della pipeline.
    pub fn new(
        model: Arc<dyn TextModel>,
        templates: Arc<PromptTemplates>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            model,
            templates,
            timeout: config.model_timeout(),
        }
    }

    /// Valuta `candidate` come risposta a `question`.
    ///
    /// # Errors
    ///
    /// [`StageFailure`] se la chiamata fallisce o il verdetto non è valido.
    pub async fn validate(
        &self,
        question: &str,
        candidate: &str,
    ) -> Result<ModerationVerdict, StageFailure> {
        let system = render(
            &self.templates.moderator,
            &[("REQUEST", question), ("ASSISTANT_ANSWER", candidate)],
        );
        let request = ModelRequest::default()
            .with(ChatMessage::system(system))
            .with(ChatMessage::user(question))
            .with(ChatMessage::assistant(candidate));

        let raw = call_model(self.model.as_ref(), &request, self.timeout).await?;
        let verdict = decode::<ModerationVerdict>(&raw)?;
        debug!(
            approved = verdict.is_approved(),
            alerts = ?verdict.alerts(),
            "moderator verdict"
        );
        Ok(verdict)
    }
}
