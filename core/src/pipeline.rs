//! Pipeline guardata: censore → assistente ⇄ moderatore → redattore.
//!
//! La run è una macchina a stati esplicita con un contatore di round.
//! Il budget `assistant_max_rounds` è unico e condiviso fra generazione e
//! moderazione: ogni invocazione del generatore consuma un round, anche
//! quando produce testo vuoto o quando il moderatore fallisce.
//!
//! ```text
//!   Init ─► Screening ─┬─► Generating ◄──────────┐
//!                      │       │                  │ rifiuto / errore
//!                      │       ▼                  │
//!                      │   Moderating ────────────┘
//!                      │       │ approvata
//!                      │       ▼
//!                      │   Redacting ─► Done
//!                      │       └──────► Fatal
//!                      └─► Rejected           (budget) ─► Exhausted
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::contracts::{PipelineResult, Request};
use crate::error::{Cancelled, PipelineError, StageFailure};
use crate::generator::{rejection_text, Generator};
use crate::memory::ConversationMemory;
use crate::meta_observer::PipelineObserver;
use crate::model::{ChatMessage, TextModel};
use crate::moderator::ResponseModerator;
use crate::policy_gate::{GateOutcome, PolicyGate};
use crate::redactor::Redactor;
use crate::retrieval::DocumentRetriever;

/// Un modello per ogni stage.
#[derive(Clone)]
pub struct StageModels {
    /// Modello del censore.
    pub censor: Arc<dyn TextModel>,
    /// Modello dell'assistente.
    pub assistant: Arc<dyn TextModel>,
    /// Modello del moderatore.
    pub moderator: Arc<dyn TextModel>,
    /// Modello del post-moderatore.
    pub redactor: Arc<dyn TextModel>,
}

impl StageModels {
    /// Lo stesso modello per tutti gli stage.
    pub fn shared(model: Arc<dyn TextModel>) -> Self {
        Self {
            censor: Arc::clone(&model),
            assistant: Arc::clone(&model),
            moderator: Arc::clone(&model),
            redactor: model,
        }
    }
}

/// Collaboratori esterni della pipeline.
#[derive(Clone)]
pub struct Collaborators {
    /// Modelli per stage.
    pub models: StageModels,
    /// Sorgente del contesto documentale.
    pub retriever: Arc<dyn DocumentRetriever>,
    /// Memoria conversazionale.
    pub memory: Arc<dyn ConversationMemory>,
}

enum State {
    Init,
    Screening,
    Generating {
        feedback: Option<String>,
    },
    Moderating {
        candidate: String,
        feedback: Option<String>,
    },
    Redacting {
        approved: String,
    },
    Done(String),
    Failed(PipelineError),
}

/// Orchestratore. È `Send + Sync`: condividerlo con `Arc` fra i task.
pub struct Pipeline {
    config: PipelineConfig,
    gate: PolicyGate,
    generator: Generator,
    moderator: ResponseModerator,
    redactor: Redactor,
    retriever: Arc<dyn DocumentRetriever>,
    memory: Arc<dyn ConversationMemory>,
    observer: PipelineObserver,
}

impl Pipeline {
    /// Costruisce la pipeline.
    ///
    /// # Errors
    ///
    /// Configurazione non valida o pattern di redazione che non compila.
    pub fn new(config: PipelineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let templates = Arc::new(config.templates.clone());
        let Collaborators {
            models,
            retriever,
            memory,
        } = collaborators;

        let redactor = Redactor::new(models.redactor, Arc::clone(&templates), &config)
            .context("invalid redaction pattern")?;

        Ok(Self {
            gate: PolicyGate::new(models.censor, Arc::clone(&templates), &config),
            generator: Generator::new(
                models.assistant,
                Arc::clone(&memory),
                Arc::clone(&templates),
                &config,
            ),
            moderator: ResponseModerator::new(models.moderator, templates, &config),
            redactor,
            retriever,
            memory,
            observer: PipelineObserver::new(),
            config,
        })
    }

    /// Contatori della pipeline.
    pub fn observer(&self) -> &PipelineObserver {
        &self.observer
    }

    /// Configurazione attiva.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Esegue una run completa.
    ///
    /// Non fallisce mai: ogni esito terminale è un [`PipelineResult`], e la
    /// risposta è presente solo in caso di successo.
    pub async fn run(&self, request: &Request) -> PipelineResult {
        let result = match self.drive(request).await {
            Ok(answer) => PipelineResult::success(answer),
            Err(err) => {
                if let PipelineError::ModerationExhausted { rejections, .. } = &err {
                    for (i, reason) in rejections.iter().enumerate() {
                        error!(conversation_id = %request.conversation_id, round = i + 1, reason = %reason, "rejection");
                    }
                }
                warn!(conversation_id = %request.conversation_id, error = %err, "pipeline run failed");
                PipelineResult::failed(err.status())
            }
        };
        self.observer.record_outcome(result.status);
        result
    }

    /// Come [`Pipeline::run`], ma si interrompe quando `token` viene
    /// annullato. Una run annullata non scrive nulla in memoria.
    ///
    /// # Errors
    ///
    /// [`Cancelled`] se il token scatta prima della fine.
    pub async fn run_cancellable(
        &self,
        request: &Request,
        token: CancellationToken,
    ) -> Result<PipelineResult, Cancelled> {
        tokio::select! {
            biased;
            () = token.cancelled() => {
                info!(conversation_id = %request.conversation_id, "pipeline run cancelled");
                self.observer.record_cancelled();
                Err(Cancelled)
            }
            result = self.run(request) => Ok(result),
        }
    }

    async fn drive(&self, request: &Request) -> Result<String, PipelineError> {
        let id = request.conversation_id;
        let max_rounds = self.config.assistant_max_rounds;
        let mut context = String::new();
        let mut round = 0u32;
        let mut rejections: Vec<String> = Vec::new();
        let mut state = State::Init;

        loop {
            state = match state {
                State::Init => {
                    context = self.context_for(request).await;
                    State::Screening
                }
                State::Screening => {
                    match self
                        .gate
                        .run(&request.question, &context, &self.observer)
                        .await
                    {
                        GateOutcome::Passed { .. } => State::Generating { feedback: None },
                        GateOutcome::Rejected { attempts } => {
                            State::Failed(PipelineError::PolicyRejected { attempts })
                        }
                    }
                }
                State::Generating { feedback } => {
                    if round >= max_rounds {
                        State::Failed(PipelineError::ModerationExhausted {
                            rounds: round,
                            rejections: std::mem::take(&mut rejections),
                        })
                    } else {
                        round += 1;
                        self.observer.record_generator_round();
                        debug!(conversation_id = %id, round, "generating");
                        match self
                            .generator
                            .generate(request, &context, feedback.as_deref())
                            .await
                        {
                            Some(candidate) => State::Moderating {
                                candidate,
                                feedback,
                            },
                            None => {
                                let err = PipelineError::EmptyGeneration { round };
                                warn!(conversation_id = %id, error = %err, "retrying");
                                rejections.push(format!("round {round}: empty answer"));
                                State::Generating { feedback }
                            }
                        }
                    }
                }
                State::Moderating {
                    candidate,
                    feedback,
                } => match self.moderator.validate(&request.question, &candidate).await {
                    Ok(verdict) if verdict.is_approved() => {
                        info!(conversation_id = %id, round, "answer approved");
                        State::Redacting {
                            approved: candidate,
                        }
                    }
                    Ok(verdict) => {
                        self.observer.record_moderation_rejection();
                        let reason = rejection_text(&verdict);
                        info!(conversation_id = %id, round, reason = %reason, "answer rejected");
                        rejections.push(format!("round {round}: {reason}"));
                        State::Generating {
                            feedback: Some(self.generator.feedback(
                                &request.question,
                                &candidate,
                                &verdict,
                            )),
                        }
                    }
                    Err(failure) => {
                        self.observer.record_moderation_rejection();
                        let reason = match failure {
                            StageFailure::Decode(source) => {
                                self.observer.record_decode_failure();
                                PipelineError::Decode {
                                    attempt: round,
                                    source,
                                }
                                .to_string()
                            }
                            StageFailure::Call(call) => call.to_string(),
                        };
                        warn!(conversation_id = %id, round, error = %reason, "moderator failed, treating as rejection");
                        rejections.push(format!("round {round}: moderator failure: {reason}"));
                        State::Generating { feedback }
                    }
                },
                State::Redacting { approved } => {
                    match self.redactor.finalize(&request.question, &approved).await {
                        Ok(answer) => State::Done(answer),
                        Err(failure) => {
                            if matches!(failure, StageFailure::Decode(_)) {
                                self.observer.record_decode_failure();
                            }
                            State::Failed(PipelineError::FatalRedactionFailure(failure.to_string()))
                        }
                    }
                }
                State::Done(answer) => {
                    self.remember(request, &answer).await;
                    info!(conversation_id = %id, rounds = round, "answer released");
                    return Ok(answer);
                }
                State::Failed(err) => return Err(err),
            };
        }
    }

    async fn context_for(&self, request: &Request) -> String {
        match self
            .retriever
            .retrieve(&request.question, request.conversation_id)
            .await
        {
            Ok(documents) => documents.join("\n\n"),
            Err(err) => {
                warn!(conversation_id = %request.conversation_id, error = %err, "retrieval failed, continuing without context");
                String::new()
            }
        }
    }

    async fn remember(&self, request: &Request, answer: &str) {
        let turn = vec![
            ChatMessage::user(request.question.clone()),
            ChatMessage::assistant(answer),
        ];
        if let Err(err) = self.memory.append(request.conversation_id, turn).await {
            warn!(conversation_id = %request.conversation_id, error = %err, "failed to store conversation turn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::PipelineStatus;
    use crate::memory::InMemoryConversationMemory;
    use crate::model::ScriptedModel;
    use crate::retrieval::NoRetrieval;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    const YES: &str = r#"{"decision":"YES","flags":["allowed"]}"#;
    const APPROVED: &str = r#"{"answer":"","isApproved":true,"alerts":[]}"#;

    fn collaborators(assistant: ScriptedModel, moderator: ScriptedModel) -> Collaborators {
        Collaborators {
            models: StageModels {
                censor: Arc::new(ScriptedModel::always(YES)),
                assistant: Arc::new(assistant),
                moderator: Arc::new(moderator),
                redactor: Arc::new(ScriptedModel::always(r#"{"answer":"Clean answer."}"#)),
            },
            retriever: Arc::new(NoRetrieval),
            memory: Arc::new(InMemoryConversationMemory::new()),
        }
    }

    #[derive(Default)]
    struct BrokenRetriever {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentRetriever for BrokenRetriever {
        async fn retrieve(&self, _question: &str, _conversation_id: Uuid) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("vector store unreachable")
        }
    }

    #[test]
    fn invalid_config_is_rejected_at_build_time() {
        let config = PipelineConfig {
            assistant_max_rounds: 0,
            ..PipelineConfig::default()
        };
        let built = Pipeline::new(
            config,
            collaborators(ScriptedModel::default(), ScriptedModel::default()),
        );
        assert!(built.is_err());
    }

    #[tokio::test]
    async fn empty_generations_consume_the_budget() {
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            collaborators(ScriptedModel::always(""), ScriptedModel::always(APPROVED)),
        )
        .expect("pipeline");

        let result = pipeline.run(&Request::new("q", Uuid::new_v4())).await;
        assert_eq!(result.status, PipelineStatus::Exhausted);
        assert_eq!(pipeline.observer().snapshot().generator_rounds, 3);
    }

    #[tokio::test]
    async fn moderator_failure_counts_as_rejection() {
        let pipeline = Pipeline::new(
            PipelineConfig::default(),
            collaborators(
                ScriptedModel::always("Candidate."),
                ScriptedModel::replies(["not json", APPROVED]),
            ),
        )
        .expect("pipeline");

        let result = pipeline.run(&Request::new("q", Uuid::new_v4())).await;
        assert_eq!(result, PipelineResult::success("Clean answer.".into()));
        let snap = pipeline.observer().snapshot();
        assert_eq!(snap.generator_rounds, 2);
        assert_eq!(snap.moderation_rejections, 1);
        assert_eq!(snap.decode_failures, 1);
    }

    #[tokio::test]
    async fn retrieval_failure_runs_with_empty_context() {
        let retriever = Arc::new(BrokenRetriever::default());
        let mut collab = collaborators(
            ScriptedModel::always("Candidate."),
            ScriptedModel::replies(["not json", APPROVED]),
        );
        collab.retriever = Arc::clone(&retriever) as Arc<dyn DocumentRetriever>;
        let pipeline = Pipeline::new(PipelineConfig::default(), collab).expect("pipeline");

        let result = pipeline.run(&Request::new("q", Uuid::new_v4())).await;
        assert_eq!(result, PipelineResult::success("Clean answer.".into()));
        // Una sola lettura anche con più round di generazione.
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pipeline.observer().snapshot().generator_rounds, 2);
    }
}
