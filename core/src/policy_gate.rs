//! PolicyGate (censore): decide se una domanda può essere elaborata.
//!
//! Il gate interroga il modello fino a `censor_rounds` volte. Dopo ogni
//! tentativo aggiunge una riga allo storico, che viene mostrato al
//! tentativo successivo. Quando il budget finisce senza convergenza la
//! domanda è respinta (fail-closed).

use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::contracts::Decision;
use crate::decoder::decode;
use crate::error::StageFailure;
use crate::meta_observer::PipelineObserver;
use crate::model::{call_model, ChatMessage, ModelRequest, TextModel};
use crate::template::{render, PromptTemplates};

/// Regola di convergenza del censore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConvergencePolicy {
    /// Servono due `Affirm` in tentativi adiacenti.
    #[default]
    ConsecutiveConfirmation,
    /// Basta un `Affirm`, con confidenza sufficiente se dichiarata.
    SingleConfirmation,
}

impl FromStr for ConvergencePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "consecutive-confirmation" => Ok(Self::ConsecutiveConfirmation),
            "single-confirmation" => Ok(Self::SingleConfirmation),
            other => Err(anyhow!(
                "unknown convergence policy {other:?} (expected consecutive-confirmation or single-confirmation)"
            )),
        }
    }
}

/// Stato della convergenza lungo i tentativi di una singola domanda.
///
/// Un tentativo fallito (`None`) sta fra i suoi vicini e interrompe la
/// sequenza di conferme.
#[derive(Debug, Clone)]
pub struct Convergence {
    policy: ConvergencePolicy,
    min_confidence: Option<u8>,
    previous_affirm: bool,
}

impl Convergence {
    /// Nuovo stato per la regola data.
    #[must_use]
    pub const fn new(policy: ConvergencePolicy, min_confidence: Option<u8>) -> Self {
        Self {
            policy,
            min_confidence,
            previous_affirm: false,
        }
    }

    /// Registra un tentativo; restituisce `true` se il gate è superato.
    pub fn observe(&mut self, decision: Option<&Decision>) -> bool {
        let affirm = decision.is_some_and(Decision::is_affirm);
        let passed = match self.policy {
            ConvergencePolicy::ConsecutiveConfirmation => affirm && self.previous_affirm,
            ConvergencePolicy::SingleConfirmation => {
                affirm && decision.is_some_and(|d| self.confident_enough(d))
            }
        };
        self.previous_affirm = affirm;
        passed
    }

    fn confident_enough(&self, decision: &Decision) -> bool {
        match (self.min_confidence, decision.confidence()) {
            (Some(min), Some(reported)) => reported > min,
            _ => true,
        }
    }
}

/// Esito del gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Domanda ammessa al tentativo indicato (1-based).
    Passed {
        /// Tentativo che ha chiuso la convergenza.
        attempt: u32,
    },
    /// Budget esaurito senza convergenza.
    Rejected {
        /// Tentativi consumati.
        attempts: u32,
    },
}

/// Censore delle domande.
pub struct PolicyGate {
    model: Arc<dyn TextModel>,
    templates: Arc<PromptTemplates>,
    rounds: u32,
    policy: ConvergencePolicy,
    min_confidence: Option<u8>,
    timeout: Duration,
}

impl PolicyGate {
    /// Crea il gate dalla configurazione della pipeline.
    pub fn new(
        model: Arc<dyn TextModel>,
        templates: Arc<PromptTemplates>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            model,
            templates,
            rounds: config.censor_rounds,
            policy: config.convergence_policy,
            min_confidence: config.min_affirm_confidence,
            timeout: config.model_timeout(),
        }
    }

    /// Un singolo tentativo di screening.
    ///
    /// # Errors
    ///
    /// [`StageFailure`] se la chiamata fallisce o la risposta non è una
    /// [`Decision`] valida.
    pub async fn screen(
        &self,
        question: &str,
        context: &str,
        history: &[String],
    ) -> Result<Decision, StageFailure> {
        let history_text = if history.is_empty() {
            self.templates.empty_history.clone()
        } else {
            format!("Censor decision history:\n{}", history.join("\n"))
        };
        let system = render(
            &self.templates.censor,
            &[
                ("QUESTION", question),
                ("DOCUMENT", context),
                ("HISTORY", &history_text),
            ],
        );
        let request = ModelRequest::default()
            .with(ChatMessage::system(system))
            .with(ChatMessage::user(question));

        let raw = call_model(self.model.as_ref(), &request, self.timeout).await?;
        Ok(decode::<Decision>(&raw)?)
    }

    /// Esegue il ciclo completo del censore per `question`.
    pub async fn run(&self, question: &str, context: &str, observer: &PipelineObserver) -> GateOutcome {
        let mut convergence = Convergence::new(self.policy, self.min_confidence);
        let mut history: Vec<String> = Vec::new();

        for attempt in 1..=self.rounds {
            debug!(attempt, policy = ?self.policy, "censor attempt");
            observer.record_censor_attempt();

            let decision = match self.screen(question, context, &history).await {
                Ok(decision) => Some(decision),
                Err(err) => {
                    warn!(attempt, error = %err, "censor attempt failed");
                    if matches!(err, StageFailure::Decode(_)) {
                        observer.record_decode_failure();
                    }
                    None
                }
            };

            history.push(history_entry(attempt, question, decision.as_ref()));

            if convergence.observe(decision.as_ref()) {
                info!(attempt, policy = ?self.policy, "censor passed");
                return GateOutcome::Passed { attempt };
            }
        }

        warn!(rounds = self.rounds, policy = ?self.policy, "censor failed: no convergence within budget");
        GateOutcome::Rejected {
            attempts: self.rounds,
        }
    }
}

fn history_entry(attempt: u32, question: &str, decision: Option<&Decision>) -> String {
    let mut line = format!("Attempt #{attempt} → Question: {question} Decision: ");
    match decision {
        Some(d) => {
            let flags: Vec<&str> = d.flags().iter().map(|f| f.as_str()).collect();
            let _ = write!(line, "{} ({})", d.verdict(), flags.join(", "));
        }
        None => line.push_str("invalid response"),
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ScriptStep, ScriptedModel};
    use proptest::prelude::*;

    const YES: &str = r#"{"decision":"YES","flags":["allowed"]}"#;
    const NO: &str = r#"{"decision":"NO","reason":"Restricted question","flags":["restricted"]}"#;

    fn gate(model: Arc<ScriptedModel>, rounds: u32, policy: ConvergencePolicy) -> PolicyGate {
        let config = PipelineConfig {
            censor_rounds: rounds,
            convergence_policy: policy,
            ..PipelineConfig::default()
        };
        PolicyGate::new(model, Arc::new(PromptTemplates::default()), &config)
    }

    #[tokio::test]
    async fn consecutive_passes_on_second_adjacent_affirm() {
        let model = Arc::new(ScriptedModel::replies([NO, YES, YES]));
        let outcome = gate(Arc::clone(&model), 5, ConvergencePolicy::ConsecutiveConfirmation)
            .run("How does the reactor work?", "", &PipelineObserver::new())
            .await;
        assert_eq!(outcome, GateOutcome::Passed { attempt: 3 });
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn consecutive_fails_without_adjacent_pair() {
        let model = Arc::new(ScriptedModel::replies([NO, YES]));
        let outcome = gate(Arc::clone(&model), 2, ConvergencePolicy::ConsecutiveConfirmation)
            .run("q", "", &PipelineObserver::new())
            .await;
        assert_eq!(outcome, GateOutcome::Rejected { attempts: 2 });
    }

    #[tokio::test]
    async fn decode_failure_consumes_a_round_and_breaks_adjacency() {
        let model = Arc::new(ScriptedModel::replies([YES, "not json", YES, YES]));
        let observer = PipelineObserver::new();
        let outcome = gate(Arc::clone(&model), 5, ConvergencePolicy::ConsecutiveConfirmation)
            .run("q", "", &observer)
            .await;
        assert_eq!(outcome, GateOutcome::Passed { attempt: 4 });
        assert_eq!(observer.snapshot().decode_failures, 1);
    }

    #[tokio::test]
    async fn single_confirmation_passes_immediately() {
        let model = Arc::new(ScriptedModel::replies([NO, YES]));
        let outcome = gate(Arc::clone(&model), 5, ConvergencePolicy::SingleConfirmation)
            .run("q", "", &PipelineObserver::new())
            .await;
        assert_eq!(outcome, GateOutcome::Passed { attempt: 2 });
    }

    #[tokio::test]
    async fn single_confirmation_honours_confidence_threshold() {
        let model = Arc::new(ScriptedModel::replies([
            r#"{"decision":"YES","flags":[],"confidence":40}"#,
            r#"{"decision":"YES","flags":[],"confidence":90}"#,
        ]));
        let config = PipelineConfig {
            convergence_policy: ConvergencePolicy::SingleConfirmation,
            min_affirm_confidence: Some(75),
            ..PipelineConfig::default()
        };
        let gate = PolicyGate::new(model, Arc::new(PromptTemplates::default()), &config);
        let outcome = gate.run("q", "", &PipelineObserver::new()).await;
        assert_eq!(outcome, GateOutcome::Passed { attempt: 2 });
    }

    #[tokio::test]
    async fn single_confirmation_fails_closed_below_threshold() {
        let model = Arc::new(ScriptedModel::always(
            r#"{"decision":"YES","flags":["allowed"],"confidence":75}"#,
        ));
        let config = PipelineConfig {
            censor_rounds: 3,
            convergence_policy: ConvergencePolicy::SingleConfirmation,
            min_affirm_confidence: Some(75),
            ..PipelineConfig::default()
        };
        let gate = PolicyGate::new(
            Arc::clone(&model) as Arc<dyn TextModel>,
            Arc::new(PromptTemplates::default()),
            &config,
        );
        let outcome = gate.run("q", "", &PipelineObserver::new()).await;
        assert_eq!(outcome, GateOutcome::Rejected { attempts: 3 });
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn history_and_context_reach_the_next_attempt() {
        let model = Arc::new(ScriptedModel::replies([NO, YES, YES]));
        gate(Arc::clone(&model), 5, ConvergencePolicy::ConsecutiveConfirmation)
            .run("Who approved it?", "Manual v2", &PipelineObserver::new())
            .await;

        let requests = model.requests();
        let first = requests[0].system_prompt().expect("system");
        assert!(first.contains("No previous decisions."));
        assert!(first.contains("Manual v2"));

        let second = requests[1].system_prompt().expect("system");
        assert!(second.contains("Attempt #1 → Question: Who approved it? Decision: NO (restricted)"));
        assert_eq!(requests[1].last_user_message(), Some("Who approved it?"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_count_as_failed_attempts() {
        let model = Arc::new(ScriptedModel::new([
            ScriptStep::Stall,
            ScriptStep::Reply(YES.into()),
            ScriptStep::Reply(YES.into()),
        ]));
        let outcome = gate(Arc::clone(&model), 3, ConvergencePolicy::ConsecutiveConfirmation)
            .run("q", "", &PipelineObserver::new())
            .await;
        assert_eq!(outcome, GateOutcome::Passed { attempt: 3 });
    }

    #[test]
    fn policy_parses_from_config_strings() {
        assert_eq!(
            "Single-Confirmation".parse::<ConvergencePolicy>().expect("parse"),
            ConvergencePolicy::SingleConfirmation
        );
        assert!("two-out-of-three".parse::<ConvergencePolicy>().is_err());
    }

    fn decision(affirm: bool) -> Decision {
        if affirm {
            decode(YES).expect("yes")
        } else {
            decode(NO).expect("no")
        }
    }

    proptest! {
        // None = tentativo fallito, Some(true) = YES, Some(false) = NO.
        #[test]
        fn consecutive_passes_iff_adjacent_affirm_pair(
            attempts in proptest::collection::vec(proptest::option::of(any::<bool>()), 1..12),
        ) {
            let mut convergence = Convergence::new(ConvergencePolicy::ConsecutiveConfirmation, None);
            let passed_at = attempts.iter().position(|a| {
                let d = a.map(decision);
                convergence.observe(d.as_ref())
            });

            let expected = attempts
                .windows(2)
                .position(|w| w[0] == Some(true) && w[1] == Some(true))
                .map(|i| i + 1);
            prop_assert_eq!(passed_at, expected);
        }
    }
}
