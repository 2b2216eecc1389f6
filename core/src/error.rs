//! Tassonomia degli errori della pipeline.
//!
//! Gli errori "di round" (`DecodeFailure`, `EmptyGeneration`,
//! `ModelCallFailure`) vengono sempre recuperati localmente come retry
//! finché lo stage ha budget. Solo gli errori terminali arrivano al
//! chiamante e determinano lo [`PipelineStatus`](crate::contracts::PipelineStatus).

use std::time::Duration;

use thiserror::Error;

use crate::contracts::PipelineStatus;

/// Output del modello non conforme al contratto strutturato atteso.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeFailure {
    /// Nel testo non c'è alcun oggetto JSON.
    #[error("no JSON object found in model output")]
    MissingJson,
    /// JSON presente ma non deserializzabile nel contratto.
    #[error("malformed {contract} payload: {details}")]
    Malformed {
        /// Nome del contratto atteso.
        contract: &'static str,
        /// Messaggio di `serde_json`.
        details: String,
    },
    /// JSON ben formato che viola un invariante del contratto.
    #[error("{contract} violates invariant: {details}")]
    Invariant {
        /// Nome del contratto atteso.
        contract: &'static str,
        /// Quale invariante è stato violato.
        details: String,
    },
}

/// Fallimento di una singola chiamata al modello.
#[derive(Debug, Error)]
pub enum ModelCallFailure {
    /// Il modello non ha risposto entro il timeout configurato.
    #[error("model call timed out after {0:?}")]
    Timeout(Duration),
    /// Errore restituito dal backend del modello.
    #[error("model backend error: {0:#}")]
    Backend(anyhow::Error),
}

/// Fallimento di un tentativo di uno stage che usa un contratto strutturato.
///
/// Consuma un round ma non fa fallire lo stage.
#[derive(Debug, Error)]
pub enum StageFailure {
    /// Chiamata al modello fallita (errore o timeout).
    #[error(transparent)]
    Call(#[from] ModelCallFailure),
    /// Risposta del modello non decodificabile.
    #[error(transparent)]
    Decode(#[from] DecodeFailure),
}

/// La run è stata annullata dal chiamante.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("pipeline run cancelled")]
pub struct Cancelled;

/// Esiti terminali (o di round) della pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Output strutturato non valido.
    #[error("decode failure on attempt {attempt}: {source}")]
    Decode {
        /// Numero del tentativo (1-based).
        attempt: u32,
        /// Causa.
        #[source]
        source: DecodeFailure,
    },
    /// Il generatore ha restituito testo vuoto.
    #[error("generator returned an empty answer on round {round}")]
    EmptyGeneration {
        /// Round del generatore (1-based).
        round: u32,
    },
    /// Il censore non ha lasciato passare la domanda.
    #[error("question rejected by policy gate after {attempts} attempts")]
    PolicyRejected {
        /// Tentativi consumati.
        attempts: u32,
    },
    /// Budget generazione/moderazione esaurito senza approvazione.
    #[error("no approved answer after {rounds} rounds")]
    ModerationExhausted {
        /// Round consumati.
        rounds: u32,
        /// Motivi di rifiuto raccolti, in ordine.
        rejections: Vec<String>,
    },
    /// Redazione fallita dopo l'approvazione.
    #[error("redaction failed: {0}")]
    FatalRedactionFailure(String),
}

impl PipelineError {
    /// Stato terminale corrispondente all'errore.
    ///
    /// Gli errori di round non dovrebbero mai arrivare qui; se succede
    /// vengono trattati come esaurimento.
    #[must_use]
    pub const fn status(&self) -> PipelineStatus {
        match self {
            Self::PolicyRejected { .. } => PipelineStatus::PolicyRejected,
            Self::FatalRedactionFailure(_) => PipelineStatus::Fatal,
            Self::Decode { .. } | Self::EmptyGeneration { .. } | Self::ModerationExhausted { .. } => {
                PipelineStatus::Exhausted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_errors_map_to_status() {
        assert_eq!(
            PipelineError::PolicyRejected { attempts: 5 }.status(),
            PipelineStatus::PolicyRejected
        );
        assert_eq!(
            PipelineError::ModerationExhausted {
                rounds: 3,
                rejections: vec![],
            }
            .status(),
            PipelineStatus::Exhausted
        );
        assert_eq!(
            PipelineError::FatalRedactionFailure("x".into()).status(),
            PipelineStatus::Fatal
        );
    }

    #[test]
    fn stage_failure_wraps_decode_failure() {
        let failure: StageFailure = DecodeFailure::MissingJson.into();
        assert!(matches!(failure, StageFailure::Decode(DecodeFailure::MissingJson)));
        assert_eq!(failure.to_string(), "no JSON object found in model output");
    }
}
