//! Contratti tipizzati scambiati fra gli stage della pipeline.
//!
//! I tipi che arrivano dal modello ([`Decision`], [`ModerationVerdict`],
//! [`FinalAnswer`]) hanno campi privati: l'unico modo per costruirli è
//! passare dai costruttori `try_new`, che applicano gli invarianti. Così
//! ogni valore in circolazione è valido per costruzione.
//!
//! Insieme canonico di invarianti:
//! - un testo opzionale vuoto o solo spazi (`reason`, `rejectionReason`)
//!   viene normalizzato ad assente prima della validazione;
//! - `Deny` richiede un `reason` non vuoto;
//! - `Affirm` vieta `reason` salvo che `informal` sia fra i flag;
//! - `approved = false` ⇔ `rejection_reason` presente.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeFailure;

/// Domanda dell'utente, immutabile per tutta la run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Testo della domanda.
    pub question: String,
    /// Conversazione a cui appartiene la domanda.
    pub conversation_id: Uuid,
}

impl Request {
    /// Crea una nuova richiesta.
    pub fn new(question: impl Into<String>, conversation_id: Uuid) -> Self {
        Self {
            question: question.into(),
            conversation_id,
        }
    }
}

/// Verdetto del censore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    /// La domanda può essere elaborata (`"YES"`).
    Affirm,
    /// La domanda va respinta (`"NO"`).
    Deny,
}

impl Verdict {
    /// Forma usata sul filo e nello storico del censore.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Affirm => "YES",
            Self::Deny => "NO",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s.trim();
        if v.eq_ignore_ascii_case("yes") {
            Ok(Self::Affirm)
        } else if v.eq_ignore_ascii_case("no") {
            Ok(Self::Deny)
        } else {
            Err(format!("decision must be \"YES\" or \"NO\", got {s:?}"))
        }
    }
}

/// Natura della domanda secondo il censore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CensorFlag {
    /// Argomento vietato o riservato.
    Restricted,
    /// Domanda non valida o incomprensibile.
    InvalidQuery,
    /// Riguarda informazioni superate.
    Outdated,
    /// Domanda informale ma ammessa ("chi sei?").
    Informal,
    /// Domanda esplicitamente ammessa.
    Allowed,
}

impl CensorFlag {
    /// Vocabolario completo dei flag ammessi.
    pub const ALL: [Self; 5] = [
        Self::Restricted,
        Self::InvalidQuery,
        Self::Outdated,
        Self::Informal,
        Self::Allowed,
    ];

    /// Nome del flag sul filo.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Restricted => "restricted",
            Self::InvalidQuery => "invalid-query",
            Self::Outdated => "outdated",
            Self::Informal => "informal",
            Self::Allowed => "allowed",
        }
    }
}

impl fmt::Display for CensorFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CensorFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|flag| flag.as_str() == s.trim())
            .ok_or_else(|| {
                format!(
                    "unknown flag {s:?}, allowed values: restricted, invalid-query, outdated, informal, allowed"
                )
            })
    }
}

/// Decisione del censore su una domanda.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    verdict: Verdict,
    reason: Option<String>,
    flags: BTreeSet<CensorFlag>,
    confidence: Option<u8>,
}

impl Decision {
    const CONTRACT: &'static str = "Decision";

    /// Costruisce una decisione validando tutti gli invarianti.
    ///
    /// `confidence` è preso come `i64` perché arriva così dal JSON:
    /// valori fuori da `0..=100` sono un errore, non un troncamento.
    ///
    /// # Errors
    ///
    /// [`DecodeFailure::Invariant`] se un invariante è violato.
    pub fn try_new(
        verdict: Verdict,
        reason: Option<String>,
        flags: BTreeSet<CensorFlag>,
        confidence: Option<i64>,
    ) -> Result<Self, DecodeFailure> {
        let reason = normalize(reason);

        match verdict {
            Verdict::Deny if reason.is_none() => {
                return Err(invariant(Self::CONTRACT, "reason must be non-empty when decision is NO"));
            }
            Verdict::Affirm if reason.is_some() && !flags.contains(&CensorFlag::Informal) => {
                return Err(invariant(
                    Self::CONTRACT,
                    "reason must be absent when decision is YES, except for informal questions",
                ));
            }
            _ => {}
        }

        let confidence = match confidence {
            None => None,
            Some(c) => match u8::try_from(c) {
                Ok(c) if c <= 100 => Some(c),
                _ => {
                    return Err(invariant(
                        Self::CONTRACT,
                        &format!("confidence must be within 0..=100, got {c}"),
                    ));
                }
            },
        };

        Ok(Self {
            verdict,
            reason,
            flags,
            confidence,
        })
    }

    /// Verdetto.
    #[must_use]
    pub const fn verdict(&self) -> Verdict {
        self.verdict
    }

    /// `true` se il verdetto è `Affirm`.
    #[must_use]
    pub fn is_affirm(&self) -> bool {
        self.verdict == Verdict::Affirm
    }

    /// Motivazione, se presente.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Flag assegnati alla domanda.
    #[must_use]
    pub const fn flags(&self) -> &BTreeSet<CensorFlag> {
        &self.flags
    }

    /// Confidenza dichiarata dal modello (0–100).
    #[must_use]
    pub const fn confidence(&self) -> Option<u8> {
        self.confidence
    }
}

/// Verdetto del moderatore su una risposta candidata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModerationVerdict {
    comment: String,
    approved: bool,
    rejection_reason: Option<String>,
    alerts: Vec<String>,
}

impl ModerationVerdict {
    const CONTRACT: &'static str = "ModerationVerdict";

    /// Costruisce un verdetto validando `approved ⇔ rejection_reason`.
    ///
    /// # Errors
    ///
    /// [`DecodeFailure::Invariant`] se l'invariante è violato.
    pub fn try_new(
        comment: String,
        approved: bool,
        rejection_reason: Option<String>,
        alerts: Vec<String>,
    ) -> Result<Self, DecodeFailure> {
        let rejection_reason = normalize(rejection_reason);

        match (approved, &rejection_reason) {
            (false, None) => Err(invariant(
                Self::CONTRACT,
                "rejectionReason must be filled when isApproved = false",
            )),
            (true, Some(_)) => Err(invariant(
                Self::CONTRACT,
                "rejectionReason must be absent when isApproved = true",
            )),
            _ => Ok(Self {
                comment,
                approved,
                rejection_reason,
                alerts,
            }),
        }
    }

    /// Commento libero del moderatore.
    #[must_use]
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// `true` se la risposta è approvata.
    #[must_use]
    pub const fn is_approved(&self) -> bool {
        self.approved
    }

    /// Motivo del rifiuto (presente solo se non approvata).
    #[must_use]
    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    /// Etichette aggiuntive, in ordine.
    #[must_use]
    pub fn alerts(&self) -> &[String] {
        &self.alerts
    }
}

/// Risposta finale prodotta dal post-moderatore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalAnswer {
    answer: String,
}

impl FinalAnswer {
    /// Costruisce la risposta finale validando che non sia vuota.
    ///
    /// # Errors
    ///
    /// [`DecodeFailure::Invariant`] se la risposta è vuota.
    pub fn try_new(answer: String) -> Result<Self, DecodeFailure> {
        if answer.trim().is_empty() {
            return Err(invariant("FinalAnswer", "answer must not be empty"));
        }
        Ok(Self { answer })
    }

    /// Testo della risposta.
    #[must_use]
    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Consuma il contratto e restituisce il testo.
    #[must_use]
    pub fn into_answer(self) -> String {
        self.answer
    }
}

/// Stato terminale di una run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    /// Risposta approvata e redatta.
    Success,
    /// Domanda respinta dal censore.
    PolicyRejected,
    /// Budget di generazione/moderazione esaurito.
    Exhausted,
    /// Redazione fallita dopo l'approvazione.
    Fatal,
}

/// Risultato di una run della pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineResult {
    /// Stato terminale.
    pub status: PipelineStatus,
    /// Risposta finale, presente solo con [`PipelineStatus::Success`].
    pub answer: Option<String>,
}

impl PipelineResult {
    /// Run conclusa con successo.
    #[must_use]
    pub const fn success(answer: String) -> Self {
        Self {
            status: PipelineStatus::Success,
            answer: Some(answer),
        }
    }

    /// Run conclusa con un fallimento: nessuna risposta.
    #[must_use]
    pub const fn failed(status: PipelineStatus) -> Self {
        Self {
            status,
            answer: None,
        }
    }

    /// `true` se la run ha prodotto una risposta.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Success
    }
}

fn normalize(text: Option<String>) -> Option<String> {
    text.filter(|t| !t.trim().is_empty())
}

fn invariant(contract: &'static str, details: &str) -> DecodeFailure {
    DecodeFailure::Invariant {
        contract,
        details: details.to_string(),
    }
}
