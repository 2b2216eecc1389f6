//! StructuredDecoder: testo grezzo del modello → contratto tipizzato.
//!
//! Il modello è inaffidabile: può avvolgere il JSON in un blocco
//! Markdown, aggiungere prosa prima o dopo, oppure violare gli invarianti.
//! Il decoder isola il primo oggetto JSON bilanciato, lo deserializza
//! nella forma "wire" del contratto e poi lo valida. Qualsiasi problema
//! diventa un [`DecodeFailure`], mai un panic.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::contracts::{CensorFlag, Decision, FinalAnswer, ModerationVerdict, Verdict};
use crate::error::DecodeFailure;

/// Contratto strutturato che il modello deve rispettare.
pub trait ResponseContract: Sized {
    /// Forma sul filo, così come la scrive il modello.
    type Wire: DeserializeOwned;

    /// Nome del contratto, usato nei messaggi d'errore.
    const NAME: &'static str;

    /// Valida la forma wire e produce il valore tipizzato.
    ///
    /// # Errors
    ///
    /// [`DecodeFailure::Invariant`] se un invariante è violato.
    fn from_wire(wire: Self::Wire) -> Result<Self, DecodeFailure>;
}

/// Decodifica `raw` nel contratto `T`.
///
/// # Errors
///
/// - [`DecodeFailure::MissingJson`] se non c'è un oggetto JSON;
/// - [`DecodeFailure::Malformed`] se il JSON non ha la forma attesa;
/// - [`DecodeFailure::Invariant`] se il contenuto viola il contratto.
pub fn decode<T: ResponseContract>(raw: &str) -> Result<T, DecodeFailure> {
    let json = extract_json_object(raw).ok_or(DecodeFailure::MissingJson)?;
    let wire: T::Wire = serde_json::from_str(json).map_err(|e| DecodeFailure::Malformed {
        contract: T::NAME,
        details: e.to_string(),
    })?;
    T::from_wire(wire)
}

/// Restituisce il primo oggetto JSON bilanciato contenuto in `raw`.
///
/// Tiene conto delle stringhe JSON (e dei loro escape) così che le
/// parentesi graffe dentro i valori non alterino il bilanciamento.
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in raw[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&raw[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

/// `Decision` sul filo.
#[derive(Debug, Deserialize)]
pub struct DecisionWire {
    decision: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    confidence: Option<i64>,
}

impl ResponseContract for Decision {
    type Wire = DecisionWire;
    const NAME: &'static str = "Decision";

    fn from_wire(wire: DecisionWire) -> Result<Self, DecodeFailure> {
        let verdict: Verdict = wire.decision.parse().map_err(|details| DecodeFailure::Invariant {
            contract: Self::NAME,
            details,
        })?;
        let flags = wire
            .flags
            .iter()
            .map(|f| f.parse::<CensorFlag>())
            .collect::<Result<_, _>>()
            .map_err(|details| DecodeFailure::Invariant {
                contract: Self::NAME,
                details,
            })?;
        Self::try_new(verdict, wire.reason, flags, wire.confidence)
    }
}

/// `ModerationVerdict` sul filo.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationWire {
    #[serde(default)]
    answer: String,
    is_approved: bool,
    #[serde(default)]
    rejection_reason: Option<String>,
    #[serde(default)]
    alerts: Vec<String>,
}

impl ResponseContract for ModerationVerdict {
    type Wire = ModerationWire;
    const NAME: &'static str = "ModerationVerdict";

    fn from_wire(wire: ModerationWire) -> Result<Self, DecodeFailure> {
        Self::try_new(wire.answer, wire.is_approved, wire.rejection_reason, wire.alerts)
    }
}

/// `FinalAnswer` sul filo.
#[derive(Debug, Deserialize)]
pub struct FinalAnswerWire {
    answer: String,
}

impl ResponseContract for FinalAnswer {
    type Wire = FinalAnswerWire;
    const NAME: &'static str = "FinalAnswer";

    fn from_wire(wire: FinalAnswerWire) -> Result<Self, DecodeFailure> {
        Self::try_new(wire.answer)
    }
}
