//! Redactor (post-moderatore): ultima sanificazione prima del rilascio.
//!
//! Due passaggi:
//! 1. il modello riscrive la risposta approvata secondo il prompt del
//!    post-moderatore (contratto [`FinalAnswer`]);
//! 2. il [`Sanitizer`] applica regole deterministiche sul risultato, così
//!    le garanzie su dati personali e identificativi valgono anche se il
//!    modello ignora le istruzioni.
//!
//! Qualsiasi fallimento qui è fatale: la risposta non redatta non esce mai.

use std::sync::Arc;
use std::time::Duration;

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::config::PipelineConfig;
use crate::contracts::FinalAnswer;
use crate::decoder::decode;
use crate::error::{DecodeFailure, StageFailure};
use crate::model::{call_model, ChatMessage, ModelRequest, TextModel};
use crate::template::{render, PromptTemplates};

/// Regole deterministiche di redazione.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedactionRules {
    /// Regex dei dati da rimuovere (nomi, telefoni, coordinate).
    pub sensitive_patterns: Vec<String>,
    /// Prefissi dei numeri di documento interni (`RE` → `RE-1023`).
    /// Sigle come `VVER-1000` o `ISO-9001` non sono dati riservati e
    /// restano intatte.
    pub document_id_prefixes: Vec<String>,
    /// Parole che indicano incertezza.
    pub hedge_words: Vec<String>,
    /// Indizi di fonti in contraddizione (match case-insensitive).
    pub conflict_cues: Vec<String>,
    /// Testo che sostituisce i dati rimossi.
    pub removed_marker: String,
    /// Testo che sostituisce le parole di incertezza.
    pub unconfirmed_marker: String,
    /// Avviso aggiunto quando le fonti possono contraddirsi.
    pub conflict_notice: String,
}

impl Default for RedactionRules {
    fn default() -> Self {
        Self {
            sensitive_patterns: vec![
                // coordinate: 54.123456, 32.654321
                r"-?\d{1,3}\.\d{4,},\s*-?\d{1,3}\.\d{4,}".to_string(),
                // Cognome I.I.
                r"\b\p{Lu}\p{Ll}+\s+\p{Lu}\.\s?\p{Lu}\.".to_string(),
                // I.I. Cognome
                r"\b\p{Lu}\.\s?\p{Lu}\.\s?\p{Lu}\p{Ll}+".to_string(),
                // telefoni: +7 (495) 123-45-67, (4812) 12-34-56, 123-45-67
                r"\+\d{1,3}[\s-]?\(?\d{3,5}\)?[\s-]?\d{1,3}[\s-]?\d{2}[\s-]?\d{2}\b".to_string(),
                r"\(\d{3,5}\)\s?\d{1,3}[\s-]\d{2}[\s-]\d{2}\b".to_string(),
                r"\b\d{3}-\d{2}-\d{2}\b".to_string(),
            ],
            document_id_prefixes: ["RE", "SB", "РЭ", "СБ"].map(String::from).to_vec(),
            hedge_words: ["possibly", "maybe", "perhaps", "probably", "presumably", "might be"]
                .map(String::from)
                .to_vec(),
            conflict_cues: [
                "conflicting",
                "contradict",
                "other sources",
                "inconsistent",
                "disagree",
            ]
            .map(String::from)
            .to_vec(),
            removed_marker: "[data removed]".to_string(),
            unconfirmed_marker: "[unconfirmed by documentation]".to_string(),
            conflict_notice: "Different versions exist. Please refine your query.".to_string(),
        }
    }
}

const YEAR: &str = r"(?:18|19|20)\d{2}";

/// Frammenti di testo che contengono anni veri. Ogni ramo cattura lo
/// span da cui estrarre gli anni.
const DATED_SPAN: &str = concat!(
    // in 2015, since 2015, as of 2015, in 2015 and 2018, until 2015-2018
    r"\b(?:in|since|as of|until|dated|year)\s+((?:18|19|20)\d{2}(?:\s*(?:,|and|or|to|-|–)\s*(?:18|19|20)\d{2})*)\b",
    // 2015 year
    r"|\b((?:18|19|20)\d{2})\s+year\b",
    // 12.03.2015, 12/03/2015
    r"|\b\d{1,2}[./]\d{1,2}[./]((?:18|19|20)\d{2})\b",
    // 2015-03-12
    r"|\b((?:18|19|20)\d{2})-\d{2}-\d{2}\b",
);

/// Applica le [`RedactionRules`] e l'avviso di obsolescenza.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    sensitive: Vec<Regex>,
    hedges: Option<Regex>,
    dated_spans: Regex,
    years: Regex,
    conflict_cues: Vec<String>,
    removed_marker: String,
    unconfirmed_marker: String,
    conflict_notice: String,
    staleness_threshold_years: u32,
    reference_year: i32,
}

impl Sanitizer {
    /// Compila le regole.
    ///
    /// # Errors
    ///
    /// Restituisce l'errore del crate `regex` se un pattern configurato
    /// non è valido.
    pub fn new(
        rules: &RedactionRules,
        staleness_threshold_years: u32,
        reference_year: i32,
    ) -> Result<Self, regex::Error> {
        let mut sensitive = Vec::with_capacity(rules.sensitive_patterns.len() + 1);
        if !rules.document_id_prefixes.is_empty() {
            let prefixes = rules
                .document_id_prefixes
                .iter()
                .map(|p| regex::escape(p))
                .collect::<Vec<_>>()
                .join("|");
            sensitive.push(Regex::new(&format!(r"(?:№\s*)?\b(?:{prefixes})-\d+\b"))?);
        }
        for pattern in &rules.sensitive_patterns {
            sensitive.push(Regex::new(pattern)?);
        }

        let hedges = if rules.hedge_words.is_empty() {
            None
        } else {
            let alternation = rules
                .hedge_words
                .iter()
                .map(|w| regex::escape(w))
                .collect::<Vec<_>>()
                .join("|");
            Some(
                RegexBuilder::new(&format!(r"\b(?:{alternation})\b"))
                    .case_insensitive(true)
                    .build()?,
            )
        };

        Ok(Self {
            sensitive,
            hedges,
            dated_spans: RegexBuilder::new(DATED_SPAN).case_insensitive(true).build()?,
            years: Regex::new(YEAR)?,
            conflict_cues: rules.conflict_cues.iter().map(|c| c.to_lowercase()).collect(),
            removed_marker: rules.removed_marker.clone(),
            unconfirmed_marker: rules.unconfirmed_marker.clone(),
            conflict_notice: rules.conflict_notice.clone(),
            staleness_threshold_years,
            reference_year,
        })
    }

    /// Sanifica `text`.
    #[must_use]
    pub fn sanitize(&self, text: &str) -> String {
        let mut out = text.trim().to_string();

        for pattern in &self.sensitive {
            out = pattern
                .replace_all(&out, regex::NoExpand(&self.removed_marker))
                .into_owned();
        }
        if let Some(hedges) = &self.hedges {
            out = hedges
                .replace_all(&out, regex::NoExpand(&self.unconfirmed_marker))
                .into_owned();
        }

        if let Some(year) = self.stale_year(&out) {
            let disclaimer = format!("Warning! Data current as of {year}. Check for updates.");
            if !out.contains(&disclaimer) {
                out.push_str("\n\n");
                out.push_str(&disclaimer);
            }
        }

        let lower = out.to_lowercase();
        if !out.contains(&self.conflict_notice)
            && self.conflict_cues.iter().any(|cue| lower.contains(cue.as_str()))
        {
            out.push_str("\n\n");
            out.push_str(&self.conflict_notice);
        }

        out
    }

    /// Anno più recente citato, se più vecchio della soglia.
    ///
    /// Conta solo i numeri in contesto temporale ("in 2019", "as of
    /// 2019", "2019 year", date complete): "2000 liters" non è un anno.
    fn stale_year(&self, text: &str) -> Option<i32> {
        let newest = self
            .dated_spans
            .captures_iter(text)
            .filter_map(|caps| caps.iter().skip(1).flatten().next())
            .flat_map(|span| self.years.find_iter(span.as_str()))
            .filter_map(|m| m.as_str().parse::<i32>().ok())
            .filter(|year| *year <= self.reference_year)
            .max()?;
        let age = self.reference_year - newest;
        (age > i32::try_from(self.staleness_threshold_years).unwrap_or(i32::MAX)).then_some(newest)
    }
}

/// Post-moderatore.
pub struct Redactor {
    model: Arc<dyn TextModel>,
    templates: Arc<PromptTemplates>,
    sanitizer: Sanitizer,
    timeout: Duration,
}

impl Redactor {
    /// Crea il redactor dalla configurazione della pipeline.
    ///
    /// # Errors
    ///
    /// Fallisce se un pattern di redazione non compila.
    pub fn new(
        model: Arc<dyn TextModel>,
        templates: Arc<PromptTemplates>,
        config: &PipelineConfig,
    ) -> Result<Self, regex::Error> {
        let reference_year = config
            .reference_year
            .unwrap_or_else(|| time::OffsetDateTime::now_utc().year());
        Ok(Self {
            model,
            templates,
            sanitizer: Sanitizer::new(
                &config.redaction,
                config.staleness_threshold_years,
                reference_year,
            )?,
            timeout: config.model_timeout(),
        })
    }

    /// Produce la risposta finale a partire da quella approvata.
    ///
    /// # Errors
    ///
    /// [`StageFailure`] se la chiamata fallisce, l'output non è una
    /// [`FinalAnswer`] valida o la sanificazione lascia testo vuoto.
    pub async fn finalize(&self, question: &str, approved: &str) -> Result<String, StageFailure> {
        let system = render(
            &self.templates.post_moderator,
            &[("REQUEST", question), ("ASSISTANT_ANSWER", approved)],
        );
        let request = ModelRequest::default()
            .with(ChatMessage::system(system))
            .with(ChatMessage::user(question))
            .with(ChatMessage::assistant(approved));

        let raw = call_model(self.model.as_ref(), &request, self.timeout).await?;
        let rewritten = decode::<FinalAnswer>(&raw)?;
        let sanitized = self.sanitizer.sanitize(rewritten.answer());
        debug!(
            before = rewritten.answer().len(),
            after = sanitized.len(),
            "redaction applied"
        );

        if sanitized.trim().is_empty() {
            return Err(DecodeFailure::Invariant {
                contract: "FinalAnswer",
                details: "answer is empty after sanitizing".to_string(),
            }
            .into());
        }
        Ok(sanitized)
    }
}
