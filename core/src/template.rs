//! Prompt template e rendering puro.
//!
//! I template sono condivisi in sola lettura fra tutte le richieste:
//! ogni run produce la propria copia con [`render`], senza mai toccare
//! il template originale.

use serde::Deserialize;

/// Sostituisce i placeholder `<NAME>` di `template` con i valori dati.
///
/// Il rendering è a passata singola: un valore che contiene a sua volta
/// un placeholder non viene espanso di nuovo. I placeholder senza valore
/// restano invariati.
#[must_use]
pub fn render(template: &str, params: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let matched = params.iter().find_map(|(name, value)| {
            let placeholder_len = name.len() + 2;
            (tail.len() >= placeholder_len
                && tail[1..].starts_with(name)
                && tail[1 + name.len()..].starts_with('>'))
            .then_some((placeholder_len, *value))
        });
        match matched {
            Some((len, value)) => {
                out.push_str(value);
                rest = &tail[len..];
            }
            None => {
                out.push('<');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

/// Set di template usati dagli stage.
///
/// Placeholder riconosciuti:
/// - censore: `<QUESTION>`, `<DOCUMENT>`, `<HISTORY>`;
/// - assistente: `<CONTEXT>`, `<DATE>` (data UTC corrente, `YYYY-MM-DD`);
/// - feedback: `<QUESTION>`, `<PREVIOUS_ANSWER>`, `<REJECTION>`;
/// - moderatore e post-moderatore: `<REQUEST>`, `<ASSISTANT_ANSWER>`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptTemplates {
    /// Prompt di sistema del censore.
    pub censor: String,
    /// Prompt di sistema dell'assistente.
    pub assistant: String,
    /// Messaggio utente usato dopo un rifiuto del moderatore.
    pub feedback: String,
    /// Prompt di sistema del moderatore.
    pub moderator: String,
    /// Prompt di sistema del post-moderatore.
    pub post_moderator: String,
    /// Testo dello storico quando non ci sono decisioni precedenti.
    pub empty_history: String,
}

impl Default for PromptTemplates {
    fn default() -> Self {
        Self {
            censor: DEFAULT_CENSOR.to_string(),
            assistant: DEFAULT_ASSISTANT.to_string(),
            feedback: DEFAULT_FEEDBACK.to_string(),
            moderator: DEFAULT_MODERATOR.to_string(),
            post_moderator: DEFAULT_POST_MODERATOR.to_string(),
            empty_history: "No previous decisions.".to_string(),
        }
    }
}

const DEFAULT_CENSOR: &str = r#"You screen questions sent to a corporate assistant before they are answered.
You never answer the question yourself.

Reply with strict JSON only:
{"decision": "YES" | "NO", "reason": "required when NO", "flags": [...], "confidence": 0-100}
Allowed flags: "restricted", "invalid-query", "outdated", "informal", "allowed".

- Forbidden topics, abuse, secret or restricted material: decision "NO" with a reason.
- Business questions: decision "YES".
- Small talk ("who are you?"): decision "YES" with flag "informal".
- Use the context when it is present. Never invent context.

Question: <QUESTION>
Context: <DOCUMENT>

<HISTORY>"#;

const DEFAULT_ASSISTANT: &str = r"You are a corporate assistant. Answer using only the documents below.
If the documents do not contain the answer, say so.
Current date: <DATE>

Documents:
<CONTEXT>";

const DEFAULT_FEEDBACK: &str = r"The moderator rejected your previous answer:
'<PREVIOUS_ANSWER>'
Reason: '<REJECTION>'.
Think about how to improve the answer and try again.
Question: '<QUESTION>'";

const DEFAULT_MODERATOR: &str = r#"You moderate the answers of a corporate assistant. Check that the answer
1. addresses the question,
2. is correct and useful,
3. contains no personal data or insults,
4. gives no inappropriate advice.

Reply with strict JSON only:
{"answer": "your comment, may be empty", "isApproved": true|false, "rejectionReason": "required when isApproved is false", "alerts": []}

Question: "<REQUEST>"
Assistant answer: "<ASSISTANT_ANSWER>""#;

const DEFAULT_POST_MODERATOR: &str = r#"You are the final editor of a corporate assistant's answer.
- Replace document numbers, personal names, phone numbers and coordinates with "[data removed]".
- Replace uncertain wording ("possibly", "maybe") with "[unconfirmed by documentation]".
- If the data is older than the freshness threshold, warn that it may be outdated.
- If sources may contradict each other, say "Different versions exist. Please refine your query."
- State facts only, without blame.

Reply with strict JSON only: {"answer": "final corrected answer"}

Input:
{"request": "<REQUEST>", "assistant_answer": "<ASSISTANT_ANSWER>"}"#;
