//! GuardRAG — pipeline di generazione guardata per assistenti RAG.
//!
//! Questo crate implementa l'orchestrazione che sta fra la domanda
//! dell'utente e la risposta rilasciata:
//!
//! - `PolicyGate` decide se la domanda può essere elaborata,
//! - `Generator` produce una risposta candidata dai documenti recuperati,
//! - `ResponseModerator` la approva o la respinge con un motivo,
//! - `Redactor` la riscrive e la sanifica prima del rilascio.
//!
//! Ogni stage parla con un modello tramite il trait [`TextModel`]; le
//! risposte strutturate passano da [`decoder::decode`], che le valida
//! prima che arrivino alla logica di controllo. Recupero dei documenti,
//! ingestione e memoria conversazionale sono collaboratori esterni dietro
//! trait.
//!
//! # Panoramica
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                Pipeline                  │
//! │ ┌──────────────────────────────────────┐ │
//! │ │ PolicyGate        censor_rounds      │ │  fail-closed
//! │ └──────────────────────────────────────┘ │
//! │ ┌──────────────────┐ ┌─────────────────┐ │
//! │ │ Generator        │⇄│ Moderator       │ │  assistant_max_rounds
//! │ └──────────────────┘ └─────────────────┘ │
//! │ ┌──────────────────────────────────────┐ │
//! │ │ Redactor + Sanitizer                 │ │  errore ⇒ Fatal
//! │ └──────────────────────────────────────┘ │
//! │ ┌──────────────────────────────────────┐ │
//! │ │ PipelineObserver                     │ │  contatori
//! │ └──────────────────────────────────────┘ │
//! └──────────────────────────────────────────┘
//! ```
//!
//! Il modulo [`api`] mappa gli esiti sugli status HTTP senza dipendere da
//! un server specifico.

#![deny(missing_docs)]
#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

/// Controller indipendenti dal trasporto (`/query`, `/embed`).
pub mod api;
/// Configurazione della pipeline (YAML + variabili d'ambiente).
pub mod config;
/// Tipi di dominio e contratti delle risposte strutturate.
pub mod contracts;
/// Estrazione e validazione dell'output JSON dei modelli.
pub mod decoder;
/// Tassonomia degli errori.
pub mod error;
/// Assistente: generazione della risposta candidata.
pub mod generator;
/// Memoria conversazionale.
pub mod memory;
/// Contatori di osservabilità.
pub mod meta_observer;
/// Astrazione sul modello di linguaggio.
pub mod model;
/// Moderazione della risposta candidata.
pub mod moderator;
/// Orchestratore a stati.
pub mod pipeline;
/// Censore delle domande e regole di convergenza.
pub mod policy_gate;
/// Post-moderazione e sanificazione deterministica.
pub mod redactor;
/// Recupero e ingestione dei documenti.
pub mod retrieval;
/// Rendering dei prompt.
pub mod template;

pub use config::PipelineConfig;
pub use contracts::{
    CensorFlag, Decision, FinalAnswer, ModerationVerdict, PipelineResult, PipelineStatus, Request,
    Verdict,
};
pub use error::{Cancelled, DecodeFailure, ModelCallFailure, PipelineError, StageFailure};
pub use meta_observer::{PipelineObserver, PipelineSnapshot};
pub use model::{ChatMessage, ChatRole, ModelRequest, ScriptStep, ScriptedModel, TextModel};
pub use pipeline::{Collaborators, Pipeline, StageModels};
pub use policy_gate::ConvergencePolicy;
pub use redactor::{RedactionRules, Sanitizer};
