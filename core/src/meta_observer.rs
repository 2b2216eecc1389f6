//! PipelineObserver – contatori per la pipeline guardata.
//!
//! Conta gli esiti terminali e il lavoro fatto dagli stage (tentativi
//! del censore, round del generatore, rifiuti del moderatore, output non
//! decodificabili). È condiviso fra tutte le richieste concorrenti, per
//! questo usa contatori atomici invece di `&mut self`.
//!
//! Non fa logging, non blocca, non panica: sta nel percorso hot di ogni
//! richiesta.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::contracts::PipelineStatus;

/// Snapshot immutabile dei contatori.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineSnapshot {
    /// Run concluse (qualsiasi esito).
    pub total_runs: u64,
    /// Run concluse con successo.
    pub succeeded: u64,
    /// Run respinte dal censore.
    pub policy_rejected: u64,
    /// Run che hanno esaurito il budget.
    pub exhausted: u64,
    /// Run fallite in redazione.
    pub fatal: u64,
    /// Run annullate dal chiamante.
    pub cancelled: u64,
    /// Tentativi del censore.
    pub censor_attempts: u64,
    /// Invocazioni del generatore.
    pub generator_rounds: u64,
    /// Risposte respinte dal moderatore.
    pub moderation_rejections: u64,
    /// Output del modello non decodificabili.
    pub decode_failures: u64,
}

/// Osservatore condiviso della pipeline.
#[derive(Debug, Default)]
pub struct PipelineObserver {
    succeeded: AtomicU64,
    policy_rejected: AtomicU64,
    exhausted: AtomicU64,
    fatal: AtomicU64,
    cancelled: AtomicU64,
    censor_attempts: AtomicU64,
    generator_rounds: AtomicU64,
    moderation_rejections: AtomicU64,
    decode_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineObserver {
    /// Osservatore con tutti i contatori a zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registra l'esito terminale di una run.
    pub fn record_outcome(&self, status: PipelineStatus) {
        match status {
            PipelineStatus::Success => bump(&self.succeeded),
            PipelineStatus::PolicyRejected => bump(&self.policy_rejected),
            PipelineStatus::Exhausted => bump(&self.exhausted),
            PipelineStatus::Fatal => bump(&self.fatal),
        }
    }

    /// Registra una run annullata.
    pub fn record_cancelled(&self) {
        bump(&self.cancelled);
    }

    /// Registra un tentativo del censore.
    pub fn record_censor_attempt(&self) {
        bump(&self.censor_attempts);
    }

    /// Registra un'invocazione del generatore.
    pub fn record_generator_round(&self) {
        bump(&self.generator_rounds);
    }

    /// Registra un rifiuto del moderatore.
    pub fn record_moderation_rejection(&self) {
        bump(&self.moderation_rejections);
    }

    /// Registra un output non decodificabile.
    pub fn record_decode_failure(&self) {
        bump(&self.decode_failures);
    }

    /// Restituisce uno snapshot dei contatori correnti.
    pub fn snapshot(&self) -> PipelineSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let succeeded = load(&self.succeeded);
        let policy_rejected = load(&self.policy_rejected);
        let exhausted = load(&self.exhausted);
        let fatal = load(&self.fatal);
        let cancelled = load(&self.cancelled);

        PipelineSnapshot {
            total_runs: succeeded + policy_rejected + exhausted + fatal + cancelled,
            succeeded,
            policy_rejected,
            exhausted,
            fatal,
            cancelled,
            censor_attempts: load(&self.censor_attempts),
            generator_rounds: load(&self.generator_rounds),
            moderation_rejections: load(&self.moderation_rejections),
            decode_failures: load(&self.decode_failures),
        }
    }

    /// Resetta tutti i contatori a zero.
    pub fn reset(&self) {
        for counter in [
            &self.succeeded,
            &self.policy_rejected,
            &self.exhausted,
            &self.fatal,
            &self.cancelled,
            &self.censor_attempts,
            &self.generator_rounds,
            &self.moderation_rejections,
            &self.decode_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_observer_has_zero_metrics() {
        assert_eq!(PipelineObserver::new().snapshot(), PipelineSnapshot::default());
    }

    #[test]
    fn outcomes_are_counted_per_status() {
        let obs = PipelineObserver::new();
        obs.record_outcome(PipelineStatus::Success);
        obs.record_outcome(PipelineStatus::Success);
        obs.record_outcome(PipelineStatus::PolicyRejected);
        obs.record_outcome(PipelineStatus::Fatal);
        obs.record_cancelled();
        obs.record_generator_round();

        let snap = obs.snapshot();
        assert_eq!(snap.total_runs, 5);
        assert_eq!(snap.succeeded, 2);
        assert_eq!(snap.policy_rejected, 1);
        assert_eq!(snap.exhausted, 0);
        assert_eq!(snap.fatal, 1);
        assert_eq!(snap.cancelled, 1);
        assert_eq!(snap.generator_rounds, 1);
    }

    #[test]
    fn reset_clears_metrics() {
        let obs = PipelineObserver::new();
        obs.record_censor_attempt();
        obs.record_decode_failure();
        obs.record_moderation_rejection();
        obs.reset();
        assert_eq!(obs.snapshot(), PipelineSnapshot::default());
    }
}
