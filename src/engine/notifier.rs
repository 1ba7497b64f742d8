//! Regime change notifier.
//!
//! Compares each cycle's prediction against the persisted `RegimeState`.
//! A confirmed transition is recorded as a `RegimeChangeEvent` and written
//! back into the state. The caller persists the state and only then calls
//! `announce`, so a transition is never announced twice. An event recorded
//! by a run that died before saving its state is adopted on the next run
//! instead of being recorded again.

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::notify::{escape_html, Notifier};
use crate::storage::state::PipelineState;
use crate::storage::PredictionStore;
use crate::types::{DataQuality, RegimeChangeEvent, RegimePrediction, RegimeState};

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeOutcome {
    /// First usable cycle: state created, nothing announced.
    Initialized,
    Unchanged,
    /// Unavailable data never moves the state.
    SkippedUnavailable,
    /// A different regime that has not yet been confirmed.
    AwaitingConfirmation { agreeing: usize, needed: usize },
    Changed(RegimeChangeEvent),
}

pub struct RegimeChangeNotifier {
    confirmations: usize,
}

impl RegimeChangeNotifier {
    pub fn new(confirmations: usize) -> Self {
        Self {
            confirmations: confirmations.max(1),
        }
    }

    /// Process the prediction persisted this cycle. Updates `state` in
    /// place; nothing is sent from here.
    pub async fn observe(
        &self,
        prediction: &RegimePrediction,
        state: &mut PipelineState,
        store: &PredictionStore,
    ) -> Result<ChangeOutcome> {
        if prediction.indicators.quality == DataQuality::Unavailable {
            debug!("Unavailable data, regime state left as is");
            return Ok(ChangeOutcome::SkippedUnavailable);
        }

        let new_regime = prediction.predicted_regime;
        let Some(current) = state.regime.as_mut() else {
            info!(regime = %new_regime, "Regime state initialised");
            state.regime = Some(RegimeState {
                regime: new_regime,
                confidence: prediction.confidence,
                updated_at: prediction.timestamp,
            });
            return Ok(ChangeOutcome::Initialized);
        };

        if current.regime == new_regime {
            current.confidence = prediction.confidence;
            current.updated_at = prediction.timestamp;
            return Ok(ChangeOutcome::Unchanged);
        }

        let agreeing = if self.confirmations > 1 {
            let recent = store.recent_regimes(self.confirmations as i64).await?;
            recent.iter().take_while(|r| **r == new_regime).count()
        } else {
            1
        };
        if agreeing < self.confirmations {
            debug!(
                from = %current.regime,
                to = %new_regime,
                agreeing,
                needed = self.confirmations,
                "Regime change awaiting confirmation"
            );
            return Ok(ChangeOutcome::AwaitingConfirmation {
                agreeing,
                needed: self.confirmations,
            });
        }

        // Recorded by an earlier run whose state never reached disk
        let unsaved = store.recent_events(1).await?.into_iter().next().filter(|e| {
            e.from_regime == current.regime
                && e.to_regime == new_regime
                && e.timestamp > current.updated_at
        });

        let event = match unsaved {
            Some(event) => {
                warn!(
                    id = ?event.id,
                    from = %event.from_regime,
                    to = %event.to_regime,
                    "Adopting regime change recorded before an unsaved state"
                );
                event
            }
            None => {
                let snap = &prediction.indicators;
                let mut event = RegimeChangeEvent {
                    id: None,
                    timestamp: prediction.timestamp,
                    from_regime: current.regime,
                    to_regime: new_regime,
                    confidence: prediction.confidence,
                    trigger_reason: format!(
                        "reversal ratio {:.2} ({} long / {} short) via {}",
                        snap.reversal_ratio, snap.long_count, snap.short_count, prediction.strategy
                    ),
                };
                event.id = Some(store.insert_event(&event).await?);
                event
            }
        };

        *current = RegimeState {
            regime: new_regime,
            confidence: prediction.confidence,
            updated_at: prediction.timestamp,
        };
        info!(
            from = %event.from_regime,
            to = %event.to_regime,
            confidence = event.confidence,
            "Regime change"
        );

        Ok(ChangeOutcome::Changed(event))
    }

    /// Send the message for a change. Best effort: failures are logged.
    /// Returns whether a message went out.
    pub async fn announce(
        &self,
        outcome: &ChangeOutcome,
        prediction: &RegimePrediction,
        notifier: &dyn Notifier,
    ) -> bool {
        let ChangeOutcome::Changed(event) = outcome else {
            return false;
        };
        let message = format_change_message(event, prediction);
        match notifier.send(&message).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, notifier = notifier.name(), "Regime change notification failed");
                false
            }
        }
    }
}

/// HTML message for a regime change.
pub fn format_change_message(event: &RegimeChangeEvent, prediction: &RegimePrediction) -> String {
    let snap = &prediction.indicators;
    let mut msg = format!(
        "{} <b>Market regime change</b>\n\
         {} → <b>{}</b>\n\
         Confidence: {:.0}%\n\
         Reversals: {} long / {} short (ratio {:.2})\n\
         Breadth 20d/50d: {:.0}% / {:.0}%\n",
        event.to_regime.emoji(),
        event.from_regime,
        event.to_regime,
        event.confidence * 100.0,
        snap.long_count,
        snap.short_count,
        snap.reversal_ratio,
        snap.breadth_20,
        snap.breadth_50,
    );
    if snap.quality != DataQuality::Fresh {
        msg.push_str(&format!("Data quality: {}\n", snap.quality));
    }
    msg.push_str(&format!(
        "<i>{}</i>",
        escape_html(event.to_regime.recommended_action())
    ));
    msg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
