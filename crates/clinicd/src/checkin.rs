//! Kiosk check-in state: who is on screen, and when a visit gets recorded.

use crate::engine::EngineError;
use crate::state::AppState;
use clinic_store::{patients, visits, NewVisit};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;

/// Outcome of one identification attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Match { patient_id: String, similarity: f32 },
    NoMatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckInEvent {
    /// A new visit should be recorded.
    CheckedIn { patient_id: String, similarity: f32 },
    /// Patient is back on screen within the revisit cooldown.
    Returned { patient_id: String },
    /// The displayed patient timed out.
    Cleared { patient_id: String },
}

/// Patient currently shown at the kiosk.
#[derive(Debug, Clone, PartialEq)]
pub struct CurrentPatient {
    pub patient_id: String,
    pub similarity: f32,
    pub since: Instant,
    pub last_seen: Instant,
}

pub struct CheckInTracker {
    hold: Duration,
    cooldown: Duration,
    current: Option<CurrentPatient>,
    last_checkin: HashMap<String, Instant>,
}

impl CheckInTracker {
    pub fn new(hold: Duration, cooldown: Duration) -> Self {
        Self {
            hold,
            cooldown,
            current: None,
            last_checkin: HashMap::new(),
        }
    }

    pub fn current(&self) -> Option<&CurrentPatient> {
        self.current.as_ref()
    }

    pub fn observe(&mut self, observation: Observation, now: Instant) -> Option<CheckInEvent> {
        match observation {
            Observation::Match {
                patient_id,
                similarity,
            } => self.on_match(patient_id, similarity, now),
            Observation::NoMatch => self.on_miss(now),
        }
    }

    fn on_match(
        &mut self,
        patient_id: String,
        similarity: f32,
        now: Instant,
    ) -> Option<CheckInEvent> {
        if let Some(cur) = self.current.as_mut().filter(|c| c.patient_id == patient_id) {
            cur.last_seen = now;
            cur.similarity = similarity;
            return None;
        }

        self.current = Some(CurrentPatient {
            patient_id: patient_id.clone(),
            similarity,
            since: now,
            last_seen: now,
        });

        let recent = self
            .last_checkin
            .get(&patient_id)
            .is_some_and(|at| now.saturating_duration_since(*at) < self.cooldown);
        if recent {
            return Some(CheckInEvent::Returned { patient_id });
        }

        self.last_checkin.insert(patient_id.clone(), now);
        Some(CheckInEvent::CheckedIn {
            patient_id,
            similarity,
        })
    }

    /// Forget a check-in whose visit could not be saved, so the next match retries it.
    pub fn revert_check_in(&mut self, patient_id: &str) {
        self.last_checkin.remove(patient_id);
        if self.current.as_ref().is_some_and(|c| c.patient_id == patient_id) {
            self.current = None;
        }
    }

    fn on_miss(&mut self, now: Instant) -> Option<CheckInEvent> {
        let expired = self
            .current
            .as_ref()
            .is_some_and(|c| now.saturating_duration_since(c.last_seen) >= self.hold);
        if !expired {
            return None;
        }
        self.current.take().map(|c| CheckInEvent::Cleared {
            patient_id: c.patient_id,
        })
    }
}

/// Identify on a fixed interval and record visits for new arrivals.
pub async fn run_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(state.config.recognition_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let gallery = state.gallery().await;
        if gallery.is_empty() {
            continue;
        }

        let observation = match state
            .engine
            .identify(
                gallery,
                state.config.similarity_threshold,
                state.config.frames_per_attempt,
            )
            .await
        {
            Ok(identified) => {
                tracing::debug!(
                    matched = identified.result.matched,
                    similarity = identified.result.similarity,
                    quality = identified.quality,
                    "identify attempt"
                );
                match identified.result.patient_id {
                    Some(patient_id) if identified.result.matched => Observation::Match {
                        patient_id,
                        similarity: identified.result.similarity,
                    },
                    _ => Observation::NoMatch,
                }
            }
            Err(EngineError::NoFaceDetected) => Observation::NoMatch,
            Err(EngineError::ChannelClosed) => {
                tracing::error!("engine stopped; check-in loop exiting");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "recognition attempt failed");
                continue;
            }
        };

        let event = state.tracker.lock().await.observe(observation, Instant::now());
        if let Some(event) = event {
            handle_event(&state, event).await;
        }
    }
}

async fn handle_event(state: &AppState, event: CheckInEvent) {
    match event {
        CheckInEvent::CheckedIn {
            patient_id,
            similarity,
        } => {
            let id = patient_id.clone();
            let recorded = state
                .with_store(move |conn| {
                    let patient = patients::get(conn, &id)?;
                    visits::record(conn, &NewVisit::check_in(&id))?;
                    Ok(patient)
                })
                .await;
            match recorded {
                Ok(patient) => tracing::info!(
                    patient_id = %patient_id,
                    name = patient.as_ref().map(|p| p.name.as_str()).unwrap_or("unknown"),
                    confidence = similarity,
                    "patient checked in"
                ),
                Err(e) => {
                    tracing::error!(patient_id = %patient_id, error = %e, "failed to record check-in");
                    state.tracker.lock().await.revert_check_in(&patient_id);
                }
            }
        }
        CheckInEvent::Returned { patient_id } => {
            tracing::info!(patient_id = %patient_id, "patient recognised again within cooldown");
        }
        CheckInEvent::Cleared { patient_id } => {
            tracing::debug!(patient_id = %patient_id, "display cleared");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_store::NewPatient;

    const HOLD: Duration = Duration::from_secs(5);
    const COOLDOWN: Duration = Duration::from_secs(300);

    fn seen(id: &str, similarity: f32) -> Observation {
        Observation::Match {
            patient_id: id.into(),
            similarity,
        }
    }

    #[test]
    fn test_first_match_checks_in() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        assert_eq!(
            tracker.observe(seen("PAT001", 0.8), t0),
            Some(CheckInEvent::CheckedIn {
                patient_id: "PAT001".into(),
                similarity: 0.8
            })
        );
        assert_eq!(tracker.current().unwrap().patient_id, "PAT001");
    }

    #[test]
    fn test_same_patient_refreshes_without_event() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        assert_eq!(tracker.observe(seen("PAT001", 0.7), t0 + Duration::from_secs(2)), None);

        let cur = tracker.current().unwrap();
        assert_eq!(cur.last_seen, t0 + Duration::from_secs(2));
        assert_eq!(cur.since, t0);
        assert_eq!(cur.similarity, 0.7);
    }

    #[test]
    fn test_miss_within_hold_keeps_patient() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        assert_eq!(tracker.observe(Observation::NoMatch, t0 + Duration::from_secs(4)), None);
        assert!(tracker.current().is_some());
    }

    #[test]
    fn test_miss_after_hold_clears() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        assert_eq!(
            tracker.observe(Observation::NoMatch, t0 + HOLD),
            Some(CheckInEvent::Cleared {
                patient_id: "PAT001".into()
            })
        );
        assert!(tracker.current().is_none());
        assert_eq!(tracker.observe(Observation::NoMatch, t0 + HOLD * 2), None);
    }

    #[test]
    fn test_return_within_cooldown_not_recorded() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        tracker.observe(Observation::NoMatch, t0 + Duration::from_secs(10));
        assert_eq!(
            tracker.observe(seen("PAT001", 0.8), t0 + Duration::from_secs(60)),
            Some(CheckInEvent::Returned {
                patient_id: "PAT001".into()
            })
        );
    }

    #[test]
    fn test_return_after_cooldown_checks_in_again() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        tracker.observe(Observation::NoMatch, t0 + Duration::from_secs(10));
        assert!(matches!(
            tracker.observe(seen("PAT001", 0.9), t0 + COOLDOWN),
            Some(CheckInEvent::CheckedIn { .. })
        ));
    }

    #[test]
    fn test_different_patient_replaces_current() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        assert!(matches!(
            tracker.observe(seen("PAT002", 0.75), t0 + Duration::from_secs(2)),
            Some(CheckInEvent::CheckedIn { ref patient_id, .. }) if patient_id == "PAT002"
        ));
        assert_eq!(tracker.current().unwrap().patient_id, "PAT002");
    }

    #[test]
    fn test_reverted_check_in_retries_on_next_match() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        tracker.revert_check_in("PAT001");
        assert!(tracker.current().is_none());
        assert!(matches!(
            tracker.observe(seen("PAT001", 0.8), t0 + Duration::from_secs(2)),
            Some(CheckInEvent::CheckedIn { .. })
        ));
    }

    #[test]
    fn test_revert_other_patient_keeps_current() {
        let mut tracker = CheckInTracker::new(HOLD, COOLDOWN);
        let t0 = Instant::now();
        tracker.observe(seen("PAT001", 0.8), t0);
        tracker.revert_check_in("PAT002");
        assert_eq!(tracker.current().unwrap().patient_id, "PAT001");
    }

    async fn add_patient(state: &AppState, id: &str) {
        let new = NewPatient {
            patient_id: id.into(),
            name: format!("Patient {id}"),
            ..Default::default()
        };
        state
            .with_store(move |conn| patients::insert(conn, &new))
            .await
            .unwrap();
    }

    async fn checked_in(state: &AppState, id: &str) -> Option<CheckInEvent> {
        state.tracker.lock().await.observe(seen(id, 0.8), Instant::now())
    }

    #[tokio::test]
    async fn test_check_in_records_visit() {
        let state = AppState::in_memory().await;
        add_patient(&state, "PAT001").await;

        let event = checked_in(&state, "PAT001").await.unwrap();
        handle_event(&state, event).await;

        let recent = state
            .with_store(|conn| visits::recent(conn, "PAT001", 10))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].purpose, visits::CHECK_IN_PURPOSE);
    }

    #[tokio::test]
    async fn test_returned_event_records_nothing() {
        let state = AppState::in_memory().await;
        add_patient(&state, "PAT001").await;

        handle_event(
            &state,
            CheckInEvent::Returned {
                patient_id: "PAT001".into(),
            },
        )
        .await;

        let recent = state
            .with_store(|conn| visits::recent(conn, "PAT001", 10))
            .await
            .unwrap();
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn test_failed_visit_insert_allows_retry() {
        let state = AppState::in_memory().await;

        // No patient row yet, so the visit insert fails.
        let event = checked_in(&state, "PAT001").await.unwrap();
        handle_event(&state, event).await;
        assert!(state.tracker.lock().await.current().is_none());

        add_patient(&state, "PAT001").await;
        let event = checked_in(&state, "PAT001").await;
        assert!(matches!(event, Some(CheckInEvent::CheckedIn { .. })));
        handle_event(&state, event.unwrap()).await;

        let recent = state
            .with_store(|conn| visits::recent(conn, "PAT001", 10))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }
}
