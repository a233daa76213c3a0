//! Aggregate model status derivation.
//!
//! The status of a model version is a pure function of its replica states,
//! whether the model is deleted, whether the version is the latest, and
//! which version was last fully available.

use chrono::{DateTime, Utc};

use super::model::{ModelState, ModelStatus, ModelVersion, ReplicaState};

#[derive(Debug, Default)]
struct ReplicaCounts {
    available: u32,
    loading: u32,
    load_failed: u32,
    unloading: u32,
    unload_failed: u32,
    latest_timestamp: Option<DateTime<Utc>>,
    last_failure: Option<(String, DateTime<Utc>)>,
}

impl ReplicaCounts {
    fn tally(mv: &ModelVersion, deleted: bool) -> Self {
        let mut counts = Self::default();
        for replica in mv.replicas.values() {
            match replica.state {
                ReplicaState::Available => counts.available += 1,
                ReplicaState::LoadRequested | ReplicaState::Loading | ReplicaState::Loaded => {
                    counts.loading += 1
                }
                ReplicaState::LoadFailed => counts.load_failed += 1,
                ReplicaState::UnloadRequested | ReplicaState::Unloading => counts.unloading += 1,
                ReplicaState::UnloadFailed => counts.unload_failed += 1,
                ReplicaState::Unloaded | ReplicaState::Unknown => {}
            }

            if counts.latest_timestamp.is_none_or(|t| replica.timestamp > t) {
                counts.latest_timestamp = Some(replica.timestamp);
            }

            // Only the failure kind relevant to the version's direction counts.
            let relevant_failure = if deleted {
                ReplicaState::UnloadFailed
            } else {
                ReplicaState::LoadFailed
            };
            if replica.state == relevant_failure
                && counts
                    .last_failure
                    .as_ref()
                    .is_none_or(|(_, t)| replica.timestamp > *t)
            {
                counts.last_failure = Some((replica.reason.clone(), replica.timestamp));
            }
        }
        counts
    }
}

/// Derives the aggregate status of `mv`.
///
/// `last_available` is the highest version of the model whose state is
/// `Available`, used to keep a rolling update reported as available while
/// the new version is partially up.
pub(crate) fn compute_status(
    mv: &ModelVersion,
    deleted: bool,
    is_latest: bool,
    last_available: Option<u32>,
) -> ModelStatus {
    let counts = ReplicaCounts::tally(mv, deleted || !is_latest);
    let desired = mv.desired_replicas();
    let timestamp = counts.latest_timestamp.unwrap_or_else(Utc::now);

    let (state, reason, timestamp) = if deleted || !is_latest {
        if counts.unload_failed > 0 {
            let (reason, at) = failure_or(counts.last_failure.clone(), timestamp);
            (ModelState::TerminateFailed, reason, at)
        } else if counts.unloading > 0 || counts.available > 0 || counts.loading > 0 {
            (ModelState::Terminating, String::new(), timestamp)
        } else {
            (ModelState::Terminated, String::new(), timestamp)
        }
    } else if counts.load_failed > 0 {
        let (reason, at) = failure_or(counts.last_failure.clone(), timestamp);
        (ModelState::Failed, reason, at)
    } else if counts.available == desired
        || (counts.available > 0 && last_available.is_some_and(|v| v != mv.version))
    {
        (ModelState::Available, String::new(), timestamp)
    } else {
        (ModelState::Progressing, String::new(), timestamp)
    };

    ModelStatus {
        state,
        reason,
        timestamp,
        available_replicas: counts.available,
        unavailable_replicas: counts.loading + counts.load_failed,
    }
}

/// Status recorded when no placement could be found for `mv`.
pub(crate) fn schedule_failed_status(mv: &ModelVersion, reason: &str) -> ModelStatus {
    let available = mv.live_replicas();
    ModelStatus {
        state: ModelState::ScheduleFailed,
        reason: reason.to_string(),
        timestamp: Utc::now(),
        available_replicas: available,
        unavailable_replicas: mv.desired_replicas().saturating_sub(available),
    }
}

fn failure_or(
    last_failure: Option<(String, DateTime<Utc>)>,
    at: DateTime<Utc>,
) -> (String, DateTime<Utc>) {
    last_failure.unwrap_or((String::new(), at))
}
