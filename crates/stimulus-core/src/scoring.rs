//! Batch scoring of stimulus candidates per agent.
//!
//! A candidate scores `weight * proximity * (0.5 + 0.5 * muffling)` plus a
//! novelty bonus for recent events, where `proximity` falls linearly from 1
//! at the source to 0 at the candidate's range. Candidates out of range
//! cannot be chosen. The agent's current target is kept unless the best
//! alternative beats it by the switch ratio.

use stimulus_types::{ScoreCandidate, ScoreRequest, ScoreResult};
use tracing::debug;

use crate::deadline::Deadline;

/// Score every request until `deadline` passes.
///
/// Requests not reached before the deadline produce no result.
pub fn score_batch(requests: &[ScoreRequest], deadline: &Deadline) -> Vec<ScoreResult> {
    let mut results = Vec::with_capacity(requests.len());
    for request in requests {
        if deadline.is_expired() {
            debug!(
                completed = results.len(),
                total = requests.len(),
                "scoring deadline hit, returning partial batch"
            );
            break;
        }
        results.push(score_request(request));
    }
    results
}

/// Choose the best candidate for one agent.
pub fn score_request(request: &ScoreRequest) -> ScoreResult {
    let mut best: Option<(&ScoreCandidate, f64)> = None;
    let mut current_score: Option<f64> = None;

    for candidate in &request.candidates {
        let Some(score) = candidate_score(request, candidate) else {
            continue;
        };
        if request.current_event_id.as_ref() == Some(&candidate.event_id) {
            current_score = Some(score);
        }
        if best.is_none_or(|(_, b)| score > b) {
            best = Some((candidate, score));
        }
    }

    let Some((best, best_score)) = best else {
        return ScoreResult::none(request.agent_id);
    };

    // Hysteresis only applies to a current target that is still a valid,
    // non-negative candidate.
    if let (Some(current_id), Some(current)) = (&request.current_event_id, current_score) {
        if current.is_finite() && current >= 0.0 && best_score < current * request.switch_ratio {
            return ScoreResult {
                agent_id: request.agent_id,
                chosen_event_id: Some(current_id.clone()),
                score: current,
            };
        }
    }

    ScoreResult {
        agent_id: request.agent_id,
        chosen_event_id: Some(best.event_id.clone()),
        score: best_score,
    }
}

/// Score of one candidate, or `None` when the agent is out of its range.
pub fn candidate_score(request: &ScoreRequest, candidate: &ScoreCandidate) -> Option<f64> {
    if !candidate.range.is_finite() || candidate.range <= 0.0 {
        return None;
    }
    let distance = request.position.horizontal_distance(candidate.position);
    if distance.is_nan() || distance > candidate.range {
        return None;
    }
    let proximity = (1.0 - distance / candidate.range).max(0.0);
    let muffling = candidate.muffling_factor.clamp(0.0, 1.0);
    let mut score = candidate.weight * proximity * 0.5f64.mul_add(muffling, 0.5);
    if request.current_step.saturating_sub(candidate.occurred_at_step) <= request.novelty_window {
        score += request.novelty_bonus;
    }
    Some(score)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use stimulus_types::{AgentId, EventId, Vec3};

    use super::*;
    use crate::deadline::ManualClock;

    fn candidate(id: &str, x: f64, range: f64, weight: f64) -> ScoreCandidate {
        ScoreCandidate {
            event_id: EventId::parse(id).unwrap(),
            position: Vec3::new(x, 0.0, 0.0),
            occurred_at_step: 0,
            range,
            weight,
            muffling_factor: 1.0,
        }
    }

    fn request(candidates: Vec<ScoreCandidate>, current: Option<&str>) -> ScoreRequest {
        ScoreRequest {
            agent_id: AgentId::new(),
            position: Vec3::new(0.0, 0.0, 0.0),
            current_step: 100,
            current_event_id: current.map(|c| EventId::parse(c).unwrap()),
            candidates,
            switch_ratio: 1.25,
            novelty_bonus: 0.5,
            novelty_window: 10,
        }
    }

    fn chosen(result: &ScoreResult) -> Option<&str> {
        result.chosen_event_id.as_ref().map(EventId::as_str)
    }

    #[test]
    fn proximity_and_muffling_shape_the_score() {
        let req = request(Vec::new(), None);
        let mut c = candidate("a", 5.0, 10.0, 4.0);
        // 4 * 0.5 * 1.0
        assert!((candidate_score(&req, &c).unwrap() - 2.0).abs() < 1e-9);
        c.muffling_factor = 0.0;
        // 4 * 0.5 * 0.5
        assert!((candidate_score(&req, &c).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_candidates_never_win() {
        let req = request(vec![candidate("far", 20.0, 10.0, 100.0)], None);
        let out = score_request(&req);
        assert!(out.chosen_event_id.is_none());
        assert!((out.score - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn novelty_bonus_applies_within_window() {
        let mut req = request(Vec::new(), None);
        let mut c = candidate("a", 0.0, 10.0, 1.0);
        c.occurred_at_step = 95;
        assert!((candidate_score(&req, &c).unwrap() - 1.5).abs() < 1e-9);
        req.current_step = 200;
        assert!((candidate_score(&req, &c).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn highest_score_wins() {
        let req = request(
            vec![candidate("weak", 1.0, 10.0, 1.0), candidate("strong", 1.0, 10.0, 3.0)],
            None,
        );
        assert_eq!(chosen(&score_request(&req)), Some("strong"));
    }

    #[test]
    fn hysteresis_keeps_current_target() {
        // current: 2.0 * 0.9 = 1.8; alternative: 2.4 * 0.9 = 2.16 < 1.8 * 1.25.
        let req = request(
            vec![candidate("current", 1.0, 10.0, 2.0), candidate("alt", 1.0, 10.0, 2.4)],
            Some("current"),
        );
        let out = score_request(&req);
        assert_eq!(chosen(&out), Some("current"));

        // A much stronger alternative does switch.
        let req = request(
            vec![candidate("current", 1.0, 10.0, 2.0), candidate("alt", 1.0, 10.0, 10.0)],
            Some("current"),
        );
        assert_eq!(chosen(&score_request(&req)), Some("alt"));
    }

    #[test]
    fn unreachable_current_target_does_not_stick() {
        let req = request(
            vec![candidate("current", 50.0, 10.0, 9.0), candidate("alt", 1.0, 10.0, 1.0)],
            Some("current"),
        );
        assert_eq!(chosen(&score_request(&req)), Some("alt"));
    }

    #[test]
    fn batch_stops_at_deadline() {
        let clock = Arc::new(ManualClock::new());
        let requests = vec![request(Vec::new(), None), request(Vec::new(), None)];

        let open = Deadline::with_clock(clock.clone(), Duration::from_millis(5));
        assert_eq!(score_batch(&requests, &open).len(), 2);

        let closed = Deadline::with_clock(clock, Duration::ZERO);
        assert!(score_batch(&requests, &closed).is_empty());
    }
}
