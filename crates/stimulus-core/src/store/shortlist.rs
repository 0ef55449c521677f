//! Bounded top-K candidate list for the synchronous lookup.

use std::cmp::Ordering;

use stimulus_types::StimulusEvent;

/// A candidate with its cheap pre-attenuation score.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The stored event.
    pub event: StimulusEvent,
    /// `weight` plus the novelty bonus when fresh.
    pub approx_score: f64,
    /// Distance from the listener to the event source.
    pub distance: f64,
}

impl Candidate {
    /// Higher score first, then closer first.
    fn rank(&self, other: &Self) -> Ordering {
        other
            .approx_score
            .total_cmp(&self.approx_score)
            .then_with(|| self.distance.total_cmp(&other.distance))
    }
}

/// Keeps the `capacity` best candidates seen so far.
#[derive(Debug)]
pub struct Shortlist {
    capacity: usize,
    entries: Vec<Candidate>,
}

impl Shortlist {
    /// An empty shortlist holding at most `capacity` candidates.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Offer a candidate; when full it replaces the worst entry only if it
    /// ranks strictly better.
    pub fn offer(&mut self, candidate: Candidate) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() < self.capacity {
            self.entries.push(candidate);
            return;
        }
        let worst = self
            .entries
            .iter_mut()
            .max_by(|a, b| a.rank(b))
            .filter(|slot| candidate.rank(slot) == Ordering::Less);
        if let Some(slot) = worst {
            *slot = candidate;
        }
    }

    /// Entries in descending approximate-score order, closer first on ties.
    pub fn into_sorted(mut self) -> Vec<Candidate> {
        self.entries.sort_by(Candidate::rank);
        self.entries
    }

    /// Number of held candidates.
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
