//! Candidate filtering and scoring.
//!
//! Eligible workers are scored by skill fit and the best few are kept with a
//! bounded min-heap. Pure: no I/O, no clock.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};

use serde::Serialize;

use crate::model::{CandidateSummary, Task, Worker};

/// Most candidates returned by [`filter`].
pub const MAX_CANDIDATES: usize = 5;

/// Weight of each distinct matched skill.
pub const MATCH_WEIGHT: f64 = 1000.0;

/// Weight of accumulated level adequacy.
pub const ADEQUACY_WEIGHT: f64 = 100.0;

/// A scored, eligible worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub worker: Worker,
    pub score: f64,
}

impl Candidate {
    pub fn summary(&self) -> CandidateSummary {
        CandidateSummary {
            worker_id: self.worker.id.clone(),
            score: self.score,
            load: self.worker.load_label(),
        }
    }
}

/// Skill-fit score of a worker for a set of required skills.
///
/// Each required skill the worker has at level > 0 counts as matched and
/// contributes `min(level / required, 1.0)` adequacy. A required level of 0
/// is fully satisfied by any positive level.
pub fn skill_score(worker: &Worker, required: &BTreeMap<String, u32>) -> f64 {
    let mut matched = 0u32;
    let mut adequacy = 0.0f64;

    for (skill, &required_level) in required {
        let level = worker.skill_level(skill);
        if level == 0 {
            continue;
        }
        matched += 1;
        adequacy += if required_level == 0 {
            1.0
        } else {
            (f64::from(level) / f64::from(required_level)).min(1.0)
        };
    }

    f64::from(matched) * MATCH_WEIGHT + adequacy * ADEQUACY_WEIGHT
}

/// Ordering key: higher score first, then lower worker id.
struct Rank<'a> {
    score: f64,
    worker: &'a Worker,
}

impl Ord for Rank<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.worker.id.cmp(&self.worker.id))
    }
}

impl PartialOrd for Rank<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Rank<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rank<'_> {}

/// Rank eligible workers for a task, best first, at most [`MAX_CANDIDATES`].
///
/// Workers that are not available, are at capacity, appear in `exclude`, or
/// score 0 are dropped. A task without required skills has no candidates.
pub fn filter(task: &Task, workers: &[Worker], exclude: &[&str]) -> Vec<Candidate> {
    let mut heap: BinaryHeap<Reverse<Rank<'_>>> = BinaryHeap::with_capacity(MAX_CANDIDATES + 1);

    for worker in workers {
        if !worker.is_eligible() || exclude.contains(&worker.id.as_str()) {
            continue;
        }
        let score = skill_score(worker, &task.required_skills);
        if score <= 0.0 {
            continue;
        }
        heap.push(Reverse(Rank { score, worker }));
        if heap.len() > MAX_CANDIDATES {
            heap.pop();
        }
    }

    // Ascending order of Reverse<Rank> is best rank first.
    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(rank)| Candidate {
            worker: rank.worker.clone(),
            score: rank.score,
        })
        .collect()
}
