//! Worker data model.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a worker can take new work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    OnLeave,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::OnLeave => "on_leave",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Availability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(Self::Available),
            "busy" => Ok(Self::Busy),
            "on_leave" => Ok(Self::OnLeave),
            other => Err(format!("unknown availability: {other}")),
        }
    }
}

/// Seniority. Only used as advisory input for the generative strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Experience {
    Junior,
    #[default]
    Mid,
    Senior,
}

impl std::fmt::Display for Experience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Junior => "junior",
            Self::Mid => "mid",
            Self::Senior => "senior",
        };
        write!(f, "{s}")
    }
}

impl FromStr for Experience {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "junior" => Ok(Self::Junior),
            "mid" => Ok(Self::Mid),
            "senior" => Ok(Self::Senior),
            other => Err(format!("unknown experience level: {other}")),
        }
    }
}

/// A capacity-constrained worker.
///
/// `current_ongoing` mirrors the number of `in_progress` tasks assigned to
/// this worker. It is only ever changed by a store commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    /// Unique ID.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Skill name to level.
    pub skills: BTreeMap<String, u32>,
    /// Maximum concurrent in-progress tasks (> 0).
    pub max_concurrent: u32,
    /// Tasks currently in progress.
    pub current_ongoing: u32,
    pub availability: Availability,
    #[serde(default)]
    pub experience: Experience,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    /// Create an available worker with no skills and no load.
    pub fn new(id: impl Into<String>, name: impl Into<String>, max_concurrent: u32) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            skills: BTreeMap::new(),
            max_concurrent: max_concurrent.max(1),
            current_ongoing: 0,
            availability: Availability::Available,
            experience: Experience::default(),
            updated_at: Utc::now(),
        }
    }

    /// Builder: add a skill.
    pub fn with_skill(mut self, skill: impl Into<String>, level: u32) -> Self {
        self.skills.insert(skill.into(), level);
        self
    }

    /// Builder: set availability.
    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    /// Builder: set experience.
    pub fn with_experience(mut self, experience: Experience) -> Self {
        self.experience = experience;
        self
    }

    /// Builder: set the current load (seeding and tests).
    pub fn with_ongoing(mut self, ongoing: u32) -> Self {
        self.current_ongoing = ongoing.min(self.max_concurrent);
        self
    }

    /// Level for a skill, 0 if absent.
    pub fn skill_level(&self, skill: &str) -> u32 {
        self.skills.get(skill).copied().unwrap_or(0)
    }

    pub fn has_capacity(&self) -> bool {
        self.current_ongoing < self.max_concurrent
    }

    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }

    /// Available and below max concurrency.
    pub fn is_eligible(&self) -> bool {
        self.is_available() && self.has_capacity()
    }

    /// `"current/max"`, as shown to the advisor.
    pub fn load_label(&self) -> String {
        format!("{}/{}", self.current_ongoing, self.max_concurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_requires_availability_and_capacity() {
        let w = Worker::new("W1", "Ada", 2);
        assert!(w.is_eligible());

        let busy = w.clone().with_availability(Availability::Busy);
        assert!(!busy.is_eligible());

        let full = w.with_ongoing(2);
        assert!(!full.has_capacity());
        assert!(!full.is_eligible());
    }

    #[test]
    fn max_concurrent_is_at_least_one() {
        assert_eq!(Worker::new("W1", "Ada", 0).max_concurrent, 1);
    }

    #[test]
    fn seeded_load_is_clamped() {
        let w = Worker::new("W1", "Ada", 3).with_ongoing(9);
        assert_eq!(w.current_ongoing, 3);
    }

    #[test]
    fn availability_parse_and_display() {
        for a in [Availability::Available, Availability::Busy, Availability::OnLeave] {
            assert_eq!(a.to_string().parse::<Availability>().unwrap(), a);
        }
        assert!("asleep".parse::<Availability>().is_err());
    }

    #[test]
    fn missing_skill_is_level_zero() {
        let w = Worker::new("W1", "Ada", 1).with_skill("rust", 8);
        assert_eq!(w.skill_level("rust"), 8);
        assert_eq!(w.skill_level("go"), 0);
    }
}
