//! UCB1-based budget allocation across search arms
//!
//! Balances exploration (trying new searches) against exploitation
//! (focusing on high-yield searches) when apportioning a task's page
//! budget:
//!
//! ```text
//! score = (average_reward + C * sqrt(ln(total_pulls) / pulls)) * priority_boost
//! ```
//!
//! Budget is distributed proportionally to scores, with a minimum per
//! search (no starvation) and a per-arm cap (no monopolization).

use std::collections::HashMap;

use log::debug;
use serde::Serialize;

/// Execution priority for a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// UCB score multiplier
    #[must_use]
    pub fn boost(&self) -> f64 {
        match self {
            Priority::High => 1.5,
            Priority::Medium => 1.0,
            Priority::Low => 0.7,
        }
    }

    /// Queue dispatch rank: lower runs first
    #[must_use]
    pub fn queue_rank(&self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Parse a priority label, defaulting to medium for unknown values
    #[must_use]
    pub fn parse(label: &str) -> Self {
        match label {
            "high" => Priority::High,
            "low" => Priority::Low,
            _ => Priority::Medium,
        }
    }
}

/// One search as a bandit arm
#[derive(Debug, Clone, Serialize)]
pub struct SearchArm {
    pub search_id: String,
    /// Number of pages fetched for this search
    pub pulls: u64,
    /// Sum of rewards (useful pages)
    pub total_reward: f64,
    /// Currently allocated pages
    pub allocated_budget: u32,
    /// Pages actually fetched
    pub consumed_budget: u32,
    pub last_harvest_rate: f64,
    /// Priority multiplier, immutable after registration
    pub priority_boost: f64,
}

impl SearchArm {
    fn new(search_id: String, priority: Priority) -> Self {
        Self {
            search_id,
            pulls: 0,
            total_reward: 0.0,
            allocated_budget: 0,
            consumed_budget: 0,
            last_harvest_rate: 0.0,
            priority_boost: priority.boost(),
        }
    }

    /// Average reward per pull; zero for unplayed arms
    #[must_use]
    pub fn average_reward(&self) -> f64 {
        if self.pulls == 0 {
            0.0
        } else {
            self.total_reward / self.pulls as f64
        }
    }

    fn record_observation(&mut self, is_useful: bool) {
        self.pulls += 1;
        self.consumed_budget += 1;
        if is_useful {
            self.total_reward += 1.0;
        }
        self.last_harvest_rate = self.average_reward();
    }

    /// Pages still allocated but not yet consumed
    #[must_use]
    pub fn remaining_budget(&self) -> u32 {
        self.allocated_budget.saturating_sub(self.consumed_budget)
    }
}

/// Per-arm snapshot for the status projection
#[derive(Debug, Clone, Serialize)]
pub struct ArmStatus {
    pub search_id: String,
    pub pulls: u64,
    pub average_reward: f64,
    pub allocated_budget: u32,
    pub consumed_budget: u32,
    pub remaining_budget: u32,
    pub priority_boost: f64,
    /// f64::INFINITY for unplayed arms
    pub ucb_score: f64,
}

/// UCB1 budget allocator for a task's searches
#[derive(Debug)]
pub struct UcbAllocator {
    total_budget: u32,
    exploration_constant: f64,
    min_budget_per_search: u32,
    max_budget_ratio: f64,
    reallocation_interval: u64,
    arms: HashMap<String, SearchArm>,
    /// Registration order for deterministic iteration
    order: Vec<String>,
    total_pulls: u64,
    pulls_since_reallocation: u64,
}

impl UcbAllocator {
    /// Create an allocator with the default guardrails: minimum 5 pages per
    /// search, at most 40% of the total to any single arm, reallocation
    /// every 10 pulls.
    #[must_use]
    pub fn new(total_budget: u32, exploration_constant: Option<f64>) -> Self {
        Self::with_params(total_budget, exploration_constant, 5, 0.4, 10)
    }

    #[must_use]
    pub fn with_params(
        total_budget: u32,
        exploration_constant: Option<f64>,
        min_budget_per_search: u32,
        max_budget_ratio: f64,
        reallocation_interval: u64,
    ) -> Self {
        let exploration_constant = exploration_constant.unwrap_or(std::f64::consts::SQRT_2);
        debug!(
            "UCB allocator initialized: total_budget={total_budget} C={exploration_constant} min_budget={min_budget_per_search} max_ratio={max_budget_ratio}"
        );
        Self {
            total_budget,
            exploration_constant,
            min_budget_per_search,
            max_budget_ratio,
            reallocation_interval,
            arms: HashMap::new(),
            order: Vec::new(),
            total_pulls: 0,
            pulls_since_reallocation: 0,
        }
    }

    /// Hard per-arm cap: no single search can monopolize the task
    #[must_use]
    pub fn max_budget_per_arm(&self) -> u32 {
        (self.total_budget as f64 * self.max_budget_ratio).floor() as u32
    }

    /// Register a search arm. Idempotent: a duplicate id returns the
    /// existing arm unchanged; priority is immutable after creation.
    pub fn register_search(
        &mut self,
        search_id: &str,
        priority: Priority,
        initial_budget: Option<u32>,
    ) -> &SearchArm {
        if self.arms.contains_key(search_id) {
            debug!("Search already registered: {search_id}");
            return &self.arms[search_id];
        }

        let mut arm = SearchArm::new(search_id.to_string(), priority);
        if let Some(budget) = initial_budget {
            arm.allocated_budget = budget.min(self.max_budget_per_arm());
        }
        self.order.push(search_id.to_string());
        self.arms.insert(search_id.to_string(), arm);
        &self.arms[search_id]
    }

    /// Record a page-fetch observation as the arm's reward signal
    pub fn record_observation(&mut self, search_id: &str, is_useful: bool) {
        let Some(arm) = self.arms.get_mut(search_id) else {
            debug!("Observation for unknown search: {search_id}");
            return;
        };
        arm.record_observation(is_useful);
        self.total_pulls += 1;
        self.pulls_since_reallocation += 1;
    }

    /// UCB1 score for a search. Unplayed arms score infinity to force
    /// exploration; unknown ids score zero.
    #[must_use]
    pub fn ucb_score(&self, search_id: &str) -> f64 {
        let Some(arm) = self.arms.get(search_id) else {
            return 0.0;
        };
        if arm.pulls == 0 {
            return f64::INFINITY;
        }

        let exploitation = arm.average_reward();
        let exploration = if self.total_pulls > 0 {
            self.exploration_constant * ((self.total_pulls as f64).ln() / arm.pulls as f64).sqrt()
        } else {
            0.0
        };
        (exploitation + exploration) * arm.priority_boost
    }

    /// Scores for every registered arm
    #[must_use]
    pub fn all_ucb_scores(&self) -> HashMap<String, f64> {
        self.arms
            .keys()
            .map(|id| (id.clone(), self.ucb_score(id)))
            .collect()
    }

    /// Remaining budget for a search. Unplayed arms with no allocation get
    /// the minimum budget so initial exploration can happen at all.
    #[must_use]
    pub fn budget(&self, search_id: &str) -> u32 {
        let Some(arm) = self.arms.get(search_id) else {
            return 0;
        };
        let remaining = arm.remaining_budget();
        if arm.pulls == 0 && remaining == 0 {
            return self.min_budget_per_search;
        }
        remaining
    }

    /// Reallocate remaining budget across active arms by UCB score.
    ///
    /// 1. Nothing left globally: return current remainders.
    /// 2. Active arms are those below the per-arm cap.
    /// 3. Unplayed active arms receive the minimum budget first.
    /// 4. The rest is split among played active arms proportionally to
    ///    their (finite) scores, bounded below by the minimum and above by
    ///    the per-arm cap. Grants come out of the shared pool highest
    ///    score first, so a capped arm's slack stays available to the
    ///    rest. Tied scores and a zero score total fall back to an even
    ///    split.
    pub fn reallocate_budget(&mut self) -> HashMap<String, u32> {
        if self.arms.is_empty() {
            return HashMap::new();
        }

        let max_per_arm = self.max_budget_per_arm();
        let total_consumed: u32 = self.arms.values().map(|a| a.consumed_budget).sum();
        let mut remaining_budget = self.total_budget.saturating_sub(total_consumed);

        let current = |arms: &HashMap<String, SearchArm>| {
            arms.iter()
                .map(|(id, arm)| (id.clone(), arm.remaining_budget()))
                .collect::<HashMap<_, _>>()
        };

        if remaining_budget == 0 {
            debug!("No remaining budget to allocate");
            return current(&self.arms);
        }

        let scores: HashMap<String, f64> = self.all_ucb_scores();
        let active: Vec<String> = self
            .order
            .iter()
            .filter(|id| self.arms[id.as_str()].consumed_budget < max_per_arm)
            .cloned()
            .collect();

        if active.is_empty() {
            return current(&self.arms);
        }

        let unplayed: Vec<String> = active
            .iter()
            .filter(|id| scores[id.as_str()].is_infinite())
            .cloned()
            .collect();
        let played: Vec<String> = active
            .iter()
            .filter(|id| scores[id.as_str()].is_finite())
            .cloned()
            .collect();

        let mut allocations: HashMap<String, u32> = HashMap::new();

        // Unplayed arms first: minimum budget each, subject to the cap and
        // the global remainder.
        if !unplayed.is_empty() {
            let budget_for_unplayed =
                remaining_budget.min(unplayed.len() as u32 * self.min_budget_per_search);
            let per_arm = budget_for_unplayed / unplayed.len() as u32;
            for id in &unplayed {
                let Some(arm) = self.arms.get_mut(id) else {
                    continue;
                };
                let grant = per_arm.min(max_per_arm - arm.consumed_budget);
                arm.allocated_budget = arm.consumed_budget + grant;
                allocations.insert(id.clone(), arm.remaining_budget());
            }
            remaining_budget = remaining_budget.saturating_sub(budget_for_unplayed);
        }

        // Played arms: proportional to finite scores.
        if !played.is_empty() && remaining_budget > 0 {
            let total_score: f64 = played.iter().map(|id| scores[id.as_str()]).sum();
            let scores_tied = played
                .windows(2)
                .all(|pair| (scores[pair[0].as_str()] - scores[pair[1].as_str()]).abs() < 1e-9);

            if total_score > 0.0 && !scores_tied {
                let mut by_score = played.clone();
                by_score.sort_by(|a, b| {
                    scores[b.as_str()]
                        .partial_cmp(&scores[a.as_str()])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                let mut pool = remaining_budget;
                for id in &by_score {
                    let Some(arm) = self.arms.get_mut(id) else {
                        continue;
                    };
                    let proportion = scores[id.as_str()] / total_score;
                    let raw = (pool as f64 * proportion) as u32;
                    let max_additional = max_per_arm - arm.consumed_budget;
                    let grant = raw
                        .max(self.min_budget_per_search)
                        .min(max_additional)
                        .min(pool);
                    arm.allocated_budget = arm.consumed_budget + grant;
                    allocations.insert(id.clone(), arm.remaining_budget());
                    pool -= grant;
                }
            } else {
                // Tied scores (or a zero total) split the pool evenly.
                let per_arm = remaining_budget / played.len() as u32;
                for id in &played {
                    let Some(arm) = self.arms.get_mut(id) else {
                        continue;
                    };
                    let grant = per_arm.min(max_per_arm - arm.consumed_budget);
                    arm.allocated_budget = arm.consumed_budget + grant;
                    allocations.insert(id.clone(), arm.remaining_budget());
                }
            }
        }

        // Arms outside the active set keep their remainders.
        for (id, arm) in &self.arms {
            allocations
                .entry(id.clone())
                .or_insert_with(|| arm.remaining_budget());
        }

        self.pulls_since_reallocation = 0;
        debug!("Budget reallocated: {allocations:?}");
        allocations
    }

    /// Whether reallocation is due: every `reallocation_interval` pulls, or
    /// when a played arm has exhausted its allocation below the cap.
    /// Unplayed arms never trigger reallocation.
    #[must_use]
    pub fn should_reallocate(&self) -> bool {
        if self.pulls_since_reallocation >= self.reallocation_interval {
            return true;
        }
        let max_per_arm = self.max_budget_per_arm();
        self.arms.values().any(|arm| {
            arm.consumed_budget > 0
                && arm.remaining_budget() == 0
                && arm.consumed_budget < max_per_arm
        })
    }

    /// Reallocate if due, then return the search's remaining budget
    pub fn reallocate_and_get_budget(&mut self, search_id: &str) -> u32 {
        if self.should_reallocate() {
            self.reallocate_budget();
        }
        self.budget(search_id)
    }

    /// Highest-UCB arm among those with remaining budget or zero pulls.
    /// Observability only: callers report it, they do not act on it.
    #[must_use]
    pub fn recommended_search(&self) -> Option<String> {
        self.order
            .iter()
            .filter(|id| {
                let arm = &self.arms[id.as_str()];
                arm.remaining_budget() > 0 || arm.pulls == 0
            })
            .max_by(|a, b| {
                let sa = self.ucb_score(a);
                let sb = self.ucb_score(b);
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    /// Per-arm snapshots in registration order
    #[must_use]
    pub fn arm_statuses(&self) -> Vec<ArmStatus> {
        self.order
            .iter()
            .map(|id| {
                let arm = &self.arms[id.as_str()];
                ArmStatus {
                    search_id: arm.search_id.clone(),
                    pulls: arm.pulls,
                    average_reward: arm.average_reward(),
                    allocated_budget: arm.allocated_budget,
                    consumed_budget: arm.consumed_budget,
                    remaining_budget: arm.remaining_budget(),
                    priority_boost: arm.priority_boost,
                    ucb_score: self.ucb_score(id),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn arm(&self, search_id: &str) -> Option<&SearchArm> {
        self.arms.get(search_id)
    }

    #[must_use]
    pub fn total_pulls(&self) -> u64 {
        self.total_pulls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unplayed_arm_scores_infinity() {
        let mut alloc = UcbAllocator::new(120, None);
        alloc.register_search("s1", Priority::Medium, None);
        assert!(alloc.ucb_score("s1").is_infinite());
        assert_eq!(alloc.ucb_score("unknown"), 0.0);
    }

    #[test]
    fn priority_ratio_holds_for_equal_history() {
        let mut alloc = UcbAllocator::new(120, None);
        alloc.register_search("hi", Priority::High, None);
        alloc.register_search("lo", Priority::Low, None);

        for _ in 0..4 {
            alloc.record_observation("hi", true);
            alloc.record_observation("lo", true);
        }

        let ratio = alloc.ucb_score("hi") / alloc.ucb_score("lo");
        assert!((ratio - 1.5 / 0.7).abs() < 1e-9);
    }

    #[test]
    fn registration_is_idempotent_and_priority_immutable() {
        let mut alloc = UcbAllocator::new(120, None);
        let boost = alloc
            .register_search("s1", Priority::High, Some(10))
            .priority_boost;
        assert!((boost - 1.5).abs() < f64::EPSILON);

        // Re-registering with a different priority returns the first arm
        let again = alloc.register_search("s1", Priority::Low, Some(99));
        assert!((again.priority_boost - 1.5).abs() < f64::EPSILON);
        assert_eq!(again.allocated_budget, 10);
    }

    #[test]
    fn initial_budget_clamped_to_per_arm_cap() {
        let mut alloc = UcbAllocator::new(100, None);
        let arm = alloc.register_search("s1", Priority::Medium, Some(90));
        assert_eq!(arm.allocated_budget, 40); // floor(0.4 * 100)
    }

    #[test]
    fn proportional_split_favors_higher_reward() {
        let mut alloc = UcbAllocator::new(100, None);
        alloc.register_search("hi", Priority::Medium, None);
        alloc.register_search("lo", Priority::Medium, None);

        for i in 0..10 {
            alloc.record_observation("hi", i < 8);
            alloc.record_observation("lo", i < 2);
        }

        let allocations = alloc.reallocate_budget();
        let hi = allocations["hi"];
        let lo = allocations["lo"];
        assert!(hi > lo, "hi={hi} lo={lo}");
        assert!(hi >= 5 && lo >= 5);
        assert!(hi <= 40 && lo <= 40);
    }

    #[test]
    fn unplayed_arms_get_minimum_budget_first() {
        let mut alloc = UcbAllocator::new(120, None);
        alloc.register_search("played", Priority::Medium, None);
        alloc.register_search("fresh", Priority::Medium, None);
        alloc.record_observation("played", true);

        let allocations = alloc.reallocate_budget();
        assert_eq!(allocations["fresh"], 5);
    }

    #[test]
    fn should_reallocate_on_interval_and_exhaustion() {
        let mut alloc = UcbAllocator::with_params(120, None, 5, 0.4, 10);
        alloc.register_search("s1", Priority::Medium, Some(2));

        // Unplayed arms never trigger
        assert!(!alloc.should_reallocate());

        alloc.record_observation("s1", true);
        alloc.record_observation("s1", true);
        // Played arm with exhausted allocation below cap triggers
        assert!(alloc.should_reallocate());

        alloc.reallocate_budget();
        assert!(!alloc.should_reallocate());

        for _ in 0..10 {
            alloc.record_observation("s1", false);
        }
        assert!(alloc.should_reallocate());
    }

    #[test]
    fn consumed_never_exceeds_allocation_cap_invariants() {
        let mut alloc = UcbAllocator::new(50, None);
        alloc.register_search("s1", Priority::High, Some(100));
        let cap = alloc.max_budget_per_arm();
        assert_eq!(cap, 20);

        for _ in 0..30 {
            alloc.record_observation("s1", true);
            alloc.reallocate_budget();
            let arm = alloc.arm("s1").expect("arm");
            assert!(arm.allocated_budget <= cap.max(arm.consumed_budget));
        }
    }

    #[test]
    fn recommended_search_prefers_highest_score_with_budget() {
        let mut alloc = UcbAllocator::new(120, None);
        alloc.register_search("a", Priority::Medium, None);
        alloc.register_search("b", Priority::Medium, None);
        // Both unplayed: either could win; both are infinite, max_by keeps
        // the later one, but any answer must be a registered arm.
        let rec = alloc.recommended_search().expect("some arm");
        assert!(rec == "a" || rec == "b");

        alloc.record_observation("a", true);
        alloc.reallocate_budget();
        // "b" is still unplayed and therefore infinite
        assert_eq!(alloc.recommended_search().as_deref(), Some("b"));
    }
}
