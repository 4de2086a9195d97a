//! Synthesis driver
//!
//! The driver owns the worklist of in-flight plans. Each step takes one
//! plan, offers its first frontier node to every module of every target
//! still eligible on that plan, and enqueues whatever successor plans come
//! back. A node no module covers simply produces no successors; the branch
//! dies and better-covered siblings survive. The scheduling policy is
//! pluggable; breadth-first is the default, and the whole frontier sweep can
//! run on a rayon pool since `process` never mutates its input plan.

use crate::coalesce;
use crate::ep::ExecutionPlan;
use crate::error::Result;
use crate::module::{SynthContext, Target};
use crate::report::PlanReport;
use chimera_diagram::Diagram;
use chimera_expr::ExprOracle;
use rayon::prelude::*;
use std::collections::VecDeque;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// Driver limits and switches
#[derive(Debug, Clone)]
pub struct SynthConfig {
    /// Stop after this many finished plans
    pub max_plans: usize,
    /// Abort a runaway search after this many driver steps
    pub max_steps: usize,
    /// Sweep each worklist level on the rayon pool
    pub parallel: bool,
}

impl Default for SynthConfig {
    fn default() -> Self {
        Self {
            max_plans: 64,
            max_steps: 100_000,
            parallel: false,
        }
    }
}

/// Worklist scheduling policy
pub trait SearchStrategy: Send {
    fn push(&mut self, ep: ExecutionPlan);
    fn pop(&mut self) -> Option<ExecutionPlan>;

    /// Remove every queued plan at once (used by the parallel sweep)
    fn drain(&mut self) -> Vec<ExecutionPlan> {
        let mut out = Vec::new();
        while let Some(ep) = self.pop() {
            out.push(ep);
        }
        out
    }
}

/// FIFO worklist: explores all plans of one depth before the next
#[derive(Default)]
pub struct BreadthFirst {
    queue: VecDeque<ExecutionPlan>,
}

impl SearchStrategy for BreadthFirst {
    fn push(&mut self, ep: ExecutionPlan) {
        self.queue.push_back(ep);
    }

    fn pop(&mut self) -> Option<ExecutionPlan> {
        self.queue.pop_front()
    }
}

/// Cost function over finished plans; higher scores rank first
pub trait RankingOracle: Send + Sync {
    fn score(&self, report: &PlanReport) -> f64;
}

/// Placeholder ranking: prefers plans that place fewer modules
pub struct ModuleCountRanking;

impl RankingOracle for ModuleCountRanking {
    fn score(&self, report: &PlanReport) -> f64 {
        -(report.module_count() as f64)
    }
}

/// The synthesis engine's front door
pub struct Synthesizer {
    targets: Vec<Target>,
    config: SynthConfig,
}

impl Synthesizer {
    pub fn new(targets: Vec<Target>) -> Self {
        Self {
            targets,
            config: SynthConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SynthConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the search to completion with the default strategy.
    pub fn synthesize(
        &self,
        diagram: Diagram,
        oracle: &dyn ExprOracle,
    ) -> Result<Vec<ExecutionPlan>> {
        let mut strategy = BreadthFirst::default();
        self.synthesize_with(diagram, oracle, &mut strategy)
    }

    /// Run the search to completion under a caller-chosen strategy.
    pub fn synthesize_with(
        &self,
        diagram: Diagram,
        oracle: &dyn ExprOracle,
        strategy: &mut dyn SearchStrategy,
    ) -> Result<Vec<ExecutionPlan>> {
        let root = diagram.root()?;
        let coalescing = coalesce::analyze(&diagram, oracle);
        if !coalescing.is_empty() {
            info!(diagram = %diagram.name, "coalescing relations established");
        }
        let diagram = RwLock::new(diagram);
        let cx = SynthContext::new(&diagram, oracle, &coalescing);

        strategy.push(ExecutionPlan::new(root));
        let mut finished = Vec::new();
        let mut steps = 0usize;

        if self.config.parallel {
            loop {
                let level = strategy.drain();
                if level.is_empty() {
                    break;
                }
                let (done, open): (Vec<_>, Vec<_>) =
                    level.into_iter().partition(ExecutionPlan::finished);
                finished.extend(done);
                if finished.len() >= self.config.max_plans {
                    break;
                }
                steps += open.len();
                if steps > self.config.max_steps {
                    warn!(steps, "step budget exhausted, returning plans found so far");
                    break;
                }
                let produced = open
                    .par_iter()
                    .map(|ep| self.step(&cx, ep))
                    .collect::<Result<Vec<_>>>()?;
                for ep in produced.into_iter().flatten() {
                    strategy.push(ep);
                }
            }
        } else {
            while let Some(ep) = strategy.pop() {
                if ep.finished() {
                    finished.push(ep);
                    if finished.len() >= self.config.max_plans {
                        break;
                    }
                    continue;
                }
                steps += 1;
                if steps > self.config.max_steps {
                    warn!(steps, "step budget exhausted, returning plans found so far");
                    break;
                }
                for successor in self.step(&cx, &ep)? {
                    strategy.push(successor);
                }
            }
        }

        info!(plans = finished.len(), steps, "synthesis complete");
        Ok(finished)
    }

    /// Offer one plan's first frontier node to every eligible module.
    fn step(&self, cx: &SynthContext<'_>, ep: &ExecutionPlan) -> Result<Vec<ExecutionPlan>> {
        let Some((&node, entry)) = ep.frontier().first() else {
            return Ok(Vec::new());
        };
        let owner = entry.target;

        let mut out = Vec::new();
        for target in &self.targets {
            match owner {
                Some(t) if t != target.kind => continue,
                None if !target.entry => continue,
                _ => {}
            }
            for matcher in &target.modules {
                let outcome = matcher.process(cx, ep, node)?;
                out.extend(outcome.next_eps);
            }
        }
        if out.is_empty() {
            debug!(node = node.0, plan = ep.generation, "node uncovered, plan dead-ends");
        }
        Ok(out)
    }

    /// Rank finished plans with a cost oracle, best first.
    pub fn rank(
        &self,
        plans: &[ExecutionPlan],
        ranking: &dyn RankingOracle,
    ) -> Vec<(f64, PlanReport)> {
        let mut scored: Vec<(f64, PlanReport)> = plans
            .iter()
            .map(PlanReport::from_plan)
            .map(|r| (ranking.score(&r), r))
            .collect();
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored
    }
}
