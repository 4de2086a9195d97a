//! Chimera synthesis engine
//!
//! This crate handles:
//! - The physical resource model (tables, counters, integer allocators)
//! - Memory banks and the global placement ledger
//! - Execution plans: persistent, branchable module trees
//! - The module matching/production protocol
//! - Postponement and deferred replay
//! - Whole-diagram coalescing analysis
//! - The pluggable search driver and finished-plan reporting

pub mod bank;
pub mod coalesce;
pub mod driver;
pub mod ep;
pub mod error;
pub mod module;
pub mod report;
pub mod resource;

pub use bank::{Delegation, GlobalBank, MemoryBank, PostponedOp};
pub use coalesce::CoalescingMap;
pub use driver::{
    BreadthFirst, ModuleCountRanking, RankingOracle, SearchStrategy, SynthConfig, Synthesizer,
};
pub use ep::{
    Attachment, BranchSlot, Continuation, EpNode, EpNodeId, ExecutionPlan, FrontierEntry,
    TargetPlanState,
};
pub use error::{Result, SynthError};
pub use module::{Module, ModuleMatcher, ModuleOp, ProcessOutcome, SynthContext, Target, TargetKind};
pub use report::{LeafReport, PlanReport, ReportNode, TargetReport};
pub use resource::{
    index_width, CounterResource, ExpirationPolicy, IntegerAllocator, Resource, ResourceKind,
    ResourceSet, Table, TableKey, TableParam,
};
