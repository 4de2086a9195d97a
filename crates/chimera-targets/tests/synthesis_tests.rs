//! End-to-end synthesis tests over small hand-built diagrams
//!
//! Drives the full engine: matchers, placement, coalescing, postponement,
//! and the hand-off rewrite, then checks the finished plans' invariants.

use chimera_diagram::{
    functions, BranchNode, CallArg, CallNode, Diagram, NodeId, ObjectId, ReturnNode, RouteOp,
};
use chimera_expr::{Expr, ExprOracle, StructuralOracle};
use chimera_synth::{
    coalesce, BranchSlot, ExecutionPlan, Module, ModuleMatcher, ModuleOp, PlanReport, ReportNode,
    Resource, ResourceKind, SynthConfig, SynthContext, Synthesizer, TargetKind,
};
use chimera_targets::{default_targets, AsicConfig, AsicIfElse, HandOff};
use indexmap::IndexMap;
use std::sync::RwLock;

fn value_args(args: Vec<(&str, Expr)>) -> IndexMap<String, CallArg> {
    args.into_iter()
        .map(|(k, v)| (k.to_string(), CallArg::Value(v)))
        .collect()
}

fn call(
    function: &str,
    object: Option<ObjectId>,
    args: Vec<(&str, Expr)>,
    ret: Option<Expr>,
    symbols: Vec<&str>,
    next: NodeId,
) -> CallNode {
    CallNode {
        function: function.into(),
        object,
        args: value_args(args),
        ret,
        symbols: symbols.into_iter().map(String::from).collect(),
        next: Some(next),
    }
}

fn forward(d: &mut Diagram, port: i64) -> NodeId {
    d.add_return(ReturnNode {
        operation: RouteOp::Forward,
        port: Some(Expr::int(port)),
    })
}

fn drop_node(d: &mut Diagram) -> NodeId {
    d.add_return(ReturnNode {
        operation: RouteOp::Drop,
        port: None,
    })
}

fn synthesize(diagram: Diagram, max_plans: usize) -> Vec<ExecutionPlan> {
    let oracle = StructuralOracle::new();
    Synthesizer::new(default_targets())
        .with_config(SynthConfig {
            max_plans,
            ..SynthConfig::default()
        })
        .synthesize(diagram, &oracle)
        .unwrap()
}

fn tree_modules(node: &ReportNode) -> Vec<&ReportNode> {
    let mut out = vec![node];
    for child in &node.children {
        out.extend(tree_modules(child));
    }
    out
}

fn plan_modules(report: &PlanReport) -> Vec<&ReportNode> {
    report
        .targets
        .iter()
        .flat_map(|t| &t.roots)
        .flat_map(tree_modules)
        .collect()
}

/// extract(eth) -> branch on a parser-only condition -> forward | drop
fn parser_branch_diagram() -> (Diagram, NodeId, NodeId) {
    let mut d = Diagram::new("parser_branch");
    let fwd = forward(&mut d, 1);
    let drp = drop_node(&mut d);
    let branch = d.add_branch(BranchNode {
        condition: Expr::eq(Expr::field("ethernet", "ether_type"), Expr::int(0x0800)),
        on_true: fwd,
        on_false: drp,
    });
    let extract = d.add_call(call(
        functions::PACKET_EXTRACT,
        None,
        vec![(functions::args::HEADER, Expr::symbol("ethernet"))],
        None,
        vec![],
        branch,
    ));
    d.set_root(extract);
    (d, fwd, drp)
}

#[test]
fn branch_split_emits_if_with_then_else_leaves() {
    let (diagram, fwd, drp) = parser_branch_diagram();
    let plans = synthesize(diagram, 16);
    assert!(!plans.is_empty());

    let reports: Vec<PlanReport> = plans.iter().map(PlanReport::from_plan).collect();
    let asic = reports
        .iter()
        .find(|r| r.targets.iter().any(|t| t.target == TargetKind::SwitchAsic))
        .expect("an ASIC plan should cover a parser-stage branch");

    let target = &asic.targets[0];
    assert_eq!(target.roots.len(), 1);
    let parse = &target.roots[0];
    assert!(matches!(parse.module.op, ModuleOp::ParseHeader { .. }));
    let iff = &parse.children[0];
    assert!(matches!(iff.module.op, ModuleOp::If { .. }));

    // the two leaves sit on the branch's own on-true/on-false successors
    assert_eq!(iff.children.len(), 2);
    let then_leaf = iff
        .children
        .iter()
        .find(|c| c.slot == BranchSlot::Then)
        .unwrap();
    let else_leaf = iff
        .children
        .iter()
        .find(|c| c.slot == BranchSlot::Else)
        .unwrap();
    assert_eq!(then_leaf.node, fwd);
    assert_eq!(else_leaf.node, drp);
    assert!(matches!(then_leaf.module.op, ModuleOp::Forward { .. }));
    assert!(matches!(else_leaf.module.op, ModuleOp::Drop));

    // semantic equality across syntactically different conditions
    let oracle = StructuralOracle::new();
    let flipped = Module::new(
        iff.module.target,
        ModuleOp::If {
            condition: Expr::eq(Expr::int(0x0800), Expr::field("ethernet", "ether_type")),
        },
        iff.node,
    );
    assert!(iff.module.equals(&flipped, &oracle));
}

/// extract -> get(A) -> branch(hit) -> [refresh(L) -> fwd] | [alloc(L) -> put(A) -> fwd]
fn allocator_diagram() -> (Diagram, ObjectId, ObjectId, NodeId) {
    let map = ObjectId(1);
    let space = ObjectId(2);
    let mut d = Diagram::new("nat_alloc");
    let fwd_hit = forward(&mut d, 1);
    let fwd_new = forward(&mut d, 2);
    let put = d.add_call(call(
        functions::MAP_PUT,
        Some(map),
        vec![
            (functions::args::KEY, Expr::field("ipv4", "src_addr")),
            (functions::args::VALUE, Expr::symbol("new_idx")),
        ],
        None,
        vec![],
        fwd_new,
    ));
    let alloc = d.add_call(call(
        functions::INDEX_ALLOC,
        Some(space),
        vec![(functions::args::CAPACITY, Expr::int(65536))],
        Some(Expr::symbol("new_idx")),
        vec!["new_idx", "alloc_ok"],
        put,
    ));
    let refresh = d.add_call(call(
        functions::INDEX_REFRESH,
        Some(space),
        vec![(functions::args::INDEX, Expr::symbol("flow_idx"))],
        None,
        vec![],
        fwd_hit,
    ));
    let branch = d.add_branch(BranchNode {
        condition: Expr::eq(Expr::symbol("hit"), Expr::int(1)),
        on_true: refresh,
        on_false: alloc,
    });
    let get = d.add_call(call(
        functions::MAP_GET,
        Some(map),
        vec![(functions::args::KEY, Expr::field("ipv4", "src_addr"))],
        Some(Expr::symbol("flow_idx")),
        vec!["flow_idx", "hit"],
        branch,
    ));
    let extract = d.add_call(call(
        functions::PACKET_EXTRACT,
        None,
        vec![(functions::args::HEADER, Expr::symbol("ipv4"))],
        None,
        vec![],
        get,
    ));
    d.set_root(extract);
    (d, map, space, refresh)
}

#[test]
fn placement_stays_consistent_across_every_plan() {
    let (diagram, _, _, _) = allocator_diagram();
    let plans = synthesize(diagram, 128);
    assert!(!plans.is_empty());

    for ep in &plans {
        assert!(ep.finished());
        for (_, state) in ep.states() {
            for resource in state.bank.resources.iter() {
                for obj in resource.objs() {
                    // every object of a resource agrees with the global ledger
                    assert_eq!(
                        ep.global().decision(*obj),
                        Some(resource.kind()),
                        "object {} drifted from its placement decision",
                        obj
                    );
                }
            }
        }
    }
}

#[test]
fn coverage_no_gaps_no_duplicate_attachment() {
    let (diagram, _, _, _) = allocator_diagram();
    let plans = synthesize(diagram, 128);

    for ep in &plans {
        let report = PlanReport::from_plan(ep);
        for leaf in &report.leaves {
            // a terminated path never visits the same diagram node twice
            let mut seen = std::collections::BTreeSet::new();
            for n in &leaf.path {
                assert!(seen.insert(*n), "node {} attached twice on one path", n);
            }
            // and it ends on a terminal module
            assert!(!leaf.path.is_empty());
        }
    }
}

#[test]
fn allocator_plan_replays_postponed_refresh() {
    let (diagram, map, space, refresh_node) = allocator_diagram();
    let plans = synthesize(diagram, 128);

    let reports: Vec<PlanReport> = plans.iter().map(PlanReport::from_plan).collect();
    let asic_plan = reports
        .iter()
        .find(|r| {
            r.targets.len() == 1
                && r.targets[0].target == TargetKind::SwitchAsic
                && plan_modules(r)
                    .iter()
                    .any(|m| matches!(m.module.op, ModuleOp::AllocatorReserve { .. }))
        })
        .expect("a pure ASIC plan with an on-switch allocator should exist");

    // the postponed refresh was spliced back exactly once, on the hit path
    let refreshes: Vec<_> = plan_modules(asic_plan)
        .into_iter()
        .filter(|m| m.node == refresh_node)
        .collect();
    assert_eq!(refreshes.len(), 1);
    assert!(matches!(
        refreshes[0].module.op,
        ModuleOp::Refresh { object, .. } if object == space
    ));
    // the refresh leads straight into the terminal it was replayed before
    assert_eq!(refreshes[0].children.len(), 1);
    assert!(matches!(
        refreshes[0].children[0].module.op,
        ModuleOp::Forward { .. }
    ));

    // allocator geometry follows the doubling-range search
    let allocator = plan_modules(asic_plan)
        .into_iter()
        .find_map(|m| match &m.module.op {
            ModuleOp::AllocatorReserve { allocator } => Some(allocator.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(allocator.capacity, 65536);
    assert_eq!(allocator.index_width, 16);

    // placements: the map became a table, the index space an allocator
    assert_eq!(
        asic_plan
            .placements
            .iter()
            .find(|(o, _)| *o == map)
            .map(|(_, k)| *k),
        Some(ResourceKind::Table)
    );
    assert_eq!(
        asic_plan
            .placements
            .iter()
            .find(|(o, _)| *o == space)
            .map(|(_, k)| *k),
        Some(ResourceKind::IntegerAllocator)
    );
}

#[test]
fn rematch_extends_rather_than_duplicates() {
    // two lookups on the same map along one path
    let map = ObjectId(7);
    let mut d = Diagram::new("double_get");
    let fwd = forward(&mut d, 1);
    let get2 = d.add_call(call(
        functions::MAP_GET,
        Some(map),
        vec![(functions::args::KEY, Expr::field("ipv4", "dst_addr"))],
        Some(Expr::symbol("rev_idx")),
        vec!["rev_idx", "rev_hit"],
        fwd,
    ));
    let get1 = d.add_call(call(
        functions::MAP_GET,
        Some(map),
        vec![(functions::args::KEY, Expr::field("ipv4", "src_addr"))],
        Some(Expr::symbol("fwd_idx")),
        vec!["fwd_idx", "fwd_hit"],
        get2,
    ));
    d.set_root(get1);

    let plans = synthesize(d, 64);
    assert!(!plans.is_empty());
    // hybrid plans split the lookups across banks; judge the pure ones
    let pure: Vec<&ExecutionPlan> = plans.iter().filter(|ep| ep.states().count() == 1).collect();
    assert!(!pure.is_empty());
    for ep in pure {
        for (_, state) in ep.states() {
            let tables: Vec<&Resource> = state
                .bank
                .resources
                .of_kind(ResourceKind::Table)
                .collect();
            if tables.is_empty() {
                continue;
            }
            // one table realizes the map, extended by both lookups
            assert_eq!(tables.len(), 1);
            let table = tables[0].as_table().unwrap();
            assert!(table.nodes.contains(&get1) && table.nodes.contains(&get2));
            assert_eq!(table.keys.len(), 2);
        }
    }
}

#[test]
fn handoff_replays_upstream_state_reads_on_the_controller() {
    let (diagram, map, _, _) = allocator_diagram();
    let plans = synthesize(diagram, 256);

    let reports: Vec<PlanReport> = plans.iter().map(PlanReport::from_plan).collect();
    let hybrid = reports
        .iter()
        .find(|r| {
            plan_modules(r)
                .iter()
                .any(|m| matches!(m.module.op, ModuleOp::SendToController { .. }))
                && r.targets.iter().any(|t| t.target == TargetKind::Controller)
        })
        .expect("a hybrid switch+controller plan should exist");

    let controller = hybrid
        .targets
        .iter()
        .find(|t| t.target == TargetKind::Controller)
        .unwrap();
    assert!(!controller.roots.is_empty());

    // at least one hybrid plan mirrors the map that an upstream lookup read
    let mirrored_somewhere = reports.iter().any(|r| {
        r.targets
            .iter()
            .any(|t| t.target == TargetKind::Controller && t.mirrored.contains(&map))
    });
    assert!(mirrored_somewhere);
}

#[test]
fn handoff_is_pruned_once_rejuvenation_is_delegated() {
    let (diagram, _, space, refresh_node) = allocator_diagram();
    let oracle = StructuralOracle::new();
    let coalescing = coalesce::analyze(&diagram, &oracle);
    let get_node = diagram.find_calls_to(functions::MAP_GET, diagram.root().unwrap())[0];
    let alloc_node = diagram.find_calls_to(functions::INDEX_ALLOC, diagram.root().unwrap())[0];
    let lock = RwLock::new(diagram);
    let cx = SynthContext::new(&lock, &oracle, &coalescing);

    // hand-build a switch path that already owns the allocator, paused at the refresh
    let mut ep = ExecutionPlan::new(get_node);
    let table = chimera_synth::Table::new("map_1", ObjectId(1), get_node);
    ep.add_leaves(
        get_node,
        Module::new(
            TargetKind::SwitchAsic,
            ModuleOp::TableLookup { table },
            get_node,
        ),
        chimera_synth::Continuation::Next(refresh_node),
    )
    .unwrap();
    let allocator =
        chimera_synth::IntegerAllocator::new(space, alloc_node, 65536, Expr::symbol("new_idx"));
    ep.bank_mut(TargetKind::SwitchAsic)
        .resources
        .insert(Resource::IntegerAllocator(allocator))
        .unwrap();
    ep.global_mut()
        .decide(space, ResourceKind::IntegerAllocator)
        .unwrap();

    let outcome = HandOff.process(&cx, &ep, refresh_node).unwrap();
    assert!(!outcome.matched(), "redundant hand-off must be pruned");
}

#[test]
fn wide_predicate_is_infeasible_on_the_asic_only() {
    let mut d = Diagram::new("wide_branch");
    let fwd = forward(&mut d, 1);
    let drp = drop_node(&mut d);
    let mut cond = Expr::eq(Expr::field("ipv4", "src_addr"), Expr::int(1));
    for field in ["dst_addr", "proto", "ttl", "tos"] {
        cond = Expr::and(cond, Expr::eq(Expr::field("ipv4", field), Expr::int(1)));
    }
    let branch = d.add_branch(BranchNode {
        condition: cond,
        on_true: fwd,
        on_false: drp,
    });
    d.set_root(branch);

    let oracle = StructuralOracle::new();
    let coalescing = coalesce::analyze(&d, &oracle);
    let lock = RwLock::new(d);
    let cx = SynthContext::new(&lock, &oracle, &coalescing);
    let ep = ExecutionPlan::new(branch);

    let asic = AsicIfElse {
        config: AsicConfig::default(),
    };
    let outcome = asic.process(&cx, &ep, branch).unwrap();
    assert!(!outcome.matched(), "five fields exceed the match unit");

    let soft = chimera_targets::software::IfElse {
        target: TargetKind::SoftwareSwitch,
    };
    let outcome = soft.process(&cx, &ep, branch).unwrap();
    assert!(outcome.matched(), "software switches have no width limit");
}

/// get(A) -> live(L, flow_idx) -> branch(is_live) -> fwd | drop
#[test]
fn coalesced_objects_share_one_table() {
    let map = ObjectId(1);
    let space = ObjectId(2);
    let mut d = Diagram::new("coalesced");
    let fwd = forward(&mut d, 1);
    let drp = drop_node(&mut d);
    let branch = d.add_branch(BranchNode {
        condition: Expr::eq(Expr::symbol("is_live"), Expr::int(1)),
        on_true: fwd,
        on_false: drp,
    });
    let live = d.add_call(call(
        functions::INDEX_LIVE,
        Some(space),
        vec![(functions::args::INDEX, Expr::symbol("flow_idx"))],
        None,
        vec!["is_live"],
        branch,
    ));
    let get = d.add_call(call(
        functions::MAP_GET,
        Some(map),
        vec![(functions::args::KEY, Expr::field("ipv4", "src_addr"))],
        Some(Expr::symbol("flow_idx")),
        vec!["flow_idx"],
        live,
    ));
    d.set_root(get);

    let plans = synthesize(d, 64);
    assert!(!plans.is_empty());

    let coalesced = plans.iter().any(|ep| {
        ep.states().any(|(_, state)| {
            state
                .bank
                .resources
                .iter()
                .any(|r| r.objs().contains(&map) && r.objs().contains(&space))
        })
    });
    assert!(coalesced, "the index space should fold into the map's table");

    // and no plan ever realizes the carried space as its own allocator
    for ep in &plans {
        assert_ne!(
            ep.global().decision(space),
            Some(ResourceKind::IntegerAllocator)
        );
    }
}

/// borrow(V) -> branch(cnt < 100) -> [commit(V, cnt+1) -> fwd] | drop
#[test]
fn read_increment_write_burst_becomes_a_counter() {
    let vec_obj = ObjectId(5);
    let mut d = Diagram::new("counter");
    let fwd = forward(&mut d, 1);
    let drp = drop_node(&mut d);
    let commit = d.add_call(call(
        functions::VECTOR_COMMIT,
        Some(vec_obj),
        vec![
            (functions::args::INDEX, Expr::field("ipv4", "src_addr")),
            (
                functions::args::VALUE,
                Expr::binary(
                    chimera_expr::BinaryOp::Add,
                    Expr::symbol("cnt"),
                    Expr::int(1),
                ),
            ),
        ],
        None,
        vec![],
        fwd,
    ));
    let branch = d.add_branch(BranchNode {
        condition: Expr::binary(
            chimera_expr::BinaryOp::Less,
            Expr::symbol("cnt"),
            Expr::int(100),
        ),
        on_true: commit,
        on_false: drp,
    });
    let borrow = d.add_call(call(
        functions::VECTOR_BORROW,
        Some(vec_obj),
        vec![
            (functions::args::INDEX, Expr::field("ipv4", "src_addr")),
            (functions::args::CAPACITY, Expr::int(1024)),
            (functions::args::WIDTH, Expr::int(32)),
        ],
        Some(Expr::symbol("cnt")),
        vec!["cnt"],
        branch,
    ));
    d.set_root(borrow);

    let plans = synthesize(d, 64);
    assert!(!plans.is_empty());

    // pick a single-target plan so the increment landed in the same bank
    let with_counter = plans
        .iter()
        .find(|ep| {
            ep.states().count() == 1
                && ep.states().any(|(_, state)| {
                    state
                        .bank
                        .resources
                        .of_kind(ResourceKind::Counter)
                        .next()
                        .is_some()
                })
        })
        .expect("the burst should compile to a counter");

    let (_, state) = with_counter
        .states()
        .find(|(_, s)| {
            s.bank
                .resources
                .of_kind(ResourceKind::Counter)
                .next()
                .is_some()
        })
        .unwrap();
    let counter = match state
        .bank
        .resources
        .of_kind(ResourceKind::Counter)
        .next()
        .unwrap()
    {
        Resource::Counter(c) => c,
        _ => unreachable!(),
    };
    assert_eq!(counter.capacity, 1024);
    assert_eq!(counter.width, 32);
    assert_eq!(counter.saturation_max, Some(100));

    let report = PlanReport::from_plan(with_counter);
    let increment = plan_modules(&report)
        .into_iter()
        .find(|m| matches!(m.module.op, ModuleOp::CounterIncrement { .. }))
        .expect("a counter increment module should be placed");
    if let ModuleOp::CounterIncrement { amount, .. } = &increment.module.op {
        let oracle = StructuralOracle::new();
        assert_eq!(oracle.constant_value(amount), Some(chimera_expr::Value::Integer(1)));
    }
}
