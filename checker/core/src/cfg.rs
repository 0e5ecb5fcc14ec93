// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! CFG post-processing: splitting a whole-function CFG into loop-free CFGs
//! for each loop and the outer body, flattening skip edges, trimming
//! unreachable points and topologically renumbering what remains.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::CheckerResult;
use crate::ir::{BlockCfg, BlockId, BlockKind, BlockPPoint, Exp, PEdge, PPoint};

/// Convert a possibly loop-containing CFG into a list of equivalent
/// loop-free CFGs, innermost loops first and the outer body last. Loop
/// blocks are named `loop:<point>:<line>` after their head in the input
/// CFG, so code motion that does not renumber lines keeps names stable.
/// Skip edges are flattened from every result. Idempotent on loop-free
/// inputs.
pub fn split_loops(whole: &BlockCfg) -> CheckerResult<Vec<BlockCfg>> {
    let mut outer = whole.clone();
    if outer.id().kind() == BlockKind::FunctionWhole {
        outer.set_id(BlockId::make(
            BlockKind::Function,
            outer.id().base_var().clone(),
            None,
        ));
    }

    let mut results = Vec::new();

    // carve loops innermost first: of the current back edge heads, take the
    // one with the smallest natural body. carving replaces the body with a
    // single Loop edge, so outer loops then see the inner loop as one edge.
    loop {
        let heads = back_edge_heads(&outer);
        if heads.is_empty() {
            break;
        }

        let (head, body) = heads
            .into_iter()
            .map(|head| {
                let body = natural_body(&outer, head);
                (head, body)
            })
            .min_by_key(|(head, body)| (body.len(), *head))
            .expect("at least one head");

        let child = carve_loop(&mut outer, head, &body);
        results.push(child);
    }

    for cfg in &mut results {
        normalize(cfg);
        cfg.validate()?;
    }
    normalize(&mut outer);
    outer.validate()?;
    results.push(outer);
    Ok(results)
}

/// Loop heads of the CFG: targets of back edges with respect to a depth
/// first search from the entry point.
fn back_edge_heads(cfg: &BlockCfg) -> BTreeSet<PPoint> {
    let mut heads = BTreeSet::new();
    let mut finished = BTreeSet::new();
    let mut on_stack = BTreeSet::new();

    // iterative DFS with an explicit edge cursor per frame.
    let entry = cfg.entry_point();
    if entry == 0 {
        return heads;
    }
    let mut stack = vec![(entry, 0usize)];
    on_stack.insert(entry);

    while let Some((point, cursor)) = stack.pop() {
        let successors: Vec<PPoint> = cfg
            .outgoing(point)
            .map(|edge| edge.target)
            .filter(|target| *target != 0)
            .collect();
        if cursor < successors.len() {
            stack.push((point, cursor + 1));
            let next = successors[cursor];
            if on_stack.contains(&next) {
                heads.insert(next);
            } else if !finished.contains(&next) {
                on_stack.insert(next);
                stack.push((next, 0));
            }
        } else {
            on_stack.remove(&point);
            finished.insert(point);
        }
    }

    heads
}

/// Natural loop body of `head`: the head plus every point that reaches a
/// back edge source without passing through the head.
fn natural_body(cfg: &BlockCfg, head: PPoint) -> BTreeSet<PPoint> {
    let mut body = BTreeSet::new();
    body.insert(head);

    let back_sources: Vec<PPoint> = cfg
        .incoming(head)
        .map(|edge| edge.source)
        .filter(|source| reaches(cfg, head, *source))
        .collect();

    let mut stack = back_sources;
    while let Some(point) = stack.pop() {
        if !body.insert(point) {
            continue;
        }
        for edge in cfg.incoming(point) {
            if edge.source != head && !body.contains(&edge.source) {
                stack.push(edge.source);
            }
        }
    }
    body
}

/// Whether `to` is reachable from `from` along forward edges.
fn reaches(cfg: &BlockCfg, from: PPoint, to: PPoint) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(point) = stack.pop() {
        if point == to {
            return true;
        }
        if !seen.insert(point) {
            continue;
        }
        for edge in cfg.outgoing(point) {
            if edge.target != 0 {
                stack.push(edge.target);
            }
        }
    }
    false
}

/// Carve the body of `head` out of `outer` into a fresh Loop-kind CFG and
/// replace it in the parent with a single Loop edge. The head point stays
/// in the parent, marked loop-isomorphic to the child's entry; edges that
/// left the body re-attach after the Loop edge.
fn carve_loop(outer: &mut BlockCfg, head: PPoint, body: &BTreeSet<PPoint>) -> BlockCfg {
    let head_location = outer.point_location(head).clone();
    let loop_name = format!("loop:{head}:{}", head_location.line());
    let loop_id = BlockId::make(
        BlockKind::Loop,
        outer.id().base_var().clone(),
        Some(&loop_name),
    );

    let mut child = BlockCfg::new(
        loop_id.clone(),
        head_location.clone(),
        outer
            .loop_heads()
            .iter()
            .find(|h| h.point == head)
            .and_then(|h| h.end_location.clone())
            .unwrap_or_else(|| head_location.clone()),
    );
    child.add_loop_parent(BlockPPoint::new(outer.id().clone(), head));

    // locals used inside the body stay defined in the child.
    for define in outer.variables() {
        child.add_variable(define.var.clone(), define.ty.clone());
    }

    // map body points into the child; a fresh copy of the head receives the
    // back edges and becomes the child's exit.
    let mut point_map: BTreeMap<PPoint, PPoint> = BTreeMap::new();
    for point in body {
        let mapped = child.add_point(outer.point_location(*point).clone());
        point_map.insert(*point, mapped);
    }
    let iter_exit = child.add_point(head_location.clone());
    child.set_entry_point(point_map[&head]);
    child.set_exit_point(iter_exit);

    let mut parent_edges = Vec::new();
    let mut departed: Vec<PEdge> = Vec::new();

    for edge in outer.edges() {
        let source_in = body.contains(&edge.source);
        let target_in = edge.target != 0 && body.contains(&edge.target);

        if source_in {
            let mut moved = edge.clone();
            moved.source = point_map[&edge.source];
            if target_in {
                moved.target = if edge.target == head {
                    iter_exit
                } else {
                    point_map[&edge.target]
                };
                child.add_edge(moved);
            } else {
                // the edge leaves the loop. the child treats it as an
                // abnormal exit of the iteration; the parent re-attaches it
                // after the Loop edge.
                moved.target = 0;
                child.add_edge(moved);
                departed.push(edge.clone());
            }
        } else {
            // edges targeting the head from outside are the loop entries
            // and stay attached to the parent head.
            parent_edges.push(edge.clone());
        }
    }

    // the parent keeps the head, a Loop edge summarizing complete
    // iterations, and a fresh point the departed edges hang from.
    let after = outer.add_point(head_location);
    parent_edges.push(PEdge::loop_edge(head, after, loop_id));
    for edge in departed {
        let mut moved = edge;
        moved.source = after;
        parent_edges.push(moved);
    }

    outer.set_edges(parent_edges);
    outer.add_loop_isomorphic(head);
    let retained: Vec<PPoint> = outer
        .loop_heads()
        .iter()
        .map(|h| h.point)
        .filter(|point| *point != head && !body.contains(point))
        .collect();
    let ends: BTreeMap<PPoint, _> = outer
        .loop_heads()
        .iter()
        .filter_map(|h| h.end_location.clone().map(|loc| (h.point, loc)))
        .collect();
    outer.clear_loop_heads();
    for point in retained {
        outer.add_loop_head(point, ends.get(&point).cloned());
    }

    child
}

/// Flatten skip edges, trim points off every entry-to-exit path, and
/// topologically renumber the remaining points.
fn normalize(cfg: &mut BlockCfg) {
    flatten_skips(cfg);
    trim_unreachable(cfg);
    topo_sort(cfg);
}

/// Contract skip edges. A skip `p -> q` contracts when it is p's only
/// outgoing edge (p merges into q) or q's only incoming edge (q merges into
/// p); entry, exit and loop-isomorphic points are preserved. Any skip that
/// cannot be contracted becomes an always-true assume so no Skip edge
/// survives.
fn flatten_skips(cfg: &mut BlockCfg) {
    // skips to the abnormal exit and degenerate self-skips cannot be
    // contracted; they lose the Skip kind up front.
    let mut edges = cfg.edges().to_vec();
    for edge in &mut edges {
        if edge.is_skip() && (edge.target == 0 || edge.source == edge.target) {
            *edge = PEdge::assume(edge.source, edge.target, Exp::make_int(1), true);
        }
    }
    cfg.set_edges(edges);

    loop {
        let mut contracted = false;

        let skip = cfg.edges().iter().enumerate().find_map(|(index, edge)| {
            edge.is_skip().then_some((index, edge.source, edge.target))
        });
        let Some((index, source, target)) = skip else {
            break;
        };

        let source_out = cfg.outgoing(source).count();
        let target_in = cfg.incoming(target).count();
        let protected = |point: PPoint| cfg.is_loop_isomorphic(point);

        if source_out == 1 && !protected(source) && cfg.exit_point() != source {
            // merge source into target.
            let mut edges = cfg.edges().to_vec();
            edges.remove(index);
            for edge in &mut edges {
                if edge.target == source {
                    edge.target = target;
                }
            }
            cfg.set_edges(edges);
            if cfg.entry_point() == source {
                cfg.set_entry_point(target);
            }
            contracted = true;
        } else if target_in == 1 && !protected(target) && cfg.entry_point() != target {
            // merge target into source.
            let mut edges = cfg.edges().to_vec();
            edges.remove(index);
            for edge in &mut edges {
                if edge.source == target {
                    edge.source = source;
                }
            }
            cfg.set_edges(edges);
            if cfg.exit_point() == target {
                cfg.set_exit_point(source);
            }
            contracted = true;
        }

        if !contracted {
            // keep the shape but lose the Skip kind.
            let mut edges = cfg.edges().to_vec();
            edges[index] = PEdge::assume(source, target, Exp::make_int(1), true);
            cfg.set_edges(edges);
        }
    }
}

/// Remove points with no path from the entry or no path to the exit. This
/// also removes paths that provably loop forever; that is intentional even
/// though it can hide assertions on those paths.
fn trim_unreachable(cfg: &mut BlockCfg) {
    let entry = cfg.entry_point();
    let exit = cfg.exit_point();

    let mut forward = BTreeSet::new();
    let mut stack = vec![entry];
    while let Some(point) = stack.pop() {
        if point == 0 || !forward.insert(point) {
            continue;
        }
        for edge in cfg.outgoing(point) {
            stack.push(edge.target);
        }
    }

    let mut backward = BTreeSet::new();
    let mut stack = vec![exit];
    while let Some(point) = stack.pop() {
        if point == 0 || !backward.insert(point) {
            continue;
        }
        for edge in cfg.incoming(point) {
            stack.push(edge.source);
        }
    }

    // when the exit is unreachable (the function never returns) keep all
    // forward-reachable points rather than emptying the CFG.
    let keep: BTreeSet<PPoint> = if forward.contains(&exit) {
        forward.intersection(&backward).copied().collect()
    } else {
        forward.clone()
    };
    if keep.is_empty() {
        return;
    }

    let edges: Vec<PEdge> = cfg
        .edges()
        .iter()
        .filter(|edge| {
            keep.contains(&edge.source) && (edge.target == 0 || keep.contains(&edge.target))
        })
        .cloned()
        .collect();
    cfg.set_edges(edges);

    let compacted: BTreeMap<PPoint, PPoint> = keep
        .iter()
        .enumerate()
        .map(|(index, point)| (*point, index as PPoint + 1))
        .collect();
    renumber(cfg, |point| compacted.get(&point).copied(), &keep);
}

/// Renumber the points of the CFG so their order forms a topological sort.
/// Ready points are emitted in ascending old index, making the result
/// deterministic for a given shape.
fn topo_sort(cfg: &mut BlockCfg) {
    let count = cfg.point_count() as PPoint;
    let mut indegree: BTreeMap<PPoint, usize> = (1..=count).map(|point| (point, 0)).collect();
    for edge in cfg.edges() {
        if edge.target != 0 {
            *indegree.entry(edge.target).or_default() += 1;
        }
    }

    let mut order = Vec::new();
    let mut ready: BTreeSet<PPoint> = indegree
        .iter()
        .filter_map(|(point, degree)| (*degree == 0).then_some(*point))
        .collect();
    while let Some(point) = ready.iter().next().copied() {
        ready.remove(&point);
        order.push(point);
        for edge in cfg.outgoing(point) {
            if edge.target == 0 {
                continue;
            }
            let degree = indegree.get_mut(&edge.target).expect("target in range");
            *degree -= 1;
            if *degree == 0 {
                ready.insert(edge.target);
            }
        }
    }

    if order.len() != count as usize {
        // a cycle survived; leave the numbering alone.
        return;
    }

    let position: BTreeMap<PPoint, PPoint> = order
        .iter()
        .enumerate()
        .map(|(index, point)| (*point, index as PPoint + 1))
        .collect();
    let keep: BTreeSet<PPoint> = (1..=count).collect();
    renumber(cfg, |point| position.get(&point).copied(), &keep);
}

/// Rebuild the CFG's point-indexed data through a renumbering map.
fn renumber(
    cfg: &mut BlockCfg,
    map: impl Fn(PPoint) -> Option<PPoint>,
    keep: &BTreeSet<PPoint>,
) {
    let mut replacement = BlockCfg::new(
        cfg.id().clone(),
        cfg.begin_location().clone(),
        cfg.end_location().clone(),
    );
    for define in cfg.variables() {
        replacement.add_variable(define.var.clone(), define.ty.clone());
    }
    for parent in cfg.loop_parents() {
        replacement.add_loop_parent(parent.clone());
    }
    replacement.set_annotation_kind(cfg.annotation_kind());
    if let Some(bit) = cfg.annotation_bit() {
        replacement.set_annotation_bit(bit.clone());
    }

    // new point list ordered by new index.
    let mut new_points: Vec<(PPoint, PPoint)> = keep
        .iter()
        .filter_map(|point| map(*point).map(|mapped| (mapped, *point)))
        .collect();
    new_points.sort();
    for (_, old) in &new_points {
        replacement.add_point(cfg.point_location(*old).clone());
    }

    replacement.set_entry_point(map(cfg.entry_point()).unwrap_or(0));
    replacement.set_exit_point(map(cfg.exit_point()).unwrap_or(0));

    for edge in cfg.edges() {
        let Some(source) = map(edge.source) else {
            continue;
        };
        let target = if edge.target == 0 {
            0
        } else {
            match map(edge.target) {
                Some(target) => target,
                None => continue,
            }
        };
        let mut moved = edge.clone();
        moved.source = source;
        moved.target = target;
        replacement.add_edge(moved);
    }

    for head in cfg.loop_heads() {
        if let Some(point) = map(head.point) {
            replacement.add_loop_head(point, head.end_location.clone());
        }
    }
    for point in 1..=cfg.point_count() as PPoint {
        if cfg.is_loop_isomorphic(point) {
            if let Some(mapped) = map(point) {
                replacement.add_loop_isomorphic(mapped);
            }
        }
    }
    for (point, annot) in cfg.point_annotations() {
        if let Some(mapped) = map(*point) {
            replacement.add_point_annotation(mapped, annot.clone());
        }
    }

    *cfg = replacement;
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ir::{BinopKind, Location, Type, VarKind, Variable};

    /// `while (i < n) i++;` with the loop head at line 10.
    fn while_cfg() -> BlockCfg {
        let id = BlockId::make(
            BlockKind::FunctionWhole,
            Variable::make_func("f"),
            None,
        );
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 9),
            Location::make("test.c", 12),
        );
        let i = Exp::make_var(Variable::make(Some(id.clone()), VarKind::Local, "i", None));
        let n = Exp::make_var(Variable::make(Some(id), VarKind::Local, "n", None));
        let cond = Exp::make_compare(BinopKind::LessThan, i.clone(), n);

        let head = cfg.add_point(Location::make("test.c", 10));
        let body = cfg.add_point(Location::make("test.c", 10));
        let exit = cfg.add_point(Location::make("test.c", 12));
        cfg.set_entry_point(head);
        cfg.set_exit_point(exit);

        let ty = Type::make_int(32, true);
        cfg.add_edge(PEdge::assume(head, body, cond.clone(), true));
        cfg.add_edge(PEdge::assign(
            body,
            head,
            ty.clone(),
            i.clone(),
            Exp::make_binop(BinopKind::Plus, i, Exp::make_int(1), 32, true),
        ));
        cfg.add_edge(PEdge::assume(head, exit, cond, false));
        cfg
    }

    #[test]
    fn test_split_while_loop() {
        let whole = while_cfg();
        let cfgs = split_loops(&whole).unwrap();
        assert_eq!(cfgs.len(), 2);

        let child = &cfgs[0];
        let outer = &cfgs[1];

        // the loop is named after its head point and line in the input.
        assert_eq!(child.id().kind(), BlockKind::Loop);
        assert_eq!(child.id().loop_name().unwrap(), "loop:1:10");
        assert_eq!(child.loop_parents().len(), 1);

        // the child is loop-free and one iteration runs entry to exit.
        assert!(back_edge_heads(child).is_empty());
        assert!(child.edges().iter().any(|edge| edge.if_assume().is_some()));

        // the outer body invokes the loop through a single Loop edge.
        let loop_edges: Vec<_> = outer
            .edges()
            .iter()
            .filter(|edge| edge.if_loop().is_some())
            .collect();
        assert_eq!(loop_edges.len(), 1);
        assert_eq!(loop_edges[0].if_loop().unwrap(), child.id());
        assert!(outer.edges().iter().all(|edge| !edge.is_skip()));

        // the head kept in the outer body is isomorphic to the child entry
        // and its only outgoing edge is the Loop edge.
        let head = loop_edges[0].source;
        assert!(outer.is_loop_isomorphic(head));
        assert_eq!(outer.outgoing(head).count(), 1);
    }

    #[test]
    fn test_split_idempotent_on_loop_free() {
        let whole = while_cfg();
        let cfgs = split_loops(&whole).unwrap();
        let outer = &cfgs[1];

        let again = split_loops(outer).unwrap();
        assert_eq!(again.len(), 1);
        assert!(again[0].is_equivalent(outer));
    }

    #[test]
    fn test_split_trims_and_renumbers() {
        let id = BlockId::make(
            BlockKind::FunctionWhole,
            Variable::make_func("g"),
            None,
        );
        let mut cfg = BlockCfg::new(
            id,
            Location::make("test.c", 1),
            Location::make("test.c", 9),
        );
        let a = cfg.add_point(Location::make("test.c", 1));
        let b = cfg.add_point(Location::make("test.c", 2));
        let dead = cfg.add_point(Location::make("test.c", 3));
        let c = cfg.add_point(Location::make("test.c", 4));
        cfg.set_entry_point(a);
        cfg.set_exit_point(c);
        cfg.add_edge(PEdge::skip(a, b));
        cfg.add_edge(PEdge::skip(b, c));
        cfg.add_edge(PEdge::skip(dead, c));

        let cfgs = split_loops(&cfg).unwrap();
        assert_eq!(cfgs.len(), 1);
        let out = &cfgs[0];

        // skips contracted, unreachable point trimmed, points renumbered.
        assert!(out.edges().iter().all(|edge| !edge.is_skip()));
        assert!(out.point_count() <= 2);
        assert_eq!(out.entry_point(), 1);
        out.validate().unwrap();
    }

    #[test]
    fn test_nested_loops_split_innermost_first() {
        let id = BlockId::make(
            BlockKind::FunctionWhole,
            Variable::make_func("h"),
            None,
        );
        let mut cfg = BlockCfg::new(
            id.clone(),
            Location::make("test.c", 1),
            Location::make("test.c", 20),
        );
        let x = Exp::make_var(Variable::make(Some(id), VarKind::Local, "x", None));
        let cond = Exp::make_compare(BinopKind::LessThan, x.clone(), Exp::make_int(10));

        // outer head at line 2, inner head at line 3.
        let outer_head = cfg.add_point(Location::make("test.c", 2));
        let inner_head = cfg.add_point(Location::make("test.c", 3));
        let inner_body = cfg.add_point(Location::make("test.c", 4));
        let exit = cfg.add_point(Location::make("test.c", 20));
        cfg.set_entry_point(outer_head);
        cfg.set_exit_point(exit);

        let ty = Type::make_int(32, true);
        cfg.add_edge(PEdge::assume(outer_head, inner_head, cond.clone(), true));
        cfg.add_edge(PEdge::assign(
            inner_head,
            inner_body,
            ty.clone(),
            x.clone(),
            Exp::make_int(0),
        ));
        // inner back edge and inner exit back to the outer head.
        cfg.add_edge(PEdge::assume(inner_body, inner_head, cond.clone(), true));
        cfg.add_edge(PEdge::assume(inner_body, outer_head, cond.clone(), false));
        cfg.add_edge(PEdge::assume(outer_head, exit, cond, false));

        let cfgs = split_loops(&cfg).unwrap();
        // inner loop, outer loop, function body.
        assert_eq!(cfgs.len(), 3);
        assert_eq!(cfgs[0].id().kind(), BlockKind::Loop);
        assert_eq!(cfgs[1].id().kind(), BlockKind::Loop);
        assert_eq!(cfgs[2].id().kind(), BlockKind::Function);

        // the inner loop was carved first and is named for line 3.
        assert!(cfgs[0].id().loop_name().unwrap().ends_with(":3"));
        assert!(cfgs[1].id().loop_name().unwrap().ends_with(":2"));

        // the outer loop body contains the inner Loop edge.
        assert!(cfgs[1]
            .edges()
            .iter()
            .any(|edge| edge.if_loop() == Some(cfgs[0].id())));
    }
}
