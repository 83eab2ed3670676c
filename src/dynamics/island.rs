//! Island management: partitioning the entity graph into connected
//! components, merging them as edges appear, splitting them as edges
//! vanish, and putting quiet islands to sleep.

use crate::config::{
    ISLAND_ANGULAR_SLEEP_THRESHOLD, ISLAND_LINEAR_SLEEP_THRESHOLD, ISLAND_TIME_TO_SLEEP,
};
use crate::core::graph::{EdgeKind, NodeIndex};
use crate::core::registry::Registry;
use crate::dynamics::solver::IslandMembers;
use crate::shapes::Aabb;
use crate::utils::allocator::EntityId;
use log::debug;
use std::collections::HashSet;

/// A connected component of the entity graph, solved as one unit. Never
/// exposed to the application.
#[derive(Debug, Default, Clone)]
pub struct Island {
    /// Body entities: dynamic residents plus shared static/kinematic nodes.
    pub nodes: Vec<EntityId>,
    pub edges: Vec<(EntityId, EdgeKind)>,
    pub aabb: Aabb,
    /// Simulation time at which the island went quiet.
    pub sleep_timestamp: Option<f64>,
    pub sleeping: bool,
    pub pending_wake: bool,
}

impl Island {
    fn empty() -> Self {
        Self {
            aabb: Aabb::empty(),
            ..Default::default()
        }
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping
    }

    /// Step work list, pruning entities destroyed since the last pass.
    pub fn members(&self, registry: &Registry) -> IslandMembers {
        let mut members = IslandMembers::default();
        for &body in &self.nodes {
            if registry.bodies.contains(body) {
                members.bodies.push(body);
            }
        }
        for &(entity, kind) in &self.edges {
            match kind {
                EdgeKind::Manifold => {
                    if registry.manifolds.contains(entity) {
                        members.manifolds.push(entity);
                    }
                }
                EdgeKind::Constraint => {
                    if registry.constraints.contains(entity) {
                        members.constraints.push(entity);
                    }
                }
            }
        }
        members
    }
}

/// Applies queued graph changes: new nodes and edges are absorbed into
/// islands (creating and merging as needed), and islands flagged by edge
/// or node removal are checked for splits.
pub fn process_graph_changes(registry: &mut Registry) {
    let new_nodes = std::mem::take(&mut registry.new_nodes);
    let new_edges = std::mem::take(&mut registry.new_edges);

    // Edges whose dynamic endpoints already reside in islands connect those
    // islands directly: same island absorbs the edge, different islands
    // merge. The reach pass below only sees island-less nodes.
    let mut reach_seeds: Vec<NodeIndex> = Vec::new();
    for node in new_nodes {
        if registry.graph.is_node_alive(node) && node_island(registry, node).is_none() {
            reach_seeds.push(node);
        }
    }

    for edge in new_edges {
        // Created and destroyed within the same tick.
        if !registry.graph.is_edge_alive(edge) {
            continue;
        }
        let [node0, node1] = registry.graph.edge_nodes(edge);
        let island0 = node_island(registry, node0);
        let island1 = node_island(registry, node1);
        let (edge_entity, kind) = registry.graph.edge_entity(edge);

        match (island0, island1) {
            (Some(a), Some(b)) if a == b => {
                add_edge_to_island(registry, a, edge_entity, kind);
            }
            (Some(a), Some(b)) => {
                let survivor = merge_islands(registry, a, b);
                add_edge_to_island(registry, survivor, edge_entity, kind);
            }
            (Some(a), None) => {
                // The island-less side joins by traversal seeded there.
                add_edge_to_island(registry, a, edge_entity, kind);
                reach_seeds.push(node1);
            }
            (None, Some(b)) => {
                add_edge_to_island(registry, b, edge_entity, kind);
                reach_seeds.push(node0);
            }
            (None, None) => {
                reach_seeds.push(node0);
                reach_seeds.push(node1);
            }
        }
    }

    absorb_components(registry, reach_seeds);

    let split_candidates = std::mem::take(&mut registry.split_candidates);
    let mut seen = HashSet::new();
    for island in split_candidates {
        if seen.insert(island) {
            try_split(registry, island);
        }
    }
}

fn node_island(registry: &Registry, node: NodeIndex) -> Option<EntityId> {
    let entity = registry.graph.node_entity(node);
    let body = registry.bodies.get(entity)?;
    if body.is_dynamic() {
        body.island
    } else {
        // Shared nodes never pin a component to an island.
        None
    }
}

/// Traverses from the seeds, stopping at existing island boundaries, and
/// folds each reached component into a new, an existing, or a merged
/// island.
fn absorb_components(registry: &mut Registry, seeds: Vec<NodeIndex>) {
    if seeds.is_empty() {
        return;
    }

    struct Component {
        nodes: Vec<NodeIndex>,
        edges: Vec<(EntityId, EdgeKind)>,
        touched: Vec<EntityId>,
    }

    let components: Vec<Component> = {
        let graph = &registry.graph;
        let bodies = &registry.bodies;
        // The reach callbacks all feed one accumulator.
        let state = std::cell::RefCell::new((Component {
            nodes: Vec::new(),
            edges: Vec::new(),
            touched: Vec::new(),
        }, Vec::new()));

        let seeds: Vec<NodeIndex> = seeds
            .into_iter()
            .filter(|&n| node_island(registry, n).is_none())
            .collect();

        graph.reach(
            seeds,
            &mut |node: NodeIndex| state.borrow_mut().0.nodes.push(node),
            &mut |edge| {
                let (entity, kind) = graph.edge_entity(edge);
                state.borrow_mut().0.edges.push((entity, kind));
            },
            &mut |node: NodeIndex| {
                let entity = graph.node_entity(node);
                match bodies.get(entity) {
                    Some(body) if body.is_dynamic() => match body.island {
                        Some(island) => {
                            let mut guard = state.borrow_mut();
                            if !guard.0.touched.contains(&island) {
                                guard.0.touched.push(island);
                            }
                            false
                        }
                        None => true,
                    },
                    Some(_) => true,
                    None => false,
                }
            },
            &mut || {
                let mut guard = state.borrow_mut();
                let component = std::mem::replace(
                    &mut guard.0,
                    Component {
                        nodes: Vec::new(),
                        edges: Vec::new(),
                        touched: Vec::new(),
                    },
                );
                guard.1.push(component);
            },
        );

        state.into_inner().1
    };

    for component in components {
        // A lone shared node reached from no dynamic body carries no island.
        let has_dynamic = component
            .nodes
            .iter()
            .any(|&n| registry.graph.is_connecting(n));
        if !has_dynamic && component.touched.is_empty() {
            continue;
        }

        // An island recorded as touched may have been merged away by an
        // earlier component in this same pass.
        let touched: Vec<EntityId> = component
            .touched
            .iter()
            .copied()
            .filter(|&id| registry.islands.contains(id))
            .collect();

        let target = match touched.len() {
            0 => registry.islands.insert(Island::empty()),
            1 => touched[0],
            _ => {
                let mut survivor = touched[0];
                for &other in &touched[1..] {
                    survivor = merge_islands(registry, survivor, other);
                }
                survivor
            }
        };

        let node_entities: Vec<EntityId> = component
            .nodes
            .iter()
            .map(|&n| registry.graph.node_entity(n))
            .collect();
        for entity in node_entities {
            add_node_to_island(registry, target, entity);
        }
        for (entity, kind) in component.edges {
            add_edge_to_island(registry, target, entity, kind);
        }
        wake_island(registry, target);
    }
}

fn add_node_to_island(registry: &mut Registry, island_id: EntityId, body_id: EntityId) {
    if !registry.islands.contains(island_id) {
        return;
    }
    let Some(body) = registry.bodies.get_mut(body_id) else {
        return;
    };
    if body.is_dynamic() {
        body.island = Some(island_id);
    } else if !body.multi_islands.contains(&island_id) {
        body.multi_islands.push(island_id);
    }
    let island = registry.islands.get_mut(island_id).unwrap();
    if !island.nodes.contains(&body_id) {
        island.nodes.push(body_id);
    }
}

fn add_edge_to_island(
    registry: &mut Registry,
    island_id: EntityId,
    entity: EntityId,
    kind: EdgeKind,
) {
    let Some(island) = registry.islands.get_mut(island_id) else {
        return;
    };
    if !island.edges.contains(&(entity, kind)) {
        island.edges.push((entity, kind));
    }
    // An edge may bring a shared static endpoint with it.
    let endpoints = match kind {
        EdgeKind::Manifold => registry
            .manifolds
            .get(entity)
            .map(|m| (m.body_a, m.body_b)),
        EdgeKind::Constraint => registry
            .constraints
            .get(entity)
            .map(|c| (c.body_a, c.body_b)),
    };
    if let Some((a, b)) = endpoints {
        for body in [a, b] {
            let is_shared = registry
                .bodies
                .get(body)
                .map(|b| !b.is_dynamic())
                .unwrap_or(false);
            if is_shared {
                add_node_to_island(registry, island_id, body);
            }
        }
    }
}

/// Merges two islands, keeping the one with more nodes. The survivor is
/// woken.
fn merge_islands(registry: &mut Registry, a: EntityId, b: EntityId) -> EntityId {
    if a == b {
        return a;
    }
    let len_a = registry.islands.get(a).map(|i| i.nodes.len()).unwrap_or(0);
    let len_b = registry.islands.get(b).map(|i| i.nodes.len()).unwrap_or(0);
    let (survivor, absorbed) = if len_a >= len_b { (a, b) } else { (b, a) };

    let Some(old) = registry.islands.remove(absorbed) else {
        return survivor;
    };
    debug!(
        "merging island {:?} ({} nodes) into {:?}",
        absorbed,
        old.nodes.len(),
        survivor
    );

    for body_id in old.nodes {
        if let Some(body) = registry.bodies.get_mut(body_id) {
            body.multi_islands.retain(|&i| i != absorbed);
        }
        add_node_to_island(registry, survivor, body_id);
    }
    for (entity, kind) in old.edges {
        add_edge_to_island(registry, survivor, entity, kind);
    }
    wake_island(registry, survivor);
    survivor
}

/// Re-derives connectivity for an island that lost an edge or node. Each
/// resulting component keeps or receives an island; static multi-residents
/// get their residency recomputed.
fn try_split(registry: &mut Registry, island_id: EntityId) {
    let Some(island) = registry.islands.get(island_id) else {
        return;
    };
    let old_nodes = island.nodes.clone();

    // Detach all members, then re-absorb components from the surviving
    // connecting nodes.
    let mut seeds = Vec::new();
    for &body_id in &old_nodes {
        let Some(body) = registry.bodies.get_mut(body_id) else {
            continue;
        };
        if body.is_dynamic() {
            body.island = None;
            seeds.push(body.node);
        } else {
            body.multi_islands.retain(|&i| i != island_id);
        }
    }

    {
        let island = registry.islands.get_mut(island_id).unwrap();
        island.nodes.clear();
        island.edges.clear();
    }

    let before = registry.islands.len();
    // Reuse the island entity for the first component so an intact island
    // keeps its identity.
    absorb_into_existing(registry, island_id, &mut seeds);
    absorb_components(registry, seeds);
    let after = registry.islands.len();

    // Nothing reached the original island: all members vanished.
    let now_empty = registry
        .islands
        .get(island_id)
        .map(|i| i.nodes.is_empty())
        .unwrap_or(true);
    if now_empty {
        registry.islands.remove(island_id);
    }

    if after > before {
        debug!("island {island_id:?} split into {} islands", after - before + 1);
    }
}

/// Absorbs the first component reachable from the seeds into `island_id`,
/// leaving the remaining seeds for fresh islands.
fn absorb_into_existing(registry: &mut Registry, island_id: EntityId, seeds: &mut Vec<NodeIndex>) {
    let Some(&first) = seeds.first() else {
        return;
    };

    let mut nodes = Vec::new();
    let mut edges = Vec::new();
    {
        let graph = &registry.graph;
        let bodies = &registry.bodies;
        graph.reach(
            [first],
            &mut |node| nodes.push(node),
            &mut |edge| edges.push(graph.edge_entity(edge)),
            &mut |node| {
                let entity = graph.node_entity(node);
                bodies
                    .get(entity)
                    .map(|body| !body.is_dynamic() || body.island.is_none())
                    .unwrap_or(false)
            },
            &mut || {},
        );
    }

    let node_set: HashSet<NodeIndex> = nodes.iter().copied().collect();
    seeds.retain(|n| !node_set.contains(n));

    for node in nodes {
        let entity = registry.graph.node_entity(node);
        add_node_to_island(registry, island_id, entity);
    }
    for (entity, kind) in edges {
        add_edge_to_island(registry, island_id, entity, kind);
    }
    wake_island(registry, island_id);
}

pub fn wake_island(registry: &mut Registry, island_id: EntityId) {
    if let Some(island) = registry.islands.get_mut(island_id) {
        island.sleeping = false;
        island.sleep_timestamp = None;
        island.pending_wake = false;
    }
}

/// Sleep bookkeeping for one island after its step. Quiet islands sleep
/// after [`ISLAND_TIME_TO_SLEEP`] seconds; any member above the velocity
/// thresholds, or tagged sleeping-disabled, resets the timer.
pub fn update_island_sleep(registry: &mut Registry, island_id: EntityId, now: f64) {
    let Some(island) = registry.islands.get(island_id) else {
        return;
    };
    if island.pending_wake {
        wake_island(registry, island_id);
        return;
    }

    let mut can_sleep = true;
    let mut aabb = Aabb::empty();
    for &body_id in &island.nodes {
        let Some(body) = registry.bodies.get(body_id) else {
            continue;
        };
        aabb = aabb.union(&body.aabb);
        if !body.is_dynamic() {
            continue;
        }
        if body.sleeping_disabled
            || body.velocity.linear.length() > ISLAND_LINEAR_SLEEP_THRESHOLD
            || body.velocity.angular.length() > ISLAND_ANGULAR_SLEEP_THRESHOLD
        {
            can_sleep = false;
        }
    }

    let node_ids: Vec<EntityId> = island.nodes.clone();
    let island = registry.islands.get_mut(island_id).unwrap();
    island.aabb = aabb;

    if !can_sleep {
        island.sleep_timestamp = None;
        island.sleeping = false;
        return;
    }

    match island.sleep_timestamp {
        None => island.sleep_timestamp = Some(now),
        Some(since) if now - since >= ISLAND_TIME_TO_SLEEP as f64 && !island.sleeping => {
            island.sleeping = true;
            debug!("island {island_id:?} sleeping");
            for body_id in node_ids {
                if let Some(body) = registry.bodies.get_mut(body_id) {
                    if body.is_dynamic() {
                        body.velocity.linear = glam::Vec3::ZERO;
                        body.velocity.angular = glam::Vec3::ZERO;
                    }
                }
            }
        }
        _ => {}
    }
}
