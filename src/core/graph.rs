use crate::utils::allocator::EntityId;

pub type NodeIndex = u32;
pub type EdgeIndex = u32;

const NULL_INDEX: u32 = u32::MAX;

/// Which entity class an edge refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Manifold,
    Constraint,
}

struct Node {
    entity: EntityId,
    /// Dynamic bodies connect their neighbors; static and kinematic bodies
    /// terminate traversal.
    connecting: bool,
    edge_head: EdgeIndex,
    alive: bool,
}

struct Edge {
    entity: EntityId,
    kind: EdgeKind,
    nodes: [NodeIndex; 2],
    next: [EdgeIndex; 2],
    prev: [EdgeIndex; 2],
    alive: bool,
}

impl Edge {
    fn side(&self, node: NodeIndex) -> usize {
        if self.nodes[0] == node {
            0
        } else {
            debug_assert_eq!(self.nodes[1], node);
            1
        }
    }
}

/// The entity-relation graph: bodies are nodes, manifolds and constraints are
/// edges. Indices are stable across removals thanks to free lists; adjacency
/// is kept in intrusive doubly-linked per-node edge lists.
#[derive(Default)]
pub struct EntityGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    node_free: Vec<NodeIndex>,
    edge_free: Vec<EdgeIndex>,
    node_count: usize,
    edge_count: usize,
}

impl EntityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn insert_node(&mut self, entity: EntityId, connecting: bool) -> NodeIndex {
        self.node_count += 1;
        let node = Node {
            entity,
            connecting,
            edge_head: NULL_INDEX,
            alive: true,
        };

        if let Some(index) = self.node_free.pop() {
            self.nodes[index as usize] = node;
            index
        } else {
            self.nodes.push(node);
            (self.nodes.len() - 1) as NodeIndex
        }
    }

    /// Removes a node along with every incident edge. Returns the removed
    /// edges so the caller can cascade entity destruction.
    pub fn remove_node(&mut self, index: NodeIndex) -> Vec<(EntityId, EdgeKind)> {
        debug_assert!(self.nodes[index as usize].alive);
        let mut removed = Vec::new();

        let mut edge_index = self.nodes[index as usize].edge_head;
        while edge_index != NULL_INDEX {
            let edge = &self.edges[edge_index as usize];
            let side = edge.side(index);
            let next = edge.next[side];
            removed.push((edge.entity, edge.kind));
            self.remove_edge(edge_index);
            edge_index = next;
        }

        let node = &mut self.nodes[index as usize];
        node.alive = false;
        node.edge_head = NULL_INDEX;
        self.node_free.push(index);
        self.node_count -= 1;
        removed
    }

    pub fn insert_edge(
        &mut self,
        entity: EntityId,
        kind: EdgeKind,
        node0: NodeIndex,
        node1: NodeIndex,
    ) -> EdgeIndex {
        debug_assert!(self.nodes[node0 as usize].alive && self.nodes[node1 as usize].alive);
        self.edge_count += 1;

        let edge = Edge {
            entity,
            kind,
            nodes: [node0, node1],
            next: [NULL_INDEX; 2],
            prev: [NULL_INDEX; 2],
            alive: true,
        };

        let index = if let Some(index) = self.edge_free.pop() {
            self.edges[index as usize] = edge;
            index
        } else {
            self.edges.push(edge);
            (self.edges.len() - 1) as EdgeIndex
        };

        self.link(index, 0, node0);
        if node0 != node1 {
            self.link(index, 1, node1);
        }
        index
    }

    fn link(&mut self, edge_index: EdgeIndex, side: usize, node: NodeIndex) {
        let head = self.nodes[node as usize].edge_head;
        self.edges[edge_index as usize].next[side] = head;
        if head != NULL_INDEX {
            let head_side = self.edges[head as usize].side(node);
            self.edges[head as usize].prev[head_side] = edge_index;
        }
        self.nodes[node as usize].edge_head = edge_index;
    }

    pub fn remove_edge(&mut self, index: EdgeIndex) {
        debug_assert!(self.edges[index as usize].alive);
        let nodes = self.edges[index as usize].nodes;

        self.unlink(index, 0, nodes[0]);
        if nodes[0] != nodes[1] {
            self.unlink(index, 1, nodes[1]);
        }

        let edge = &mut self.edges[index as usize];
        edge.alive = false;
        self.edge_free.push(index);
        self.edge_count -= 1;
    }

    fn unlink(&mut self, edge_index: EdgeIndex, side: usize, node: NodeIndex) {
        let (prev, next) = {
            let edge = &self.edges[edge_index as usize];
            (edge.prev[side], edge.next[side])
        };

        if prev != NULL_INDEX {
            let prev_side = self.edges[prev as usize].side(node);
            self.edges[prev as usize].next[prev_side] = next;
        } else {
            self.nodes[node as usize].edge_head = next;
        }

        if next != NULL_INDEX {
            let next_side = self.edges[next as usize].side(node);
            self.edges[next as usize].prev[next_side] = prev;
        }
    }

    pub fn node_entity(&self, index: NodeIndex) -> EntityId {
        self.nodes[index as usize].entity
    }

    pub fn is_node_alive(&self, index: NodeIndex) -> bool {
        self.nodes
            .get(index as usize)
            .map(|n| n.alive)
            .unwrap_or(false)
    }

    pub fn is_edge_alive(&self, index: EdgeIndex) -> bool {
        self.edges
            .get(index as usize)
            .map(|e| e.alive)
            .unwrap_or(false)
    }

    pub fn is_connecting(&self, index: NodeIndex) -> bool {
        self.nodes[index as usize].connecting
    }

    pub fn edge_entity(&self, index: EdgeIndex) -> (EntityId, EdgeKind) {
        let edge = &self.edges[index as usize];
        (edge.entity, edge.kind)
    }

    pub fn edge_nodes(&self, index: EdgeIndex) -> [NodeIndex; 2] {
        self.edges[index as usize].nodes
    }

    pub fn visit_edges(&self, node: NodeIndex, mut f: impl FnMut(EdgeIndex)) {
        let mut edge_index = self.nodes[node as usize].edge_head;
        while edge_index != NULL_INDEX {
            f(edge_index);
            let edge = &self.edges[edge_index as usize];
            edge_index = edge.next[edge.side(node)];
        }
    }

    pub fn visit_neighbors(&self, node: NodeIndex, mut f: impl FnMut(NodeIndex)) {
        self.visit_edges(node, |edge_index| {
            let edge = &self.edges[edge_index as usize];
            let other = edge.nodes[1 - edge.side(node)];
            if other != node {
                f(other);
            }
        });
    }

    /// Bounded traversal from a set of seed nodes. Expansion only crosses
    /// connecting nodes; `should_visit` prunes (the island manager uses it to
    /// stop at nodes already assigned to an island). `on_component` fires
    /// once per maximal reachable subgraph.
    pub fn reach(
        &self,
        seeds: impl IntoIterator<Item = NodeIndex>,
        visit_node: &mut impl FnMut(NodeIndex),
        visit_edge: &mut impl FnMut(EdgeIndex),
        should_visit: &mut impl FnMut(NodeIndex) -> bool,
        on_component: &mut impl FnMut(),
    ) {
        let mut node_visited = vec![false; self.nodes.len()];
        let mut edge_visited = vec![false; self.edges.len()];
        let mut stack = Vec::new();
        let mut non_connecting_visited = Vec::new();

        for seed in seeds {
            if node_visited[seed as usize] || !self.nodes[seed as usize].alive {
                continue;
            }
            if !should_visit(seed) {
                continue;
            }

            stack.push(seed);
            let mut component_touched = false;

            while let Some(node_index) = stack.pop() {
                if node_visited[node_index as usize] {
                    continue;
                }
                node_visited[node_index as usize] = true;
                component_touched = true;
                visit_node(node_index);

                let node = &self.nodes[node_index as usize];
                if !node.connecting {
                    // Remember so shared non-connecting nodes can be visited
                    // again from the next component.
                    non_connecting_visited.push(node_index);
                    continue;
                }

                self.visit_edges(node_index, |edge_index| {
                    if !edge_visited[edge_index as usize] {
                        edge_visited[edge_index as usize] = true;
                        visit_edge(edge_index);
                    }
                    let edge = &self.edges[edge_index as usize];
                    let other = edge.nodes[1 - edge.side(node_index)];
                    if !node_visited[other as usize] && should_visit(other) {
                        stack.push(other);
                    }
                });
            }

            if component_touched {
                on_component();
                for index in non_connecting_visited.drain(..) {
                    node_visited[index as usize] = false;
                }
            }
        }
    }

    /// All connected components under connecting-node traversal. A
    /// non-connecting node shared by several components appears in each.
    pub fn connected_components(&self) -> Vec<Component> {
        // One accumulator shared by the traversal callbacks.
        let state = std::cell::RefCell::new((Component::default(), Vec::new()));

        let seeds = (0..self.nodes.len() as NodeIndex)
            .filter(|&i| self.nodes[i as usize].alive && self.nodes[i as usize].connecting);

        self.reach(
            seeds,
            &mut |node| state.borrow_mut().0.nodes.push(node),
            &mut |edge| state.borrow_mut().0.edges.push(edge),
            &mut |_| true,
            &mut || {
                let mut guard = state.borrow_mut();
                let component = std::mem::take(&mut guard.0);
                guard.1.push(component);
            },
        );

        state.into_inner().1
    }

    pub fn is_single_connected_component(&self) -> bool {
        self.connected_components().len() <= 1
    }
}

/// One maximal reachable subgraph.
#[derive(Debug, Default, Clone)]
pub struct Component {
    pub nodes: Vec<NodeIndex>,
    pub edges: Vec<EdgeIndex>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    #[test]
    fn removing_a_node_removes_incident_edges() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(0), true);
        let b = graph.insert_node(entity(1), true);
        let c = graph.insert_node(entity(2), true);
        graph.insert_edge(entity(10), EdgeKind::Manifold, a, b);
        graph.insert_edge(entity(11), EdgeKind::Constraint, b, c);

        let removed = graph.remove_node(b);
        assert_eq!(removed.len(), 2);
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.node_count(), 2);
    }

    #[test]
    fn traversal_does_not_cross_non_connecting_nodes() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(0), true);
        let ground = graph.insert_node(entity(1), false);
        let b = graph.insert_node(entity(2), true);
        graph.insert_edge(entity(10), EdgeKind::Manifold, a, ground);
        graph.insert_edge(entity(11), EdgeKind::Manifold, ground, b);

        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
        // The ground node is shared by both components.
        assert!(components.iter().all(|c| c.nodes.contains(&ground)));
    }

    #[test]
    fn chain_forms_single_component_until_cut() {
        let mut graph = EntityGraph::new();
        let nodes: Vec<_> = (0..6)
            .map(|i| graph.insert_node(entity(i), true))
            .collect();
        let mut edges = Vec::new();
        for i in 0..5 {
            edges.push(graph.insert_edge(
                entity(10 + i as u32),
                EdgeKind::Constraint,
                nodes[i],
                nodes[i + 1],
            ));
        }

        assert!(graph.is_single_connected_component());

        graph.remove_edge(edges[2]);
        let components = graph.connected_components();
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].nodes.len(), 3);
        assert_eq!(components[1].nodes.len(), 3);
    }

    #[test]
    fn reach_prunes_with_should_visit() {
        let mut graph = EntityGraph::new();
        let a = graph.insert_node(entity(0), true);
        let b = graph.insert_node(entity(1), true);
        let c = graph.insert_node(entity(2), true);
        graph.insert_edge(entity(10), EdgeKind::Manifold, a, b);
        graph.insert_edge(entity(11), EdgeKind::Manifold, b, c);

        let mut visited = Vec::new();
        graph.reach(
            [a],
            &mut |n| visited.push(n),
            &mut |_| {},
            &mut |n| n != c,
            &mut || {},
        );
        assert_eq!(visited, vec![a, b]);
    }
}
