//! Layered (Sugiyama-style) layout of a parsed DOT graph.
//!
//! Cycles are broken by reversing DFS back edges, ranks are longest-path
//! distances from the sources, rank order is refined with barycenter sweeps
//! and coordinates are assigned rank by rank. All units are points (1/72 in).

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use strum_macros::{AsRefStr, Display, EnumString};

use super::LayoutError;
use super::dot::{Attrs, Graph};

const POINTS_PER_INCH: f64 = 72.0;
const CLUSTER_PADDING: f64 = 8.0;
const ORDERING_SWEEPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr, Display)]
#[strum(ascii_case_insensitive)]
pub enum RankDir {
    #[default]
    #[strum(serialize = "TB")]
    TopBottom,
    #[strum(serialize = "LR")]
    LeftRight,
    #[strum(serialize = "BT")]
    BottomTop,
    #[strum(serialize = "RL")]
    RightLeft,
}

impl RankDir {
    fn is_horizontal(self) -> bool {
        matches!(self, RankDir::LeftRight | RankDir::RightLeft)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shape {
    #[default]
    Ellipse,
    Box,
    Circle,
    Diamond,
    Point,
    Plain,
}

impl Shape {
    pub fn from_attrs(attrs: &Attrs) -> Self {
        match attrs.get("shape").map(|s| s.to_ascii_lowercase()).as_deref() {
            Some("box" | "rect" | "rectangle" | "square" | "record" | "mrecord") => Shape::Box,
            Some("circle" | "doublecircle") => Shape::Circle,
            Some("diamond") => Shape::Diamond,
            Some("point") => Shape::Point,
            Some("plaintext" | "plain" | "none") => Shape::Plain,
            _ => Shape::Ellipse,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayoutConfig {
    pub rankdir: RankDir,
    pub node_sep: f64,
    pub rank_sep: f64,
    pub margin: f64,
    pub font_size: f64,
    pub char_width: f64,
    pub min_width: f64,
    pub min_height: f64,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            rankdir: RankDir::TopBottom,
            node_sep: 0.25 * POINTS_PER_INCH,
            rank_sep: 0.5 * POINTS_PER_INCH,
            margin: 8.0,
            font_size: 14.0,
            char_width: 7.5,
            min_width: 0.75 * POINTS_PER_INCH,
            min_height: 0.5 * POINTS_PER_INCH,
        }
    }
}

impl LayoutConfig {
    /// Defaults overridden by the graph's `rankdir`, `nodesep` and `ranksep` (inches).
    pub fn for_graph(graph: &Graph) -> Result<Self, LayoutError> {
        let mut config = Self::default();
        if let Some(dir) = graph.attr("rankdir") {
            config.rankdir =
                RankDir::from_str(dir).map_err(|_| LayoutError::Unsupported(format!("rankdir={}", dir)))?;
        }
        if let Some(sep) = graph.attr("nodesep").and_then(|s| s.parse::<f64>().ok()) {
            config.node_sep = sep.max(0.02) * POINTS_PER_INCH;
        }
        if let Some(sep) = graph
            .attr("ranksep")
            .and_then(|s| s.split_whitespace().next())
            .and_then(|s| s.parse::<f64>().ok())
        {
            config.rank_sep = sep.max(0.02) * POINTS_PER_INCH;
        }
        Ok(config)
    }

    pub fn line_height(&self) -> f64 {
        self.font_size * 1.2
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeBox {
    pub id: String,
    pub label: Vec<String>,
    pub shape: Shape,
    /// Centre.
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub rank: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EdgeShape {
    Line,
    /// Quadratic curve through `points[1]`, used to separate parallel edges.
    Curve,
    /// Cubic loop, `points` holds start, two control points and end.
    SelfLoop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgePath {
    pub from: String,
    pub to: String,
    pub shape: EdgeShape,
    pub points: Vec<(f64, f64)>,
    pub label: Vec<String>,
    pub label_pos: (f64, f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClusterBox {
    pub id: String,
    pub label: Vec<String>,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Layout {
    pub width: f64,
    pub height: f64,
    pub rankdir: RankDir,
    pub nodes: Vec<NodeBox>,
    pub edges: Vec<EdgePath>,
    pub clusters: Vec<ClusterBox>,
    pub label: Vec<String>,
    pub label_pos: (f64, f64),
}

impl Layout {
    pub fn node(&self, id: &str) -> Option<&NodeBox> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Splits a DOT label on its `\n`, `\l` and `\r` line escapes.
pub fn label_lines(label: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut chars = label.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n' | 'l' | 'r') => {
                    chars.next();
                    lines.push(std::mem::take(&mut current));
                    continue;
                }
                Some('\\') => {
                    chars.next();
                    current.push('\\');
                    continue;
                }
                _ => {}
            }
        }
        current.push(c);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

pub fn compute(graph: &Graph, config: &LayoutConfig) -> Result<Layout, LayoutError> {
    let mut nodes: Vec<NodeBox> = graph
        .nodes
        .iter()
        .map(|node| {
            let shape = Shape::from_attrs(&node.attrs);
            let label = label_lines(node.label());
            let (width, height) = node_size(&label, shape, &node.attrs, config);
            NodeBox {
                id: node.id.clone(),
                label,
                shape,
                x: 0.0,
                y: 0.0,
                width,
                height,
                rank: 0,
            }
        })
        .collect();
    let index: HashMap<&str, usize> = graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.as_str(), i))
        .collect();

    let ranks = assign_ranks(graph, &index)?;
    for (node, rank) in nodes.iter_mut().zip(&ranks) {
        node.rank = *rank;
    }

    let rank_count = ranks.iter().copied().max().map_or(0, |r| r + 1);
    let mut buckets: Vec<Vec<usize>> = vec![Vec::new(); rank_count];
    for (i, rank) in ranks.iter().enumerate() {
        buckets[*rank].push(i);
    }
    order_buckets(&mut buckets, graph, &index);

    place_nodes(&mut nodes, &buckets, config);

    let mut clusters = cluster_boxes(graph, &nodes, &index, config);
    let mut label = graph.attr("label").map(label_lines).unwrap_or_default();
    if label.iter().all(|l| l.is_empty()) {
        label.clear();
    }

    // normalise so everything starts at the margin
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (0.0_f64, 0.0_f64);
    for n in &nodes {
        min_x = min_x.min(n.x - n.width / 2.0);
        min_y = min_y.min(n.y - n.height / 2.0);
        max_x = max_x.max(n.x + n.width / 2.0);
        max_y = max_y.max(n.y + n.height / 2.0);
    }
    for c in &clusters {
        min_x = min_x.min(c.x);
        min_y = min_y.min(c.y);
        max_x = max_x.max(c.x + c.width);
        max_y = max_y.max(c.y + c.height);
    }
    if nodes.is_empty() {
        min_x = 0.0;
        min_y = 0.0;
    }
    let dx = config.margin - min_x;
    let dy = config.margin - min_y;
    for n in nodes.iter_mut() {
        n.x += dx;
        n.y += dy;
    }
    for c in clusters.iter_mut() {
        c.x += dx;
        c.y += dy;
    }

    let mut width = (max_x + dx + config.margin).max(2.0 * config.margin);
    let mut height = (max_y + dy + config.margin).max(2.0 * config.margin);
    let label_width = label.iter().map(|l| text_width(l, config)).fold(0.0, f64::max);
    width = width.max(label_width + 2.0 * config.margin);
    let label_pos = (width / 2.0, height + config.line_height() * 0.5);
    if !label.is_empty() {
        height += label.len() as f64 * config.line_height() + config.margin;
    }

    let edges = route_edges(graph, &nodes, &index, config);

    Ok(Layout {
        width,
        height,
        rankdir: config.rankdir,
        nodes,
        edges,
        clusters,
        label,
        label_pos,
    })
}

fn text_width(text: &str, config: &LayoutConfig) -> f64 {
    text.chars().count() as f64 * config.char_width
}

fn node_size(label: &[String], shape: Shape, attrs: &Attrs, config: &LayoutConfig) -> (f64, f64) {
    if shape == Shape::Point {
        return (8.0, 8.0);
    }
    let text_w = label.iter().map(|l| text_width(l, config)).fold(0.0, f64::max);
    let text_h = label.len() as f64 * config.line_height();
    let (mut width, mut height) = match shape {
        Shape::Ellipse => (text_w * 1.4 + 16.0, text_h * 1.4 + 8.0),
        Shape::Diamond => (text_w * 2.0 + 16.0, text_h * 2.0 + 8.0),
        Shape::Plain => (text_w + 8.0, text_h + 4.0),
        _ => (text_w + 24.0, text_h + 12.0),
    };
    if shape != Shape::Plain {
        width = width.max(config.min_width);
        height = height.max(config.min_height);
    }
    if let Some(w) = attrs.get("width").and_then(|s| s.parse::<f64>().ok()) {
        width = width.max(w * POINTS_PER_INCH);
    }
    if let Some(h) = attrs.get("height").and_then(|s| s.parse::<f64>().ok()) {
        height = height.max(h * POINTS_PER_INCH);
    }
    if shape == Shape::Circle {
        let side = width.max(height);
        return (side, side);
    }
    (width, height)
}

fn assign_ranks(graph: &Graph, index: &HashMap<&str, usize>) -> Result<Vec<usize>, LayoutError> {
    let mut g: DiGraph<usize, ()> = DiGraph::new();
    let handles: Vec<NodeIndex> = (0..graph.nodes.len()).map(|i| g.add_node(i)).collect();
    for edge in &graph.edges {
        if edge.from == edge.to {
            continue;
        }
        let (Some(&a), Some(&b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) else {
            continue;
        };
        g.add_edge(handles[a], handles[b], ());
    }

    let back_edges = back_edges(&g);

    let mut dag: DiGraph<usize, ()> = DiGraph::new();
    let dag_handles: Vec<NodeIndex> = (0..graph.nodes.len()).map(|i| dag.add_node(i)).collect();
    for edge in g.raw_edges() {
        let (u, v) = (edge.source(), edge.target());
        if back_edges.contains(&(u, v)) {
            dag.add_edge(dag_handles[v.index()], dag_handles[u.index()], ());
        } else {
            dag.add_edge(dag_handles[u.index()], dag_handles[v.index()], ());
        }
    }

    let order = toposort(&dag, None)
        .map_err(|cycle| LayoutError::Engine(format!("unbroken cycle at node {}", cycle.node_id().index())))?;
    let mut ranks = vec![0usize; graph.nodes.len()];
    for n in order {
        let rank = ranks[n.index()];
        for next in dag.neighbors(n) {
            ranks[next.index()] = ranks[next.index()].max(rank + 1);
        }
    }
    Ok(ranks)
}

/// Edges closing a cycle in a depth-first walk from each unvisited node in
/// index order. Walks with an explicit stack; graphs may be long chains.
fn back_edges(g: &DiGraph<usize, ()>) -> HashSet<(NodeIndex, NodeIndex)> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        New,
        Open,
        Closed,
    }

    let mut mark = vec![Mark::New; g.node_count()];
    let mut back = HashSet::new();
    for root in g.node_indices() {
        if mark[root.index()] != Mark::New {
            continue;
        }
        mark[root.index()] = Mark::Open;
        let mut stack = vec![(root, g.neighbors(root).detach())];
        while let Some(top) = stack.last_mut() {
            let u = top.0;
            match top.1.next_node(g) {
                Some(v) => match mark[v.index()] {
                    Mark::New => {
                        mark[v.index()] = Mark::Open;
                        stack.push((v, g.neighbors(v).detach()));
                    }
                    Mark::Open => {
                        back.insert((u, v));
                    }
                    Mark::Closed => {}
                },
                None => {
                    mark[u.index()] = Mark::Closed;
                    stack.pop();
                }
            }
        }
    }
    back
}

fn order_buckets(buckets: &mut [Vec<usize>], graph: &Graph, index: &HashMap<&str, usize>) {
    if buckets.len() <= 1 {
        return;
    }
    let mut preds: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut succs: HashMap<usize, Vec<usize>> = HashMap::new();
    for edge in &graph.edges {
        let (Some(&a), Some(&b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) else {
            continue;
        };
        if a == b {
            continue;
        }
        succs.entry(a).or_default().push(b);
        preds.entry(b).or_default().push(a);
    }

    let mut position: HashMap<usize, usize> = HashMap::new();
    let refresh = |bucket: &[usize], position: &mut HashMap<usize, usize>| {
        for (i, n) in bucket.iter().enumerate() {
            position.insert(*n, i);
        }
    };
    for bucket in buckets.iter() {
        refresh(bucket, &mut position);
    }

    let sort = |bucket: &mut Vec<usize>, neighbours: &HashMap<usize, Vec<usize>>, position: &HashMap<usize, usize>| {
        let mut keyed: Vec<(f64, usize, usize)> = bucket
            .iter()
            .enumerate()
            .map(|(current, n)| {
                let score = neighbours
                    .get(n)
                    .filter(|list| !list.is_empty())
                    .map(|list| {
                        list.iter().map(|m| *position.get(m).unwrap_or(&0) as f64).sum::<f64>() / list.len() as f64
                    })
                    .unwrap_or(current as f64);
                (score, current, *n)
            })
            .collect();
        keyed.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        *bucket = keyed.into_iter().map(|(_, _, n)| n).collect();
    };

    for _ in 0..ORDERING_SWEEPS {
        for rank in 1..buckets.len() {
            sort(&mut buckets[rank], &preds, &position);
            refresh(&buckets[rank], &mut position);
        }
        for rank in (0..buckets.len() - 1).rev() {
            sort(&mut buckets[rank], &succs, &position);
            refresh(&buckets[rank], &mut position);
        }
    }
}

/// Places node centres. Ranks run along the "depth" axis, order within a rank
/// along the "breadth" axis; the axes are swapped for LR/RL.
fn place_nodes(nodes: &mut [NodeBox], buckets: &[Vec<usize>], config: &LayoutConfig) {
    let horizontal = config.rankdir.is_horizontal();
    let breadth_of = |n: &NodeBox| if horizontal { n.height } else { n.width };
    let depth_of = |n: &NodeBox| if horizontal { n.width } else { n.height };

    let rank_breadth: Vec<f64> = buckets
        .iter()
        .map(|bucket| {
            let sum: f64 = bucket.iter().map(|&i| breadth_of(&nodes[i])).sum();
            sum + config.node_sep * bucket.len().saturating_sub(1) as f64
        })
        .collect();
    let max_breadth = rank_breadth.iter().copied().fold(0.0, f64::max);

    let mut depth_cursor = 0.0;
    let mut rank_centres = Vec::with_capacity(buckets.len());
    for bucket in buckets {
        let extent = bucket.iter().map(|&i| depth_of(&nodes[i])).fold(0.0, f64::max);
        rank_centres.push(depth_cursor + extent / 2.0);
        depth_cursor += extent + config.rank_sep;
    }
    let total_depth = (depth_cursor - config.rank_sep).max(0.0);

    for (rank, bucket) in buckets.iter().enumerate() {
        let mut cursor = (max_breadth - rank_breadth[rank]) / 2.0;
        for &i in bucket {
            let extent = breadth_of(&nodes[i]);
            let breadth = cursor + extent / 2.0;
            cursor += extent + config.node_sep;
            let depth = match config.rankdir {
                RankDir::TopBottom | RankDir::LeftRight => rank_centres[rank],
                RankDir::BottomTop | RankDir::RightLeft => total_depth - rank_centres[rank],
            };
            let (x, y) = if horizontal { (depth, breadth) } else { (breadth, depth) };
            nodes[i].x = x;
            nodes[i].y = y;
        }
    }
}

fn cluster_boxes(
    graph: &Graph,
    nodes: &[NodeBox],
    index: &HashMap<&str, usize>,
    config: &LayoutConfig,
) -> Vec<ClusterBox> {
    let mut boxes = Vec::new();
    for cluster in &graph.clusters {
        let members: Vec<&NodeBox> = cluster
            .nodes
            .iter()
            .filter_map(|id| index.get(id.as_str()).map(|&i| &nodes[i]))
            .collect();
        if members.is_empty() {
            continue;
        }
        let label = cluster.attrs.get("label").map(|l| label_lines(l)).unwrap_or_default();
        let label_room = if label.is_empty() {
            0.0
        } else {
            label.len() as f64 * config.line_height()
        };
        let min_x = members.iter().map(|n| n.x - n.width / 2.0).fold(f64::MAX, f64::min);
        let min_y = members.iter().map(|n| n.y - n.height / 2.0).fold(f64::MAX, f64::min);
        let max_x = members.iter().map(|n| n.x + n.width / 2.0).fold(f64::MIN, f64::max);
        let max_y = members.iter().map(|n| n.y + n.height / 2.0).fold(f64::MIN, f64::max);
        let label_w = label.iter().map(|l| text_width(l, config)).fold(0.0, f64::max);
        let width = (max_x - min_x + 2.0 * CLUSTER_PADDING).max(label_w + 2.0 * CLUSTER_PADDING);
        let centre_x = (min_x + max_x) / 2.0;
        boxes.push(ClusterBox {
            id: cluster.id.clone(),
            label,
            x: centre_x - width / 2.0,
            y: min_y - CLUSTER_PADDING - label_room,
            width,
            height: max_y - min_y + 2.0 * CLUSTER_PADDING + label_room,
        });
    }
    boxes
}

/// Point where the ray from a node's centre towards `(tx, ty)` leaves its outline.
fn clip(node: &NodeBox, tx: f64, ty: f64) -> (f64, f64) {
    let (dx, dy) = (tx - node.x, ty - node.y);
    if dx == 0.0 && dy == 0.0 {
        return (node.x, node.y);
    }
    let (hw, hh) = (node.width / 2.0, node.height / 2.0);
    let t = match node.shape {
        Shape::Ellipse | Shape::Circle | Shape::Point => 1.0 / ((dx / hw).powi(2) + (dy / hh).powi(2)).sqrt(),
        Shape::Diamond => 1.0 / (dx.abs() / hw + dy.abs() / hh),
        Shape::Box | Shape::Plain => {
            let tx = if dx == 0.0 { f64::MAX } else { hw / dx.abs() };
            let ty = if dy == 0.0 { f64::MAX } else { hh / dy.abs() };
            tx.min(ty)
        }
    };
    (node.x + dx * t, node.y + dy * t)
}

fn route_edges(graph: &Graph, nodes: &[NodeBox], index: &HashMap<&str, usize>, config: &LayoutConfig) -> Vec<EdgePath> {
    let mut seen: HashMap<(usize, usize), usize> = HashMap::new();
    let mut paths = Vec::with_capacity(graph.edges.len());
    for edge in &graph.edges {
        let (Some(&a), Some(&b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str())) else {
            continue;
        };
        let label = edge.attrs.get("label").map(|l| label_lines(l)).unwrap_or_default();
        let (src, dst) = (&nodes[a], &nodes[b]);

        if a == b {
            let (hw, hh) = (src.width / 2.0, src.height / 2.0);
            let loop_size = config.node_sep.max(18.0);
            let start = (src.x + hw * 0.7, src.y - hh * 0.7);
            let end = (src.x + hw * 0.7, src.y + hh * 0.7);
            let c1 = (src.x + hw + loop_size, src.y - hh - loop_size * 0.3);
            let c2 = (src.x + hw + loop_size, src.y + hh + loop_size * 0.3);
            paths.push(EdgePath {
                from: edge.from.clone(),
                to: edge.to.clone(),
                shape: EdgeShape::SelfLoop,
                points: vec![start, c1, c2, end],
                label,
                label_pos: (src.x + hw + loop_size + 4.0, src.y),
            });
            continue;
        }

        let key = (a.min(b), a.max(b));
        let nth = *seen.entry(key).and_modify(|n| *n += 1).or_insert(0);
        if nth == 0 {
            let start = clip(src, dst.x, dst.y);
            let end = clip(dst, src.x, src.y);
            let mid = ((start.0 + end.0) / 2.0, (start.1 + end.1) / 2.0);
            paths.push(EdgePath {
                from: edge.from.clone(),
                to: edge.to.clone(),
                shape: EdgeShape::Line,
                points: vec![start, end],
                label,
                label_pos: (mid.0 + 4.0, mid.1),
            });
        } else {
            // alternate sides, growing the bend for each further parallel edge
            let side = if nth % 2 == 1 { 1.0 } else { -1.0 };
            let bend = side * config.node_sep * nth.div_ceil(2) as f64;
            // normal taken in a fixed direction so a->b and b->a bend apart
            let (p, q) = if a < b { (src, dst) } else { (dst, src) };
            let (dx, dy) = (q.x - p.x, q.y - p.y);
            let len = (dx * dx + dy * dy).sqrt().max(1.0);
            let (nx, ny) = (-dy / len, dx / len);
            let control = ((src.x + dst.x) / 2.0 + nx * bend * 2.0, (src.y + dst.y) / 2.0 + ny * bend * 2.0);
            let start = clip(src, control.0, control.1);
            let end = clip(dst, control.0, control.1);
            let apex = (
                0.25 * start.0 + 0.5 * control.0 + 0.25 * end.0,
                0.25 * start.1 + 0.5 * control.1 + 0.25 * end.1,
            );
            paths.push(EdgePath {
                from: edge.from.clone(),
                to: edge.to.clone(),
                shape: EdgeShape::Curve,
                points: vec![start, control, end],
                label,
                label_pos: (apex.0 + 4.0, apex.1),
            });
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::dot::parse;

    fn layout(src: &str) -> Layout {
        let graph = parse(src).unwrap();
        let config = LayoutConfig::for_graph(&graph).unwrap();
        compute(&graph, &config).unwrap()
    }

    #[test]
    fn test_chain_is_ranked_top_to_bottom() {
        let l = layout("digraph { a -> b -> c }");
        let (a, b, c) = (l.node("a").unwrap(), l.node("b").unwrap(), l.node("c").unwrap());
        assert_eq!((a.rank, b.rank, c.rank), (0, 1, 2));
        assert!(a.y < b.y && b.y < c.y);
        assert!((a.x - c.x).abs() < 1e-6);
    }

    #[test]
    fn test_longest_path_ranking() {
        let l = layout("digraph { a -> b -> c; a -> c }");
        assert_eq!(l.node("c").unwrap().rank, 2);
    }

    #[test]
    fn test_cycles_are_broken() {
        let l = layout("digraph { a -> b -> c -> a }");
        let mut ranks: Vec<usize> = l.nodes.iter().map(|n| n.rank).collect();
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert_eq!(l.edges.len(), 3);
    }

    #[test]
    fn test_long_chain_and_long_cycle() {
        let mut src = String::from("digraph {");
        for i in 0..50_000 {
            src.push_str(&format!("n{i}->"));
        }
        src.push_str("end }");
        let l = layout(&src);
        assert_eq!(l.nodes.len(), 50_001);
        assert_eq!(l.node("end").unwrap().rank, 50_000);

        let mut src = String::from("digraph {");
        for i in 0..50_000 {
            src.push_str(&format!("n{i}->"));
        }
        src.push_str("n0 }");
        let l = layout(&src);
        assert_eq!(l.node("n49999").unwrap().rank, 49_999);
    }

    #[test]
    fn test_rankdir_left_right() {
        let l = layout("digraph { rankdir=LR; a -> b }");
        let (a, b) = (l.node("a").unwrap(), l.node("b").unwrap());
        assert!(a.x < b.x);
        assert!((a.y - b.y).abs() < 1e-6);

        let l = layout("digraph { rankdir=BT; a -> b }");
        assert!(l.node("a").unwrap().y > l.node("b").unwrap().y);

        let graph = parse("digraph { rankdir=XY; a }").unwrap();
        assert!(matches!(LayoutConfig::for_graph(&graph), Err(LayoutError::Unsupported(_))));
    }

    #[test]
    fn test_nodes_stay_inside_canvas_and_do_not_overlap() {
        let l = layout("digraph { a -> {b c d e}; b -> f; e -> f }");
        for n in &l.nodes {
            assert!(n.x - n.width / 2.0 >= 0.0 && n.x + n.width / 2.0 <= l.width);
            assert!(n.y - n.height / 2.0 >= 0.0 && n.y + n.height / 2.0 <= l.height);
        }
        let rank1: Vec<&NodeBox> = l.nodes.iter().filter(|n| n.rank == 1).collect();
        assert_eq!(rank1.len(), 4);
        for (i, p) in rank1.iter().enumerate() {
            for q in rank1.iter().skip(i + 1) {
                assert!((p.x - q.x).abs() >= (p.width + q.width) / 2.0);
            }
        }
    }

    #[test]
    fn test_edge_endpoints_touch_node_outlines() {
        let l = layout("digraph { node [shape=box]; a -> b }");
        let (a, b) = (l.node("a").unwrap(), l.node("b").unwrap());
        let edge = &l.edges[0];
        assert_eq!(edge.shape, EdgeShape::Line);
        let (start, end) = (edge.points[0], edge.points[1]);
        assert!((start.1 - (a.y + a.height / 2.0)).abs() < 1e-6);
        assert!((end.1 - (b.y - b.height / 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_parallel_edges_and_self_loops() {
        let l = layout("digraph { a -> b; a -> b; b -> a; a -> a }");
        let shapes: Vec<EdgeShape> = l.edges.iter().map(|e| e.shape).collect();
        assert_eq!(shapes, vec![EdgeShape::Line, EdgeShape::Curve, EdgeShape::Curve, EdgeShape::SelfLoop]);
        assert_ne!(l.edges[1].points[1], l.edges[2].points[1]);
    }

    #[test]
    fn test_cluster_box_contains_members() {
        let l = layout(r#"digraph { subgraph cluster_x { label="X"; a -> b } c }"#);
        let cluster = &l.clusters[0];
        assert_eq!(cluster.label, vec!["X".to_string()]);
        for id in ["a", "b"] {
            let n = l.node(id).unwrap();
            assert!(n.x - n.width / 2.0 >= cluster.x);
            assert!(n.x + n.width / 2.0 <= cluster.x + cluster.width);
            assert!(n.y - n.height / 2.0 >= cluster.y);
            assert!(n.y + n.height / 2.0 <= cluster.y + cluster.height);
        }
    }

    #[test]
    fn test_label_lines() {
        assert_eq!(label_lines("a\\nb\\lc"), vec!["a", "b", "c"]);
        assert_eq!(label_lines("trailing\\n"), vec!["trailing"]);
        assert_eq!(label_lines(""), vec![""]);
        assert_eq!(label_lines("back\\\\slash"), vec!["back\\slash"]);
    }

    #[test]
    fn test_empty_graph() {
        let l = layout("digraph {}");
        assert!(l.nodes.is_empty());
        assert!(l.width > 0.0 && l.height > 0.0);
    }
}
