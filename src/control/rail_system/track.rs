use crate::control::rail_system::components::{Block, BlockRegistry};
use crate::general::{BlockId, Line};
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::NodeFiltered;
use std::collections::{HashMap, HashSet};
use tokio::sync::Mutex;

#[derive(Debug)]
struct LineGraph {
    graph: DiGraph<BlockId, f64>,
    nodes: HashMap<BlockId, NodeIndex>,
    /// Array length used by wayside controllers, yard slot 0 included.
    total_blocks: usize,
    yard_exit: BlockId,
    stations: HashMap<String, BlockId>,
    station_numbers: HashMap<BlockId, u16>,
}

/// The static block graph of all loaded lines.
///
/// Connectivity and travel direction live here; the mutable per-block state
/// lives in the CTC's [`BlockRegistry`]. Built once at startup, read-only
/// afterwards.
#[derive(Debug)]
pub struct TrackModel {
    lines: HashMap<Line, LineGraph>,
}

impl TrackModel {
    pub fn lines(&self) -> impl Iterator<Item = Line> + '_ {
        self.lines.keys().copied()
    }

    pub fn contains(&self, line: Line, block: BlockId) -> bool {
        self.lines
            .get(&line)
            .is_some_and(|l| l.nodes.contains_key(&block))
    }

    /// Number of command-array slots on the line (yard slot included).
    pub fn total_blocks(&self, line: Line) -> usize {
        self.lines.get(&line).map_or(0, |l| l.total_blocks)
    }

    /// The block trains enter when leaving the yard.
    pub fn yard_exit(&self, line: Line) -> Option<BlockId> {
        self.lines.get(&line).map(|l| l.yard_exit)
    }

    /// Whether `to` can be reached directly from `from` in travel direction.
    pub fn are_adjacent(&self, line: Line, from: BlockId, to: BlockId) -> bool {
        let Some(l) = self.lines.get(&line) else {
            return false;
        };
        match (l.nodes.get(&from), l.nodes.get(&to)) {
            (Some(&a), Some(&b)) => l.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    pub fn next_hops(&self, line: Line, from: BlockId) -> Vec<BlockId> {
        let Some(l) = self.lines.get(&line) else {
            return Vec::new();
        };
        let Some(&node) = l.nodes.get(&from) else {
            return Vec::new();
        };
        l.graph.neighbors(node).map(|n| l.graph[n]).collect()
    }

    /// Cheapest block sequence from `from` to `to`, cost = block length.
    pub fn shortest_path(&self, line: Line, from: BlockId, to: BlockId) -> Option<Vec<BlockId>> {
        let l = self.lines.get(&line)?;
        let start = *l.nodes.get(&from)?;
        let goal = *l.nodes.get(&to)?;
        let (_cost, path) = astar(
            &l.graph,
            start,
            |node| node == goal,
            |edge| *edge.weight(),
            |_| 0.0,
        )?;
        Some(path.into_iter().map(|n| l.graph[n]).collect())
    }

    /// Like [`TrackModel::shortest_path`], but never routes through the
    /// blocks in `avoid`. Endpoints are exempt from the filter.
    pub fn shortest_path_avoiding(
        &self,
        line: Line,
        from: BlockId,
        to: BlockId,
        avoid: &HashSet<BlockId>,
    ) -> Option<Vec<BlockId>> {
        let l = self.lines.get(&line)?;
        let start = *l.nodes.get(&from)?;
        let goal = *l.nodes.get(&to)?;
        let filtered = NodeFiltered::from_fn(&l.graph, |node| {
            let id = l.graph[node];
            id == from || id == to || !avoid.contains(&id)
        });
        let (_cost, path) = astar(
            &filtered,
            start,
            |node| node == goal,
            |edge| *edge.weight(),
            |_| 0.0,
        )?;
        Some(path.into_iter().map(|n| l.graph[n]).collect())
    }

    /// Looks a station up by its display name, case-insensitive.
    pub fn station_block(&self, line: Line, name: &str) -> Option<BlockId> {
        self.lines
            .get(&line)?
            .stations
            .get(&name.to_ascii_uppercase())
            .copied()
    }

    /// The line-wide station number carried in command frames.
    pub fn station_number(&self, line: Line, block: BlockId) -> Option<u16> {
        self.lines.get(&line)?.station_numbers.get(&block).copied()
    }

    pub fn station_block_by_number(&self, line: Line, number: u16) -> Option<BlockId> {
        let l = self.lines.get(&line)?;
        l.station_numbers
            .iter()
            .find(|(_, &n)| n == number)
            .map(|(&b, _)| b)
    }
}

/// Assembles a [`TrackModel`] and the matching [`BlockRegistry`].
///
/// Mirrors the construction discipline of the line layouts: declare blocks
/// first, then connect them in travel direction; `build` freezes the graph.
#[derive(Debug, Default)]
pub struct Builder {
    blocks: Vec<Block>,
    edges: Vec<(Line, BlockId, BlockId)>,
    yard_exits: HashMap<Line, BlockId>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Declares a block. Re-declaring an id replaces the earlier entry.
    pub fn add_block(&mut self, block: Block) -> &mut Self {
        self.blocks
            .retain(|b| !(b.line == block.line && b.id == block.id));
        self.blocks.push(block);
        self
    }

    /// Directed connection `from -> to` in travel direction.
    pub fn connect(&mut self, line: Line, from: BlockId, to: BlockId) -> &mut Self {
        self.edges.push((line, from, to));
        self
    }

    /// Chains every consecutive pair of `run`.
    pub fn connect_run(&mut self, line: Line, run: &[BlockId]) -> &mut Self {
        for pair in run.windows(2) {
            self.edges.push((line, pair[0], pair[1]));
        }
        self
    }

    pub fn yard_exit(&mut self, line: Line, block: BlockId) -> &mut Self {
        self.yard_exits.insert(line, block);
        self
    }

    pub fn build(self) -> (TrackModel, BlockRegistry) {
        let mut lines: HashMap<Line, LineGraph> = HashMap::new();
        let mut registry: BlockRegistry = HashMap::new();
        let mut lengths: HashMap<(Line, BlockId), f64> = HashMap::new();

        for block in self.blocks {
            lengths.insert((block.line, block.id), block.length_m);
            let entry = lines.entry(block.line).or_insert_with(|| LineGraph {
                graph: DiGraph::new(),
                nodes: HashMap::new(),
                total_blocks: 0,
                yard_exit: 1,
                stations: HashMap::new(),
                station_numbers: HashMap::new(),
            });
            let node = entry.graph.add_node(block.id);
            entry.nodes.insert(block.id, node);
            entry.total_blocks = entry.total_blocks.max(block.id + 1);
            if let Some(station) = &block.station {
                entry
                    .stations
                    .insert(station.name.to_ascii_uppercase(), block.id);
                entry.station_numbers.insert(block.id, station.number);
            }
            registry.insert((block.line, block.id), Mutex::new(block));
        }

        for (line, from, to) in self.edges {
            if let Some(l) = lines.get_mut(&line) {
                if let (Some(&a), Some(&b)) = (l.nodes.get(&from), l.nodes.get(&to)) {
                    let length = lengths.get(&(line, to)).copied().unwrap_or(100.0);
                    l.graph.update_edge(a, b, length);
                }
            }
        }

        for (line, exit) in self.yard_exits {
            if let Some(l) = lines.get_mut(&line) {
                l.yard_exit = exit;
            }
        }

        (TrackModel { lines }, registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_block_line() -> (TrackModel, BlockRegistry) {
        let mut builder = Builder::new();
        for id in 1..=3 {
            builder.add_block(Block::new(Line::Green, id));
        }
        builder.connect_run(Line::Green, &[1, 2, 3]);
        builder.yard_exit(Line::Green, 1);
        builder.build()
    }

    #[test]
    fn adjacency_is_directed() {
        let (track, _) = three_block_line();
        assert!(track.are_adjacent(Line::Green, 1, 2));
        assert!(!track.are_adjacent(Line::Green, 2, 1));
        assert!(!track.are_adjacent(Line::Green, 1, 3));
        assert!(!track.are_adjacent(Line::Red, 1, 2));
    }

    #[test]
    fn shortest_path_walks_the_chain() {
        let (track, _) = three_block_line();
        assert_eq!(
            track.shortest_path(Line::Green, 1, 3),
            Some(vec![1, 2, 3])
        );
        assert_eq!(track.shortest_path(Line::Green, 3, 1), None);
    }

    #[test]
    fn shortest_path_prefers_shorter_legs() {
        let mut builder = Builder::new();
        for id in 1..=4 {
            let mut b = Block::new(Line::Green, id);
            b.length_m = if id == 4 { 10.0 } else { 100.0 };
            builder.add_block(b);
        }
        // 1 -> 2 -> 3 against the 1 -> 4 -> 3 shortcut
        builder.connect_run(Line::Green, &[1, 2, 3]);
        builder.connect_run(Line::Green, &[1, 4, 3]);
        let (track, _) = builder.build();
        assert_eq!(
            track.shortest_path(Line::Green, 1, 3),
            Some(vec![1, 4, 3])
        );
    }
}
