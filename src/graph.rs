//! The resolved block graph.
//!
//! Nodes are keyed by their source address in one arena map; links are plain
//! addresses, so refinement (swapping a generic node for its specialized
//! representation) is just an update of the map entry — identity never moves.
//! Blocks synthesized during demultiplexing get addresses from a reserved
//! range well above any real file offset.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, SortError};
use crate::schema::{Kind, Schema, LINK_CG_FIRST, LINK_NEXT};

/// First address handed out for synthesized blocks.
const SYNTHETIC_BASE: u64 = 1 << 62;

// ── Block ────────────────────────────────────────────────────────────────────

/// One link field: where it sits inside the block, and what it points at
/// (0 = absent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub offset: u32,
    pub target: u64,
}

/// How the writer treats a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Copy the source bytes verbatim.
    Verbatim,
    /// Emit rebuilt bytes.
    Synthesized,
    /// Subtree is owned by a demultiplexer replacement set; never copied
    /// independently.
    Replaced,
}

/// A structural incompatibility anchored at one block. Documents a required
/// restructuring; attaching it does not itself mutate the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemKind {
    /// Several channel groups share one record section.
    InterleavedRecords,
}

/// Typed fields of the specialized kinds that carry any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockData {
    Plain,
    Header {
        data_groups: u16,
    },
    DataGroup {
        channel_groups: u16,
        /// 3.x: number of 1-byte record ids per record (0, 1 or 2).
        /// 4.x: byte width of the single leading record id.
        record_ids: u16,
    },
    ChannelGroup {
        record_id: u64,
        record_size: u32,
        record_count: u64,
        flags: u16,
    },
}

#[derive(Debug, Clone)]
pub struct Block {
    pub addr: u64,
    pub tag: [u8; 2],
    pub length: u64,
    pub links: Vec<Link>,
    pub kind: Kind,
    pub data: BlockData,
    pub state: WriteState,
    pub problem: Option<ProblemKind>,
    pub out_addr: Option<u64>,
}

impl Block {
    pub fn new(addr: u64, tag: [u8; 2], length: u64, kind: Kind) -> Self {
        Self {
            addr,
            tag,
            length,
            links: Vec::new(),
            kind,
            data: BlockData::Plain,
            state: WriteState::Verbatim,
            problem: None,
            out_addr: None,
        }
    }

    pub fn tag_str(&self) -> String {
        String::from_utf8_lossy(&self.tag).into_owned()
    }

    /// Target of link `i`, 0 when the slot is absent or empty.
    pub fn link_target(&self, i: usize) -> u64 {
        self.links.get(i).map(|l| l.target).unwrap_or(0)
    }
}

// ── Graph ────────────────────────────────────────────────────────────────────

pub struct Graph {
    blocks: BTreeMap<u64, Block>,
    pub root: u64,
    next_synthetic: u64,
    /// Anchor address → address of its first replacement block. Every link
    /// pointing at a replaced anchor is redirected through this map when the
    /// output links are patched.
    remap: HashMap<u64, u64>,
}

impl Graph {
    pub fn new(root: u64) -> Self {
        Self {
            blocks: BTreeMap::new(),
            root,
            next_synthetic: SYNTHETIC_BASE,
            remap: HashMap::new(),
        }
    }

    /// Register a finalized block. Exactly one canonical node may exist per
    /// address; a second registration is fatal corruption.
    pub fn insert(&mut self, block: Block) -> Result<()> {
        let addr = block.addr;
        if self.blocks.insert(addr, block).is_some() {
            return Err(SortError::DuplicateAddress { addr });
        }
        Ok(())
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.blocks.contains_key(&addr)
    }

    pub fn get(&self, addr: u64) -> Option<&Block> {
        self.blocks.get(&addr)
    }

    pub fn get_mut(&mut self, addr: u64) -> Option<&mut Block> {
        self.blocks.get_mut(&addr)
    }

    pub fn node(&self, addr: u64) -> Result<&Block> {
        self.blocks
            .get(&addr)
            .ok_or_else(|| SortError::Corrupt(format!("link to unresolved address {addr:#x}")))
    }

    pub fn node_mut(&mut self, addr: u64) -> Result<&mut Block> {
        self.blocks
            .get_mut(&addr)
            .ok_or_else(|| SortError::Corrupt(format!("link to unresolved address {addr:#x}")))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Addresses in ascending order — the bulk traversal sequence.
    pub fn order(&self) -> Vec<u64> {
        self.blocks.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u64, &Block)> {
        self.blocks.iter()
    }

    /// Reserve an address for a synthesized block.
    pub fn alloc_synthetic(&mut self) -> u64 {
        let addr = self.next_synthetic;
        self.next_synthetic += 1;
        addr
    }

    pub fn set_remap(&mut self, anchor: u64, replacement: u64) {
        self.remap.insert(anchor, replacement);
    }

    /// Follow the replacement map (one hop — anchors are never remapped to
    /// other anchors' replacements).
    pub fn resolve_target(&self, addr: u64) -> u64 {
        self.remap.get(&addr).copied().unwrap_or(addr)
    }

    /// Attach a compatibility problem. A block carrying more than one
    /// simultaneous problem is unsupported and treated as fatal.
    pub fn attach_problem(&mut self, addr: u64, kind: ProblemKind) -> Result<()> {
        let block = self.node_mut(addr)?;
        if block.problem.is_some() {
            return Err(SortError::Corrupt(format!(
                "block at {addr:#x} carries more than one restructuring problem"
            )));
        }
        block.problem = Some(kind);
        Ok(())
    }

    /// Walk the channel-group chain of a data group, in chain order.
    pub fn cg_chain(&self, dg_addr: u64) -> Result<Vec<u64>> {
        let dg = self.node(dg_addr)?;
        let mut chain = Vec::new();
        let mut next = dg.link_target(LINK_CG_FIRST);
        while next != 0 {
            let cg = self.node(next)?;
            if cg.kind != Kind::ChannelGroup {
                return Err(SortError::Corrupt(format!(
                    "data group {dg_addr:#x} links a {} block where a channel group was expected",
                    cg.tag_str()
                )));
            }
            chain.push(next);
            if chain.len() > self.blocks.len() {
                return Err(SortError::Corrupt(format!(
                    "channel group chain of data group {dg_addr:#x} is cyclic"
                )));
            }
            next = cg.link_target(LINK_NEXT);
        }
        Ok(chain)
    }
}

// ── Problem detection ────────────────────────────────────────────────────────

/// Flag every data group whose record section is shared by more than one
/// channel group. The chain members and the section itself are marked
/// [`WriteState::Replaced`] so the write pass skips them; the anchor keeps
/// the problem and triggers the demultiplexer.
///
/// Returns the number of anchors found.
pub fn detect_problems(graph: &mut Graph, schema: &Schema) -> Result<usize> {
    let data_link = schema.dg_data_link();
    let mut anchors = Vec::new();

    for (&addr, block) in graph.iter() {
        if block.kind != Kind::DataGroup {
            continue;
        }
        let section = block.link_target(data_link);
        if section == 0 {
            continue;
        }
        let chain = graph.cg_chain(addr)?;
        if chain.len() > 1 {
            anchors.push((addr, section, chain));
        }
    }

    let count = anchors.len();
    for (addr, section, chain) in anchors {
        graph.attach_problem(addr, ProblemKind::InterleavedRecords)?;
        graph.node_mut(addr)?.state = WriteState::Replaced;
        graph.node_mut(section)?.state = WriteState::Replaced;
        for cg in chain {
            graph.node_mut(cg)?.state = WriteState::Replaced;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Endian, Family};

    fn dg_with_chain(graph: &mut Graph, dg_addr: u64, cgs: &[u64], section: u64) {
        let mut dg = Block::new(dg_addr, *b"DG", 28, Kind::DataGroup);
        dg.data = BlockData::DataGroup { channel_groups: cgs.len() as u16, record_ids: 1 };
        dg.links = vec![
            Link { offset: 4, target: 0 },
            Link { offset: 8, target: cgs.first().copied().unwrap_or(0) },
            Link { offset: 12, target: 0 },
            Link { offset: 16, target: section },
        ];
        graph.insert(dg).unwrap();
        for (i, &addr) in cgs.iter().enumerate() {
            let mut cg = Block::new(addr, *b"CG", 26, Kind::ChannelGroup);
            cg.data = BlockData::ChannelGroup {
                record_id: i as u64 + 1,
                record_size: 8,
                record_count: 2,
                flags: 0,
            };
            cg.links = vec![
                Link { offset: 4, target: cgs.get(i + 1).copied().unwrap_or(0) },
                Link { offset: 8, target: 0 },
                Link { offset: 12, target: 0 },
            ];
            graph.insert(cg).unwrap();
        }
        if section != 0 {
            graph.insert(Block::new(section, *b"DT", 0, Kind::RawData)).unwrap();
        }
    }

    #[test]
    fn duplicate_insert_is_fatal() {
        let mut g = Graph::new(64);
        g.insert(Block::new(100, *b"TX", 10, Kind::Text)).unwrap();
        assert!(matches!(
            g.insert(Block::new(100, *b"TX", 10, Kind::Text)),
            Err(SortError::DuplicateAddress { addr: 100 })
        ));
    }

    #[test]
    fn second_problem_is_fatal() {
        let mut g = Graph::new(64);
        g.insert(Block::new(100, *b"DG", 28, Kind::DataGroup)).unwrap();
        g.attach_problem(100, ProblemKind::InterleavedRecords).unwrap();
        assert!(g.attach_problem(100, ProblemKind::InterleavedRecords).is_err());
    }

    #[test]
    fn detects_shared_section() {
        let schema = Schema::new(Family::V3, Endian::Little, 330);
        let mut g = Graph::new(64);
        dg_with_chain(&mut g, 100, &[200, 300], 400);
        dg_with_chain(&mut g, 500, &[600], 700);

        let found = detect_problems(&mut g, &schema).unwrap();
        assert_eq!(found, 1);
        assert_eq!(g.get(100).unwrap().problem, Some(ProblemKind::InterleavedRecords));
        assert_eq!(g.get(100).unwrap().state, WriteState::Replaced);
        assert_eq!(g.get(200).unwrap().state, WriteState::Replaced);
        assert_eq!(g.get(300).unwrap().state, WriteState::Replaced);
        assert_eq!(g.get(400).unwrap().state, WriteState::Replaced);
        // The single-group DG is untouched.
        assert_eq!(g.get(500).unwrap().problem, None);
        assert_eq!(g.get(600).unwrap().state, WriteState::Verbatim);
    }

    #[test]
    fn remap_redirects_links() {
        let mut g = Graph::new(64);
        let synth = g.alloc_synthetic();
        g.set_remap(100, synth);
        assert_eq!(g.resolve_target(100), synth);
        assert_eq!(g.resolve_target(200), 200);
    }

    #[test]
    fn cg_chain_in_order() {
        let mut g = Graph::new(64);
        dg_with_chain(&mut g, 100, &[300, 200, 400], 0);
        assert_eq!(g.cg_chain(100).unwrap(), vec![300, 200, 400]);
    }
}
