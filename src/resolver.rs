//! Block graph resolution from a single forward-readable stream.
//!
//! # How it works
//!
//! Resolution starts with one address stub (the header block at offset 64)
//! in a FIFO worklist. Popping a stub seeks to it, reads its header, asks
//! the schema how many links follow, and turns every non-zero link into a
//! stub unless the address is already known. Blocks are parsed strictly in
//! the order the cursor moves forward: a stub whose address lies *behind*
//! the highest address parsed so far is deferred instead of triggering a
//! backward seek. When the worklist drains and deferrals remain, the cursor
//! rewinds and another pass runs — each pass fully consumes at least the
//! lowest deferred address, so the loop terminates on any finite acyclic
//! graph.
//!
//! A duplicate address discovered under two different stubs is fatal
//! corruption; so is a tag the schema cannot size.
//!
//! # Post-resolution
//!
//! 3.x data sections are headerless, so their length is only knowable once
//! every sibling channel group is parsed: length = Σ over the chain of
//! (record size + id count) × record count. This runs as a final pass over
//! the finalized graph.

use std::collections::{HashSet, VecDeque};
use std::io::{Read, Seek, SeekFrom};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::error::{Result, SortError};
use crate::graph::{Block, BlockData, Graph, Link};
use crate::ident::ID_BLOCK_LEN;
use crate::schema::{
    Family, Kind, Schema, V3_CG_CYCLE_COUNT_OFFSET, V3_CG_RECORD_ID_OFFSET,
    V3_CG_RECORD_SIZE_OFFSET, V3_DG_CG_COUNT_OFFSET, V3_DG_REC_ID_COUNT_OFFSET,
    V3_HD_DG_COUNT_OFFSET, V4_CG_CYCLE_COUNT_REL, V4_CG_DATA_BYTES_REL, V4_CG_FLAGS_REL,
    V4_CG_INVAL_BYTES_REL, V4_CG_RECORD_ID_REL, V4_DG_REC_ID_WIDTH_REL, V4_HEADER_LEN,
};

/// Result of [`resolve`]: the finalized graph plus the number of passes the
/// forward cursor needed.
pub struct Resolution {
    pub graph: Graph,
    pub passes: u32,
}

/// Build the full address-keyed graph reachable from the header block.
pub fn resolve<R: Read + Seek>(src: &mut R, schema: &Schema) -> Result<Resolution> {
    let mut r = Resolver {
        src,
        schema,
        graph: Graph::new(ID_BLOCK_LEN as u64),
        queue: VecDeque::new(),
        pending: HashSet::new(),
        deferred: Vec::new(),
        high_water: 0,
        passes: 0,
    };
    r.run()?;
    if matches!(schema.family, Family::V3) {
        r.compute_section_lengths()?;
    }
    info!(passes = r.passes, blocks = r.graph.len(), "resolved block graph");
    Ok(Resolution { graph: r.graph, passes: r.passes })
}

struct Resolver<'a, R: Read + Seek> {
    src: &'a mut R,
    schema: &'a Schema,
    graph: Graph,
    queue: VecDeque<u64>,
    pending: HashSet<u64>,
    deferred: Vec<u64>,
    high_water: u64,
    passes: u32,
}

impl<'a, R: Read + Seek> Resolver<'a, R> {
    fn run(&mut self) -> Result<()> {
        let root = self.graph.root;
        self.pending.insert(root);
        self.queue.push_back(root);

        loop {
            while let Some(addr) = self.queue.pop_front() {
                if self.graph.contains(addr) {
                    return Err(SortError::DuplicateAddress { addr });
                }
                if addr < self.high_water {
                    self.deferred.push(addr);
                    continue;
                }
                let block = match self.schema.family {
                    Family::V3 => self.parse_v3_block(addr)?,
                    Family::V4 => self.parse_v4_block(addr)?,
                };
                debug!(addr, tag = %block.tag_str(), "parsed block");
                self.pending.remove(&addr);
                self.graph.insert(block)?;
                self.high_water = addr;
            }
            self.passes += 1;
            if self.deferred.is_empty() {
                break;
            }
            // Rewind: refill the worklist from the deferrals and restart the
            // forward cursor at the top of the file.
            self.high_water = 0;
            self.queue.extend(self.deferred.drain(..));
        }
        Ok(())
    }

    /// Record a discovered link target, reusing the existing node when the
    /// address is already finalized or pending.
    fn discover(&mut self, addr: u64) {
        if addr == 0 || self.graph.contains(addr) || self.pending.contains(&addr) {
            return;
        }
        self.pending.insert(addr);
        self.queue.push_back(addr);
    }

    fn read_at(&mut self, addr: u64, len: usize) -> Result<Vec<u8>> {
        self.src.seek(SeekFrom::Start(addr))?;
        let mut buf = vec![0u8; len];
        self.src.read_exact(&mut buf)?;
        Ok(buf)
    }

    // ── 3.x ─────────────────────────────────────────────────────────────────

    fn parse_v3_block(&mut self, addr: u64) -> Result<Block> {
        let e = self.schema.endian;
        let head = self.read_at(addr, 4)?;
        let tag = [head[0], head[1]];
        // The length field is little-endian even in big-endian files; only
        // links and data fields honor the id-block byte order.
        let length = LittleEndian::read_u16(&head[2..4]) as usize;

        let base = self.schema.base_link_count(&tag)?;
        let kind = self.schema.kind_of(&tag)?;
        if length < 4 + 4 * base {
            return Err(SortError::Corrupt(format!(
                "{} block at {addr:#x} declares length {length}, too short for {base} links",
                String::from_utf8_lossy(&tag)
            )));
        }
        let blk = self.read_at(addr, length)?;

        let mut links = Vec::with_capacity(base);
        for i in 0..base {
            let off = 4 + 4 * i;
            let target = e.u32(&blk[off..off + 4]) as u64;
            links.push(Link { offset: off as u32, target });
        }

        self.extra_v3_links(addr, &tag, &blk, &mut links)?;

        // Discover children. The data-section link of a data group is
        // validated and registered directly: 3.x data sections are
        // headerless and must never be parsed as blocks.
        let data_link = self.schema.dg_data_link();
        for i in 0..links.len() {
            let target = links[i].target;
            if target == 0 {
                continue;
            }
            if tag == *b"DG" && i == data_link {
                if self.validate_v3_data_link(addr)? {
                    self.register_data_section(target)?;
                } else {
                    // Link present but no channel group carries records;
                    // drop it like the reference behavior does.
                    links[i].target = 0;
                }
            } else {
                self.discover(target);
            }
        }

        let data = self.parse_v3_fields(addr, kind, &blk)?;

        let mut block = Block::new(addr, tag, length as u64, kind);
        block.links = links;
        block.data = data;
        Ok(block)
    }

    /// Content-conditional extra links of the 3.x family.
    fn extra_v3_links(
        &mut self,
        addr: u64,
        tag: &[u8; 2],
        blk: &[u8],
        links: &mut Vec<Link>,
    ) -> Result<()> {
        let e = self.schema.endian;
        let length = blk.len();

        match tag {
            // CG grown to 30 bytes carries a sample-reduction link at the end.
            b"CG" if length == 30 => {
                let target = e.u32(&blk[26..30]) as u64;
                links.push(Link { offset: 26, target });
                self.discover(target);
            }
            // CN: long-name text at 218, display-name text at 222.
            b"CN" if length > 218 => {
                let target = e.u32(&blk[218..222]) as u64;
                links.push(Link { offset: 218, target });
                self.discover(target);
                if length > 222 {
                    let target = e.u32(&blk[222..226]) as u64;
                    links.push(Link { offset: 222, target });
                    self.discover(target);
                }
            }
            // CC conversion type 12 is a text-range table with one text link
            // per entry.
            b"CC" if length >= 46 => {
                let convtype = e.u16(&blk[42..44]);
                if convtype == 12 {
                    let entries = e.u16(&blk[44..46]) as usize;
                    for i in 0..entries {
                        let off = 46 + 20 * i + 16;
                        if off + 4 > length {
                            return Err(SortError::Corrupt(format!(
                                "CC block at {addr:#x} declares {entries} table entries beyond its length"
                            )));
                        }
                        let target = e.u32(&blk[off..off + 4]) as u64;
                        links.push(Link { offset: off as u32, target });
                        self.discover(target);
                    }
                }
            }
            // CD carries two links per dependency.
            b"CD" if length >= 8 => {
                let deps = e.u16(&blk[6..8]) as usize;
                for j in 0..2 * deps {
                    let off = 8 + 4 * j;
                    if off + 4 > length {
                        return Err(SortError::Corrupt(format!(
                            "CD block at {addr:#x} declares {deps} dependencies beyond its length"
                        )));
                    }
                    let target = e.u32(&blk[off..off + 4]) as u64;
                    links.push(Link { offset: off as u32, target });
                    self.discover(target);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_v3_fields(&self, addr: u64, kind: Kind, blk: &[u8]) -> Result<BlockData> {
        let e = self.schema.endian;
        let need = |n: usize| -> Result<()> {
            if blk.len() < n {
                Err(SortError::Corrupt(format!(
                    "block at {addr:#x} too short for its typed fields"
                )))
            } else {
                Ok(())
            }
        };
        let at = |offset: u64, width: usize| -> std::ops::Range<usize> {
            offset as usize..offset as usize + width
        };
        let data = match kind {
            Kind::Header => {
                need(18)?;
                BlockData::Header { data_groups: e.u16(&blk[at(V3_HD_DG_COUNT_OFFSET, 2)]) }
            }
            Kind::DataGroup => {
                need(24)?;
                BlockData::DataGroup {
                    channel_groups: e.u16(&blk[at(V3_DG_CG_COUNT_OFFSET, 2)]),
                    record_ids: e.u16(&blk[at(V3_DG_REC_ID_COUNT_OFFSET, 2)]),
                }
            }
            Kind::ChannelGroup => {
                need(26)?;
                BlockData::ChannelGroup {
                    record_id: e.u16(&blk[at(V3_CG_RECORD_ID_OFFSET, 2)]) as u64,
                    record_size: e.u16(&blk[at(V3_CG_RECORD_SIZE_OFFSET, 2)]) as u32,
                    record_count: e.u32(&blk[at(V3_CG_CYCLE_COUNT_OFFSET, 4)]) as u64,
                    flags: 0,
                }
            }
            _ => BlockData::Plain,
        };
        Ok(data)
    }

    /// A 3.x data-section link is only accepted if the data group has at
    /// least one channel group with a non-zero record count; a dangling
    /// pointer into arbitrary bytes is ignored otherwise.
    fn validate_v3_data_link(&mut self, dg_addr: u64) -> Result<bool> {
        let e = self.schema.endian;
        let buf = self.read_at(dg_addr + V3_DG_CG_COUNT_OFFSET, 2)?;
        let mut remaining = e.u16(&buf);
        if remaining < 1 {
            return Ok(false);
        }
        let buf = self.read_at(dg_addr + 8, 4)?;
        let mut cg = e.u32(&buf) as u64;
        while cg != 0 {
            let buf = self.read_at(cg + V3_CG_CYCLE_COUNT_OFFSET, 4)?;
            if e.u32(&buf) > 0 {
                return Ok(true);
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
            let buf = self.read_at(cg + 4, 4)?;
            cg = e.u32(&buf) as u64;
        }
        Ok(false)
    }

    /// Headerless data sections are finalized the moment they are found;
    /// their length is filled in by [`Resolver::compute_section_lengths`].
    fn register_data_section(&mut self, addr: u64) -> Result<()> {
        if self.graph.contains(addr) {
            return Ok(());
        }
        self.graph.insert(Block::new(addr, *b"DT", 0, Kind::RawData))
    }

    // ── 4.x ─────────────────────────────────────────────────────────────────

    fn parse_v4_block(&mut self, addr: u64) -> Result<Block> {
        let head = self.read_at(addr, V4_HEADER_LEN as usize)?;
        if &head[0..2] != b"##" {
            return Err(SortError::Corrupt(format!(
                "block at {addr:#x} does not start with '##'"
            )));
        }
        let tag = [head[2], head[3]];
        let length = LittleEndian::read_u64(&head[8..16]);
        let link_count = LittleEndian::read_u64(&head[16..24]) as usize;
        let kind = self.schema.kind_of(&tag)?;

        let data_start = V4_HEADER_LEN + 8 * link_count as u64;
        if length < data_start {
            return Err(SortError::Corrupt(format!(
                "{} block at {addr:#x} declares length {length}, too short for {link_count} links",
                String::from_utf8_lossy(&tag)
            )));
        }

        let raw = self.read_at(addr + V4_HEADER_LEN, 8 * link_count)?;
        let mut links = Vec::with_capacity(link_count);
        for i in 0..link_count {
            let target = LittleEndian::read_u64(&raw[8 * i..8 * i + 8]);
            links.push(Link { offset: (V4_HEADER_LEN as usize + 8 * i) as u32, target });
            self.discover(target);
        }

        let data = self.parse_v4_fields(addr, kind, length, data_start)?;

        let mut block = Block::new(addr, tag, length, kind);
        block.links = links;
        block.data = data;
        Ok(block)
    }

    fn parse_v4_fields(
        &mut self,
        addr: u64,
        kind: Kind,
        length: u64,
        data_start: u64,
    ) -> Result<BlockData> {
        let short = || SortError::Corrupt(format!("block at {addr:#x} too short for its typed fields"));
        let data = match kind {
            Kind::Header => BlockData::Header { data_groups: 0 },
            Kind::DataGroup => {
                if length < data_start + 1 {
                    return Err(short());
                }
                let body = self.read_at(addr + data_start + V4_DG_REC_ID_WIDTH_REL, 1)?;
                BlockData::DataGroup { channel_groups: 0, record_ids: body[0] as u16 }
            }
            Kind::ChannelGroup => {
                if length < data_start + 32 {
                    return Err(short());
                }
                let body = self.read_at(addr + data_start, 32)?;
                let field = |rel: u64, width: usize| &body[rel as usize..rel as usize + width];
                BlockData::ChannelGroup {
                    record_id: LittleEndian::read_u64(field(V4_CG_RECORD_ID_REL, 8)),
                    record_count: LittleEndian::read_u64(field(V4_CG_CYCLE_COUNT_REL, 8)),
                    flags: LittleEndian::read_u16(field(V4_CG_FLAGS_REL, 2)),
                    record_size: LittleEndian::read_u32(field(V4_CG_DATA_BYTES_REL, 4))
                        + LittleEndian::read_u32(field(V4_CG_INVAL_BYTES_REL, 4)),
                }
            }
            _ => BlockData::Plain,
        };
        Ok(data)
    }

    // ── Post-resolution ─────────────────────────────────────────────────────

    /// Recompute the length of every 3.x data section from its sibling
    /// channel groups.
    fn compute_section_lengths(&mut self) -> Result<()> {
        let data_link = self.schema.dg_data_link();
        let dgs: Vec<u64> = self
            .graph
            .iter()
            .filter(|(_, b)| b.kind == Kind::DataGroup)
            .map(|(&a, _)| a)
            .collect();

        for dg_addr in dgs {
            let dg = self.graph.node(dg_addr)?;
            let section = dg.link_target(data_link);
            if section == 0 {
                continue;
            }
            let record_ids = match dg.data {
                BlockData::DataGroup { record_ids, .. } => record_ids as u64,
                _ => {
                    return Err(SortError::Corrupt(format!(
                        "data group at {dg_addr:#x} was never refined"
                    )))
                }
            };
            let chain = self.graph.cg_chain(dg_addr)?;
            if chain.is_empty() {
                return Err(SortError::Corrupt(format!(
                    "data group at {dg_addr:#x} owns a data section but no channel groups"
                )));
            }
            let mut total = 0u64;
            for cg_addr in chain {
                match self.graph.node(cg_addr)?.data {
                    BlockData::ChannelGroup { record_size, record_count, .. } => {
                        total += (record_size as u64 + record_ids) * record_count;
                    }
                    _ => {
                        return Err(SortError::Corrupt(format!(
                            "channel group at {cg_addr:#x} was never refined"
                        )))
                    }
                }
            }
            self.graph.node_mut(section)?.length = total;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Endian;
    use proptest::prelude::*;
    use std::io::Cursor;

    // Minimal 3.x little-endian image builder.
    struct Image(Vec<u8>);

    impl Image {
        fn new() -> Self {
            let mut raw = vec![0u8; 64];
            raw[0..8].copy_from_slice(b"MDF     ");
            raw[28..30].copy_from_slice(&330u16.to_le_bytes());
            Image(raw)
        }

        fn at(&mut self, addr: u64) -> u64 {
            assert!(addr as usize >= self.0.len(), "blocks must be laid out forward");
            self.0.resize(addr as usize, 0);
            addr
        }

        fn block(&mut self, tag: &[u8; 2], body: &[u8]) -> u64 {
            let addr = self.0.len() as u64;
            let length = (4 + body.len()) as u16;
            self.0.extend_from_slice(tag);
            self.0.extend_from_slice(&length.to_le_bytes());
            self.0.extend_from_slice(body);
            addr
        }

        fn hd(&mut self, dg_first: u32, dg_count: u16) -> u64 {
            let mut body = vec![0u8; 160];
            body[0..4].copy_from_slice(&dg_first.to_le_bytes());
            body[12..14].copy_from_slice(&dg_count.to_le_bytes());
            self.block(b"HD", &body)
        }

        fn dg(&mut self, next: u32, cg_first: u32, trigger: u32, data: u32, cgs: u16, ids: u16) -> u64 {
            let mut body = vec![0u8; 24];
            body[0..4].copy_from_slice(&next.to_le_bytes());
            body[4..8].copy_from_slice(&cg_first.to_le_bytes());
            body[8..12].copy_from_slice(&trigger.to_le_bytes());
            body[12..16].copy_from_slice(&data.to_le_bytes());
            body[16..18].copy_from_slice(&cgs.to_le_bytes());
            body[18..20].copy_from_slice(&ids.to_le_bytes());
            self.block(b"DG", &body)
        }

        fn cg(&mut self, next: u32, record_id: u16, size: u16, count: u32) -> u64 {
            let mut body = vec![0u8; 22];
            body[0..4].copy_from_slice(&next.to_le_bytes());
            body[12..14].copy_from_slice(&record_id.to_le_bytes());
            body[16..18].copy_from_slice(&size.to_le_bytes());
            body[18..22].copy_from_slice(&count.to_le_bytes());
            self.block(b"CG", &body)
        }

        fn resolve(self) -> Result<Resolution> {
            let schema = Schema::new(Family::V3, Endian::Little, 330);
            resolve(&mut Cursor::new(self.0), &schema)
        }
    }

    #[test]
    fn forward_graph_takes_one_pass() {
        let mut img = Image::new();
        // Layout: HD, DG, CG, raw data.
        let mut body = vec![0u8; 160];
        // HD at 64; DG at 228; CG at 256; data at 282.
        body[0..4].copy_from_slice(&228u32.to_le_bytes());
        body[12..14].copy_from_slice(&1u16.to_le_bytes());
        img.block(b"HD", &body);
        img.dg(0, 256, 0, 282, 1, 0);
        img.cg(0, 0, 8, 3);
        img.0.extend_from_slice(&[0xAB; 24]);

        let res = img.resolve().unwrap();
        assert_eq!(res.passes, 1);
        assert_eq!(res.graph.len(), 4);
        assert_eq!(res.graph.order(), vec![64, 228, 256, 282]);
        // Data section length from siblings: 8 bytes * 3 records, no ids.
        assert_eq!(res.graph.get(282).unwrap().length, 24);
        assert_eq!(res.graph.get(282).unwrap().kind, Kind::RawData);
    }

    #[test]
    fn backward_reference_defers_to_second_pass() {
        let mut img = Image::new();
        // HD links a DG placed *behind* a text block discovered first.
        // HD at 64, TX at 228, DG at 238. HD.dg_first = 238, HD.comment = 228.
        let mut body = vec![0u8; 160];
        body[0..4].copy_from_slice(&238u32.to_le_bytes());
        body[4..8].copy_from_slice(&228u32.to_le_bytes());
        body[12..14].copy_from_slice(&1u16.to_le_bytes());
        img.block(b"HD", &body);
        img.block(b"TX", b"hello\0");
        img.dg(0, 0, 0, 0, 0, 0);

        let res = img.resolve().unwrap();
        // 238 (DG) is parsed before 228 (TX) pops, so TX defers one pass.
        assert_eq!(res.passes, 2);
        assert_eq!(res.graph.len(), 3);
    }

    #[test]
    fn duplicate_address_is_fatal() {
        let mut img = Image::new();
        let mut body = vec![0u8; 160];
        body[0..4].copy_from_slice(&228u32.to_le_bytes());
        img.block(b"HD", &body);
        // DG whose trigger link and data link both hit 284.
        img.dg(0, 256, 284, 284, 1, 0);
        img.cg(0, 0, 8, 1);
        img.at(284);
        img.0.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            img.resolve(),
            Err(SortError::DuplicateAddress { addr: 284 })
        ));
    }

    #[test]
    fn dangling_data_link_is_dropped() {
        let mut img = Image::new();
        let mut body = vec![0u8; 160];
        body[0..4].copy_from_slice(&228u32.to_le_bytes());
        img.block(b"HD", &body);
        // Channel group exists but has zero records: data link is ignored.
        img.dg(0, 256, 0, 5000, 1, 0);
        img.cg(0, 0, 8, 0);

        let res = img.resolve().unwrap();
        assert!(res.graph.get(5000).is_none());
        assert_eq!(res.graph.node(228).unwrap().link_target(3), 0);
    }

    #[test]
    fn shared_section_length_sums_all_groups() {
        let mut img = Image::new();
        let mut body = vec![0u8; 160];
        body[0..4].copy_from_slice(&228u32.to_le_bytes());
        img.block(b"HD", &body);
        // Two groups with one leading id byte each.
        img.dg(0, 256, 0, 312, 2, 1);
        img.cg(282, 1, 8, 5);
        img.cg(0, 2, 4, 3);
        img.at(312);
        img.0.extend_from_slice(&[0u8; 8]);

        let res = img.resolve().unwrap();
        assert_eq!(res.graph.get(312).unwrap().length, (8 + 1) * 5 + (4 + 1) * 3);
    }

    proptest! {
        /// Completeness: a chain of data groups is fully resolved no matter
        /// how its physical placement is permuted, and the pass count never
        /// exceeds backward references + 1.
        #[test]
        fn resolves_permuted_chains(order in proptest::sample::subsequence(
            (0usize..6).collect::<Vec<_>>(), 1..6
        ).prop_shuffle()) {
            let n = order.len();
            // Physical slots, one DG each, 28 bytes apart starting at 228.
            let slot_addr = |slot: usize| 228 + 28 * slot as u32;

            let mut img = Image::new();
            let mut body = vec![0u8; 160];
            body[0..4].copy_from_slice(&slot_addr(order[0]).to_le_bytes());
            body[12..14].copy_from_slice(&(n as u16).to_le_bytes());
            img.block(b"HD", &body);

            // next-pointers follow the chain order through the slots.
            let mut next_of = vec![0u32; 6];
            for w in order.windows(2) {
                next_of[w[0]] = slot_addr(w[1]);
            }
            let mut present = order.clone();
            present.sort_unstable();
            for &slot in &present {
                img.at(slot_addr(slot) as u64);
                img.dg(next_of[slot], 0, 0, 0, 0, 0);
            }

            let backward = order.windows(2).filter(|w| w[1] < w[0]).count() as u32;
            let res = img.resolve().unwrap();
            prop_assert_eq!(res.graph.len(), n + 1);
            prop_assert!(res.passes <= backward + 1);
            for &slot in &present {
                prop_assert!(res.graph.contains(slot_addr(slot) as u64));
            }
        }
    }
}
