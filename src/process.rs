//! End-to-end file processing: identify, resolve, restructure, write, patch.
//!
//! The write pass streams blocks to the output in source-address order
//! through the [`BlockSink`] pipeline, assigning every block its output
//! address at submission. Links are written as garbage (or source values)
//! during the stream and fixed afterwards in a single random-access patch
//! pass over the finished file; the patch pass rewrites *every* link slot,
//! zeros included, so dropped links are cleared and untouched files round
//! trip byte for byte.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, info};

use crate::demux::{plan_split, SplitPlan};
use crate::error::{Result, SortError};
use crate::graph::{detect_problems, Block, BlockData, Graph, Link, WriteState};
use crate::ident::IdBlock;
use crate::pipeline::BlockSink;
use crate::resolver::{resolve, Resolution};
use crate::schema::{
    Endian, Family, Kind, Schema, V3_CG_CYCLE_COUNT_OFFSET, V3_CG_RECORD_ID_OFFSET,
    V3_DG_BLOCK_LEN, V3_DG_CG_COUNT_OFFSET, V3_HD_DG_COUNT_OFFSET, V4_DG_BLOCK_LEN,
    V4_HEADER_LEN,
};

const COPY_CHUNK: usize = 64 * 1024;

// ── Options and results ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SortOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    /// Caller asserts compressed sections were inflated beforehand.
    pub unzip: bool,
}

/// What one run did.
#[derive(Debug)]
pub struct Summary {
    pub version: u16,
    pub passes: u32,
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub groups_split: usize,
}

/// Read-only structure report for the `info` command.
#[derive(Debug)]
pub struct Report {
    pub version: u16,
    pub version_str: String,
    pub family: Family,
    pub endian: Endian,
    pub passes: u32,
    pub blocks: usize,
    pub tag_counts: BTreeMap<String, usize>,
    pub interleaved_groups: usize,
}

// ── Inspect ──────────────────────────────────────────────────────────────────

/// Resolve the file and report its structure without writing anything.
pub fn inspect_file(path: &Path) -> Result<Report> {
    let mut src = BufReader::new(File::open(path)?);
    let id = IdBlock::read(&mut src)?;
    let schema = Schema::new(id.family, id.endian, id.version);
    let Resolution { mut graph, passes } = resolve(&mut src, &schema)?;
    let interleaved = detect_problems(&mut graph, &schema)?;

    let mut tag_counts = BTreeMap::new();
    for (_, block) in graph.iter() {
        *tag_counts.entry(block.tag_str()).or_insert(0) += 1;
    }
    Ok(Report {
        version: id.version,
        version_str: id.version_str,
        family: id.family,
        endian: id.endian,
        passes,
        blocks: graph.len(),
        tag_counts,
        interleaved_groups: interleaved,
    })
}

// ── Sort ─────────────────────────────────────────────────────────────────────

/// Rewrite `input` into `output` with every channel group owning its own
/// contiguous record section.
pub fn sort_file(opts: &SortOptions) -> Result<Summary> {
    let mut src = BufReader::new(File::open(&opts.input)?);
    let id = IdBlock::read(&mut src)?;
    let schema = Schema::new(id.family, id.endian, id.version);

    let Resolution { mut graph, passes } = resolve(&mut src, &schema)?;
    let problems = detect_problems(&mut graph, &schema)?;
    info!(problems, "detected data groups needing demultiplexing");

    let anchors: Vec<u64> = graph
        .iter()
        .filter(|(_, b)| b.problem.is_some())
        .map(|(&a, _)| a)
        .collect();

    check_compressed_sections(&graph, &schema, &anchors, opts.unzip)?;

    let mut plans: HashMap<u64, SplitPlan> = HashMap::new();
    for &anchor in &anchors {
        plans.insert(anchor, plan_split(&graph, &schema, anchor, &mut src)?);
    }

    // 3.x stores the data-group count in the header block; splitting changes
    // it, so the header is rebuilt instead of copied.
    if schema.family == Family::V3 && !plans.is_empty() {
        graph.node_mut(graph.root)?.state = WriteState::Synthesized;
    }
    let dg_total = planned_dg_total(&graph, &plans);

    let out = BufWriter::new(File::create(&opts.output)?);
    let mut sink = BlockSink::spawn(out);
    sink.put(&id.raw)?;

    let mut blocks_written = 0u64;
    let mut groups_split = 0usize;
    for addr in graph.order() {
        let (state, length) = {
            let b = graph.node(addr)?;
            (b.state, b.length)
        };
        match state {
            WriteState::Verbatim => {
                align_for(&schema, &mut sink)?;
                let out_addr = sink.position();
                copy_range(&mut src, addr, length, &mut sink)?;
                graph.node_mut(addr)?.out_addr = Some(out_addr);
                blocks_written += 1;
            }
            WriteState::Synthesized => {
                // Only the 3.x header block reaches here from the graph walk.
                let mut bytes = read_exact_at(&mut src, addr, length as usize)?;
                schema.endian.put_u16(
                    &mut bytes[V3_HD_DG_COUNT_OFFSET as usize..V3_HD_DG_COUNT_OFFSET as usize + 2],
                    dg_total,
                );
                let out_addr = sink.put(&bytes)?;
                graph.node_mut(addr)?.out_addr = Some(out_addr);
                blocks_written += 1;
            }
            WriteState::Replaced => {
                if let Some(plan) = plans.remove(&addr) {
                    groups_split += plan.groups.len();
                    blocks_written += emit_split(&mut graph, &schema, &mut src, &mut sink, plan)?;
                }
                // Replaced non-anchor blocks are emitted by their anchor.
            }
        }
    }

    let bytes_written = sink.finish()?;
    debug!(bytes_written, "stream write complete, patching links");

    let mut out = OpenOptions::new().write(true).open(&opts.output)?;
    patch_links(&graph, &schema, &mut out)?;
    out.flush()?;

    info!(blocks_written, bytes_written, groups_split, "sorted file written");
    Ok(Summary { version: id.version, passes, blocks_written, bytes_written, groups_split })
}

/// Inflation lives outside this tool. Without `--unzip` any compressed
/// section is a usage error pointing the caller at the external inflate
/// step. With the flag the caller asserted inflation already happened, so
/// remaining compressed sections pass through verbatim, except where the
/// demultiplexer would need their bytes, which is corruption of the claim.
fn check_compressed_sections(
    graph: &Graph,
    schema: &Schema,
    anchors: &[u64],
    unzip: bool,
) -> Result<()> {
    if !unzip {
        if let Some((&addr, _)) = graph.iter().find(|(_, b)| b.kind == Kind::CompressedData) {
            return Err(SortError::Usage(format!(
                "file holds a compressed data section at {addr:#x}; inflate it first or pass --unzip"
            )));
        }
        return Ok(());
    }
    for &anchor in anchors {
        let section = graph.node(anchor)?.link_target(schema.dg_data_link());
        if section != 0 && graph.node(section)?.kind == Kind::CompressedData {
            return Err(SortError::Corrupt(format!(
                "record section at {section:#x} is still compressed although inflation was asserted"
            )));
        }
    }
    Ok(())
}

/// Data-group count after splitting: every untouched data group stays, every
/// anchor becomes one group per channel group.
fn planned_dg_total(graph: &Graph, plans: &HashMap<u64, SplitPlan>) -> u16 {
    let untouched = graph
        .iter()
        .filter(|(_, b)| b.kind == Kind::DataGroup && b.problem.is_none())
        .count();
    let split: usize = plans.values().map(|p| p.groups.len()).sum();
    (untouched + split) as u16
}

// ── Replacement-set emission ─────────────────────────────────────────────────

/// Emit one anchor's replacement set: per channel group a synthesized
/// single-group data group, the patched channel group, and a contiguous data
/// section replaying the group's records. The first replacement data group
/// takes over the anchor's graph identity via the remap; the last one
/// inherits the anchor's next link so sibling data groups keep their place
/// in the chain.
fn emit_split<R: Read + Seek>(
    graph: &mut Graph,
    schema: &Schema,
    src: &mut R,
    sink: &mut BlockSink,
    plan: SplitPlan,
) -> Result<u64> {
    let n = plan.groups.len();
    let dg_addrs: Vec<u64> = (0..n).map(|_| graph.alloc_synthetic()).collect();
    let mut blocks = 0u64;

    for (i, group) in plan.groups.iter().enumerate() {
        let next = if i + 1 < n { dg_addrs[i + 1] } else { plan.next_after };
        let data_addr = if group.count > 0 { graph.alloc_synthetic() } else { 0 };

        // Synthesized data group. Link slots are zero here; the patch pass
        // fills them.
        align_for(schema, sink)?;
        let (bytes, dg_links) = match schema.family {
            Family::V3 => {
                let mut bytes = vec![0u8; V3_DG_BLOCK_LEN as usize];
                bytes[0..2].copy_from_slice(b"DG");
                LittleEndian::write_u16(&mut bytes[2..4], V3_DG_BLOCK_LEN);
                let o = V3_DG_CG_COUNT_OFFSET as usize;
                schema.endian.put_u16(&mut bytes[o..o + 2], 1);
                let links = vec![
                    Link { offset: 4, target: next },
                    Link { offset: 8, target: group.cg_addr },
                    Link { offset: 12, target: 0 },
                    Link { offset: 16, target: data_addr },
                ];
                (bytes, links)
            }
            Family::V4 => {
                let mut bytes = vec![0u8; V4_DG_BLOCK_LEN as usize];
                bytes[0..4].copy_from_slice(b"##DG");
                LittleEndian::write_u64(&mut bytes[8..16], V4_DG_BLOCK_LEN);
                LittleEndian::write_u64(&mut bytes[16..24], 4);
                // Record-id width byte at the start of the data section
                // stays 0: the replacement group is alone in its section.
                let links = vec![
                    Link { offset: 24, target: next },
                    Link { offset: 32, target: group.cg_addr },
                    Link { offset: 40, target: data_addr },
                    Link { offset: 48, target: 0 },
                ];
                (bytes, links)
            }
        };
        let dg_len = bytes.len() as u64;
        let dg_out = sink.put(&bytes)?;
        let mut dg = Block::new(dg_addrs[i], *b"DG", dg_len, Kind::DataGroup);
        dg.state = WriteState::Synthesized;
        dg.out_addr = Some(dg_out);
        dg.links = dg_links;
        dg.data = BlockData::DataGroup { channel_groups: 1, record_ids: 0 };
        graph.insert(dg)?;
        blocks += 1;

        // The original channel group, with its multiplex linkage cleared:
        // no next group, record id 0, count trimmed to the records found.
        align_for(schema, sink)?;
        let (cg_len, cg_link_count) = {
            let node = graph.node(group.cg_addr)?;
            (node.length as usize, node.links.len())
        };
        let mut cg = read_exact_at(src, group.cg_addr, cg_len)?;
        match schema.family {
            Family::V3 => {
                let id = V3_CG_RECORD_ID_OFFSET as usize;
                schema.endian.put_u16(&mut cg[id..id + 2], 0);
                let cc = V3_CG_CYCLE_COUNT_OFFSET as usize;
                schema.endian.put_u32(&mut cg[cc..cc + 4], group.count as u32);
            }
            Family::V4 => {
                let ds = (V4_HEADER_LEN as usize) + 8 * cg_link_count;
                LittleEndian::write_u64(&mut cg[ds..ds + 8], 0);
                LittleEndian::write_u64(&mut cg[ds + 8..ds + 16], group.count);
            }
        }
        let cg_out = sink.put(&cg)?;
        {
            let node = graph.node_mut(group.cg_addr)?;
            node.out_addr = Some(cg_out);
            node.links[0].target = 0;
            node.data = BlockData::ChannelGroup {
                record_id: 0,
                record_size: group.record_size,
                record_count: group.count,
                flags: 0,
            };
        }
        blocks += 1;

        // The group's records, in scan order.
        if data_addr != 0 {
            align_for(schema, sink)?;
            let out_addr = sink.position();
            let mut payload = 0u64;
            if schema.family == Family::V4 {
                let mut head = vec![0u8; V4_HEADER_LEN as usize];
                head[0..4].copy_from_slice(b"##DT");
                let total: u64 = plan_runs_len(group.runs.as_slice());
                LittleEndian::write_u64(&mut head[8..16], V4_HEADER_LEN + total);
                sink.put(&head)?;
            }
            for &(run_start, run_len) in &group.runs {
                copy_range(src, run_start, run_len, sink)?;
                payload += run_len;
            }
            let length = match schema.family {
                Family::V3 => payload,
                Family::V4 => V4_HEADER_LEN + payload,
            };
            let mut dt = Block::new(data_addr, *b"DT", length, Kind::RawData);
            dt.state = WriteState::Synthesized;
            dt.out_addr = Some(out_addr);
            graph.insert(dt)?;
            blocks += 1;
        }
    }

    graph.set_remap(plan.anchor, dg_addrs[0]);
    Ok(blocks)
}

fn plan_runs_len(runs: &[(u64, u64)]) -> u64 {
    runs.iter().map(|&(_, l)| l).sum()
}

// ── Link patching ────────────────────────────────────────────────────────────

/// Rewrite every link slot of every written block with the output address of
/// its (possibly remapped) target.
fn patch_links(graph: &Graph, schema: &Schema, out: &mut File) -> Result<()> {
    let mut patched = 0u64;
    for (_, block) in graph.iter() {
        let Some(base) = block.out_addr else { continue };
        for link in &block.links {
            let target = graph.resolve_target(link.target);
            let resolved = if target == 0 {
                0
            } else {
                graph.node(target)?.out_addr.ok_or_else(|| {
                    SortError::Corrupt(format!("link target {target:#x} was never written"))
                })?
            };
            out.seek(SeekFrom::Start(base + link.offset as u64))?;
            match schema.family {
                Family::V3 => {
                    let addr = u32::try_from(resolved).map_err(|_| {
                        SortError::Corrupt(
                            "output grew beyond the 4 GiB a 3.x link can address".into(),
                        )
                    })?;
                    let mut buf = [0u8; 4];
                    schema.endian.put_u32(&mut buf, addr);
                    out.write_all(&buf)?;
                }
                Family::V4 => {
                    let mut buf = [0u8; 8];
                    LittleEndian::write_u64(&mut buf, resolved);
                    out.write_all(&buf)?;
                }
            }
            patched += 1;
        }
    }
    debug!(patched, "links patched");
    Ok(())
}

// ── Copy helpers ─────────────────────────────────────────────────────────────

fn read_exact_at<R: Read + Seek>(src: &mut R, addr: u64, len: usize) -> Result<Vec<u8>> {
    src.seek(SeekFrom::Start(addr))?;
    let mut buf = vec![0u8; len];
    src.read_exact(&mut buf)?;
    Ok(buf)
}

fn copy_range<R: Read + Seek>(src: &mut R, addr: u64, len: u64, sink: &mut BlockSink) -> Result<()> {
    src.seek(SeekFrom::Start(addr))?;
    let mut remaining = len;
    let mut buf = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let take = remaining.min(COPY_CHUNK as u64) as usize;
        src.read_exact(&mut buf[..take])?;
        sink.put(&buf[..take])?;
        remaining -= take as u64;
    }
    Ok(())
}

/// 4.x blocks start on 8-byte boundaries; 3.x has no alignment rule.
fn align_for(schema: &Schema, sink: &mut BlockSink) -> Result<()> {
    if schema.family == Family::V4 {
        let rem = (sink.position() % 8) as usize;
        if rem != 0 {
            sink.put(&[0u8; 8][..8 - rem])?;
        }
    }
    Ok(())
}
