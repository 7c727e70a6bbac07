//! Interleaved-record detection aftermath: scanning and splitting.
//!
//! A data group whose record section is shared by several channel groups
//! stores the groups' records interleaved, each prefixed (and in the legacy
//! redundant mode also suffixed) by a fixed-width identifier. The scan is
//! strictly sequential: identifiers drive the cursor from record to record,
//! an identifier of 0 or a clean end of section trims the declared counts
//! to what was actually found, and any other unregistered identifier is
//! fatal corruption.
//!
//! The planner turns one anchor data group into a replacement set: per
//! channel group, a synthesized single-group data group, the original
//! channel group with its multiplex linkage cleared, and a data section
//! replaying the group's records in scan order with adjacent runs coalesced
//! into single copy requests.

use std::collections::HashMap;
use std::io::{Read, Seek};

use tracing::{debug, info, warn};

use crate::error::{Result, SortError};
use crate::graph::{BlockData, Graph};
use crate::provider::CachedReader;
use crate::schema::{Family, Kind, Schema, V4_CG_FLAG_VLSD, V4_HEADER_LEN, LINK_NEXT};

// ── Plan model ───────────────────────────────────────────────────────────────

/// Everything the writer needs to emit one channel group's replacement.
#[derive(Debug)]
pub struct GroupPlan {
    pub cg_addr: u64,
    pub record_size: u32,
    /// Record count after trimming to what the scan actually found.
    pub count: u64,
    /// Coalesced absolute source ranges of the record payloads, in scan
    /// order.
    pub runs: Vec<(u64, u64)>,
}

/// Replacement plan for one interleaved data group.
#[derive(Debug)]
pub struct SplitPlan {
    pub anchor: u64,
    pub groups: Vec<GroupPlan>,
    /// The anchor's original next-group link; the last replacement data
    /// group inherits it so sibling data groups keep their chain position.
    pub next_after: u64,
}

/// Identifier registration for the scan.
#[derive(Debug, Clone, Copy)]
pub struct GroupLayout {
    pub id: u64,
    pub size: u32,
    pub declared: u64,
}

// ── Planner ──────────────────────────────────────────────────────────────────

/// Scan the anchor's shared record section and build its replacement plan.
pub fn plan_split<R: Read + Seek>(
    graph: &Graph,
    schema: &Schema,
    anchor: u64,
    src: &mut R,
) -> Result<SplitPlan> {
    let dg = graph.node(anchor)?;
    let record_ids = match dg.data {
        BlockData::DataGroup { record_ids, .. } => record_ids,
        _ => return Err(SortError::Corrupt(format!("anchor at {anchor:#x} is not a data group"))),
    };

    let section_addr = dg.link_target(schema.dg_data_link());
    let section = graph.node(section_addr)?;
    let (payload_base, payload_len) = match (schema.family, section.kind) {
        (Family::V3, Kind::RawData) => (section.addr, section.length),
        (Family::V4, Kind::RawData) => {
            (section.addr + V4_HEADER_LEN, section.length - V4_HEADER_LEN)
        }
        (_, Kind::DataList | Kind::ListHeader) => {
            return Err(SortError::Corrupt(format!(
                "data group at {anchor:#x} stores its interleaved records in a data list; \
                 concatenate the list first"
            )))
        }
        (_, kind) => {
            return Err(SortError::Corrupt(format!(
                "data group at {anchor:#x} links a {kind:?} block as its record section"
            )))
        }
    };

    if record_ids == 0 {
        return Err(SortError::Corrupt(format!(
            "data group at {anchor:#x} interleaves several channel groups \
             but its records carry no identifiers"
        )));
    }
    // 3.x ids are one byte each; record_ids counts them (2 = redundant
    // trailing id). 4.x stores the width of the single leading id.
    let (id_width, redundant) = match schema.family {
        Family::V3 => (1usize, record_ids == 2),
        Family::V4 => (record_ids as usize, false),
    };

    let chain = graph.cg_chain(anchor)?;
    let mut layouts = Vec::with_capacity(chain.len());
    for &cg_addr in &chain {
        let cg = graph.node(cg_addr)?;
        // Clearing the multiplex linkage later rewrites the next-group
        // slot; a channel group without link fields has nowhere to put it.
        if cg.links.is_empty() {
            return Err(SortError::Corrupt(format!(
                "channel group at {cg_addr:#x} carries no link fields"
            )));
        }
        match cg.data {
            BlockData::ChannelGroup { record_id, record_size, record_count, flags } => {
                if schema.family == Family::V4 && flags & V4_CG_FLAG_VLSD != 0 {
                    return Err(SortError::Corrupt(format!(
                        "channel group at {cg_addr:#x} holds variable-length records \
                         and cannot be demultiplexed"
                    )));
                }
                layouts.push(GroupLayout { id: record_id, size: record_size, declared: record_count });
            }
            _ => {
                return Err(SortError::Corrupt(format!(
                    "channel group at {cg_addr:#x} was never refined"
                )))
            }
        }
    }

    let mut provider = CachedReader::new(src, payload_base, payload_len);
    let starts = scan_records(&mut provider, &layouts, id_width, redundant, schema)?;

    let mut groups = Vec::with_capacity(chain.len());
    for ((&cg_addr, layout), starts) in chain.iter().zip(&layouts).zip(&starts) {
        let count = starts.len() as u64;
        if count < layout.declared {
            warn!(
                cg = format_args!("{cg_addr:#x}"),
                declared = layout.declared,
                found = count,
                "trimming channel group record count to the records actually present"
            );
        }
        let abs: Vec<u64> =
            starts.iter().map(|&s| payload_base + s + id_width as u64).collect();
        groups.push(GroupPlan {
            cg_addr,
            record_size: layout.size,
            count,
            runs: coalesce_runs(&abs, layout.size as u64),
        });
    }

    Ok(SplitPlan { anchor, groups, next_after: dg.link_target(LINK_NEXT) })
}

// ── Scan ─────────────────────────────────────────────────────────────────────

/// Walk the interleaved section once, returning each group's record start
/// offsets (section-relative, pointing at the leading identifier) in scan
/// order.
pub fn scan_records<R: Read + Seek>(
    provider: &mut CachedReader<R>,
    groups: &[GroupLayout],
    id_width: usize,
    redundant: bool,
    schema: &Schema,
) -> Result<Vec<Vec<u64>>> {
    let mut by_id: HashMap<u64, usize> = HashMap::new();
    for (i, g) in groups.iter().enumerate() {
        if by_id.insert(g.id, i).is_some() {
            return Err(SortError::Corrupt(format!(
                "record id {} is registered by more than one channel group",
                g.id
            )));
        }
    }

    let section_len = provider.section_len();
    let total: u64 = groups.iter().map(|g| g.declared).sum();
    let mut starts: Vec<Vec<u64>> = groups.iter().map(|_| Vec::new()).collect();
    let mut offset = 0u64;
    let mut found = 0u64;

    while found < total {
        if offset + id_width as u64 > section_len {
            warn!(found, declared = total, "record section exhausted before the declared counts");
            break;
        }
        let id = provider.read_uint(offset, id_width, schema.endian)?;
        let Some(&idx) = by_id.get(&id) else {
            if id == 0 {
                info!("record id 0 found, cutting off missing records since those are not recoverable");
                break;
            }
            return Err(SortError::UnknownRecordId { id, offset });
        };
        let size = groups[idx].size as u64;
        let trailer = if redundant { id_width as u64 } else { 0 };
        let end = offset + id_width as u64 + size + trailer;
        if end > section_len {
            warn!(
                id,
                offset,
                "record overruns the section end; trimming the remaining counts"
            );
            break;
        }
        if redundant {
            let trailing = provider.read_uint(offset + id_width as u64 + size, id_width, schema.endian)?;
            if trailing != id {
                warn!(leading = id, trailing, offset, "leading and trailing record ids disagree");
            }
        }
        if starts[idx].len() as u64 >= groups[idx].declared {
            return Err(SortError::Corrupt(format!(
                "more records with id {id} than the channel group declares"
            )));
        }
        starts[idx].push(offset);
        offset = end;
        found += 1;
    }

    debug!(found, "record scan complete");
    Ok(starts)
}

/// Merge adjacent payload ranges into single copy requests.
fn coalesce_runs(starts: &[u64], len: u64) -> Vec<(u64, u64)> {
    let mut runs: Vec<(u64, u64)> = Vec::new();
    for &s in starts {
        match runs.last_mut() {
            Some((run_start, run_len)) if *run_start + *run_len == s => *run_len += len,
            _ => runs.push((s, len)),
        }
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Endian;
    use std::io::Cursor;

    fn v3() -> Schema {
        Schema::new(Family::V3, Endian::Little, 330)
    }

    /// One record: leading id, then `size` payload bytes of `fill`.
    fn rec(section: &mut Vec<u8>, id: u8, size: usize, fill: u8) {
        section.push(id);
        section.extend(std::iter::repeat(fill).take(size));
    }

    fn scan(section: Vec<u8>, groups: &[GroupLayout], redundant: bool) -> Result<Vec<Vec<u64>>> {
        let len = section.len() as u64;
        let mut cur = Cursor::new(section);
        let mut provider = CachedReader::new(&mut cur, 0, len);
        scan_records(&mut provider, groups, 1, redundant, &v3())
    }

    fn ab_layout() -> Vec<GroupLayout> {
        vec![
            GroupLayout { id: 1, size: 8, declared: 5 },
            GroupLayout { id: 2, size: 4, declared: 3 },
        ]
    }

    #[test]
    fn splits_interleaved_groups_in_order() {
        // A(8 bytes) x5 and B(4 bytes) x3, sequence A,B,A,A,B,A,B,A.
        let mut s = Vec::new();
        for (id, size, fill) in [
            (1, 8, 0xA0),
            (2, 4, 0xB0),
            (1, 8, 0xA1),
            (1, 8, 0xA2),
            (2, 4, 0xB1),
            (1, 8, 0xA3),
            (2, 4, 0xB2),
            (1, 8, 0xA4),
        ] {
            rec(&mut s, id, size, fill);
        }
        let starts = scan(s, &ab_layout(), false).unwrap();
        assert_eq!(starts[0], vec![0, 14, 23, 37, 51]);
        assert_eq!(starts[1], vec![9, 32, 46]);
        assert_eq!(starts[0].len() as u64 * 8, 40);
        assert_eq!(starts[1].len() as u64 * 4, 12);
    }

    #[test]
    fn sentinel_trims_counts() {
        let mut s = Vec::new();
        for fill in 0..5 {
            rec(&mut s, 1, 8, 0xA0 + fill);
        }
        rec(&mut s, 2, 4, 0xB0);
        s.push(0); // sentinel; B's remaining records are gone
        s.extend([0u8; 16]);
        let starts = scan(s, &ab_layout(), false).unwrap();
        assert_eq!(starts[0].len(), 5);
        assert_eq!(starts[1].len(), 1);
    }

    #[test]
    fn section_end_trims_counts() {
        let mut s = Vec::new();
        rec(&mut s, 1, 8, 0xA0);
        rec(&mut s, 2, 4, 0xB0);
        let starts = scan(s, &ab_layout(), false).unwrap();
        assert_eq!(starts[0].len(), 1);
        assert_eq!(starts[1].len(), 1);
    }

    #[test]
    fn unknown_id_is_fatal() {
        let mut s = Vec::new();
        rec(&mut s, 1, 8, 0xA0);
        rec(&mut s, 9, 4, 0xEE);
        assert!(matches!(
            scan(s, &ab_layout(), false),
            Err(SortError::UnknownRecordId { id: 9, offset: 9 })
        ));
    }

    #[test]
    fn overflowing_a_declared_count_is_fatal() {
        let groups = vec![
            GroupLayout { id: 1, size: 8, declared: 1 },
            GroupLayout { id: 2, size: 4, declared: 2 },
        ];
        let mut s = Vec::new();
        rec(&mut s, 1, 8, 0xA0);
        rec(&mut s, 1, 8, 0xA1);
        rec(&mut s, 2, 4, 0xB0);
        assert!(matches!(scan(s, &groups, false), Err(SortError::Corrupt(_))));
    }

    #[test]
    fn redundant_ids_are_verified_not_fatal() {
        let groups = vec![GroupLayout { id: 1, size: 4, declared: 2 }];
        let mut s = Vec::new();
        s.push(1);
        s.extend([0xA0; 4]);
        s.push(1); // matching trailer
        s.push(1);
        s.extend([0xA1; 4]);
        s.push(3); // mismatching trailer: logged, not fatal
        let starts = scan(s, &groups, true).unwrap();
        assert_eq!(starts[0], vec![0, 6]);
    }

    #[test]
    fn duplicate_registration_is_fatal() {
        let groups = vec![
            GroupLayout { id: 1, size: 8, declared: 1 },
            GroupLayout { id: 1, size: 4, declared: 1 },
        ];
        assert!(matches!(scan(vec![], &groups, false), Err(SortError::Corrupt(_))));
    }

    #[test]
    fn adjacent_runs_coalesce() {
        assert_eq!(coalesce_runs(&[0, 8, 20], 8), vec![(0, 16), (20, 8)]);
        assert_eq!(coalesce_runs(&[5], 4), vec![(5, 4)]);
        assert!(coalesce_runs(&[], 4).is_empty());
    }
}
