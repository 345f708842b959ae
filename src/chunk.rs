//! Mechanical chunking: the finest pairwise-disjoint units of change.
//!
//! A chunk is one contiguous edit against the base file. Because the gateway
//! produces zero-context hunks, every hunk is already a maximal run of
//! removed/added lines; the only further splitting is of pure insertions and
//! pure deletions at blank-line boundaries, controlled by `ChunkingLevel`.
//! Chunks are disjoint on both sides, so any subset can be applied to the
//! base in a single deterministic pass (`compose`).

use std::collections::BTreeMap;

use crate::errors::{Error, Result};
use crate::owned::{Block, Delta, DeltaKind};

pub type ChunkId = usize;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: ChunkId,
    pub path: String,
    pub removed: Block,
    pub added: Block,
}

impl Chunk {
    /// Number of old-file lines strictly before this chunk. This is the
    /// split point for composition: copy `old_anchor` lines, emit the added
    /// side, skip the removed side.
    pub fn old_anchor(&self) -> usize {
        if self.removed.is_empty() {
            // for insertions git records the line the insert follows
            self.removed.start as usize
        } else {
            self.removed.start as usize - 1
        }
    }

    /// Inclusive line span on the new side, clamped to 1 for edits that sit
    /// above the first line.
    pub fn new_span(&self) -> (u32, u32) {
        if self.added.is_empty() {
            let p = self.added.start.max(1);
            (p, p)
        } else {
            (self.added.start, self.added.start + self.added.len() - 1)
        }
    }

    pub fn is_pure_insert(&self) -> bool {
        self.removed.is_empty() && !self.added.is_empty()
    }

    pub fn is_pure_delete(&self) -> bool {
        self.added.is_empty() && !self.removed.is_empty()
    }
}

/// Per-file bookkeeping the tree materializer needs besides the chunks
/// themselves.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: String,
    pub old_path: Option<String>,
    pub kind: DeltaKind,
    pub binary: bool,
    pub old_id: git2::Oid,
    pub new_id: git2::Oid,
    pub old_mode: i32,
    pub new_mode: i32,
    pub chunk_ids: Vec<ChunkId>,
}

/// All chunks of a run plus the per-file metadata, in canonical order:
/// files sorted by path, chunks by old offset within each file, ids dense.
#[derive(Debug, Default)]
pub struct ChunkSet {
    pub chunks: Vec<Chunk>,
    pub files: BTreeMap<String, FileMeta>,
}

impl ChunkSet {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk(&self, id: ChunkId) -> &Chunk {
        &self.chunks[id]
    }

    pub fn meta(&self, path: &str) -> &FileMeta {
        &self.files[path]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingLevel {
    None,
    FullFiles,
    AllFiles,
}

impl std::str::FromStr for ChunkingLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "none" => Ok(ChunkingLevel::None),
            "full_files" => Ok(ChunkingLevel::FullFiles),
            "all_files" => Ok(ChunkingLevel::AllFiles),
            other => Err(format!("unknown chunking level {:?}", other)),
        }
    }
}

/// Split owned deltas into chunks.
pub fn split(mut deltas: Vec<Delta>, level: ChunkingLevel) -> ChunkSet {
    deltas.sort_by(|a, b| a.path.cmp(&b.path));

    let mut set = ChunkSet::default();
    for delta in deltas {
        let mut chunk_ids = Vec::new();

        if delta.binary || delta.hunks.is_empty() {
            // binary payloads, pure renames and mode changes carry no line
            // edits; they still need one chunk so the partition covers them
            let id = set.chunks.len();
            set.chunks.push(Chunk {
                id,
                path: delta.path.clone(),
                removed: Block::empty(0),
                added: Block::empty(0),
            });
            chunk_ids.push(id);
        } else {
            for hunk in &delta.hunks {
                let split_this = match level {
                    ChunkingLevel::None => false,
                    ChunkingLevel::FullFiles => {
                        matches!(delta.kind, DeltaKind::Added | DeltaKind::Deleted)
                    }
                    ChunkingLevel::AllFiles => {
                        hunk.removed.is_empty() || hunk.added.is_empty()
                    }
                };

                let parts = if split_this && hunk.removed.is_empty() {
                    split_block_at_blanks(&hunk.added)
                        .into_iter()
                        .map(|added| (Block::empty(hunk.removed.start), added))
                        .collect()
                } else if split_this && hunk.added.is_empty() {
                    split_block_at_blanks(&hunk.removed)
                        .into_iter()
                        .map(|removed| (removed, Block::empty(hunk.added.start)))
                        .collect()
                } else {
                    vec![(hunk.removed.clone(), hunk.added.clone())]
                };

                for (removed, added) in parts {
                    let id = set.chunks.len();
                    set.chunks.push(Chunk {
                        id,
                        path: delta.path.clone(),
                        removed,
                        added,
                    });
                    chunk_ids.push(id);
                }
            }
        }

        set.files.insert(
            delta.path.clone(),
            FileMeta {
                path: delta.path,
                old_path: delta.old_path,
                kind: delta.kind,
                binary: delta.binary,
                old_id: delta.old_id,
                new_id: delta.new_id,
                old_mode: delta.old_mode,
                new_mode: delta.new_mode,
                chunk_ids,
            },
        );
    }
    set
}

fn is_blank(line: &[u8]) -> bool {
    line.iter().all(|b| b.is_ascii_whitespace())
}

/// Split a one-sided block into maximal non-blank regions. Blank separator
/// lines ride with the region they follow, so the regions concatenate back
/// to the original block.
fn split_block_at_blanks(block: &Block) -> Vec<Block> {
    let mut regions: Vec<Block> = Vec::new();
    let mut current: Vec<Vec<u8>> = Vec::new();
    let mut current_start = block.start;
    let mut seen_blank_tail = false;

    for (idx, line) in block.lines.iter().enumerate() {
        let blank = is_blank(line);
        if !blank && seen_blank_tail && !current.is_empty() {
            regions.push(Block {
                start: current_start,
                lines: std::mem::take(&mut current),
                trailing_newline: true,
            });
            current_start = block.start + idx as u32;
            seen_blank_tail = false;
        }
        if blank && !current.is_empty() {
            seen_blank_tail = true;
        }
        current.push(line.clone());
    }
    if !current.is_empty() {
        regions.push(Block {
            start: current_start,
            lines: current,
            trailing_newline: block.trailing_newline,
        });
    }

    if regions.len() < 2 {
        return vec![block.clone()];
    }
    regions
}

/// Return slices for lines [1..n] and [n+1; ...].
fn split_lines_after(content: &[u8], n: usize) -> (&[u8], &[u8]) {
    let split_index = if n > 0 {
        memchr::Memchr::new(b'\n', content)
            .nth(n - 1) // the position of '\n' ending the `n`-th line
            .map(|x| x + 1)
            .unwrap_or(content.len())
    } else {
        0
    };
    content.split_at(split_index)
}

/// Apply a subset of one file's chunks to the base content.
///
/// The result depends only on the subset, not on the order given: chunks are
/// re-sorted by old anchor (insertions at the same anchor tie-break by their
/// new-side position). The removed side of each chunk is checked against the
/// base bytes it displaces, so drifted arithmetic surfaces as
/// `Error::Invariant` instead of a corrupted tree.
pub fn compose(base: &[u8], chunks: &[&Chunk]) -> Result<Vec<u8>> {
    let mut sorted: Vec<&Chunk> = chunks.to_vec();
    sorted.sort_by_key(|c| (c.old_anchor(), c.added.start));

    let mut out = Vec::with_capacity(base.len());
    let mut rest = base;
    let mut consumed = 0usize;

    for chunk in sorted {
        let anchor = chunk.old_anchor();
        if anchor < consumed {
            return Err(Error::Invariant(format!(
                "chunks overlap on the old side of {}",
                chunk.path
            )));
        }
        let (pre, post) = split_lines_after(rest, anchor - consumed);
        out.extend_from_slice(pre);
        rest = post;
        consumed = anchor;

        for line in &chunk.added.lines {
            out.extend_from_slice(line);
        }

        let (displaced, post) = split_lines_after(rest, chunk.removed.len() as usize);
        let expected: usize = chunk.removed.lines.iter().map(|l| l.len()).sum();
        if displaced.len() != expected
            || !chunk
                .removed
                .lines
                .iter()
                .scan(0usize, |off, l| {
                    let matches = displaced[*off..].starts_with(l);
                    *off += l.len();
                    Some(matches)
                })
                .all(|m| m)
        {
            return Err(Error::Invariant(format!(
                "removed lines of {} do not match the base content",
                chunk.path
            )));
        }
        rest = post;
        consumed += chunk.removed.len() as usize;
    }

    out.extend_from_slice(rest);
    Ok(out)
}

/// Check chunk exhaustiveness for one file: applying every chunk must
/// reproduce the target content byte for byte.
pub fn verify_exhaustive(base: &[u8], chunks: &[&Chunk], target: &[u8]) -> Result<()> {
    let produced = compose(base, chunks)?;
    if produced != target {
        let path = chunks
            .first()
            .map(|c| c.path.as_str())
            .unwrap_or("<empty>");
        return Err(Error::Invariant(format!(
            "chunks of {} do not reproduce the target content",
            path
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        let mut rest = text.as_bytes();
        while !rest.is_empty() {
            let end = memchr::memchr(b'\n', rest).map(|i| i + 1).unwrap_or(rest.len());
            out.push(rest[..end].to_vec());
            rest = &rest[end..];
        }
        out
    }

    fn chunk(id: ChunkId, old_start: u32, removed: &str, new_start: u32, added: &str) -> Chunk {
        Chunk {
            id,
            path: "a.txt".to_string(),
            removed: Block {
                start: old_start,
                lines: lines(removed),
                trailing_newline: true,
            },
            added: Block {
                start: new_start,
                lines: lines(added),
                trailing_newline: true,
            },
        }
    }

    const BASE: &[u8] = b"one\ntwo\nthree\nfour\n";

    #[test]
    fn compose_replaces_lines_in_place() {
        // replace "two" with "2"
        let c = chunk(0, 2, "two\n", 2, "2\n");
        let out = compose(BASE, &[&c]).unwrap();
        assert_eq!(out, b"one\n2\nthree\nfour\n");
    }

    #[test]
    fn compose_insertion_at_top_and_bottom() {
        let top = chunk(0, 0, "", 1, "zero\n");
        let bottom = chunk(1, 4, "", 6, "five\n");
        let out = compose(BASE, &[&top, &bottom]).unwrap();
        assert_eq!(out, b"zero\none\ntwo\nthree\nfour\nfive\n");
    }

    #[test]
    fn compose_is_order_free() {
        let a = chunk(0, 1, "one\n", 1, "ONE\n");
        let b = chunk(1, 3, "three\n", 3, "THREE\n");
        let ab = compose(BASE, &[&a, &b]).unwrap();
        let ba = compose(BASE, &[&b, &a]).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab, b"ONE\ntwo\nTHREE\nfour\n");
    }

    #[test]
    fn compose_subset_leaves_other_regions_untouched() {
        let a = chunk(0, 1, "one\n", 1, "ONE\n");
        let b = chunk(1, 3, "three\n", 3, "THREE\n");
        let only_b = compose(BASE, &[&b]).unwrap();
        assert_eq!(only_b, b"one\ntwo\nTHREE\nfour\n");
        let _ = a;
    }

    #[test]
    fn compose_rejects_overlapping_chunks() {
        let a = chunk(0, 2, "two\nthree\n", 2, "X\n");
        let b = chunk(1, 3, "three\n", 3, "Y\n");
        assert!(matches!(
            compose(BASE, &[&a, &b]),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn compose_rejects_stale_removed_lines() {
        let c = chunk(0, 2, "not-two\n", 2, "2\n");
        assert!(matches!(compose(BASE, &[&c]), Err(Error::Invariant(_))));
    }

    #[test]
    fn verify_exhaustive_detects_missing_chunks() {
        let a = chunk(0, 1, "one\n", 1, "ONE\n");
        let err = verify_exhaustive(BASE, &[&a], b"ONE\ntwo\nTHREE\nfour\n");
        assert!(matches!(err, Err(Error::Invariant(_))));
    }

    #[test]
    fn blank_line_split_produces_disjoint_regions() {
        let block = Block {
            start: 1,
            lines: lines("fn a() {}\n\nfn b() {}\n\n\nfn c() {}\n"),
            trailing_newline: true,
        };
        let parts = split_block_at_blanks(&block);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].start, 1);
        assert_eq!(parts[1].start, 3);
        assert_eq!(parts[2].start, 6);
        // regions concatenate back to the original block
        let total: Vec<Vec<u8>> = parts.into_iter().flat_map(|b| b.lines).collect();
        assert_eq!(total, block.lines);
    }

    #[test]
    fn blank_only_block_stays_whole() {
        let block = Block {
            start: 1,
            lines: lines("\n\n"),
            trailing_newline: true,
        };
        assert_eq!(split_block_at_blanks(&block).len(), 1);
    }

    #[test]
    fn split_levels_control_granularity() {
        let delta = Delta {
            path: "new.py".to_string(),
            old_path: None,
            kind: DeltaKind::Added,
            old_id: git2::Oid::zero(),
            new_id: git2::Oid::zero(),
            old_mode: 0,
            new_mode: 0o100644,
            binary: false,
            hunks: vec![crate::owned::Hunk {
                removed: Block::empty(0),
                added: Block {
                    start: 1,
                    lines: lines("def f():\n    return 1\n\ndef g():\n    return 2\n"),
                    trailing_newline: true,
                },
            }],
        };

        let whole = split(vec![delta.clone()], ChunkingLevel::None);
        assert_eq!(whole.chunks.len(), 1);

        let fine = split(vec![delta], ChunkingLevel::AllFiles);
        assert_eq!(fine.chunks.len(), 2);
        // both chunks share the insertion anchor but are disjoint on the new side
        assert_eq!(fine.chunks[0].old_anchor(), fine.chunks[1].old_anchor());
        assert!(fine.chunks[0].new_span().1 < fine.chunks[1].new_span().0);
    }

    #[test]
    fn split_applied_to_base_reproduces_target() {
        let target = b"def f():\n    return 1\n\ndef g():\n    return 2\n";
        let delta = Delta {
            path: "new.py".to_string(),
            old_path: None,
            kind: DeltaKind::Added,
            old_id: git2::Oid::zero(),
            new_id: git2::Oid::zero(),
            old_mode: 0,
            new_mode: 0o100644,
            binary: false,
            hunks: vec![crate::owned::Hunk {
                removed: Block::empty(0),
                added: Block {
                    start: 1,
                    lines: lines(std::str::from_utf8(target).unwrap()),
                    trailing_newline: true,
                },
            }],
        };
        let set = split(vec![delta], ChunkingLevel::AllFiles);
        let refs: Vec<&Chunk> = set.chunks.iter().collect();
        verify_exhaustive(b"", &refs, target).unwrap();
    }
}
