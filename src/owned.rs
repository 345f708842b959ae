//! Owned copies of libgit2 diff data.
//!
//! Everything downstream of the repository gateway works on these structures
//! so that no borrow of a `git2::Diff` escapes into the pipeline.

use crate::errors::{Error, Result};

/// One side of a hunk: a starting line number (1-based, git convention) and
/// the lines on that side. For a pure insertion the removed block is empty
/// and its `start` names the line *after which* the insertion lands (0 for
/// the top of the file); symmetrically for pure deletions on the added side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub start: u32,
    pub lines: Vec<Vec<u8>>,
    pub trailing_newline: bool,
}

impl Block {
    pub fn empty(start: u32) -> Block {
        Block {
            start,
            lines: Vec::new(),
            trailing_newline: true,
        }
    }

    pub fn len(&self) -> u32 {
        self.lines.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Hunk {
    pub removed: Block,
    pub added: Block,
}

impl Hunk {
    /// Lift one libgit2 hunk into owned blocks.
    ///
    /// The chunker's composition arithmetic depends on every hunk being
    /// line-addressable: each removed line must sit at `old_start + n` and
    /// each added line at `new_start + n`, densely, in diff order. Anything
    /// libgit2 hands us that breaks that shape is refused here rather than
    /// miscomposed later.
    fn read(patch: &mut git2::Patch, idx: usize) -> Result<Hunk> {
        let (old_start, old_count, new_start, new_count) = {
            let (header, _) = patch.hunk(idx)?;
            (
                header.old_start(),
                header.old_lines(),
                header.new_start(),
                header.new_lines(),
            )
        };

        let mut removed = Vec::with_capacity(old_count as usize);
        let mut added = Vec::with_capacity(new_count as usize);
        let mut removed_eof_newline = true;
        let mut added_eof_newline = true;

        for line_idx in 0..patch.num_lines_in_hunk(idx)? {
            let line = patch.line_in_hunk(idx, line_idx)?;
            match line.origin() {
                '-' => {
                    let at = old_start + removed.len() as u32;
                    if line.num_lines() > 1 || line.old_lineno() != Some(at) {
                        return Err(invalid(&format!(
                            "hunk {} removes lines out of sequence near old line {}",
                            idx, at
                        )));
                    }
                    removed.push(line.content().to_vec());
                }
                '+' => {
                    let at = new_start + added.len() as u32;
                    if line.num_lines() > 1 || line.new_lineno() != Some(at) {
                        return Err(invalid(&format!(
                            "hunk {} adds lines out of sequence near new line {}",
                            idx, at
                        )));
                    }
                    added.push(line.content().to_vec());
                }
                // markers for a missing newline at end of file
                '>' => removed_eof_newline = false,
                '<' => added_eof_newline = false,
                other => {
                    return Err(invalid(&format!(
                        "hunk {} carries an unexpected {:?} line",
                        idx, other
                    )));
                }
            }
        }

        if removed.len() != old_count as usize || added.len() != new_count as usize {
            return Err(invalid(&format!(
                "hunk {} disagrees with its header: -{} of {}, +{} of {}",
                idx,
                removed.len(),
                old_count,
                added.len(),
                new_count
            )));
        }

        Ok(Hunk {
            removed: Block {
                start: old_start,
                lines: removed,
                trailing_newline: removed_eof_newline,
            },
            added: Block {
                start: new_start,
                lines: added,
                trailing_newline: added_eof_newline,
            },
        })
    }
}

/// What happened to a file between the base and target trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    Added,
    Deleted,
    Modified,
    Renamed,
}

/// A per-path record of the diff, with the raw hunks already lifted out of
/// libgit2. Paths must be valid UTF-8; the pipeline keys language detection,
/// grouping and the model payloads off string paths.
#[derive(Debug, Clone)]
pub struct Delta {
    pub path: String,
    pub old_path: Option<String>,
    pub kind: DeltaKind,
    pub old_id: git2::Oid,
    pub new_id: git2::Oid,
    pub old_mode: i32,
    pub new_mode: i32,
    pub binary: bool,
    pub hunks: Vec<Hunk>,
}

fn invalid(msg: &str) -> Error {
    Error::Gateway(git2::Error::from_str(msg))
}

fn utf8_path(bytes: Option<&[u8]>) -> Result<Option<String>> {
    match bytes {
        None => Ok(None),
        Some(b) => std::str::from_utf8(b)
            .map(|s| Some(s.to_string()))
            .map_err(|_| invalid("non-UTF-8 path in diff")),
    }
}

/// Lift a `git2::Diff` into owned deltas. Unmodified and ignored entries are
/// skipped; renames must have been detected by the caller (`find_similar`).
pub fn parse_diff(diff: &git2::Diff) -> Result<Vec<Delta>> {
    let mut ret = Vec::new();
    for (delta_idx, _delta) in diff.deltas().enumerate() {
        let mut patch = git2::Patch::from_diff(diff, delta_idx)?
            .ok_or_else(|| invalid("got empty delta"))?;

        let delta = patch.delta();
        let kind = match delta.status() {
            git2::Delta::Added | git2::Delta::Untracked => DeltaKind::Added,
            git2::Delta::Deleted => DeltaKind::Deleted,
            git2::Delta::Modified => DeltaKind::Modified,
            git2::Delta::Renamed => DeltaKind::Renamed,
            git2::Delta::Unmodified | git2::Delta::Ignored => continue,
            other => {
                return Err(invalid(&format!("unsupported delta status {:?}", other)));
            }
        };

        let old_path = utf8_path(delta.old_file().path_bytes())?;
        let new_path = utf8_path(delta.new_file().path_bytes())?;
        let path = match kind {
            DeltaKind::Deleted => old_path.clone(),
            _ => new_path,
        }
        .ok_or_else(|| invalid("delta without a usable path"))?;
        let old_path = match kind {
            DeltaKind::Renamed => old_path,
            _ => None,
        };

        let binary = delta.flags().is_binary()
            || (patch.num_hunks() == 0
                && delta.old_file().id() != delta.new_file().id()
                && kind == DeltaKind::Modified);

        let mut parsed = Delta {
            path,
            old_path,
            kind,
            old_id: delta.old_file().id(),
            new_id: delta.new_file().id(),
            old_mode: i32::from(delta.old_file().mode()),
            new_mode: i32::from(delta.new_file().mode()),
            binary,
            hunks: Vec::with_capacity(patch.num_hunks()),
        };

        if !binary {
            for idx in 0..patch.num_hunks() {
                parsed.hunks.push(Hunk::read(&mut patch, idx)?);
            }
        }

        ret.push(parsed);
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_len_counts_lines() {
        let block = Block {
            start: 3,
            lines: vec![b"a\n".to_vec(), b"b\n".to_vec()],
            trailing_newline: true,
        };
        assert_eq!(block.len(), 2);
        assert!(!block.is_empty());
        assert!(Block::empty(1).is_empty());
    }
}
