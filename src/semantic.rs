//! Semantic grouping: partition chunks into syntactically cohesive groups.
//!
//! Three relations pull chunks together, and groups are the connected
//! components of their union:
//!   1. chunks intersecting the same innermost scope of the same file,
//!   2. a comment chunk and the scope it documents,
//!   3. chunks touching a changed definition and the chunks touching its
//!      reference sites (across files when the language shares tokens).
//! Chunks outside any named scope stay alone unless pulled by relation 3.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::{ChunkId, ChunkSet};
use crate::errors::{Error, Result};
use crate::scope::FileIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackGrouping {
    AllTogether,
    ByFile,
    ByExtension,
}

impl std::str::FromStr for FallbackGrouping {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "all_together" => Ok(FallbackGrouping::AllTogether),
            "by_file" => Ok(FallbackGrouping::ByFile),
            "by_extension" => Ok(FallbackGrouping::ByExtension),
            other => Err(format!("unknown fallback grouping {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SemanticGroup {
    pub chunks: Vec<ChunkId>,
    pub files: BTreeSet<String>,
    /// Display labels for the scopes this group touches, e.g. `a.py:f`.
    pub scopes: BTreeSet<String>,
    pub identifiers_touched: BTreeSet<String>,
    pub identifiers_defined: BTreeSet<String>,
    pub identifiers_referenced: BTreeSet<String>,
}

struct Dsu {
    parent: Vec<usize>,
}

impl Dsu {
    fn new(n: usize) -> Dsu {
        Dsu {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, x: usize) -> usize {
        if self.parent[x] != x {
            let root = self.find(self.parent[x]);
            self.parent[x] = root;
        }
        self.parent[x]
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // smaller root wins so group order follows chunk order
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

pub fn group(
    set: &ChunkSet,
    index: &BTreeMap<String, FileIndex>,
    fallback: FallbackGrouping,
) -> Result<Vec<SemanticGroup>> {
    let n = set.chunks.len();
    let mut dsu = Dsu::new(n);

    // representative chunk for each (path, scope) key
    let mut scope_rep: BTreeMap<(String, usize), ChunkId> = BTreeMap::new();
    // representative chunk for each fallback grouping key
    let mut fallback_rep: BTreeMap<String, ChunkId> = BTreeMap::new();
    // per-chunk scope labels and identifier sets, filled as we go
    let mut chunk_scopes: Vec<BTreeSet<String>> = vec![BTreeSet::new(); n];
    let mut chunk_defined: Vec<BTreeSet<String>> = vec![BTreeSet::new(); n];
    let mut chunk_referenced: Vec<BTreeSet<String>> = vec![BTreeSet::new(); n];

    fn union_key(
        dsu: &mut Dsu,
        reps: &mut BTreeMap<(String, usize), ChunkId>,
        path: &str,
        scope_idx: usize,
        chunk: ChunkId,
    ) {
        match reps.get(&(path.to_string(), scope_idx)) {
            Some(&rep) => dsu.union(rep, chunk),
            None => {
                reps.insert((path.to_string(), scope_idx), chunk);
            }
        }
    }

    for chunk in &set.chunks {
        let file = index.get(&chunk.path).filter(|f| f.parsed);
        let file = match file {
            Some(file) => file,
            None => {
                // fallback mode: unknown language, parse failure, deleted or
                // binary file
                let key = match fallback {
                    FallbackGrouping::AllTogether => "*".to_string(),
                    FallbackGrouping::ByFile => chunk.path.clone(),
                    FallbackGrouping::ByExtension => std::path::Path::new(&chunk.path)
                        .extension()
                        .and_then(|e| e.to_str())
                        .map(|e| format!("*.{}", e))
                        .unwrap_or_else(|| chunk.path.clone()),
                };
                chunk_scopes[chunk.id].insert(chunk.path.clone());
                match fallback_rep.get(&key) {
                    Some(&rep) => dsu.union(rep, chunk.id),
                    None => {
                        fallback_rep.insert(key, chunk.id);
                    }
                }
                continue;
            }
        };

        let span = chunk.new_span();

        // (1) scope cohesion
        for scope_idx in file.innermost_scopes(span) {
            union_key(&mut dsu, &mut scope_rep, &chunk.path, scope_idx, chunk.id);
            let scope = &file.scopes[scope_idx];
            let label = match &scope.name {
                Some(name) => format!("{}:{}", chunk.path, name),
                None => format!("{}:{}..{}", chunk.path, scope.start_line, scope.end_line),
            };
            chunk_scopes[chunk.id].insert(label);
        }

        // (2) comment attachment
        for (comment, attached) in &file.comments {
            if comment.intersects(span) {
                if let Some(scope_idx) = attached {
                    union_key(&mut dsu, &mut scope_rep, &chunk.path, *scope_idx, chunk.id);
                }
            }
        }

        // record identifier sites this chunk touches
        for site in &file.definitions {
            if span.0 <= site.line && site.line <= span.1 {
                chunk_defined[chunk.id].insert(site.name.clone());
            }
        }
        for site in &file.references {
            if span.0 <= site.line && site.line <= span.1 {
                chunk_referenced[chunk.id].insert(site.name.clone());
            }
        }
    }

    // (3) cross-reference cohesion: chunks touching reference sites of a
    // changed definition join the defining chunk's group
    for chunk in &set.chunks {
        if chunk_defined[chunk.id].is_empty() {
            continue;
        }
        let defining_file = match index.get(&chunk.path) {
            Some(f) => f,
            None => continue,
        };
        for name in chunk_defined[chunk.id].clone() {
            for other in &set.chunks {
                if other.id == chunk.id {
                    continue;
                }
                if other.path != chunk.path && !defining_file.share_tokens {
                    continue;
                }
                let other_file = match index.get(&other.path).filter(|f| f.parsed) {
                    Some(f) => f,
                    None => continue,
                };
                let span = other.new_span();
                let touches = other_file
                    .references
                    .iter()
                    .any(|site| site.name == name && span.0 <= site.line && site.line <= span.1);
                if touches {
                    dsu.union(chunk.id, other.id);
                }
            }
        }
    }

    // connected components, ordered by their smallest chunk id
    let mut by_root: BTreeMap<usize, Vec<ChunkId>> = BTreeMap::new();
    for id in 0..n {
        by_root.entry(dsu.find(id)).or_default().push(id);
    }

    let mut groups = Vec::with_capacity(by_root.len());
    for (_, chunk_ids) in by_root {
        let mut group = SemanticGroup {
            chunks: chunk_ids,
            files: BTreeSet::new(),
            scopes: BTreeSet::new(),
            identifiers_touched: BTreeSet::new(),
            identifiers_defined: BTreeSet::new(),
            identifiers_referenced: BTreeSet::new(),
        };
        for &id in &group.chunks {
            group.files.insert(set.chunks[id].path.clone());
            group.scopes.extend(chunk_scopes[id].iter().cloned());
            group
                .identifiers_defined
                .extend(chunk_defined[id].iter().cloned());
            group
                .identifiers_referenced
                .extend(chunk_referenced[id].iter().cloned());
        }
        group.identifiers_touched = group
            .identifiers_defined
            .union(&group.identifiers_referenced)
            .cloned()
            .collect();
        groups.push(group);
    }

    let assigned: usize = groups.iter().map(|g| g.chunks.len()).sum();
    if assigned != n {
        return Err(Error::Invariant(format!(
            "semantic partition lost chunks: {} of {} assigned",
            assigned, n
        )));
    }

    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, ChunkingLevel};
    use crate::errors::CancelToken;
    use crate::lang::LanguageTable;
    use crate::owned::{Block, Delta, DeltaKind, Hunk};
    use crate::scope;

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn lines(text: &str) -> Vec<Vec<u8>> {
        text.split_inclusive('\n').map(|l| l.as_bytes().to_vec()).collect()
    }

    fn added_delta(path: &str, content: &str) -> Delta {
        Delta {
            path: path.to_string(),
            old_path: None,
            kind: DeltaKind::Added,
            old_id: git2::Oid::zero(),
            new_id: git2::Oid::zero(),
            old_mode: 0,
            new_mode: 0o100644,
            binary: false,
            hunks: vec![Hunk {
                removed: Block::empty(0),
                added: Block {
                    start: 1,
                    lines: lines(content),
                    trailing_newline: true,
                },
            }],
        }
    }

    fn index_of(
        files: &[(&str, &str)],
    ) -> BTreeMap<String, scope::FileIndex> {
        let table = LanguageTable::builtin();
        let owned: Vec<(String, Vec<u8>)> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect();
        scope::index_files(&owned, &table, false, &CancelToken::new(), &discard()).unwrap()
    }

    #[test]
    fn distinct_functions_form_distinct_groups() {
        let content = "def f():\n    return 1\n\ndef g():\n    return 2\n";
        let set = crate::chunk::split(
            vec![added_delta("a.py", content)],
            ChunkingLevel::AllFiles,
        );
        assert_eq!(set.chunks.len(), 2);
        let index = index_of(&[("a.py", content)]);
        let groups = group(&set, &index, FallbackGrouping::ByFile).unwrap();
        assert_eq!(groups.len(), 2);
        assert!(groups[0].scopes.contains("a.py:f"));
        assert!(groups[1].scopes.contains("a.py:g"));
    }

    #[test]
    fn chunks_in_the_same_function_group_together() {
        let content = "def f():\n    a = 1\n\n    b = 2\n    return a + b\n";
        let set = crate::chunk::split(
            vec![added_delta("a.py", content)],
            ChunkingLevel::AllFiles,
        );
        assert!(set.chunks.len() >= 2);
        let index = index_of(&[("a.py", content)]);
        let groups = group(&set, &index, FallbackGrouping::ByFile).unwrap();
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn changed_definition_pulls_cross_file_references() {
        let util = "def assist():\n    return 1\n";
        let main = "from util import assist\n\ndef run():\n    return assist()\n";
        let set = crate::chunk::split(
            vec![added_delta("util.py", util), added_delta("main.py", main)],
            ChunkingLevel::AllFiles,
        );
        let index = index_of(&[("util.py", util), ("main.py", main)]);
        let groups = group(&set, &index, FallbackGrouping::ByFile).unwrap();
        // the def in util.py and its call site in main.py share one group
        let spanning = groups
            .iter()
            .find(|g| g.files.len() == 2)
            .expect("no cross-file group");
        assert!(spanning.identifiers_defined.contains("assist"));
    }

    #[test]
    fn shared_tokens_disabled_keeps_files_apart() {
        let util = "def assist():\n    return 1\n";
        let main = "def run():\n    return assist()\n";
        let set = crate::chunk::split(
            vec![added_delta("util.py", util), added_delta("main.py", main)],
            ChunkingLevel::AllFiles,
        );
        let mut index = index_of(&[("util.py", util), ("main.py", main)]);
        for file in index.values_mut() {
            file.share_tokens = false;
        }
        let groups = group(&set, &index, FallbackGrouping::ByFile).unwrap();
        assert!(groups.iter().all(|g| g.files.len() == 1));
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn fallback_files_group_by_strategy() {
        let set = crate::chunk::split(
            vec![
                added_delta("a.txt", "alpha\n"),
                added_delta("b.txt", "beta\n"),
                added_delta("c.cfg", "gamma\n"),
            ],
            ChunkingLevel::AllFiles,
        );
        let index = BTreeMap::new();

        let by_file = group(&set, &index, FallbackGrouping::ByFile).unwrap();
        assert_eq!(by_file.len(), 3);

        let by_ext = group(&set, &index, FallbackGrouping::ByExtension).unwrap();
        assert_eq!(by_ext.len(), 2);

        let together = group(&set, &index, FallbackGrouping::AllTogether).unwrap();
        assert_eq!(together.len(), 1);
    }
}
