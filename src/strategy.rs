//! Incremental accumulation commit strategy.
//!
//! Chunk coordinates are all relative to the *base* tree, so applying group
//! patches commit-over-commit would need offset rewriting. Instead, commit k is
//! built from scratch as base + (chunks of groups 1..=k): the union grows
//! monotonically and chunk composition is order-free, so
//! `diff(tree_{k-1}, tree_k)` is exactly group k's chunks and the final tree
//! equals the target.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::{Chunk, ChunkId, ChunkSet, FileMeta};
use crate::errors::{CancelToken, Error, Result};
use crate::owned::DeltaKind;

/// One commit to materialize: a message and the chunks its group introduces.
#[derive(Debug, Clone)]
pub struct CommitSpec {
    pub message: String,
    pub chunk_ids: Vec<ChunkId>,
}

/// Write the accumulated commit chain. Returns the new commit ids, oldest
/// first. Objects go wherever the repository ODB sends them, which during a
/// pipeline run is the sandbox mempack.
pub fn write_chain(
    repo: &git2::Repository,
    base_commit: Option<&git2::Commit>,
    base_tree: &git2::Tree,
    specs: &[CommitSpec],
    set: &ChunkSet,
    author: &git2::Signature,
    committer: &git2::Signature,
    token: &CancelToken,
) -> Result<Vec<git2::Oid>> {
    let mut commits = Vec::with_capacity(specs.len());
    let mut accumulated: BTreeMap<String, Vec<ChunkId>> = BTreeMap::new();
    let mut current_tree_id = base_tree.id();
    let mut parent_id = base_commit.map(|c| c.id());

    for spec in specs {
        token.check()?;

        let touched: BTreeSet<&str> = spec
            .chunk_ids
            .iter()
            .map(|&id| set.chunk(id).path.as_str())
            .collect();

        for path in touched {
            let meta = set.meta(path);
            let first_touch = !accumulated.contains_key(path);
            accumulated
                .entry(path.to_string())
                .or_default()
                .extend(spec.chunk_ids.iter().filter(|&&id| set.chunk(id).path == path));

            let current_tree = repo.find_tree(current_tree_id)?;

            // a rename drops its old entry as soon as the file is touched
            if first_touch {
                if let Some(old_path) = &meta.old_path {
                    current_tree_id = update_tree(
                        repo,
                        Some(&current_tree),
                        old_path.as_bytes(),
                        None,
                    )?;
                }
            }

            let current_tree = repo.find_tree(current_tree_id)?;
            let entry = materialize(repo, base_tree, meta, &accumulated[path], set)?;
            current_tree_id =
                update_tree(repo, Some(&current_tree), path.as_bytes(), entry)?;
        }

        let tree = repo.find_tree(current_tree_id)?;
        let mut message = spec.message.clone();
        if !message.ends_with('\n') {
            message.push('\n');
        }
        let commit_id = match parent_id {
            Some(parent_id) => {
                let parent = repo.find_commit(parent_id)?;
                repo.commit(None, author, committer, &message, &tree, &[&parent])?
            }
            None => repo.commit(None, author, committer, &message, &tree, &[])?,
        };
        parent_id = Some(commit_id);
        commits.push(commit_id);
    }

    Ok(commits)
}

/// Compute the tree entry for a file given the chunks applied so far.
/// `None` means the path disappears from the tree.
fn materialize(
    repo: &git2::Repository,
    base_tree: &git2::Tree,
    meta: &FileMeta,
    applied: &[ChunkId],
    set: &ChunkSet,
) -> Result<Option<(git2::Oid, i32)>> {
    let all_applied = applied.len() == meta.chunk_ids.len();

    if meta.binary {
        // binary payloads land whole with their first chunk
        return Ok(match meta.kind {
            DeltaKind::Deleted => None,
            _ => Some((meta.new_id, meta.new_mode)),
        });
    }

    if meta.kind == DeltaKind::Deleted && all_applied {
        return Ok(None);
    }

    let base = base_content(repo, base_tree, meta)?;
    let chunks: Vec<&Chunk> = applied.iter().map(|&id| set.chunk(id)).collect();
    let content = crate::chunk::compose(&base, &chunks)?;

    let mode = match meta.kind {
        DeltaKind::Deleted => meta.old_mode,
        _ => meta.new_mode,
    };
    let blob_id = repo.blob(&content)?;
    Ok(Some((blob_id, mode)))
}

fn base_content(
    repo: &git2::Repository,
    base_tree: &git2::Tree,
    meta: &FileMeta,
) -> Result<Vec<u8>> {
    if meta.kind == DeltaKind::Added {
        return Ok(Vec::new());
    }
    let lookup = meta.old_path.as_deref().unwrap_or(&meta.path);
    let entry = base_tree.get_path(std::path::Path::new(lookup))?;
    let blob = repo.find_blob(entry.id())?;
    Ok(blob.content().to_vec())
}

/// Insert or remove one path in a tree, recursing into (and creating or
/// pruning) the intermediate trees.
fn update_tree(
    repo: &git2::Repository,
    base: Option<&git2::Tree>,
    path: &[u8],
    entry: Option<(git2::Oid, i32)>,
) -> Result<git2::Oid> {
    let mut builder = repo.treebuilder(base)?;

    if let Some(slash) = path.iter().position(|&b| b == b'/') {
        let (first, rest) = path.split_at(slash);
        let rest = &rest[1..];

        let subtree = match builder.get(first)? {
            Some(existing) if existing.kind() == Some(git2::ObjectType::Tree) => {
                Some(repo.find_tree(existing.id())?)
            }
            _ => None,
        };
        let new_subtree_id = update_tree(repo, subtree.as_ref(), rest, entry)?;

        if repo.find_tree(new_subtree_id)?.len() == 0 {
            if builder.get(first)?.is_some() {
                builder.remove(first)?;
            }
        } else {
            builder.insert(first, new_subtree_id, 0o040000)?;
        }
        return Ok(builder.write()?);
    }

    match entry {
        Some((id, mode)) => {
            builder.insert(path, id, mode)?;
        }
        None => {
            if builder.get(path)?.is_some() {
                builder.remove(path)?;
            }
        }
    }
    Ok(builder.write()?)
}

/// First-parent chain from `tip` down to (excluding) `target`, returned
/// oldest first. Used to reparent the commits above a rewritten one.
pub fn linear_descendants(
    repo: &git2::Repository,
    tip: git2::Oid,
    target: git2::Oid,
) -> Result<Vec<git2::Oid>> {
    let mut chain = Vec::new();
    let mut cursor = tip;
    while cursor != target {
        let commit = repo.find_commit(cursor)?;
        match commit.parent_count() {
            0 => {
                return Err(Error::Usage(format!(
                    "{} is not an ancestor of {}",
                    target, tip
                )))
            }
            1 => {
                chain.push(cursor);
                cursor = commit.parent_id(0)?;
            }
            _ => {
                return Err(Error::Usage(format!(
                    "merge commit {} between {} and the branch tip",
                    cursor, target
                )))
            }
        }
    }
    chain.reverse();
    Ok(chain)
}

/// Rewrite a commit on top of a new parent, keeping its tree, message and
/// author. The tree is unchanged because the new parent's tree equals the
/// old parent's.
pub fn reparent(
    repo: &git2::Repository,
    commit: &git2::Commit,
    new_parent_id: git2::Oid,
    committer: &git2::Signature,
) -> Result<git2::Oid> {
    let new_parent = repo.find_commit(new_parent_id)?;
    let tree = commit.tree()?;
    let message = commit
        .message()
        .ok_or_else(|| Error::Gateway(git2::Error::from_str("commit message is not UTF-8")))?;
    Ok(repo.commit(
        None,
        &commit.author(),
        committer,
        message,
        &tree,
        &[&new_parent],
    )?)
}

/// Walk from `tip` toward the root, collecting the linear run of commits:
/// stops before the first merge commit and before the root commit. Newest
/// first, like the ref log reads.
pub fn linear_stack(repo: &git2::Repository, tip: git2::Oid) -> Result<Vec<git2::Oid>> {
    let mut stack = Vec::new();
    let mut cursor = tip;
    loop {
        let commit = repo.find_commit(cursor)?;
        if commit.parent_count() != 1 {
            break;
        }
        stack.push(cursor);
        cursor = commit.parent_id(0)?;
    }
    Ok(stack)
}
