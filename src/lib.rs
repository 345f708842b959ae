#[macro_use]
extern crate slog;

pub mod chunk;
pub mod config;
pub mod errors;
pub mod filter;
pub mod lang;
pub mod logical;
pub mod model;
pub mod owned;
pub mod sandbox;
pub mod scope;
pub mod semantic;
pub mod strategy;

use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use crate::chunk::{Chunk, ChunkSet};
use crate::config::{DiffDisplay, Options};
use crate::errors::{CancelToken, Error, Result};
use crate::filter::Rejection;
use crate::lang::LanguageTable;
use crate::logical::LogicalGroup;
use crate::model::{EmbeddingProvider, ModelProvider};
use crate::sandbox::Sandbox;
use crate::semantic::SemanticGroup;
use crate::strategy::CommitSpec;

#[derive(Debug, Clone)]
pub enum Mode {
    Commit { pathspecs: Vec<String> },
    Fix { rev: String },
    Clean { rev: Option<String>, min_size: usize },
}

/// Everything `main` hands over for one invocation.
pub struct Config {
    pub mode: Mode,
    pub cli: config::Overrides,
    pub config_file: Option<std::path::PathBuf>,
    pub token: CancelToken,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub commits: Vec<git2::Oid>,
    pub messages: Vec<String>,
    pub rejected: usize,
}

pub fn run(logger: &slog::Logger, config: &Config) -> Result<RunSummary> {
    let repo = git2::Repository::open_from_env()?;
    debug!(logger, "repository found"; "path" => repo.path().to_str());

    let file_overrides = match &config.config_file {
        Some(path) => config::Overrides::from_file(path)?,
        None => config::Overrides::default(),
    };
    let options = config::resolve(&config.cli, &file_overrides, Some(&repo))?;

    let provider = model::provider_for(
        &options.model,
        options.api_key.as_deref(),
        options.api_base.as_deref(),
        options.temperature,
        options.max_tokens,
        logger,
    )?;
    let embedder = model::embedder_for(
        options.custom_embedding_model.as_deref(),
        options.api_key.as_deref(),
        options.api_base.as_deref(),
    )?;

    run_with_repo(
        logger,
        &repo,
        &config.mode,
        &options,
        provider.as_ref(),
        embedder.as_ref(),
        &config.token,
    )
}

pub fn run_with_repo(
    logger: &slog::Logger,
    repo: &git2::Repository,
    mode: &Mode,
    options: &Options,
    provider: &dyn ModelProvider,
    embedder: &dyn EmbeddingProvider,
    token: &CancelToken,
) -> Result<RunSummary> {
    let mut table = LanguageTable::builtin();
    if let Some(path) = &options.custom_language_config {
        let ignored = table.merge_custom_file(path)?;
        if !ignored.is_empty() {
            announce(logger, Announcement::IgnoredLanguages(&ignored));
        }
    }

    match mode {
        Mode::Commit { pathspecs } => {
            commit_mode(logger, repo, pathspecs, options, &table, provider, embedder, token)
        }
        Mode::Fix { rev } => {
            fix_mode(logger, repo, rev, options, &table, provider, embedder, token)
        }
        Mode::Clean { rev, min_size } => clean_mode(
            logger, repo, rev.as_deref(), *min_size, options, &table, provider, embedder, token,
        ),
    }
}

// ---------------------------------------------------------------------------
// The shared decomposition pipeline
// ---------------------------------------------------------------------------

struct Plan {
    set: ChunkSet,
    groups: Vec<SemanticGroup>,
    logical: Vec<LogicalGroup>,
    rejections: Vec<Rejection>,
}

impl Plan {
    fn specs(&self) -> Vec<CommitSpec> {
        self.logical
            .iter()
            .map(|group| CommitSpec {
                message: group.message.clone(),
                chunk_ids: group
                    .members
                    .iter()
                    .flat_map(|&m| self.groups[m].chunks.iter().copied())
                    .collect(),
            })
            .collect()
    }
}

/// Run chunking, indexing, semantic grouping, (optionally) the filter chain
/// and logical grouping between two trees. Returns `None` when the trees do
/// not differ.
#[allow(clippy::too_many_arguments)]
fn decompose(
    logger: &slog::Logger,
    repo: &git2::Repository,
    base_tree: &git2::Tree,
    target_tree: &git2::Tree,
    options: &Options,
    table: &LanguageTable,
    provider: &dyn ModelProvider,
    embedder: &dyn EmbeddingProvider,
    token: &CancelToken,
    with_filters: bool,
) -> Result<Option<Plan>> {
    token.check()?;

    let mut diff_options = git2::DiffOptions::new();
    diff_options
        .context_lines(0)
        .id_abbrev(40)
        .ignore_filemode(true)
        .ignore_submodules(true);
    let mut diff =
        repo.diff_tree_to_tree(Some(base_tree), Some(target_tree), Some(&mut diff_options))?;
    let mut find_options = git2::DiffFindOptions::new();
    find_options.renames(true);
    diff.find_similar(Some(&mut find_options))?;

    let deltas = owned::parse_diff(&diff)?;
    if deltas.is_empty() {
        return Ok(None);
    }
    trace!(logger, "parsed diff"; "deltas" => deltas.len());

    let set = chunk::split(deltas, options.chunking_level);

    // lift blob contents once; everything downstream works on these
    let mut base_contents: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut target_contents: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    for meta in set.files.values() {
        if meta.binary {
            continue;
        }
        let base = if meta.old_id.is_zero() {
            Vec::new()
        } else {
            repo.find_blob(meta.old_id)?.content().to_vec()
        };
        let target = if meta.new_id.is_zero() {
            Vec::new()
        } else {
            repo.find_blob(meta.new_id)?.content().to_vec()
        };
        base_contents.insert(meta.path.clone(), base);
        target_contents.insert(meta.path.clone(), target);
    }

    // chunk exhaustiveness: every file must reproduce its target content
    for meta in set.files.values() {
        if meta.binary {
            continue;
        }
        let chunks: Vec<&Chunk> = meta.chunk_ids.iter().map(|&id| set.chunk(id)).collect();
        chunk::verify_exhaustive(
            &base_contents[&meta.path],
            &chunks,
            &target_contents[&meta.path],
        )?;
    }
    debug!(logger, "chunked"; "files" => set.files.len(), "chunks" => set.chunks.len());

    let parse_input: Vec<(String, Vec<u8>)> = set
        .files
        .values()
        .filter(|meta| !meta.binary && meta.kind != owned::DeltaKind::Deleted)
        .map(|meta| (meta.path.clone(), target_contents[&meta.path].clone()))
        .collect();
    let index = scope::index_files(
        &parse_input,
        table,
        options.fail_on_syntax_errors,
        token,
        logger,
    )?;

    let groups = semantic::group(&set, &index, options.fallback_grouping_strategy)?;
    debug!(logger, "semantic groups formed"; "groups" => groups.len());

    let (groups, rejections) = if with_filters {
        let ctx = filter::FilterContext {
            aggression: options.secret_scanner_aggression,
            relevance_filtering: options.relevance_filtering,
            intent: options.intent.as_deref(),
            relevance_threshold: options.relevance_filter_similarity_threshold,
            fail_on_syntax_errors: options.fail_on_syntax_errors,
            embedder,
            table,
            base_contents: &base_contents,
            token,
            logger,
        };
        filter::run(groups, &set, &ctx)?
    } else {
        (groups, Vec::new())
    };
    for rejection in &rejections {
        announce(logger, Announcement::RejectedGroup(rejection));
    }

    if groups.is_empty() {
        return Ok(Some(Plan {
            set,
            groups,
            logical: Vec::new(),
            rejections,
        }));
    }

    let planner = logical::PlannerContext {
        provider,
        intent: options.intent.as_deref(),
        cluster_strictness: options.cluster_strictness,
        max_tokens: options.max_tokens,
        batching: options.batching_strategy,
        num_retries: options.num_retries,
        token,
        logger,
    };
    let logical = logical::plan(&groups, &set, &planner)?;

    Ok(Some(Plan {
        set,
        groups,
        logical,
        rejections,
    }))
}

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
fn commit_mode(
    logger: &slog::Logger,
    repo: &git2::Repository,
    pathspecs: &[String],
    options: &Options,
    table: &LanguageTable,
    provider: &dyn ModelProvider,
    embedder: &dyn EmbeddingProvider,
    token: &CancelToken,
) -> Result<RunSummary> {
    let head = repo.head()?;
    if !head.is_branch() {
        return Err(Error::Usage("HEAD is not a branch".to_string()));
    }
    let branch = head
        .name()
        .ok_or_else(|| Error::Usage("HEAD name is not UTF-8".to_string()))?
        .to_string();
    let base_commit = head.peel_to_commit()?;
    let base_tree = base_commit.tree()?;

    // transient tree of the working directory; the on-disk index file is
    // never written with these additions
    let mut index = repo.index()?;
    let patterns: Vec<&str> = if pathspecs.is_empty() {
        vec!["."]
    } else {
        pathspecs.iter().map(|s| s.as_str()).collect()
    };
    index.add_all(patterns.iter(), git2::IndexAddOption::DEFAULT, None)?;
    index.update_all(patterns.iter(), None)?;
    let target_tree_id = index.write_tree_to(repo)?;
    let target_tree = repo.find_tree(target_tree_id)?;

    if target_tree_id == base_tree.id() {
        announce(logger, Announcement::NothingToCommit);
        return Ok(RunSummary::default());
    }

    let plan = match decompose(
        logger, repo, &base_tree, &target_tree, options, table, provider, embedder, token, true,
    )? {
        Some(plan) => plan,
        None => {
            announce(logger, Announcement::NothingToCommit);
            return Ok(RunSummary::default());
        }
    };

    if plan.logical.is_empty() {
        announce(logger, Announcement::EverythingRejected);
        return Err(Error::Usage(
            "every group was rejected by the filter chain".to_string(),
        ));
    }

    let mut specs = plan.specs();
    preview(&plan, options)?;
    if options.ask_for_commit_message {
        reword(&mut specs)?;
    }
    if !confirm(options, token)? {
        return Err(Error::Aborted);
    }

    let signature = repo
        .signature()
        .or_else(|_| git2::Signature::now("nobody", "nobody@example.com"))?;

    let odb = repo.odb()?;
    let sandbox = Sandbox::attach(&odb)?;
    let outcome = (|| {
        let commits = strategy::write_chain(
            repo,
            Some(&base_commit),
            &base_tree,
            &specs,
            &plan.set,
            &signature,
            &signature,
            token,
        )?;
        let last = *commits.last().expect("plan has at least one commit");
        // cheap pre-check so a lost race does not promote any objects
        if repo.refname_to_id(&branch)? != base_commit.id() {
            return Err(Error::RefConflict(branch.clone()));
        }
        sandbox.finalize(repo, &odb)?;
        sandbox::cas_update_ref(repo, &branch, base_commit.id(), last, "codestory commit")?;
        Ok(commits)
    })();

    let commits = match outcome {
        Ok(commits) => commits,
        Err(e) => {
            let _ = sandbox.discard();
            return Err(e);
        }
    };

    // move the index to the new HEAD so only rejected chunks show as
    // unstaged; the working directory itself is never touched
    let final_tree = repo.find_commit(*commits.last().expect("nonempty"))?.tree()?;
    index.read_tree(&final_tree)?;
    index.write()?;

    for (commit_id, spec) in commits.iter().zip(&specs) {
        announce(
            logger,
            Announcement::Committed {
                commit: &commit_id.to_string()[..8],
                message: &spec.message,
            },
        );
    }
    announce(
        logger,
        Announcement::BranchUpdated {
            branch: &branch,
            commits: commits.len(),
        },
    );

    Ok(RunSummary {
        commits,
        messages: specs.into_iter().map(|s| s.message).collect(),
        rejected: plan.rejections.len(),
    })
}

#[allow(clippy::too_many_arguments)]
fn fix_mode(
    logger: &slog::Logger,
    repo: &git2::Repository,
    rev: &str,
    options: &Options,
    table: &LanguageTable,
    provider: &dyn ModelProvider,
    embedder: &dyn EmbeddingProvider,
    token: &CancelToken,
) -> Result<RunSummary> {
    let head = repo.head()?;
    if !head.is_branch() {
        return Err(Error::Usage("HEAD is not a branch".to_string()));
    }
    let branch = head
        .name()
        .ok_or_else(|| Error::Usage("HEAD name is not UTF-8".to_string()))?
        .to_string();
    let tip = head.peel_to_commit()?.id();

    let target = repo.revparse_single(rev)?.peel_to_commit()?;
    if target.parent_count() > 1 {
        return Err(Error::Usage(format!("{} is a merge commit", target.id())));
    }
    if target.parent_count() == 0 {
        return Err(Error::Usage("cannot rewrite the root commit".to_string()));
    }
    let descendants = strategy::linear_descendants(repo, tip, target.id())?;

    let base_commit = target.parent(0)?;
    let base_tree = base_commit.tree()?;
    let target_tree = target.tree()?;

    let plan = match decompose(
        logger, repo, &base_tree, &target_tree, options, table, provider, embedder, token, false,
    )? {
        Some(plan) => plan,
        None => {
            announce(logger, Announcement::NothingToSplit { rev });
            return Ok(RunSummary::default());
        }
    };
    if plan.logical.len() < 2 {
        announce(logger, Announcement::NothingToSplit { rev });
        return Ok(RunSummary::default());
    }

    let mut specs = plan.specs();
    preview(&plan, options)?;
    if options.ask_for_commit_message {
        reword(&mut specs)?;
    }
    if !confirm(options, token)? {
        return Err(Error::Aborted);
    }

    let committer = repo
        .signature()
        .or_else(|_| git2::Signature::now("nobody", "nobody@example.com"))?;

    let odb = repo.odb()?;
    let sandbox = Sandbox::attach(&odb)?;
    let outcome = (|| {
        let commits = strategy::write_chain(
            repo,
            Some(&base_commit),
            &base_tree,
            &specs,
            &plan.set,
            &target.author(),
            &committer,
            token,
        )?;
        let mut new_tip = *commits.last().expect("plan has at least two commits");
        for descendant in &descendants {
            let commit = repo.find_commit(*descendant)?;
            new_tip = strategy::reparent(repo, &commit, new_tip, &committer)?;
        }
        if repo.refname_to_id(&branch)? != tip {
            return Err(Error::RefConflict(branch.clone()));
        }
        sandbox.finalize(repo, &odb)?;
        sandbox::cas_update_ref(repo, &branch, tip, new_tip, "codestory fix")?;
        Ok(commits)
    })();

    let commits = match outcome {
        Ok(commits) => commits,
        Err(e) => {
            let _ = sandbox.discard();
            return Err(e);
        }
    };

    announce(
        logger,
        Announcement::BranchUpdated {
            branch: &branch,
            commits: commits.len(),
        },
    );

    Ok(RunSummary {
        commits,
        messages: specs.into_iter().map(|s| s.message).collect(),
        rejected: 0,
    })
}

#[allow(clippy::too_many_arguments)]
fn clean_mode(
    logger: &slog::Logger,
    repo: &git2::Repository,
    rev: Option<&str>,
    min_size: usize,
    options: &Options,
    table: &LanguageTable,
    provider: &dyn ModelProvider,
    embedder: &dyn EmbeddingProvider,
    token: &CancelToken,
) -> Result<RunSummary> {
    let head = repo.head()?;
    if !head.is_branch() {
        return Err(Error::Usage("HEAD is not a branch".to_string()));
    }
    let branch = head
        .name()
        .ok_or_else(|| Error::Usage("HEAD name is not UTF-8".to_string()))?
        .to_string();
    let tip = head.peel_to_commit()?.id();

    let start = match rev {
        Some(rev) => repo.revparse_single(rev)?.peel_to_commit()?.id(),
        None => tip,
    };
    let above = strategy::linear_descendants(repo, tip, start)?;

    // newest-first linear run below the chosen tip, stopping at merges
    let stack = strategy::linear_stack(repo, start)?;
    if stack.is_empty() {
        announce(logger, Announcement::NothingToSplit { rev: rev.unwrap_or("HEAD") });
        return Ok(RunSummary::default());
    }

    if !confirm(options, token)? {
        return Err(Error::Aborted);
    }

    let committer = repo
        .signature()
        .or_else(|_| git2::Signature::now("nobody", "nobody@example.com"))?;

    let odb = repo.odb()?;
    let sandbox = Sandbox::attach(&odb)?;
    let outcome = (|| {
        let mut all_commits = Vec::new();
        let oldest = repo.find_commit(*stack.last().expect("stack is nonempty"))?;
        let mut new_tip = oldest.parent_id(0)?;

        for &commit_id in stack.iter().rev() {
            token.check()?;
            let commit = repo.find_commit(commit_id)?;
            let parent = repo.find_commit(new_tip)?;
            let base_tree = commit.parent(0)?.tree()?;
            let target_tree = commit.tree()?;

            let plan = decompose(
                logger, repo, &base_tree, &target_tree, options, table, provider, embedder,
                token, false,
            )?;
            let rewrite = match &plan {
                Some(plan) => plan.logical.len() >= 2 && plan.set.chunks.len() >= min_size,
                None => false,
            };

            if rewrite {
                let plan = plan.expect("rewrite implies a plan");
                let specs = plan.specs();
                let commits = strategy::write_chain(
                    repo,
                    Some(&parent),
                    &base_tree,
                    &specs,
                    &plan.set,
                    &commit.author(),
                    &committer,
                    token,
                )?;
                new_tip = *commits.last().expect("plan has at least two commits");
                all_commits.extend(commits);
            } else {
                announce(logger, Announcement::SkippedSmallCommit { commit: commit_id });
                new_tip = strategy::reparent(repo, &commit, new_tip, &committer)?;
                all_commits.push(new_tip);
            }
        }

        for descendant in &above {
            let commit = repo.find_commit(*descendant)?;
            new_tip = strategy::reparent(repo, &commit, new_tip, &committer)?;
        }

        if repo.refname_to_id(&branch)? != tip {
            return Err(Error::RefConflict(branch.clone()));
        }
        sandbox.finalize(repo, &odb)?;
        sandbox::cas_update_ref(repo, &branch, tip, new_tip, "codestory clean")?;
        Ok(all_commits)
    })();

    let commits = match outcome {
        Ok(commits) => commits,
        Err(e) => {
            let _ = sandbox.discard();
            return Err(e);
        }
    };

    announce(
        logger,
        Announcement::BranchUpdated {
            branch: &branch,
            commits: commits.len(),
        },
    );

    Ok(RunSummary {
        commits,
        messages: Vec::new(),
        rejected: 0,
    })
}

// ---------------------------------------------------------------------------
// Preview and confirmation
// ---------------------------------------------------------------------------

fn preview(plan: &Plan, options: &Options) -> Result<()> {
    if options.silent {
        return Ok(());
    }
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    render_preview(&mut out, plan, options.display_diff_type)?;
    Ok(())
}

fn render_preview(out: &mut impl Write, plan: &Plan, display: DiffDisplay) -> Result<()> {
    for (idx, group) in plan.logical.iter().enumerate() {
        writeln!(out, "commit {}/{}: {}", idx + 1, plan.logical.len(), group.message)?;
        for &member in &group.members {
            let semantic = &plan.groups[member];
            match display {
                DiffDisplay::Semantic => {
                    for scope in &semantic.scopes {
                        writeln!(out, "  scope {}", scope)?;
                    }
                    for file in &semantic.files {
                        writeln!(out, "  file  {}", file)?;
                    }
                }
                DiffDisplay::Git => {
                    for &id in &semantic.chunks {
                        let chunk = plan.set.chunk(id);
                        writeln!(
                            out,
                            "  @@ {} -{},{} +{},{} @@",
                            chunk.path,
                            chunk.removed.start,
                            chunk.removed.len(),
                            chunk.added.start,
                            chunk.added.len(),
                        )?;
                        for line in &chunk.removed.lines {
                            write!(out, "  -{}", String::from_utf8_lossy(line))?;
                        }
                        for line in &chunk.added.lines {
                            write!(out, "  +{}", String::from_utf8_lossy(line))?;
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

fn confirm(options: &Options, token: &CancelToken) -> Result<bool> {
    if options.auto_accept {
        return Ok(true);
    }
    token.check()?;
    print!("create these commits? [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

/// Replace proposed messages with user-typed ones; an empty line keeps the
/// proposal.
fn reword(specs: &mut [CommitSpec]) -> Result<()> {
    let stdin = std::io::stdin();
    for spec in specs.iter_mut() {
        print!("message [{}]: ", spec.message.trim_end());
        std::io::stdout().flush()?;
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;
        let line = line.trim();
        if !line.is_empty() {
            spec.message = line.to_string();
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// User-visible reporting
// ---------------------------------------------------------------------------

enum Announcement<'r> {
    NothingToCommit,
    EverythingRejected,
    RejectedGroup(&'r Rejection),
    Committed { commit: &'r str, message: &'r str },
    BranchUpdated { branch: &'r str, commits: usize },
    NothingToSplit { rev: &'r str },
    SkippedSmallCommit { commit: git2::Oid },
    IgnoredLanguages(&'r [String]),
}

fn announce(logger: &slog::Logger, announcement: Announcement) {
    match announcement {
        Announcement::NothingToCommit => warn!(
            logger,
            "No changes against the base tree. Nothing to commit."
        ),
        Announcement::EverythingRejected => warn!(
            logger,
            "Every group was rejected by the filter chain. Nothing to commit."
        ),
        Announcement::RejectedGroup(rejection) => warn!(
            logger,
            "group rejected";
            "reason" => rejection.reason.to_string(),
            "files" => rejection
                .group
                .files
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
        ),
        Announcement::Committed { commit, message } => info!(
            logger,
            "committed";
            "commit" => commit,
            "message" => message.trim_end(),
        ),
        Announcement::BranchUpdated { branch, commits } => info!(
            logger,
            "branch updated";
            "branch" => branch,
            "commits" => commits,
        ),
        Announcement::NothingToSplit { rev } => warn!(
            logger,
            "Commit already is a single cohesive change. Nothing to split.";
            "rev" => rev,
        ),
        Announcement::SkippedSmallCommit { commit } => info!(
            logger,
            "kept commit as-is";
            "commit" => commit.to_string(),
        ),
        Announcement::IgnoredLanguages(names) => warn!(
            logger,
            "language config entries without a compiled grammar were ignored";
            "languages" => names.join(", "),
        ),
    }
}
