//! Logical grouping: commit-sized aggregation of semantic groups.
//!
//! The model proposes which semantic groups belong in one commit and writes
//! the messages. Everything the model returns is validated against the
//! partition invariant; broken responses are retried and, when retries run
//! out, replaced by a safe one-commit-per-group fallback. Ordering respects
//! a local dependency heuristic: a group that only references identifiers
//! defined elsewhere lands after the group defining them.

use std::collections::{BTreeMap, BTreeSet};

use crate::chunk::ChunkSet;
use crate::errors::{CancelToken, Error, Result};
use crate::model::{
    self, AnalysisRequest, AnalysisResponse, GroupSummary, ModelProvider,
};
use crate::semantic::SemanticGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchingStrategy {
    Auto,
    Requests,
    Prompt,
}

impl std::str::FromStr for BatchingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" => Ok(BatchingStrategy::Auto),
            "requests" => Ok(BatchingStrategy::Requests),
            "prompt" => Ok(BatchingStrategy::Prompt),
            other => Err(format!("unknown batching strategy {:?}", other)),
        }
    }
}

/// One commit's worth of semantic groups (indices into the accepted set).
#[derive(Debug, Clone)]
pub struct LogicalGroup {
    pub members: Vec<usize>,
    pub message: String,
}

pub struct PlannerContext<'a> {
    pub provider: &'a dyn ModelProvider,
    pub intent: Option<&'a str>,
    pub cluster_strictness: f32,
    pub max_tokens: u32,
    pub batching: BatchingStrategy,
    pub num_retries: u32,
    pub token: &'a CancelToken,
    pub logger: &'a slog::Logger,
}

const MAX_FRAGMENT_LINES: usize = 40;
/// Rough bytes-per-token used to size prompt batches.
const BYTES_PER_TOKEN: usize = 3;

pub fn plan(
    groups: &[SemanticGroup],
    set: &ChunkSet,
    ctx: &PlannerContext,
) -> Result<Vec<LogicalGroup>> {
    if groups.is_empty() {
        return Ok(Vec::new());
    }

    let summaries: Vec<GroupSummary> = groups
        .iter()
        .enumerate()
        .map(|(idx, group)| summarize(idx, group, set))
        .collect();

    let batches = batch(&summaries, ctx);
    debug!(ctx.logger, "logical grouping batched";
           "groups" => summaries.len(),
           "batches" => batches.len(),
           "provider" => ctx.provider.name(),
    );

    let mut logical: Vec<LogicalGroup> = Vec::new();
    for batch in &batches {
        ctx.token.check()?;
        logical.extend(run_batch(batch, ctx)?);
    }

    if batches.len() > 1 {
        logical = merge_same_message(logical);
    }

    verify_partition(&logical, groups.len())?;
    Ok(order_by_dependencies(logical, groups))
}

fn summarize(idx: usize, group: &SemanticGroup, set: &ChunkSet) -> GroupSummary {
    let mut fragments = Vec::with_capacity(group.chunks.len());
    for &id in &group.chunks {
        let chunk = set.chunk(id);
        let mut text = format!(
            "{} @ -{},{} +{},{}\n",
            chunk.path,
            chunk.removed.start,
            chunk.removed.len(),
            chunk.added.start,
            chunk.added.len(),
        );
        let mut emitted = 0usize;
        for line in &chunk.removed.lines {
            if emitted == MAX_FRAGMENT_LINES {
                text.push_str("…\n");
                break;
            }
            text.push('-');
            text.push_str(&String::from_utf8_lossy(line));
            emitted += 1;
        }
        for line in &chunk.added.lines {
            if emitted >= MAX_FRAGMENT_LINES {
                text.push_str("…\n");
                break;
            }
            text.push('+');
            text.push_str(&String::from_utf8_lossy(line));
            emitted += 1;
        }
        fragments.push(text);
    }
    GroupSummary {
        id: idx,
        files: group.files.iter().cloned().collect(),
        identifiers: group.identifiers_touched.iter().cloned().collect(),
        diff_fragments: fragments,
    }
}

fn summary_size(summary: &GroupSummary) -> usize {
    serde_json::to_string(summary).map(|s| s.len()).unwrap_or(0)
}

fn batch<'a>(
    summaries: &'a [GroupSummary],
    ctx: &PlannerContext,
) -> Vec<Vec<&'a GroupSummary>> {
    let budget = ctx.max_tokens as usize * BYTES_PER_TOKEN;
    let total: usize = summaries.iter().map(summary_size).sum();

    let strategy = match ctx.batching {
        BatchingStrategy::Auto => {
            if total <= budget {
                BatchingStrategy::Prompt
            } else if summaries.iter().any(|s| summary_size(s) > budget) {
                BatchingStrategy::Requests
            } else {
                BatchingStrategy::Prompt
            }
        }
        other => other,
    };

    match strategy {
        BatchingStrategy::Requests => summaries.iter().map(|s| vec![s]).collect(),
        _ => {
            // greedy packing in input order, at least one summary per batch
            let mut batches: Vec<Vec<&GroupSummary>> = Vec::new();
            let mut current: Vec<&GroupSummary> = Vec::new();
            let mut used = 0usize;
            for summary in summaries {
                let size = summary_size(summary);
                if !current.is_empty() && used + size > budget {
                    batches.push(std::mem::take(&mut current));
                    used = 0;
                }
                used += size;
                current.push(summary);
            }
            if !current.is_empty() {
                batches.push(current);
            }
            batches
        }
    }
}

fn run_batch(batch: &[&GroupSummary], ctx: &PlannerContext) -> Result<Vec<LogicalGroup>> {
    let ids: BTreeSet<usize> = batch.iter().map(|s| s.id).collect();
    let seed = model::fingerprint(
        batch
            .iter()
            .flat_map(|s| s.files.iter().chain(s.identifiers.iter()))
            .map(|s| s.as_bytes()),
    );
    let request = AnalysisRequest {
        groups: batch.iter().map(|&s| s.clone()).collect(),
        intent: ctx.intent.map(|s| s.to_string()),
        cluster_strictness: ctx.cluster_strictness,
        max_tokens: ctx.max_tokens,
        seed,
    };

    let mut last_error = None;
    for attempt in 0..=ctx.num_retries {
        ctx.token.check()?;
        match ctx.provider.analyze(&request) {
            Ok(response) => match validate(response, &ids) {
                Ok(groups) => return Ok(groups),
                Err(detail) => {
                    debug!(ctx.logger, "invalid analysis response";
                           "attempt" => attempt,
                           "detail" => &detail);
                    last_error = Some(detail);
                }
            },
            Err(e) => {
                debug!(ctx.logger, "analysis request failed";
                       "attempt" => attempt,
                       "err" => e.to_string());
                last_error = Some(e.to_string());
            }
        }
    }

    warn!(ctx.logger, "model grouping failed, one commit per group";
          "err" => last_error.unwrap_or_default());
    Ok(batch
        .iter()
        .map(|summary| LogicalGroup {
            members: vec![summary.id],
            message: model::heuristic_message(&summary.files),
        })
        .collect())
}

/// Check a response against the partition rules for its batch. Missing ids
/// are repaired by appending singleton groups; duplicates and unknown ids
/// are hard failures that trigger a retry.
fn validate(
    response: AnalysisResponse,
    batch_ids: &BTreeSet<usize>,
) -> std::result::Result<Vec<LogicalGroup>, String> {
    let mut seen = BTreeSet::new();
    let mut groups = Vec::new();
    for proposed in response.logical_groups {
        let mut members = Vec::new();
        for id in proposed.member_ids {
            if !batch_ids.contains(&id) {
                return Err(format!("unknown member id {}", id));
            }
            if !seen.insert(id) {
                return Err(format!("member id {} appears twice", id));
            }
            members.push(id);
        }
        if members.is_empty() {
            continue;
        }
        let message = proposed.message.trim().to_string();
        groups.push(LogicalGroup { members, message });
    }

    for &id in batch_ids {
        if !seen.contains(&id) {
            groups.push(LogicalGroup {
                members: vec![id],
                message: String::new(),
            });
        }
    }

    if let Some(order) = permutation(&response.order, groups.len()) {
        groups = order.into_iter().map(|i| groups[i].clone()).collect();
    }
    Ok(groups)
}

fn permutation(order: &[usize], len: usize) -> Option<Vec<usize>> {
    if order.len() != len {
        return None;
    }
    let unique: BTreeSet<usize> = order.iter().copied().collect();
    if unique.len() == len && order.iter().all(|&i| i < len) {
        Some(order.to_vec())
    } else {
        None
    }
}

/// Cross-batch union: request-per-group batching cannot express merges, so
/// groups that came back with the same message are folded together.
fn merge_same_message(groups: Vec<LogicalGroup>) -> Vec<LogicalGroup> {
    let mut merged: Vec<LogicalGroup> = Vec::new();
    let mut by_message: BTreeMap<String, usize> = BTreeMap::new();
    for group in groups {
        let key = group.message.trim().to_lowercase();
        if key.is_empty() {
            merged.push(group);
            continue;
        }
        match by_message.get(&key) {
            Some(&idx) => merged[idx].members.extend(group.members),
            None => {
                by_message.insert(key, merged.len());
                merged.push(group);
            }
        }
    }
    merged
}

fn verify_partition(groups: &[LogicalGroup], expected: usize) -> Result<()> {
    let mut seen = BTreeSet::new();
    for group in groups {
        for &member in &group.members {
            if member >= expected || !seen.insert(member) {
                return Err(Error::Invariant(format!(
                    "logical grouping broke the partition at member {}",
                    member
                )));
            }
        }
    }
    if seen.len() != expected {
        return Err(Error::Invariant(format!(
            "logical grouping lost members: {} of {}",
            seen.len(),
            expected
        )));
    }
    Ok(())
}

/// Order groups so definitions land before groups that only reference them.
/// Independent groups keep their proposed order; cycles are broken by
/// message-alphabetic order so the result is deterministic.
fn order_by_dependencies(
    mut logical: Vec<LogicalGroup>,
    semantic: &[SemanticGroup],
) -> Vec<LogicalGroup> {
    // fill in messages the fallback path left empty
    for group in &mut logical {
        if group.message.is_empty() {
            let files: Vec<String> = group
                .members
                .iter()
                .flat_map(|&m| semantic[m].files.iter().cloned())
                .collect();
            group.message = model::heuristic_message(&files);
        }
    }

    let n = logical.len();
    let defs: Vec<BTreeSet<&str>> = logical
        .iter()
        .map(|g| {
            g.members
                .iter()
                .flat_map(|&m| semantic[m].identifiers_defined.iter())
                .map(|s| s.as_str())
                .collect()
        })
        .collect();
    let refs_only: Vec<BTreeSet<&str>> = logical
        .iter()
        .enumerate()
        .map(|(i, g)| {
            g.members
                .iter()
                .flat_map(|&m| semantic[m].identifiers_referenced.iter())
                .map(|s| s.as_str())
                .filter(|name| !defs[i].contains(name))
                .collect()
        })
        .collect();

    // edge j -> i: i references something j defines, so j must come first
    let mut pending: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for i in 0..n {
        for j in 0..n {
            if i != j && refs_only[i].intersection(&defs[j]).next().is_some() {
                pending[i].insert(j);
            }
        }
    }

    let mut emitted = vec![false; n];
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        let next = (0..n)
            .find(|&i| !emitted[i] && pending[i].iter().all(|&j| emitted[j]))
            .unwrap_or_else(|| {
                // dependency cycle: emit the alphabetically smallest message
                (0..n)
                    .filter(|&i| !emitted[i])
                    .min_by(|&a, &b| {
                        (&logical[a].message, a).cmp(&(&logical[b].message, b))
                    })
                    .expect("some group must remain")
            });
        emitted[next] = true;
        out.push(logical[next].clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semantic(files: &[&str], defined: &[&str], referenced: &[&str]) -> SemanticGroup {
        SemanticGroup {
            chunks: Vec::new(),
            files: files.iter().map(|s| s.to_string()).collect(),
            scopes: BTreeSet::new(),
            identifiers_touched: defined
                .iter()
                .chain(referenced)
                .map(|s| s.to_string())
                .collect(),
            identifiers_defined: defined.iter().map(|s| s.to_string()).collect(),
            identifiers_referenced: referenced.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn proposed(members: &[usize], message: &str) -> crate::model::ProposedGroup {
        crate::model::ProposedGroup {
            member_ids: members.to_vec(),
            message: message.to_string(),
        }
    }

    struct Scripted(AnalysisResponse);

    impl ModelProvider for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }
        fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalysisResponse> {
            Ok(AnalysisResponse {
                logical_groups: self.0.logical_groups.clone(),
                order: self.0.order.clone(),
            })
        }
    }

    struct Failing;

    impl ModelProvider for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn analyze(&self, _request: &AnalysisRequest) -> Result<AnalysisResponse> {
            Err(Error::Model("boom".to_string()))
        }
    }

    fn ctx<'a>(provider: &'a dyn ModelProvider, token: &'a CancelToken, logger: &'a slog::Logger) -> PlannerContext<'a> {
        PlannerContext {
            provider,
            intent: None,
            cluster_strictness: 0.5,
            max_tokens: 4096,
            batching: BatchingStrategy::Prompt,
            num_retries: 1,
            token,
            logger,
        }
    }

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    #[test]
    fn valid_plan_passes_through() {
        let groups = vec![
            semantic(&["src/a.rs"], &["alpha"], &[]),
            semantic(&["src/b.rs"], &[], &[]),
        ];
        let set = ChunkSet::default();
        let provider = Scripted(AnalysisResponse {
            logical_groups: vec![proposed(&[0, 1], "add alpha")],
            order: vec![0],
        });
        let token = CancelToken::new();
        let logger = discard();
        let plan = plan(&groups, &set, &ctx(&provider, &token, &logger)).unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].members, vec![0, 1]);
        assert_eq!(plan[0].message, "add alpha");
    }

    #[test]
    fn missing_members_are_repaired_as_singletons() {
        let groups = vec![
            semantic(&["src/a.rs"], &[], &[]),
            semantic(&["src/b.rs"], &[], &[]),
        ];
        let set = ChunkSet::default();
        let provider = Scripted(AnalysisResponse {
            logical_groups: vec![proposed(&[0], "touch a")],
            order: vec![],
        });
        let token = CancelToken::new();
        let logger = discard();
        let plan = plan(&groups, &set, &ctx(&provider, &token, &logger)).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].members, vec![1]);
        assert!(plan[1].message.starts_with("files touched: "));
    }

    #[test]
    fn duplicate_members_fall_back_after_retries() {
        let groups = vec![
            semantic(&["src/a.rs"], &[], &[]),
            semantic(&["src/b.rs"], &[], &[]),
        ];
        let set = ChunkSet::default();
        let provider = Scripted(AnalysisResponse {
            logical_groups: vec![
                proposed(&[0, 1], "first"),
                proposed(&[1], "second"),
            ],
            order: vec![],
        });
        let token = CancelToken::new();
        let logger = discard();
        let plan = plan(&groups, &set, &ctx(&provider, &token, &logger)).unwrap();
        // the broken response was rejected and each group got its own commit
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|g| g.members.len() == 1));
    }

    #[test]
    fn transport_failure_degrades_to_one_commit_per_group() {
        let groups = vec![
            semantic(&["src/a.rs"], &[], &[]),
            semantic(&["docs/b.md"], &[], &[]),
        ];
        let set = ChunkSet::default();
        let token = CancelToken::new();
        let logger = discard();
        let plan = plan(&groups, &set, &ctx(&Failing, &token, &logger)).unwrap();
        assert_eq!(plan.len(), 2);
        assert!(plan[0].message.contains("src/a.rs"));
    }

    #[test]
    fn referencing_group_is_ordered_after_the_defining_one() {
        let groups = vec![
            semantic(&["src/use.rs"], &[], &["helper"]),
            semantic(&["src/def.rs"], &["helper"], &[]),
        ];
        let set = ChunkSet::default();
        let provider = Scripted(AnalysisResponse {
            logical_groups: vec![
                proposed(&[0], "use helper"),
                proposed(&[1], "add helper"),
            ],
            order: vec![],
        });
        let token = CancelToken::new();
        let logger = discard();
        let plan = plan(&groups, &set, &ctx(&provider, &token, &logger)).unwrap();
        assert_eq!(plan[0].message, "add helper");
        assert_eq!(plan[1].message, "use helper");
    }

    #[test]
    fn dependency_cycles_break_alphabetically() {
        let groups = vec![
            semantic(&["a.rs"], &["x"], &["y"]),
            semantic(&["b.rs"], &["y"], &["x"]),
        ];
        let set = ChunkSet::default();
        let provider = Scripted(AnalysisResponse {
            logical_groups: vec![
                proposed(&[0], "zebra change"),
                proposed(&[1], "apple change"),
            ],
            order: vec![],
        });
        let token = CancelToken::new();
        let logger = discard();
        let plan = plan(&groups, &set, &ctx(&provider, &token, &logger)).unwrap();
        assert_eq!(plan[0].message, "apple change");
    }

    #[test]
    fn requests_batching_merges_identical_messages() {
        let groups = vec![
            semantic(&["src/a.rs"], &[], &[]),
            semantic(&["src/b.rs"], &[], &[]),
        ];
        let set = ChunkSet::default();
        let provider = Scripted(AnalysisResponse {
            logical_groups: vec![proposed(&[0], "shared message")],
            order: vec![],
        });
        // scripted provider echoes member id 0 for the first batch; the
        // second batch repairs to a singleton, so craft via Requests on a
        // provider that answers per-batch is not expressible here. Instead
        // check merge_same_message directly.
        let merged = merge_same_message(vec![
            LogicalGroup {
                members: vec![0],
                message: "Shared message".to_string(),
            },
            LogicalGroup {
                members: vec![1],
                message: "shared message".to_string(),
            },
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].members, vec![0, 1]);
        let _ = (groups, set, provider);
    }

    #[test]
    fn partition_violation_is_an_invariant_error() {
        let err = verify_partition(
            &[LogicalGroup {
                members: vec![0, 0],
                message: "x".to_string(),
            }],
            2,
        );
        assert!(matches!(err, Err(Error::Invariant(_))));
    }
}
