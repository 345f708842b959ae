//! Parser capability: syntax trees, scope nodes and identifier sites.
//!
//! Every file with new content is parsed once; scopes, shared tokens and
//! comments come from the language's queries. Files with no known language
//! or a failed parse drop into fallback mode (one anonymous whole-file
//! scope, no identifiers) unless `failOnSyntaxErrors` promotes the parse
//! error to a fatal one.

use std::collections::BTreeMap;

use rayon::prelude::*;
use streaming_iterator::StreamingIterator;

use crate::errors::{CancelToken, Error, Result};
use crate::lang::{self, LanguageSpec, LanguageTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Named,
    Anonymous,
    Comment,
}

/// A syntactic region, in 1-based inclusive line coordinates of the new
/// file content.
#[derive(Debug, Clone)]
pub struct ScopeNode {
    pub kind: ScopeKind,
    pub name: Option<String>,
    pub start_line: u32,
    pub end_line: u32,
}

impl ScopeNode {
    pub fn intersects(&self, span: (u32, u32)) -> bool {
        span.0 <= self.end_line && self.start_line <= span.1
    }

    pub fn contains(&self, other: &ScopeNode) -> bool {
        self.start_line <= other.start_line
            && other.end_line <= self.end_line
            && (self.start_line, self.end_line) != (other.start_line, other.end_line)
    }
}

#[derive(Debug, Clone)]
pub struct IdentifierSite {
    pub name: String,
    pub line: u32,
}

/// Everything the semantic grouper needs to know about one file.
#[derive(Debug)]
pub struct FileIndex {
    pub path: String,
    pub language: Option<String>,
    /// False means fallback mode: the file groups by path or extension.
    pub parsed: bool,
    pub share_tokens: bool,
    pub scopes: Vec<ScopeNode>,
    /// Comments paired with the scope they document (the next scope below
    /// with only blank lines in between), if any.
    pub comments: Vec<(ScopeNode, Option<usize>)>,
    pub definitions: Vec<IdentifierSite>,
    pub references: Vec<IdentifierSite>,
}

impl FileIndex {
    pub fn fallback(path: &str, language: Option<&str>) -> FileIndex {
        FileIndex {
            path: path.to_string(),
            language: language.map(|l| l.to_string()),
            parsed: false,
            share_tokens: false,
            scopes: Vec::new(),
            comments: Vec::new(),
            definitions: Vec::new(),
            references: Vec::new(),
        }
    }

    /// The innermost scopes intersecting a line span: scopes that intersect
    /// the span and contain no nested scope that also intersects it.
    pub fn innermost_scopes(&self, span: (u32, u32)) -> Vec<usize> {
        let hits: Vec<usize> = self
            .scopes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.intersects(span))
            .map(|(i, _)| i)
            .collect();
        hits.iter()
            .filter(|&&i| {
                !hits
                    .iter()
                    .any(|&j| j != i && self.scopes[i].contains(&self.scopes[j]))
            })
            .copied()
            .collect()
    }
}

/// Parse and index a batch of files. Input is `(path, new content)`;
/// output is keyed by path. Per-file work fans out on the rayon pool and is
/// reassembled in path order, so the result is deterministic.
pub fn index_files(
    files: &[(String, Vec<u8>)],
    table: &LanguageTable,
    fail_on_syntax_errors: bool,
    token: &CancelToken,
    logger: &slog::Logger,
) -> Result<BTreeMap<String, FileIndex>> {
    let indexed: Vec<Result<FileIndex>> = files
        .par_iter()
        .map(|(path, content)| {
            token.check()?;
            index_file(path, content, table, fail_on_syntax_errors, logger)
        })
        .collect();

    let mut out = BTreeMap::new();
    for index in indexed {
        let index = index?;
        out.insert(index.path.clone(), index);
    }
    Ok(out)
}

fn index_file(
    path: &str,
    content: &[u8],
    table: &LanguageTable,
    fail_on_syntax_errors: bool,
    logger: &slog::Logger,
) -> Result<FileIndex> {
    let (name, spec) = match table.language_for_path(path) {
        Some(found) => found,
        None => {
            debug!(logger, "no language for file"; "path" => path);
            return Ok(FileIndex::fallback(path, None));
        }
    };
    let language = match lang::grammar(name) {
        Some(l) => l,
        None => return Ok(FileIndex::fallback(path, None)),
    };

    let mut parser = tree_sitter::Parser::new();
    parser
        .set_language(&language)
        .map_err(|e| Error::Usage(format!("cannot load {} grammar: {}", name, e)))?;

    let tree = match parser.parse(content, None) {
        Some(tree) => tree,
        None => {
            debug!(logger, "parser returned no tree"; "path" => path);
            return Ok(FileIndex::fallback(path, Some(name)));
        }
    };

    if tree.root_node().has_error() {
        if fail_on_syntax_errors {
            return Err(Error::Syntax {
                path: path.to_string(),
            });
        }
        warn!(logger, "syntax errors, using fallback grouping"; "path" => path);
        return Ok(FileIndex::fallback(path, Some(name)));
    }
    if tree.root_node().kind() != spec.root_node_name {
        debug!(logger, "unexpected root node";
               "path" => path,
               "kind" => tree.root_node().kind(),
        );
    }

    let mut index = FileIndex {
        path: path.to_string(),
        language: Some(name.to_string()),
        parsed: true,
        share_tokens: spec.share_tokens_between_files,
        scopes: collect_scopes(&language, spec, &tree, content),
        comments: Vec::new(),
        definitions: collect_sites(
            &language,
            &spec.shared_token_queries.definitions,
            &tree,
            content,
        ),
        references: Vec::new(),
    };

    let general = collect_sites(
        &language,
        &spec.shared_token_queries.general,
        &tree,
        content,
    );
    let defined: std::collections::BTreeSet<(u32, &str)> = index
        .definitions
        .iter()
        .map(|site| (site.line, site.name.as_str()))
        .collect();
    index.references = general
        .into_iter()
        .filter(|site| !defined.contains(&(site.line, site.name.as_str())))
        .collect();

    let comments = collect_comments(&language, spec, &tree, content);
    index.comments = attach_comments(comments, &index.scopes, content);

    debug!(logger, "indexed file";
           "path" => path,
           "language" => name,
           "scopes" => index.scopes.len(),
           "definitions" => index.definitions.len(),
    );
    Ok(index)
}

/// Re-parse freshly composed content for the syntax validator. `None` means
/// the language is unknown and there is nothing to validate.
pub fn parses_cleanly(path: &str, content: &[u8], table: &LanguageTable) -> Option<bool> {
    let (name, _) = table.language_for_path(path)?;
    let language = lang::grammar(name)?;
    let mut parser = tree_sitter::Parser::new();
    parser.set_language(&language).ok()?;
    let tree = parser.parse(content, None)?;
    Some(!tree.root_node().has_error())
}

fn node_lines(node: &tree_sitter::Node) -> (u32, u32) {
    (
        node.start_position().row as u32 + 1,
        node.end_position().row as u32 + 1,
    )
}

fn collect_scopes(
    language: &tree_sitter::Language,
    spec: &LanguageSpec,
    tree: &tree_sitter::Tree,
    content: &[u8],
) -> Vec<ScopeNode> {
    let mut scopes = Vec::new();
    for source in &spec.scope_queries {
        let query = match tree_sitter::Query::new(language, source) {
            Ok(q) => q,
            Err(_) => continue,
        };
        let names = query.capture_names();
        let mut cursor = tree_sitter::QueryCursor::new();
        let mut matches = cursor.matches(&query, tree.root_node(), content);
        while let Some(m) = matches.next() {
            let mut node_span = None;
            let mut name = None;
            for capture in m.captures {
                let capture_name = names[capture.index as usize];
                if capture_name.ends_with(".name") {
                    name = capture.node.utf8_text(content).ok().map(|s| s.to_string());
                } else {
                    node_span = Some(node_lines(&capture.node));
                }
            }
            if let Some((start_line, end_line)) = node_span {
                scopes.push(ScopeNode {
                    kind: ScopeKind::Named,
                    name,
                    start_line,
                    end_line,
                });
            }
        }
    }
    scopes.sort_by_key(|s| (s.start_line, std::cmp::Reverse(s.end_line)));
    scopes
}

fn collect_sites(
    language: &tree_sitter::Language,
    sources: &[String],
    tree: &tree_sitter::Tree,
    content: &[u8],
) -> Vec<IdentifierSite> {
    let mut sites = Vec::new();
    for source in sources {
        let query = match tree_sitter::Query::new(language, source) {
            Ok(q) => q,
            Err(_) => continue,
        };
        let mut cursor = tree_sitter::QueryCursor::new();
        let mut matches = cursor.matches(&query, tree.root_node(), content);
        while let Some(m) = matches.next() {
            for capture in m.captures {
                if let Ok(text) = capture.node.utf8_text(content) {
                    sites.push(IdentifierSite {
                        name: text.to_string(),
                        line: capture.node.start_position().row as u32 + 1,
                    });
                }
            }
        }
    }
    sites.sort_by(|a, b| (a.line, &a.name).cmp(&(b.line, &b.name)));
    sites.dedup_by(|a, b| a.line == b.line && a.name == b.name);
    sites
}

fn collect_comments(
    language: &tree_sitter::Language,
    spec: &LanguageSpec,
    tree: &tree_sitter::Tree,
    content: &[u8],
) -> Vec<ScopeNode> {
    let mut comments = Vec::new();
    for source in &spec.comment_queries {
        let query = match tree_sitter::Query::new(language, source) {
            Ok(q) => q,
            Err(_) => continue,
        };
        let mut cursor = tree_sitter::QueryCursor::new();
        let mut matches = cursor.matches(&query, tree.root_node(), content);
        while let Some(m) = matches.next() {
            for capture in m.captures {
                let (start_line, end_line) = node_lines(&capture.node);
                comments.push(ScopeNode {
                    kind: ScopeKind::Comment,
                    name: None,
                    start_line,
                    end_line,
                });
            }
        }
    }
    comments.sort_by_key(|c| (c.start_line, c.end_line));
    comments.dedup_by(|a, b| (a.start_line, a.end_line) == (b.start_line, b.end_line));
    comments
}

/// Pair each comment with the scope it documents: the nearest scope starting
/// below the comment with nothing but blank lines in between.
fn attach_comments(
    comments: Vec<ScopeNode>,
    scopes: &[ScopeNode],
    content: &[u8],
) -> Vec<(ScopeNode, Option<usize>)> {
    let blank: Vec<bool> = content
        .split(|&b| b == b'\n')
        .map(|line| line.iter().all(|b| b.is_ascii_whitespace()))
        .collect();
    let line_blank = |line: u32| {
        let idx = line as usize - 1;
        idx >= blank.len() || blank[idx]
    };

    comments
        .into_iter()
        .map(|comment| {
            let attached = scopes
                .iter()
                .enumerate()
                .filter(|(_, s)| s.start_line > comment.end_line)
                .min_by_key(|(_, s)| s.start_line)
                .and_then(|(idx, s)| {
                    let gap_blank =
                        (comment.end_line + 1..s.start_line).all(line_blank);
                    if gap_blank {
                        Some(idx)
                    } else {
                        None
                    }
                });
            (comment, attached)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, o!())
    }

    fn index_one(path: &str, content: &str) -> FileIndex {
        let table = LanguageTable::builtin();
        let files = vec![(path.to_string(), content.as_bytes().to_vec())];
        let mut map =
            index_files(&files, &table, false, &CancelToken::new(), &discard()).unwrap();
        map.remove(path).unwrap()
    }

    #[test]
    fn python_functions_become_named_scopes() {
        let index = index_one(
            "a.py",
            "def f():\n    return helper()\n\ndef g():\n    return 2\n",
        );
        assert!(index.parsed);
        let names: Vec<_> = index
            .scopes
            .iter()
            .filter_map(|s| s.name.as_deref())
            .collect();
        assert_eq!(names, vec!["f", "g"]);
        assert!(index
            .definitions
            .iter()
            .any(|site| site.name == "f" && site.line == 1));
        assert!(index
            .references
            .iter()
            .any(|site| site.name == "helper" && site.line == 2));
    }

    #[test]
    fn rust_items_and_comments_are_indexed() {
        let index = index_one(
            "a.rs",
            "// adds one\nfn incr(x: u32) -> u32 {\n    x + 1\n}\n\nstruct Counter {\n    n: u32,\n}\n",
        );
        assert!(index.parsed);
        assert_eq!(index.scopes.len(), 2);
        assert_eq!(index.comments.len(), 1);
        // the comment documents the function right below it
        let (comment, attached) = &index.comments[0];
        assert_eq!(comment.start_line, 1);
        assert_eq!(*attached, Some(0));
        assert_eq!(index.scopes[0].name.as_deref(), Some("incr"));
    }

    #[test]
    fn comment_with_code_between_is_unattached() {
        let index = index_one(
            "a.py",
            "# stray note\nx = 1\n\ndef f():\n    return x\n",
        );
        let (_, attached) = &index.comments[0];
        assert_eq!(*attached, None);
    }

    #[test]
    fn unknown_language_falls_back() {
        let index = index_one("notes.txt", "hello\n");
        assert!(!index.parsed);
        assert!(index.scopes.is_empty());
        assert!(index.definitions.is_empty());
    }

    #[test]
    fn broken_python_falls_back_without_fail_flag() {
        let index = index_one("bad.py", "def f(:\n");
        assert!(!index.parsed);
    }

    #[test]
    fn broken_python_is_fatal_with_fail_flag() {
        let table = LanguageTable::builtin();
        let files = vec![("bad.py".to_string(), b"def f(:\n".to_vec())];
        let err = index_files(&files, &table, true, &CancelToken::new(), &discard());
        assert!(matches!(err, Err(Error::Syntax { .. })));
    }

    #[test]
    fn innermost_scope_prefers_the_nested_method() {
        let index = index_one(
            "a.py",
            "class C:\n    def m(self):\n        return 1\n\n    def n(self):\n        return 2\n",
        );
        // span inside method m
        let innermost = index.innermost_scopes((3, 3));
        assert_eq!(innermost.len(), 1);
        assert_eq!(index.scopes[innermost[0]].name.as_deref(), Some("m"));
        // span covering both methods resolves to both, not the class
        let both = index.innermost_scopes((2, 6));
        let names: Vec<_> = both
            .iter()
            .filter_map(|&i| index.scopes[i].name.as_deref())
            .collect();
        assert!(names.contains(&"m") && names.contains(&"n"));
    }
}
