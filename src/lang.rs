//! Language configuration for the parser capability.
//!
//! Each supported language carries tree-sitter queries for scopes, shared
//! tokens (definitions and general references) and comments. The built-in
//! table covers the bundled grammars; a custom JSON config file (same shape,
//! keyed by language name) is merged over it. Custom entries can retune
//! queries and extensions but cannot introduce grammars that are not
//! compiled in; those entries are ignored and their files take the fallback
//! path.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use crate::errors::Result;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SharedTokenQueries {
    #[serde(default)]
    pub general: Vec<String>,
    #[serde(default)]
    pub definitions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LanguageSpec {
    pub root_node_name: String,
    #[serde(default)]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub scope_queries: Vec<String>,
    #[serde(default)]
    pub shared_token_queries: SharedTokenQueries,
    #[serde(default)]
    pub comment_queries: Vec<String>,
    #[serde(default = "default_share_tokens")]
    pub share_tokens_between_files: bool,
}

fn default_share_tokens() -> bool {
    true
}

#[derive(Debug, Clone)]
pub struct LanguageTable {
    entries: BTreeMap<String, LanguageSpec>,
}

impl LanguageTable {
    pub fn builtin() -> LanguageTable {
        let mut entries = BTreeMap::new();
        entries.insert("rust".to_string(), rust_spec());
        entries.insert("python".to_string(), python_spec());
        entries.insert("javascript".to_string(), javascript_spec());
        entries.insert("typescript".to_string(), typescript_spec());
        entries.insert("go".to_string(), go_spec());
        LanguageTable { entries }
    }

    /// Merge a custom config file over the built-in table. Returns the names
    /// of entries that were dropped because no grammar is compiled in.
    pub fn merge_custom_file(&mut self, path: &Path) -> Result<Vec<String>> {
        let text = std::fs::read_to_string(path)?;
        let custom: BTreeMap<String, LanguageSpec> = serde_json::from_str(&text)
            .map_err(|e| crate::errors::Error::Usage(format!(
                "cannot parse language config {}: {}",
                path.display(),
                e
            )))?;

        let mut ignored = Vec::new();
        for (name, spec) in custom {
            if grammar(&name).is_none() {
                ignored.push(name);
                continue;
            }
            self.entries.insert(name, spec);
        }
        Ok(ignored)
    }

    pub fn get(&self, name: &str) -> Option<&LanguageSpec> {
        self.entries.get(name)
    }

    /// Detect the language of a path by extension.
    pub fn language_for_path(&self, path: &str) -> Option<(&str, &LanguageSpec)> {
        let ext = Path::new(path).extension()?.to_str()?;
        self.entries
            .iter()
            .find(|(_, spec)| spec.extensions.iter().any(|e| e == ext))
            .map(|(name, spec)| (name.as_str(), spec))
    }
}

/// Grammar binding for a language name.
pub fn grammar(name: &str) -> Option<tree_sitter::Language> {
    match name {
        "rust" => Some(tree_sitter_rust::LANGUAGE.into()),
        "python" => Some(tree_sitter_python::LANGUAGE.into()),
        "javascript" => Some(tree_sitter_javascript::LANGUAGE.into()),
        "typescript" => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
        "go" => Some(tree_sitter_go::LANGUAGE.into()),
        _ => None,
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn rust_spec() -> LanguageSpec {
    LanguageSpec {
        root_node_name: "source_file".to_string(),
        extensions: strings(&["rs"]),
        scope_queries: strings(&[
            "(function_item name: (identifier) @scope.name) @scope",
            "(struct_item name: (type_identifier) @scope.name) @scope",
            "(enum_item name: (type_identifier) @scope.name) @scope",
            "(trait_item name: (type_identifier) @scope.name) @scope",
            "(mod_item name: (identifier) @scope.name) @scope",
            "(impl_item) @scope",
        ]),
        shared_token_queries: SharedTokenQueries {
            general: strings(&[
                "(identifier) @ref",
                "(type_identifier) @ref",
                "(field_identifier) @ref",
            ]),
            definitions: strings(&[
                "(function_item name: (identifier) @def)",
                "(struct_item name: (type_identifier) @def)",
                "(enum_item name: (type_identifier) @def)",
                "(trait_item name: (type_identifier) @def)",
                "(const_item name: (identifier) @def)",
                "(static_item name: (identifier) @def)",
                "(type_item name: (type_identifier) @def)",
            ]),
        },
        comment_queries: strings(&["(line_comment) @comment", "(block_comment) @comment"]),
        share_tokens_between_files: true,
    }
}

fn python_spec() -> LanguageSpec {
    LanguageSpec {
        root_node_name: "module".to_string(),
        extensions: strings(&["py"]),
        scope_queries: strings(&[
            "(function_definition name: (identifier) @scope.name) @scope",
            "(class_definition name: (identifier) @scope.name) @scope",
        ]),
        shared_token_queries: SharedTokenQueries {
            general: strings(&["(identifier) @ref"]),
            definitions: strings(&[
                "(function_definition name: (identifier) @def)",
                "(class_definition name: (identifier) @def)",
                "(assignment left: (identifier) @def)",
            ]),
        },
        comment_queries: strings(&[
            "(comment) @comment",
            "(expression_statement (string) @comment)",
        ]),
        share_tokens_between_files: true,
    }
}

fn javascript_spec() -> LanguageSpec {
    LanguageSpec {
        root_node_name: "program".to_string(),
        extensions: strings(&["js", "jsx", "mjs", "cjs"]),
        scope_queries: strings(&[
            "(function_declaration name: (identifier) @scope.name) @scope",
            "(class_declaration name: (identifier) @scope.name) @scope",
            "(method_definition name: (property_identifier) @scope.name) @scope",
        ]),
        shared_token_queries: SharedTokenQueries {
            general: strings(&["(identifier) @ref", "(property_identifier) @ref"]),
            definitions: strings(&[
                "(function_declaration name: (identifier) @def)",
                "(class_declaration name: (identifier) @def)",
                "(variable_declarator name: (identifier) @def)",
            ]),
        },
        comment_queries: strings(&["(comment) @comment"]),
        share_tokens_between_files: true,
    }
}

fn typescript_spec() -> LanguageSpec {
    LanguageSpec {
        root_node_name: "program".to_string(),
        extensions: strings(&["ts", "tsx"]),
        scope_queries: strings(&[
            "(function_declaration name: (identifier) @scope.name) @scope",
            "(class_declaration name: (type_identifier) @scope.name) @scope",
            "(method_definition name: (property_identifier) @scope.name) @scope",
            "(interface_declaration name: (type_identifier) @scope.name) @scope",
            "(enum_declaration name: (identifier) @scope.name) @scope",
            "(type_alias_declaration name: (type_identifier) @scope.name) @scope",
        ]),
        shared_token_queries: SharedTokenQueries {
            general: strings(&[
                "(identifier) @ref",
                "(property_identifier) @ref",
                "(type_identifier) @ref",
            ]),
            definitions: strings(&[
                "(function_declaration name: (identifier) @def)",
                "(class_declaration name: (type_identifier) @def)",
                "(interface_declaration name: (type_identifier) @def)",
                "(enum_declaration name: (identifier) @def)",
                "(type_alias_declaration name: (type_identifier) @def)",
                "(variable_declarator name: (identifier) @def)",
            ]),
        },
        comment_queries: strings(&["(comment) @comment"]),
        share_tokens_between_files: true,
    }
}

fn go_spec() -> LanguageSpec {
    LanguageSpec {
        root_node_name: "source_file".to_string(),
        extensions: strings(&["go"]),
        scope_queries: strings(&[
            "(function_declaration name: (identifier) @scope.name) @scope",
            "(method_declaration name: (field_identifier) @scope.name) @scope",
            "(type_declaration (type_spec name: (type_identifier) @scope.name)) @scope",
        ]),
        shared_token_queries: SharedTokenQueries {
            general: strings(&[
                "(identifier) @ref",
                "(type_identifier) @ref",
                "(field_identifier) @ref",
            ]),
            definitions: strings(&[
                "(function_declaration name: (identifier) @def)",
                "(method_declaration name: (field_identifier) @def)",
                "(type_spec name: (type_identifier) @def)",
                "(const_spec name: (identifier) @def)",
                "(var_spec name: (identifier) @def)",
            ]),
        },
        comment_queries: strings(&["(comment) @comment"]),
        share_tokens_between_files: true,
    }
}
