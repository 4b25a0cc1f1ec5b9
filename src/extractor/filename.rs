//! Works out which file a code block is meant to be saved as.
//!
//! Prose rendered from markup wraps inline code in backticks, so a filename
//! is any quoted or backticked token with a known extension or a leading dot.
//! Sources are consulted in a fixed priority order, and within one sentence
//! the candidate closest to the code block wins.

use regex::Regex;
use std::sync::LazyLock;

use super::model::FileActionKind;

const KNOWN_EXTENSIONS: &[&str] = &[
    "cfg", "conf", "crt", "csv", "env", "html", "ini", "j2", "json", "key", "md", "pem", "properties",
    "py", "repo", "service", "sh", "sql", "toml", "txt", "xml", "yaml", "yml",
];

/// Prose surrounding one code block.
#[derive(Debug, Clone, Default)]
pub struct BlockContext {
    /// Prose blocks before the code block, nearest first
    pub preceding: Vec<String>,
    pub lead: String,
    /// Prose blocks after the code block, nearest first
    pub following: Vec<String>,
    /// Lead sentences of enclosing steps, nearest first
    pub ancestor_leads: Vec<String>,
}

/// Where a filename was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilenameSource {
    PrecedingProse,
    LeadSentence,
    FollowingProse,
    AncestorLead,
}

impl FilenameSource {
    pub fn describe(&self) -> &'static str {
        match self {
            FilenameSource::PrecedingProse => "preceding paragraph",
            FilenameSource::LeadSentence => "step lead sentence",
            FilenameSource::FollowingProse => "following paragraph",
            FilenameSource::AncestorLead => "enclosing step",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFilename {
    pub filename: String,
    pub source: FilenameSource,
    /// Modify when the resolving sentence talks about changing a file
    pub kind: FileActionKind,
}

static QUOTED_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"`([^`\s]+)`|"([^"\s]+)"|'([^'\s]+)'|“([^”\s]+)”"#).expect("quoted token regex is valid")
});

static CONTENT_PHRASING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(contents?|following|as follows|should (contain|look|read|consist))\b")
        .expect("content phrasing regex is valid")
});

static CREATION_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(create|creates|creating|write|writing|save|place|put|populate|generate)\b")
        .expect("creation verb regex is valid")
});

static SNIPPET_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(add|adding|append|insert|modify|edit|update|change|replace|uncomment)\b")
        .expect("snippet verb regex is valid")
});

static SAVE_PHRASING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(save|saved|saving|name it|named|file as)\b").expect("save phrasing regex is valid")
});

/// A known extension or a leading dot, with at most one further dot in the
/// basename so module paths like `ansible.builtin.copy` are rejected.
pub fn looks_like_filename(token: &str) -> bool {
    let token = token.trim_end_matches(['.', ',', ':', ';']);
    if token.is_empty() || token.contains("://") {
        return false;
    }
    let basename = token.rsplit('/').next().unwrap_or(token);
    if let Some(hidden) = basename.strip_prefix('.') {
        return !hidden.is_empty() && hidden.matches('.').count() <= 1;
    }
    if basename.matches('.').count() != 1 {
        return false;
    }
    basename
        .rsplit('.')
        .next()
        .map(|ext| KNOWN_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Filename candidates in a sentence, in reading order.
pub fn filename_candidates(text: &str) -> Vec<String> {
    QUOTED_TOKEN
        .captures_iter(text)
        .filter_map(|caps| caps.iter().skip(1).flatten().next().map(|m| m.as_str()))
        .map(|t| t.trim_end_matches(['.', ',', ':', ';']).to_string())
        .filter(|t| looks_like_filename(t))
        .collect()
}

fn kind_for(sentence: &str) -> FileActionKind {
    if SNIPPET_VERBS.is_match(sentence) {
        FileActionKind::Modify
    } else {
        FileActionKind::Create
    }
}

/// Resolves the target filename for a file-like code block.
pub fn resolve_filename(ctx: &BlockContext) -> Option<ResolvedFilename> {
    // nearest preceding paragraph that describes content and names a file
    for prose in &ctx.preceding {
        if CONTENT_PHRASING.is_match(prose) {
            if let Some(name) = filename_candidates(prose).pop() {
                return Some(ResolvedFilename {
                    filename: name,
                    source: FilenameSource::PrecedingProse,
                    kind: kind_for(prose),
                });
            }
        }
    }

    if CREATION_VERBS.is_match(&ctx.lead) && !SNIPPET_VERBS.is_match(&ctx.lead) {
        if let Some(name) = filename_candidates(&ctx.lead).pop() {
            return Some(ResolvedFilename {
                filename: name,
                source: FilenameSource::LeadSentence,
                kind: FileActionKind::Create,
            });
        }
    }

    for prose in &ctx.following {
        if SAVE_PHRASING.is_match(prose) {
            if let Some(name) = filename_candidates(prose).into_iter().next() {
                return Some(ResolvedFilename {
                    filename: name,
                    source: FilenameSource::FollowingProse,
                    kind: kind_for(prose),
                });
            }
        }
    }

    for lead in &ctx.ancestor_leads {
        if let Some(name) = filename_candidates(lead).pop() {
            return Some(ResolvedFilename {
                filename: name,
                source: FilenameSource::AncestorLead,
                kind: kind_for(lead),
            });
        }
    }

    // a lead that adds a snippet still names the file being changed
    filename_candidates(&ctx.lead).pop().map(|name| ResolvedFilename {
        filename: name,
        source: FilenameSource::LeadSentence,
        kind: FileActionKind::Modify,
    })
}
