//! Attribute and citation extraction over agent response text.
//!
//! Both extractors are pure and deterministic: the same text always yields
//! the same sorted, de-duplicated list, and empty text yields an empty list.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Returned alone when the text clearly cites sources but carries no URL.
pub const CITATION_SENTINEL: &str = "NOTE: Text contains citation references but no extractable URLs";

static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*#{1,6}\s*([^\n#]{1,100})").expect("heading regex compiles"));
static BOLD_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\*\*\s*([^*:\n]{1,100}?)\s*\*\*\s*:").expect("bold label regex compiles")
});
static KEY_LABEL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 &/()\-_.]{0,100}?)\s*:\s*").expect("key label regex compiles")
});
static BULLET_LABEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*+]\s*([^:\n]{1,60}?):").expect("bullet regex compiles"));

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https?://[\w\-._~:/?#\[\]@!$&'()*+,;=%]+").expect("url regex compiles")
});
static MD_LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").expect("link regex compiles"));
static BRACKET_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]").expect("bracket regex compiles"));
static FOOTNOTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)\^(\d+)(?:\s|$)").expect("footnote regex compiles"));

/// Per-line attribute rules in precedence order; the first rule that
/// captures a non-empty label wins for that line.
struct LabelRule {
    pattern: &'static LazyLock<Regex>,
    min_len: usize,
}

static LINE_RULES: [LabelRule; 3] = [
    LabelRule {
        pattern: &HEADING_RE,
        min_len: 1,
    },
    LabelRule {
        pattern: &BOLD_LABEL_RE,
        min_len: 1,
    },
    LabelRule {
        pattern: &KEY_LABEL_RE,
        min_len: 2,
    },
];

fn clean_label(raw: &str) -> &str {
    raw.trim_matches(|c: char| c.is_whitespace() || c == '*')
}

fn capture_label<'t>(re: &Regex, line: &'t str, min_len: usize) -> Option<&'t str> {
    let caps = re.captures(line)?;
    let label = clean_label(caps.get(1)?.as_str());
    (label.chars().count() >= min_len).then_some(label)
}

/// Attribute names mentioned in the text: heading text, bold `**Label**:`
/// and bare `Label:` lines, then bulleted `- Label:` lines.
pub fn extract_attributes(text: &str) -> Vec<String> {
    let mut found = BTreeSet::new();

    for line in text.lines() {
        let hit = LINE_RULES
            .iter()
            .find_map(|rule| capture_label(rule.pattern, line, rule.min_len));
        if let Some(label) = hit {
            found.insert(label.to_string());
        }
    }

    for line in text.lines() {
        if let Some(label) = capture_label(&BULLET_LABEL_RE, line, 1) {
            found.insert(label.to_string());
        }
    }

    found.into_iter().collect()
}

/// Drops a trailing `)` that belongs to the surrounding text rather than
/// the last path segment.
fn trim_url(raw: &str) -> &str {
    match raw.strip_suffix(')') {
        Some(stripped) if !raw.rsplit('/').next().is_some_and(|seg| seg.contains('(')) => stripped,
        _ => raw,
    }
}

fn has_reference_markers(text: &str) -> bool {
    let bracket_ref = BRACKET_REF_RE.captures_iter(text).any(|caps| {
        let inner = caps[1].trim();
        let lower = inner.to_lowercase();
        (!inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()))
            || ["source", "reference", "citation"]
                .iter()
                .any(|marker| lower.contains(marker))
    });
    if bracket_ref || FOOTNOTE_RE.is_match(text) {
        return true;
    }
    text.lines().any(|line| {
        let lower = line.to_lowercase();
        lower.contains("sources:") || lower.contains("references:")
    })
}

/// Cited URLs and Markdown link targets. When neither exists but the text
/// still carries reference markers, the list is just [`CITATION_SENTINEL`].
pub fn extract_citations(text: &str) -> Vec<String> {
    let mut found = BTreeSet::new();

    for m in URL_RE.find_iter(text) {
        let url = trim_url(m.as_str());
        if !url.is_empty() {
            found.insert(url.to_string());
        }
    }
    for caps in MD_LINK_RE.captures_iter(text) {
        let target = caps[2].trim();
        if !target.is_empty() {
            found.insert(target.to_string());
        }
    }

    if found.is_empty() && has_reference_markers(text) {
        return vec![CITATION_SENTINEL.to_string()];
    }
    found.into_iter().collect()
}

/// Union of attribute lists, sorted and de-duplicated.
pub fn union_attributes<'a>(lists: impl IntoIterator<Item = &'a [String]>) -> Vec<String> {
    lists
        .into_iter()
        .flatten()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
