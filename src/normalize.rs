//! Text normalization, fingerprints and record identifiers.
//!
//! Every document passes through [`normalize`] before it is embedded or
//! checked for duplicates:
//!
//! 1. Markup removal: tags are dropped, `<script>`/`<style>` bodies and
//!    comments are skipped, character entities are decoded.
//! 2. Boilerplate removal: page numbers, "Page N of M" footers and table of
//!    contents headings are dropped line by line.
//! 3. Canonical whitespace: runs of whitespace collapse to a single space.
//! 4. Truncation to the configured excerpt length, on a char boundary.
//!
//! The duplicate fingerprint ([`fingerprint`]) is the SHA-256 of the
//! lowercase alphanumeric token sequence, so documents that differ only in
//! punctuation, casing or layout share a fingerprint.

use sha2::{Digest, Sha256};

use crate::models::RecordSource;

/// Output of [`normalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub text: String,
    pub content_hash: String,
}

/// Run the full normalization pipeline and compute the fingerprint.
pub fn normalize(raw: &str, max_chars: usize) -> Normalized {
    let stripped = strip_markup(raw);
    let kept: Vec<&str> = stripped
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_boilerplate(l))
        .collect();
    let text = collapse_whitespace(&kept.join("\n"));
    let text = truncate_chars(&text, max_chars).to_string();
    let content_hash = fingerprint(&text);
    Normalized { text, content_hash }
}

/// Deterministic record id for `(source, native_id[, revision])`.
///
/// Revision 0 hashes only source and native id, so the first revision of a
/// document always gets the same id.
pub fn record_id(source: RecordSource, native_id: &str, revision: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(native_id.as_bytes());
    if revision > 0 {
        hasher.update([0u8]);
        hasher.update(format!("rev{}", revision).as_bytes());
    }
    let digest = hex::encode(hasher.finalize());
    digest[..32].to_string()
}

/// SHA-256 of the lowercase alphanumeric token sequence.
pub fn fingerprint(text: &str) -> String {
    let mut hasher = Sha256::new();
    let mut first = true;
    for token in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
    {
        if !first {
            hasher.update(b" ");
        }
        hasher.update(token.to_lowercase().as_bytes());
        first = false;
    }
    hex::encode(hasher.finalize())
}

/// Longest prefix of `text` holding at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_boilerplate(line: &str) -> bool {
    let lower = line.to_lowercase();
    if lower == "table of contents" || lower == "(back to top)" {
        return true;
    }
    // "12", "- 12 -", "Page 3", "Page 3 of 40"
    let stripped = lower.trim_matches(|c: char| c == '-' || c.is_whitespace());
    if !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit()) {
        return true;
    }
    if let Some(rest) = stripped.strip_prefix("page") {
        let rest = rest.trim();
        return !rest.is_empty()
            && rest
                .split_whitespace()
                .all(|w| w == "of" || w.chars().all(|c| c.is_ascii_digit()));
    }
    false
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "br", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6", "table", "title", "hr",
    "page", "td", "th",
];

/// Remove markup, keeping block boundaries as newlines.
pub fn strip_markup(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find(['<', '&']) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if rest.starts_with('&') {
            match decode_entity(rest) {
                Some((decoded, len)) => {
                    out.push(decoded);
                    rest = &rest[len..];
                }
                None => {
                    out.push('&');
                    rest = &rest[1..];
                }
            }
            continue;
        }

        if let Some(after) = rest.strip_prefix("<!--") {
            rest = match after.find("-->") {
                Some(end) => &after[end + 3..],
                None => "",
            };
            continue;
        }

        let looks_like_tag = rest[1..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '/' || c == '!' || c == '?');
        if !looks_like_tag {
            out.push('<');
            rest = &rest[1..];
            continue;
        }

        let Some(end) = rest.find('>') else {
            // Unterminated tag: drop the remainder
            rest = "";
            break;
        };
        let tag = &rest[1..end];
        rest = &rest[end + 1..];

        let name = tag
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();

        if !tag.starts_with('/') && (name == "script" || name == "style") {
            let close = format!("</{}", name);
            rest = match find_ascii_ci(rest, &close) {
                Some(idx) => match rest[idx..].find('>') {
                    Some(gt) => &rest[idx + gt + 1..],
                    None => "",
                },
                None => "",
            };
            continue;
        }

        if BLOCK_TAGS.contains(&name.as_str()) {
            out.push('\n');
        }
    }

    out.push_str(rest);
    out
}

fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Decode the entity at the start of `s`. Returns the character and the
/// number of bytes consumed.
fn decode_entity(s: &str) -> Option<(char, usize)> {
    let end = s.bytes().take(12).position(|b| b == b';')?;
    let body = &s[1..end];
    let ch = match body {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" | "#39" => '\'',
        "nbsp" | "#160" => ' ',
        "mdash" | "ndash" => '-',
        "rsquo" | "lsquo" => '\'',
        "rdquo" | "ldquo" => '"',
        "sect" => '§',
        _ => {
            let num = body.strip_prefix('#')?;
            let code = match num.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => num.parse().ok()?,
            };
            char::from_u32(code)?
        }
    };
    Some((ch, end + 1))
}

/// Contract type from keywords in a corpus file name.
pub fn classify_contract_type(file_name: &str) -> &'static str {
    let name = file_name.to_lowercase();
    let has = |words: &[&str]| words.iter().any(|w| name.contains(w));

    if has(&["employ", "compensation", "severance"]) {
        "Employment"
    } else if has(&["merger", "acquisition"]) {
        "M&A"
    } else if has(&["lease", "rental"]) {
        "Lease"
    } else if has(&["credit", "loan", "security", "note"]) {
        "Security"
    } else if has(&["service", "consulting", "professional"]) {
        "Services"
    } else {
        "Other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_markup_drops_script_and_decodes_entities() {
        let html = "<html><head><style>p{color:red}</style><SCRIPT>var x = '<p>';</SCRIPT></head>\
                    <body><p>Smith &amp; Co.</p><!-- note --><p>Fee &lt; $5&#44;000</p></body></html>";
        let text = normalize(html, 1000).text;
        assert_eq!(text, "Smith & Co. Fee < $5,000");
    }

    #[test]
    fn test_plain_text_comparison_kept() {
        let text = normalize("if a < b and c > d", 100).text;
        assert_eq!(text, "if a < b and c > d");
    }

    #[test]
    fn test_boilerplate_lines_removed() {
        let raw = "TABLE OF CONTENTS\nSection 1. Term\n- 2 -\nPage 3 of 40\nThe term is five years.\n17\n";
        assert_eq!(
            normalize(raw, 1000).text,
            "Section 1. Term The term is five years."
        );
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("§§§§", 2), "§§");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(normalize("héllo wörld", 5).text, "héllo");
    }

    #[test]
    fn test_fingerprint_ignores_case_and_punctuation() {
        assert_eq!(
            fingerprint("Exclusivity clause governs distribution."),
            fingerprint("exclusivity   CLAUSE, governs\ndistribution")
        );
        assert_ne!(
            fingerprint("clause governs distribution"),
            fingerprint("distribution governs clause")
        );
    }

    #[test]
    fn test_record_id_deterministic_and_source_scoped() {
        let a = record_id(RecordSource::Historical, "corpus/a.htm", 0);
        assert_eq!(a, record_id(RecordSource::Historical, "corpus/a.htm", 0));
        assert_eq!(a.len(), 32);
        assert_ne!(a, record_id(RecordSource::Live, "corpus/a.htm", 0));
        assert_ne!(a, record_id(RecordSource::Historical, "corpus/a.htm", 1));
    }

    #[test]
    fn test_classify_contract_type() {
        assert_eq!(classify_contract_type("Executive_Employment_Agmt.htm"), "Employment");
        assert_eq!(classify_contract_type("merger-agreement.txt"), "M&A");
        assert_eq!(classify_contract_type("OfficeLease2019.html"), "Lease");
        assert_eq!(classify_contract_type("credit_facility.htm"), "Security");
        assert_eq!(classify_contract_type("consulting.txt"), "Services");
        assert_eq!(classify_contract_type("exhibit10.htm"), "Other");
    }
}
