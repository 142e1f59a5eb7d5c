//! Historical corpus loader.
//!
//! Walks `corpus.root`, keeps files matching the include globs (HTML and
//! plain-text contracts by default) and turns each into a [`RawDocument`]
//! whose native id is the path relative to the root. Contract type is
//! inferred from the file name.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::CorpusConfig;
use crate::models::{RawDocument, RecordMetadata};
use crate::normalize::{classify_contract_type, normalize};

/// A file selected by the include/exclude globs.
#[derive(Debug, Clone)]
pub struct CorpusFile {
    pub path: PathBuf,
    /// Path relative to the corpus root, `/`-separated. Used as native id.
    pub relative: String,
}

/// Lazily loads corpus files as [`RawDocument`]s, skipping files that are
/// unreadable or whose extracted text is shorter than `min_chars`.
pub struct CorpusLoader {
    files: std::vec::IntoIter<CorpusFile>,
    min_chars: usize,
    max_chars: usize,
    discovered: usize,
    skipped_short: usize,
    unreadable: usize,
}

impl CorpusLoader {
    pub fn discovered(&self) -> usize {
        self.discovered
    }

    pub fn skipped_short(&self) -> usize {
        self.skipped_short
    }

    pub fn unreadable(&self) -> usize {
        self.unreadable
    }

    fn load(&mut self, file: CorpusFile) -> Option<RawDocument> {
        let bytes = match std::fs::read(&file.path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(path = %file.path.display(), error = %e, "skipping unreadable file");
                self.unreadable += 1;
                return None;
            }
        };
        let text = String::from_utf8_lossy(&bytes).into_owned();

        let size_chars = normalize(&text, self.max_chars).text.chars().count();
        if size_chars < self.min_chars {
            tracing::debug!(path = %file.relative, size_chars, "skipping short document");
            self.skipped_short += 1;
            return None;
        }
        Some(file_to_document(&file.path, file.relative, text, size_chars))
    }
}

impl Iterator for CorpusLoader {
    type Item = RawDocument;

    fn next(&mut self) -> Option<RawDocument> {
        while let Some(file) = self.files.next() {
            if let Some(doc) = self.load(file) {
                return Some(doc);
            }
        }
        None
    }
}

/// Walk the corpus root and collect matching files in path order.
pub fn discover(config: &CorpusConfig, root_override: Option<&Path>) -> Result<Vec<CorpusFile>> {
    let root = match (root_override, config.root.as_deref()) {
        (Some(r), _) | (None, Some(r)) => r,
        (None, None) => bail!("No corpus root: set corpus.root or pass --root"),
    };
    if !root.exists() {
        bail!("Corpus root does not exist: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;
    let mut excludes = vec!["**/.git/**".to_string()];
    excludes.extend(config.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root) {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }
        files.push(CorpusFile {
            path: path.to_path_buf(),
            relative: rel_str,
        });
    }

    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}

pub fn open_corpus(config: &CorpusConfig, root_override: Option<&Path>) -> Result<CorpusLoader> {
    let files = discover(config, root_override)?;
    Ok(CorpusLoader {
        discovered: files.len(),
        files: files.into_iter(),
        min_chars: config.min_chars,
        max_chars: config.max_chars,
        skipped_short: 0,
        unreadable: 0,
    })
}

fn file_to_document(path: &Path, relative: String, text: String, size_chars: usize) -> RawDocument {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let mut extra = BTreeMap::new();
    extra.insert("source_type".to_string(), "corpus".to_string());
    extra.insert("file_name".to_string(), file_name.clone());
    extra.insert("file_path".to_string(), path.display().to_string());
    extra.insert("size_chars".to_string(), size_chars.to_string());

    RawDocument {
        source_native_id: relative,
        text,
        metadata: RecordMetadata {
            doc_type: Some(classify_contract_type(&file_name).to_string()),
            source_url: Some(format!("file://{}", path.display())),
            extra,
            ..Default::default()
        },
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn long_text(topic: &str) -> String {
        format!("{} ", topic).repeat(30)
    }

    #[test]
    fn test_scan_filters_and_classifies() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("2019")).unwrap();
        fs::write(
            root.join("2019/employment_agreement.htm"),
            format!("<html><script>x()</script><p>{}</p></html>", long_text("salary")),
        )
        .unwrap();
        fs::write(root.join("lease.txt"), long_text("premises")).unwrap();
        fs::write(root.join("short.txt"), "too short").unwrap();
        fs::write(root.join("notes.md"), long_text("ignored")).unwrap();

        let config = CorpusConfig {
            root: Some(root.to_path_buf()),
            ..Default::default()
        };
        let mut loader = open_corpus(&config, None).unwrap();
        let docs: Vec<RawDocument> = loader.by_ref().collect();

        let ids: Vec<_> = docs.iter().map(|d| d.source_native_id.as_str()).collect();
        assert_eq!(ids, vec!["2019/employment_agreement.htm", "lease.txt"]);
        assert_eq!(loader.discovered(), 3);
        assert_eq!(loader.skipped_short(), 1);
        assert_eq!(docs[0].metadata.doc_type.as_deref(), Some("Employment"));
        assert_eq!(docs[1].metadata.doc_type.as_deref(), Some("Lease"));
        assert_eq!(
            docs[1].metadata.extra.get("file_name").map(String::as_str),
            Some("lease.txt")
        );
    }

    #[test]
    fn test_exclude_globs_apply() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("drafts")).unwrap();
        fs::write(tmp.path().join("drafts/a.txt"), long_text("draft")).unwrap();
        fs::write(tmp.path().join("b.txt"), long_text("final")).unwrap();

        let config = CorpusConfig {
            exclude_globs: vec!["drafts/**".into()],
            ..Default::default()
        };
        let files = discover(&config, Some(tmp.path())).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, "b.txt");
    }

    #[test]
    fn test_missing_root_errors() {
        let config = CorpusConfig::default();
        assert!(discover(&config, None).is_err());
        assert!(discover(&config, Some(Path::new("/nonexistent/corpus"))).is_err());
    }
}
