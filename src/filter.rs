//! Offensive-word content filtering.
//!
//! Holds the current word list and its compiled patterns as an immutable
//! snapshot. Writers build a new snapshot and swap it in, so a reader
//! always sees a complete list.

use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::error::{ErrorContext, Result, WardenError};
use crate::pattern::{is_word_char, PatternCompiler, WordPattern};

/// Replacement text for redacted matches.
pub const REDACTION_PLACEHOLDER: &str = "***";

/// Durable home of the word list.
pub trait WordStore: Send + Sync {
    /// Read every stored word.
    fn load(&self) -> Result<Vec<String>>;
    /// Record one newly added word.
    fn append(&self, word: &str) -> Result<()>;
    /// Replace the stored list after a removal.
    fn rewrite(&self, words: &[String]) -> Result<()>;
}

/// Plain-text word list, one word per line, `#` starts a comment line.
#[derive(Debug, Clone)]
pub struct FileWordStore {
    path: PathBuf,
}

impl FileWordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_parent(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    WardenError::Io(format!("Failed to create word list directory: {}", e))
                })?;
            }
        }
        Ok(())
    }
}

impl WordStore for FileWordStore {
    fn load(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            tracing::warn!(path = %self.path.display(), "Word list file not found");
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path)
            .map_err(|e| WardenError::Io(format!("Failed to read word list: {}", e)))?;

        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    fn append(&self, word: &str) -> Result<()> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WardenError::Io(format!("Failed to open word list: {}", e)))?;

        // Lists edited by hand often lack the final newline
        let unterminated = if file
            .metadata()
            .map_err(|e| WardenError::Io(format!("Failed to stat word list: {}", e)))?
            .len()
            > 0
        {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))
                .and_then(|_| file.read_exact(&mut last))
                .map_err(|e| WardenError::Io(format!("Failed to read word list: {}", e)))?;
            last[0] != b'\n'
        } else {
            false
        };

        let line = if unterminated {
            format!("\n{}\n", word)
        } else {
            format!("{}\n", word)
        };
        file.write_all(line.as_bytes())
            .map_err(|e| WardenError::Io(format!("Failed to append to word list: {}", e)))
    }

    fn rewrite(&self, words: &[String]) -> Result<()> {
        self.ensure_parent()?;
        let mut content = words.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(&self.path, content)
            .map_err(|e| WardenError::Io(format!("Failed to rewrite word list: {}", e)))
    }
}

/// Result of [`ContentFilter::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyExists,
}

/// Result of [`ContentFilter::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}

/// One published state of the word list.
#[derive(Default)]
struct WordSnapshot {
    words: BTreeSet<String>,
    patterns: Vec<WordPattern>,
}

/// Runtime-editable offensive-word filter.
pub struct ContentFilter {
    compiler: PatternCompiler,
    snapshot: RwLock<Arc<WordSnapshot>>,
    /// Serialises writers; readers never take it.
    write_lock: Mutex<()>,
    store: Option<Arc<dyn WordStore>>,
}

impl ContentFilter {
    /// Create an empty filter with no durable store.
    pub fn new(compiler: PatternCompiler) -> Self {
        Self {
            compiler,
            snapshot: RwLock::new(Arc::new(WordSnapshot::default())),
            write_lock: Mutex::new(()),
            store: None,
        }
    }

    /// Create a filter seeded from `store`; later edits are written back to it.
    ///
    /// Lines that do not compile are skipped with a warning.
    pub fn with_store(compiler: PatternCompiler, store: Arc<dyn WordStore>) -> Result<Self> {
        let words = store.load()?;
        let mut filter = Self::new(compiler);
        filter.seed(words);
        filter.store = Some(store);
        tracing::info!(count = filter.count(), "Offensive word list loaded");
        Ok(filter)
    }

    /// Create a filter from an in-memory list.
    pub fn from_words<I, S>(compiler: PatternCompiler, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::new(compiler);
        filter.seed(words);
        filter
    }

    fn seed<I, S>(&mut self, words: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut snapshot = WordSnapshot::default();
        for word in words {
            match self.compiler.compile(word.as_ref()) {
                Ok(pattern) => {
                    if snapshot.words.insert(pattern.source.clone()) {
                        snapshot.patterns.push(pattern);
                    }
                }
                Err(e) => {
                    tracing::warn!(word = %word.as_ref(), error = %e, "Skipping unusable word");
                }
            }
        }
        self.snapshot = RwLock::new(Arc::new(snapshot));
    }

    fn current(&self) -> Arc<WordSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish(&self, next: WordSnapshot) {
        let mut slot = self.snapshot.write().unwrap_or_else(PoisonError::into_inner);
        *slot = Arc::new(next);
    }

    /// Add a word. Takes effect for every query that starts afterwards.
    pub fn add(&self, word: &str) -> Result<AddOutcome> {
        let normalized = PatternCompiler::normalize(word)?;
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current();
        if current.words.contains(&normalized) {
            return Ok(AddOutcome::AlreadyExists);
        }

        let pattern = self.compiler.compile(&normalized)?;
        let mut words = current.words.clone();
        words.insert(normalized.clone());
        let mut patterns = current.patterns.clone();
        patterns.push(pattern);
        self.publish(WordSnapshot { words, patterns });

        if let Some(store) = &self.store {
            if let Err(e) = store.append(&normalized) {
                e.log_with_context(&ErrorContext::new("wordlist_append"));
            }
        }

        tracing::info!(word = %normalized, "Offensive word added");
        Ok(AddOutcome::Added)
    }

    /// Remove a word and the pattern compiled from it.
    pub fn remove(&self, word: &str) -> Result<RemoveOutcome> {
        let normalized = PatternCompiler::normalize(word)?;
        let _writer = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.current();
        if !current.words.contains(&normalized) {
            return Ok(RemoveOutcome::NotFound);
        }

        let mut words = current.words.clone();
        words.remove(&normalized);
        let patterns = current
            .patterns
            .iter()
            .filter(|p| p.source != normalized)
            .cloned()
            .collect();
        let remaining: Vec<String> = words.iter().cloned().collect();
        self.publish(WordSnapshot { words, patterns });

        if let Some(store) = &self.store {
            if let Err(e) = store.rewrite(&remaining) {
                e.log_with_context(&ErrorContext::new("wordlist_rewrite"));
            }
        }

        tracing::info!(word = %normalized, "Offensive word removed");
        Ok(RemoveOutcome::Removed)
    }

    /// Whether `text` contains any listed word.
    pub fn contains(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }

    /// The first listed word found in `text`.
    ///
    /// Exact whole-word occurrences are checked before the tolerant patterns.
    pub fn first_match(&self, text: &str) -> Option<String> {
        if text.is_empty() {
            return None;
        }
        let snapshot = self.current();

        let lowered = text.to_lowercase();
        if let Some(word) = snapshot
            .words
            .iter()
            .find(|word| contains_whole_word(&lowered, word))
        {
            tracing::debug!(word = %word, "Offensive word found by exact match");
            return Some(word.clone());
        }

        snapshot
            .patterns
            .iter()
            .find(|pattern| pattern.is_match(text))
            .map(|pattern| {
                tracing::debug!(word = %pattern.source, "Offensive word found by pattern");
                pattern.source.clone()
            })
    }

    /// Replace every match with [`REDACTION_PLACEHOLDER`].
    pub fn redact(&self, text: &str) -> String {
        let snapshot = self.current();
        let mut redacted = text.to_string();
        for pattern in &snapshot.patterns {
            if pattern.is_match(&redacted) {
                redacted = pattern
                    .matcher
                    .replace_all(&redacted, REDACTION_PLACEHOLDER)
                    .into_owned();
            }
        }
        redacted
    }

    /// Listed words in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.current().words.iter().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.current().words.len()
    }
}

/// Substring search that only accepts occurrences standing as whole words.
fn contains_whole_word(haystack: &str, needle: &str) -> bool {
    let needs_lead = needle.chars().next().is_some_and(is_word_char);
    let needs_tail = needle.chars().next_back().is_some_and(is_word_char);

    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let lead_ok = !needs_lead
            || !haystack[..start]
                .chars()
                .next_back()
                .is_some_and(is_word_char);
        let tail_ok = !needs_tail || !haystack[end..].chars().next().is_some_and(is_word_char);
        lead_ok && tail_ok
    })
}


#[cfg(test)]
mod property_tests {
    use proptest::prelude::*;

    use crate::filter::ContentFilter;
    use crate::pattern::{LookalikeClasses, PatternCompiler};

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Added words are found immediately, without a restart.
        #[test]
        fn prop_runtime_additions_take_effect(
            word in "[a-z]{3,10}",
            filler in "[0-9 ]{0,20}",
        ) {
            let filter = ContentFilter::new(PatternCompiler::new(LookalikeClasses::default()));
            let text = format!("{} {}", filler, word);
            prop_assert!(!filter.contains(&text));

            filter.add(&word).expect("add");
            prop_assert!(filter.contains(&text));

            filter.remove(&word).expect("remove");
            prop_assert!(!filter.contains(&text));
        }

        /// Redacted text no longer contains any listed word.
        #[test]
        fn prop_redaction_removes_matches(
            word in "[a-z]{3,8}",
            words in prop::collection::vec("[0-9]{1,4}", 0..5),
        ) {
            let filter = ContentFilter::from_words(
                PatternCompiler::new(LookalikeClasses::default()),
                [word.clone()],
            );
            let mut parts = words.clone();
            parts.push(word.clone());
            let text = parts.join(" ");
            let redacted = filter.redact(&text);
            prop_assert!(!filter.contains(&redacted));
        }
    }
}
