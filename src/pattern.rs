//! Compilation of offensive words into evasion-tolerant matchers.
//!
//! A compiled word accepts look-alike substitutions, whitespace between
//! letters ("b a d"), and any letter case, but only as a whole word.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Result, WardenError};

/// Default look-alike families: alef forms, taa marbuta/haa, yaa/alef
/// maqsura, waw/waw-hamza, hamza/yaa-hamza.
pub const DEFAULT_LOOKALIKE_CLASSES: &[&str] = &["اأإآ", "ةه", "يى", "وؤ", "ءئ"];

/// Sets of characters treated as interchangeable when matching.
#[derive(Debug, Clone, Default)]
pub struct LookalikeClasses {
    classes: Vec<Vec<char>>,
    index: HashMap<char, usize>,
}

impl LookalikeClasses {
    /// Build from strings, each holding one family of characters.
    ///
    /// Members are lower-cased and de-duplicated. A character already
    /// claimed by an earlier family stays in that family.
    pub fn new<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut built = Self::default();
        for class in classes {
            let mut members: Vec<char> = Vec::new();
            for c in class.as_ref().chars().flat_map(char::to_lowercase) {
                if c.is_whitespace() || members.contains(&c) || built.index.contains_key(&c) {
                    continue;
                }
                members.push(c);
            }
            if members.len() < 2 {
                continue;
            }
            let slot = built.classes.len();
            for c in &members {
                built.index.insert(*c, slot);
            }
            built.classes.push(members);
        }
        built
    }

    /// The family a character belongs to, if any.
    pub fn class_of(&self, c: char) -> Option<&[char]> {
        self.index.get(&c).map(|slot| self.classes[*slot].as_slice())
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

/// A source word together with its compiled matcher.
#[derive(Debug, Clone)]
pub struct WordPattern {
    pub source: String,
    pub matcher: Regex,
}

impl WordPattern {
    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }
}

/// Turns raw words into [`WordPattern`]s.
#[derive(Debug, Clone)]
pub struct PatternCompiler {
    lookalikes: LookalikeClasses,
}

impl Default for PatternCompiler {
    fn default() -> Self {
        Self::new(LookalikeClasses::new(DEFAULT_LOOKALIKE_CLASSES.iter()))
    }
}

impl PatternCompiler {
    pub fn new(lookalikes: LookalikeClasses) -> Self {
        Self { lookalikes }
    }

    /// Trim and lower-case a word, rejecting one that ends up empty.
    pub fn normalize(word: &str) -> Result<String> {
        let normalized = word.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(WardenError::InvalidInput("word is empty".to_string()));
        }
        Ok(normalized)
    }

    /// Compile a word into a matcher.
    ///
    /// ```
    /// use warden::pattern::{LookalikeClasses, PatternCompiler};
    ///
    /// let compiler = PatternCompiler::new(LookalikeClasses::new(["o0"]));
    /// let pattern = compiler.compile("Noob").unwrap();
    ///
    /// assert!(pattern.is_match("what a n00b"));
    /// assert!(pattern.is_match("N o o B"));
    /// assert!(!pattern.is_match("noobish"));
    /// ```
    pub fn compile(&self, word: &str) -> Result<WordPattern> {
        let source = Self::normalize(word)?;
        let letters: Vec<char> = source.chars().filter(|c| !c.is_whitespace()).collect();

        let body = letters
            .iter()
            .map(|c| self.letter_pattern(*c))
            .collect::<Vec<_>>()
            .join(r"\s*");

        // \b only anchors next to a word character
        let lead = if letters.first().is_some_and(|c| is_word_char(*c)) {
            r"\b"
        } else {
            ""
        };
        let tail = if letters.last().is_some_and(|c| is_word_char(*c)) {
            r"\b"
        } else {
            ""
        };

        let matcher = Regex::new(&format!("(?i){lead}{body}{tail}"))?;
        Ok(WordPattern { source, matcher })
    }

    fn letter_pattern(&self, c: char) -> String {
        match self.lookalikes.class_of(c) {
            Some(members) => {
                let alternatives: String = members
                    .iter()
                    .map(|m| regex::escape(m.encode_utf8(&mut [0u8; 4])))
                    .collect();
                format!("[{alternatives}]")
            }
            None => regex::escape(c.encode_utf8(&mut [0u8; 4])),
        }
    }
}

/// Whether `c` counts as a word character for `\b`.
///
/// Asks the regex engine itself so substring checks and compiled patterns
/// agree on combining marks.
pub(crate) fn is_word_char(c: char) -> bool {
    static WORD: OnceLock<Option<Regex>> = OnceLock::new();
    match WORD.get_or_init(|| Regex::new(r"^\w$").ok()) {
        Some(word) => word.is_match(c.encode_utf8(&mut [0u8; 4])),
        None => c.is_alphanumeric() || c == '_',
    }
}
