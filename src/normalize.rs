//! Transcript normalization.
//!
//! Steps run in a fixed order: optional lower-casing, NFKC, the ordered
//! conversion table, optional allowlist enforcement, space collapsing, and
//! per-line trimming. A [`TextNormalizer`] is immutable once built and is
//! shared read-only across worker threads.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use unicode_normalization::UnicodeNormalization;

use crate::data::{Record, RecordSet};

/// Ordered literal substitutions. Later entries see the output of earlier ones.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionTable {
    entries: Vec<(Cow<'static, str>, Cow<'static, str>)>,
}

/// Danish-targeted default table. Spoken-word expansions are padded with
/// spaces; runs of spaces are collapsed afterwards.
const DANISH_CONVERSIONS: [(&str, &str); 34] = [
    ("aa", "å"),
    ("ğ", "g"),
    ("ñ", "n"),
    ("ń", "n"),
    ("è", "e"),
    ("kg", " kilo "),
    ("μg", " mikrogram "),
    ("-", " minus "),
    ("+", " plus "),
    ("μ", " mikro "),
    ("§", " paragraf "),
    ("%", " procent "),
    ("‰", " promille "),
    ("ú", "u"),
    ("ş", "s"),
    ("ê", "e"),
    ("ã", "a"),
    ("ë", "e"),
    ("ć", "c"),
    ("ä", "æ"),
    ("í", "i"),
    ("š", "s"),
    ("î", "i"),
    ("ě", "e"),
    ("ð", "d"),
    ("á", "a"),
    ("ó", "o"),
    ("þ", "th"),
    ("ı", "i"),
    ("ö", "ø"),
    ("ç", "c"),
    ("ș", "s"),
    ("\u{0301}", " "),
    ("\u{200b}", " "),
];

impl ConversionTable {
    /// Table from ordered `(pattern, replacement)` pairs; empty patterns are skipped.
    pub fn new<P, R>(entries: impl IntoIterator<Item = (P, R)>) -> Self
    where
        P: Into<Cow<'static, str>>,
        R: Into<Cow<'static, str>>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(pattern, replacement)| (pattern.into(), replacement.into()))
                .filter(|(pattern, _)| !pattern.is_empty())
                .collect(),
        }
    }

    /// Table with no substitutions.
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Danish default table.
    pub fn danish() -> Self {
        Self::new(DANISH_CONVERSIONS)
    }

    /// Number of substitutions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True with no substitutions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in application order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(pattern, replacement)| (pattern.as_ref(), replacement.as_ref()))
    }

    /// Apply every substitution in declaration order.
    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for (pattern, replacement) in &self.entries {
            if current.contains(pattern.as_ref()) {
                current = current.replace(pattern.as_ref(), replacement);
            }
        }
        current
    }
}

impl Default for ConversionTable {
    fn default() -> Self {
        Self::danish()
    }
}

/// Options controlling one normalizer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NormalizeOptions {
    /// Lower-case before substitution.
    pub lower_case: bool,
    /// Characters kept by allowlist enforcement; `None` keeps everything.
    pub characters_to_keep: Option<String>,
}

/// Deterministic transcript normalizer.
#[derive(Clone, Debug)]
pub struct TextNormalizer {
    table: ConversionTable,
    lower_case: bool,
    allowed: Option<HashSet<char>>,
}

impl TextNormalizer {
    /// Normalizer over `table`; the allowlist always admits space and `|`.
    pub fn new(table: ConversionTable, options: NormalizeOptions) -> Self {
        let allowed = options.characters_to_keep.map(|keep| {
            let mut allowed: HashSet<char> = if options.lower_case {
                keep.chars().flat_map(char::to_lowercase).collect()
            } else {
                keep.chars()
                    .flat_map(char::to_uppercase)
                    .chain(keep.chars().flat_map(char::to_lowercase))
                    .collect()
            };
            allowed.insert(' ');
            allowed.insert('|');
            allowed
        });
        Self {
            table,
            lower_case: options.lower_case,
            allowed,
        }
    }

    /// Substitution table in use.
    pub fn table(&self) -> &ConversionTable {
        &self.table
    }

    /// Run the full normalization on one transcript.
    pub fn normalize(&self, text: &str) -> String {
        let mut doc = if self.lower_case {
            text.to_lowercase()
        } else {
            text.to_string()
        };

        // Folds glyph variants such as the full-width dash onto ASCII.
        doc = doc.nfkc().collect();
        doc = self.table.apply(&doc);

        if let Some(allowed) = &self.allowed {
            doc = doc
                .trim()
                .chars()
                .map(|ch| if allowed.contains(&ch) { ch } else { ' ' })
                .collect();
        }

        doc = collapse_spaces(&doc);
        doc.split('\n')
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n")
            .trim_matches('\n')
            .to_string()
    }

    /// Normalize the text field of one record.
    pub fn apply(&self, mut record: Record) -> Record {
        record.text = self.normalize(&record.text);
        record
    }
}

/// Collapse runs of the space character (only) into one.
pub fn collapse_spaces(text: &str) -> String {
    let mut collapsed = String::with_capacity(text.len());
    let mut previous_space = false;
    for ch in text.chars() {
        if ch == ' ' {
            if !previous_space {
                collapsed.push(ch);
            }
            previous_space = true;
        } else {
            collapsed.push(ch);
            previous_space = false;
        }
    }
    collapsed
}

/// Normalize transcripts across a record set.
///
/// The normalizer is captured read-only; tables are processed in parallel.
pub fn normalize_records(records: RecordSet, normalizer: Arc<TextNormalizer>) -> RecordSet {
    records.map_infallible(move |record| normalizer.apply(record))
}
