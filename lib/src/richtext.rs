// Copyright 2025 The Antler Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![expect(missing_docs)]

//! Rich text bodies and their paragraph- or character-granular edits.

use serde::Deserialize;
use serde::Serialize;

/// A rich text body: an ordered list of paragraphs.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RichText {
    #[serde(rename = "p")]
    paragraphs: Vec<String>,
}

/// One splice against a [`RichText`] body.
///
/// Edits touching a single paragraph are recorded at character granularity;
/// everything else splices whole paragraphs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "g")]
pub enum RichTextChange {
    /// Replace `remove` paragraphs starting at `at` with `insert`.
    #[serde(rename = "par")]
    Paragraphs {
        at: usize,
        remove: usize,
        insert: Vec<String>,
    },
    /// Replace `remove` characters starting at char offset `at` within
    /// paragraph `par` with `insert`.
    #[serde(rename = "chr")]
    Characters {
        par: usize,
        at: usize,
        remove: usize,
        insert: String,
    },
}

impl RichText {
    pub fn new(paragraphs: Vec<String>) -> Self {
        Self { paragraphs }
    }

    /// Splits `text` into paragraphs on newlines.
    pub fn from_plain_text(text: &str) -> Self {
        Self {
            paragraphs: text.split('\n').map(str::to_owned).collect(),
        }
    }

    pub fn to_plain_text(&self) -> String {
        self.paragraphs.join("\n")
    }

    pub fn paragraphs(&self) -> &[String] {
        &self.paragraphs
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs.iter().all(|p| p.is_empty())
    }

    /// Computes the changes that turn `self` into `other`.
    ///
    /// Single-paragraph bodies diff at character granularity, so typing into
    /// a short note produces a few-byte edit rather than a paragraph copy.
    pub fn diff(&self, other: &Self) -> Vec<RichTextChange> {
        if self == other {
            return vec![];
        }
        if self.paragraphs.len() == 1 && other.paragraphs.len() == 1 {
            return char_diff(&self.paragraphs[0], &other.paragraphs[0])
                .map(|(at, remove, insert)| {
                    vec![RichTextChange::Characters {
                        par: 0,
                        at,
                        remove,
                        insert,
                    }]
                })
                .unwrap_or_default();
        }
        let (at, remove, insert) = splice(&self.paragraphs, &other.paragraphs);
        vec![RichTextChange::Paragraphs { at, remove, insert }]
    }

    /// Applies `changes` in order. Offsets are clamped to the current bounds;
    /// a stale offset produces a body whose checksum will not match the
    /// edit's recorded destination, which the caller treats as corruption.
    pub fn patch(&mut self, changes: &[RichTextChange]) {
        for change in changes {
            match change {
                RichTextChange::Paragraphs { at, remove, insert } => {
                    let at = (*at).min(self.paragraphs.len());
                    let end = at.saturating_add(*remove).min(self.paragraphs.len());
                    self.paragraphs.splice(at..end, insert.iter().cloned());
                }
                RichTextChange::Characters {
                    par,
                    at,
                    remove,
                    insert,
                } => {
                    if *par >= self.paragraphs.len() {
                        continue;
                    }
                    let chars: Vec<char> = self.paragraphs[*par].chars().collect();
                    let at = (*at).min(chars.len());
                    let end = at.saturating_add(*remove).min(chars.len());
                    let mut out: String = chars[..at].iter().collect();
                    out.push_str(insert);
                    out.extend(&chars[end..]);
                    self.paragraphs[*par] = out;
                }
            }
        }
    }
}

/// Minimal splice turning `a` into `b`: trim the common prefix and suffix,
/// replace the middle.
fn splice<T: PartialEq + Clone>(a: &[T], b: &[T]) -> (usize, usize, Vec<T>) {
    let prefix = a
        .iter()
        .zip(b.iter())
        .take_while(|(x, y)| x == y)
        .count();
    let max_suffix = a.len().min(b.len()) - prefix;
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take(max_suffix)
        .take_while(|(x, y)| x == y)
        .count();
    let insert = b[prefix..b.len() - suffix].to_vec();
    (prefix, a.len() - suffix - prefix, insert)
}

fn char_diff(a: &str, b: &str) -> Option<(usize, usize, String)> {
    if a == b {
        return None;
    }
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (at, remove, insert) = splice(&a, &b);
    Some((at, remove, insert.into_iter().collect()))
}
