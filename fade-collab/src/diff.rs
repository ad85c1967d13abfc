//! Content diffing for text documents.
//!
//! Picks the cheapest representation of a change between two versions of a
//! file and rebuilds the new version on the receiving side.
//!
//! ```text
//!   old, new ──► compute_diff ──► DiffEnvelope ──► wire ──► apply_diff(old) ──► new
//!                    │
//!                    ├─ either side empty      → Full
//!                    ├─ new < 500 bytes        → Full
//!                    ├─ identical              → None
//!                    ├─ line diff too large    → Full
//!                    ├─ single short line edit → CharDiff (if smaller)
//!                    └─ otherwise              → LineDiff
//! ```
//!
//! The line differ is a greedy walk with a bounded lookahead, not an optimal
//! LCS. It always round-trips but may emit more operations than necessary
//! for heavily reordered input; the size check then falls back to full
//! content.
//!
//! Line operations carry positions in the coordinates of the old content and
//! are applied in descending position order, so earlier indices stay valid.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::DiffConfig;

/// How a change is represented on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    None,
    Full,
    LineDiff,
    CharDiff,
    Crdt,
}

/// One line-level edit, positioned in old-content coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum LineOp {
    Insert { position: usize, lines: Vec<String> },
    Delete { position: usize, count: usize },
    Replace {
        position: usize,
        old_line: String,
        new_line: String,
    },
}

impl LineOp {
    pub fn position(&self) -> usize {
        match self {
            Self::Insert { position, .. }
            | Self::Delete { position, .. }
            | Self::Replace { position, .. } => *position,
        }
    }
}

/// One character-level edit, positioned in old-line char indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CharOp {
    Insert { position: usize, ch: char },
    Delete { position: usize },
    Replace { position: usize, ch: char },
}

/// Character edits confined to a single line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharEdit {
    pub line: usize,
    pub ops: Vec<CharOp>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffPayload {
    Empty,
    Content(String),
    Lines(Vec<LineOp>),
    Chars(CharEdit),
    Update(Vec<u8>),
}

/// A change in wire form. `size` is the serialized payload size in bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffEnvelope {
    pub kind: DiffKind,
    pub payload: DiffPayload,
    pub size: usize,
}

impl DiffEnvelope {
    pub fn none() -> Self {
        Self {
            kind: DiffKind::None,
            payload: DiffPayload::Empty,
            size: 0,
        }
    }

    pub fn full(content: &str) -> Self {
        Self {
            kind: DiffKind::Full,
            payload: DiffPayload::Content(content.to_owned()),
            size: content.len(),
        }
    }

    pub fn crdt(update: Vec<u8>) -> Self {
        Self {
            kind: DiffKind::Crdt,
            size: update.len(),
            payload: DiffPayload::Update(update),
        }
    }

    pub fn is_full(&self) -> bool {
        self.kind == DiffKind::Full
    }

    /// Whether the kind tag agrees with the payload variant.
    pub fn is_well_formed(&self) -> bool {
        matches!(
            (self.kind, &self.payload),
            (DiffKind::None, DiffPayload::Empty)
                | (DiffKind::Full, DiffPayload::Content(_))
                | (DiffKind::LineDiff, DiffPayload::Lines(_))
                | (DiffKind::CharDiff, DiffPayload::Chars(_))
                | (DiffKind::Crdt, DiffPayload::Update(_))
        )
    }
}

/// Errors from applying a diff.
#[derive(Debug, Clone, PartialEq)]
pub enum DiffError {
    /// Kind tag and payload disagree.
    KindMismatch(DiffKind),
    /// This kind is applied by a strategy, not the text differ.
    Unsupported(DiffKind),
    LineOutOfRange { position: usize, lines: usize },
    /// A replace targeted a line whose content differs from the expected one.
    LineMismatch { position: usize },
    CharOutOfRange { position: usize, len: usize },
}

impl std::fmt::Display for DiffError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KindMismatch(kind) => write!(f, "Payload does not match diff kind {kind:?}"),
            Self::Unsupported(kind) => write!(f, "Diff kind {kind:?} cannot be applied as text"),
            Self::LineOutOfRange { position, lines } => {
                write!(f, "Line {position} out of range ({lines} lines)")
            }
            Self::LineMismatch { position } => {
                write!(f, "Line {position} does not match the expected content")
            }
            Self::CharOutOfRange { position, len } => {
                write!(f, "Char {position} out of range (line length {len})")
            }
        }
    }
}

impl std::error::Error for DiffError {}

// ─── Computing ───────────────────────────────────────────────────────────────

/// Diff with default thresholds.
pub fn compute_diff(old: &str, new: &str) -> DiffEnvelope {
    compute_diff_with(old, new, &DiffConfig::default())
}

pub fn compute_diff_with(old: &str, new: &str, config: &DiffConfig) -> DiffEnvelope {
    if old.is_empty() || new.is_empty() {
        return DiffEnvelope::full(new);
    }
    if new.len() < config.full_threshold {
        return DiffEnvelope::full(new);
    }
    if old == new {
        return DiffEnvelope::none();
    }

    let ops = diff_lines(old, new, config.lookahead);
    let size = serialized_size(&ops);
    if size > new.len() || size > config.max_diff_size {
        return DiffEnvelope::full(new);
    }

    if let Some(edit) = char_refinement(&ops, config) {
        let char_size = serialized_size(&edit);
        if char_size < size {
            return DiffEnvelope {
                kind: DiffKind::CharDiff,
                payload: DiffPayload::Chars(edit),
                size: char_size,
            };
        }
    }

    DiffEnvelope {
        kind: DiffKind::LineDiff,
        payload: DiffPayload::Lines(ops),
        size,
    }
}

fn serialized_size<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(usize::MAX)
}

/// Greedy line diff. Positions in the result are strictly increasing.
pub fn diff_lines(old: &str, new: &str, lookahead: usize) -> Vec<LineOp> {
    let old_lines: Vec<&str> = old.split('\n').collect();
    let new_lines: Vec<&str> = new.split('\n').collect();
    let mut ops = Vec::new();
    let (mut i, mut j) = (0, 0);

    while i < old_lines.len() || j < new_lines.len() {
        if i < old_lines.len() && j < new_lines.len() && old_lines[i] == new_lines[j] {
            i += 1;
            j += 1;
            continue;
        }

        if i >= old_lines.len() {
            ops.push(LineOp::Insert {
                position: i,
                lines: to_owned_lines(&new_lines[j..]),
            });
            j = new_lines.len();
            continue;
        }

        if j >= new_lines.len() {
            ops.push(LineOp::Delete {
                position: i,
                count: old_lines.len() - i,
            });
            i = old_lines.len();
            continue;
        }

        let found_in_old = find_line(&old_lines, i, new_lines[j], lookahead);
        let found_in_new = find_line(&new_lines, j, old_lines[i], lookahead);

        match (found_in_old, found_in_new) {
            (Some(o), Some(n)) if o - i <= n - j => {
                ops.push(LineOp::Delete {
                    position: i,
                    count: o - i,
                });
                i = o;
            }
            (Some(o), None) => {
                ops.push(LineOp::Delete {
                    position: i,
                    count: o - i,
                });
                i = o;
            }
            (_, Some(n)) => {
                ops.push(LineOp::Insert {
                    position: i,
                    lines: to_owned_lines(&new_lines[j..n]),
                });
                j = n;
            }
            (None, None) => {
                ops.push(LineOp::Replace {
                    position: i,
                    old_line: old_lines[i].to_owned(),
                    new_line: new_lines[j].to_owned(),
                });
                i += 1;
                j += 1;
            }
        }
    }

    ops
}

fn find_line(lines: &[&str], start: usize, needle: &str, lookahead: usize) -> Option<usize> {
    let end = lines.len().min(start.saturating_add(lookahead));
    (start..end).find(|&k| lines[k] == needle)
}

fn to_owned_lines(lines: &[&str]) -> Vec<String> {
    lines.iter().map(|l| (*l).to_owned()).collect()
}

fn char_refinement(ops: &[LineOp], config: &DiffConfig) -> Option<CharEdit> {
    let [LineOp::Replace {
        position,
        old_line,
        new_line,
    }] = ops
    else {
        return None;
    };
    if old_line.chars().count() > config.char_diff_max_line
        || new_line.chars().count() > config.char_diff_max_line
    {
        return None;
    }
    Some(CharEdit {
        line: *position,
        ops: diff_chars(old_line, new_line),
    })
}

/// Levenshtein edit script from `old` to `new`, in ascending position order.
pub fn diff_chars(old: &str, new: &str) -> Vec<CharOp> {
    let a: Vec<char> = old.chars().collect();
    let b: Vec<char> = new.chars().collect();
    let (m, n) = (a.len(), b.len());
    let width = n + 1;
    let mut dist = vec![0usize; (m + 1) * width];

    for i in 0..=m {
        dist[i * width] = i;
    }
    for j in 0..=n {
        dist[j] = j;
    }
    for i in 1..=m {
        for j in 1..=n {
            dist[i * width + j] = if a[i - 1] == b[j - 1] {
                dist[(i - 1) * width + j - 1]
            } else {
                1 + dist[(i - 1) * width + j]
                    .min(dist[i * width + j - 1])
                    .min(dist[(i - 1) * width + j - 1])
            };
        }
    }

    let mut ops = Vec::new();
    let (mut i, mut j) = (m, n);
    while i > 0 || j > 0 {
        let here = dist[i * width + j];
        if i > 0 && j > 0 && a[i - 1] == b[j - 1] {
            i -= 1;
            j -= 1;
        } else if i > 0 && (j == 0 || here == dist[(i - 1) * width + j] + 1) {
            ops.push(CharOp::Delete { position: i - 1 });
            i -= 1;
        } else if j > 0 && (i == 0 || here == dist[i * width + j - 1] + 1) {
            ops.push(CharOp::Insert {
                position: i,
                ch: b[j - 1],
            });
            j -= 1;
        } else {
            ops.push(CharOp::Replace {
                position: i - 1,
                ch: b[j - 1],
            });
            i -= 1;
            j -= 1;
        }
    }

    ops.reverse();
    ops
}

// ─── Applying ────────────────────────────────────────────────────────────────

/// Rebuild the new content from `old` and an envelope.
///
/// Fails closed: nothing is partially applied on error.
pub fn apply_diff(old: &str, envelope: &DiffEnvelope) -> Result<String, DiffError> {
    match (envelope.kind, &envelope.payload) {
        (DiffKind::None, DiffPayload::Empty) => Ok(old.to_owned()),
        (DiffKind::Full, DiffPayload::Content(content)) => Ok(content.clone()),
        (DiffKind::LineDiff, DiffPayload::Lines(ops)) => apply_line_ops(old, ops),
        (DiffKind::CharDiff, DiffPayload::Chars(edit)) => apply_char_edit(old, edit),
        (DiffKind::Crdt, DiffPayload::Update(_)) => Err(DiffError::Unsupported(DiffKind::Crdt)),
        (kind, _) => Err(DiffError::KindMismatch(kind)),
    }
}

fn apply_line_ops(old: &str, ops: &[LineOp]) -> Result<String, DiffError> {
    let mut lines: Vec<String> = old.split('\n').map(str::to_owned).collect();
    let mut ordered: Vec<&LineOp> = ops.iter().collect();
    ordered.sort_by(|a, b| b.position().cmp(&a.position()));

    for op in ordered {
        match op {
            LineOp::Insert {
                position,
                lines: inserted,
            } => {
                if *position > lines.len() {
                    return Err(DiffError::LineOutOfRange {
                        position: *position,
                        lines: lines.len(),
                    });
                }
                lines.splice(*position..*position, inserted.iter().cloned());
            }
            LineOp::Delete { position, count } => {
                let end = position.saturating_add(*count);
                if end > lines.len() {
                    return Err(DiffError::LineOutOfRange {
                        position: end,
                        lines: lines.len(),
                    });
                }
                lines.drain(*position..end);
            }
            LineOp::Replace {
                position,
                old_line,
                new_line,
            } => {
                let total = lines.len();
                let slot = lines.get_mut(*position).ok_or(DiffError::LineOutOfRange {
                    position: *position,
                    lines: total,
                })?;
                if *slot != *old_line {
                    return Err(DiffError::LineMismatch {
                        position: *position,
                    });
                }
                *slot = new_line.clone();
            }
        }
    }

    Ok(lines.join("\n"))
}

fn apply_char_edit(old: &str, edit: &CharEdit) -> Result<String, DiffError> {
    let mut lines: Vec<String> = old.split('\n').map(str::to_owned).collect();
    let total = lines.len();
    let line = lines.get_mut(edit.line).ok_or(DiffError::LineOutOfRange {
        position: edit.line,
        lines: total,
    })?;
    *line = apply_char_ops(line, &edit.ops)?;
    Ok(lines.join("\n"))
}

/// Apply an ascending edit script to a single line.
pub fn apply_char_ops(line: &str, ops: &[CharOp]) -> Result<String, DiffError> {
    let chars: Vec<char> = line.chars().collect();
    let len = chars.len();
    let mut out = String::with_capacity(line.len());
    let mut cursor = 0;

    let out_of_range = |position| DiffError::CharOutOfRange { position, len };

    for op in ops {
        match *op {
            CharOp::Insert { position, ch } => {
                if position < cursor || position > len {
                    return Err(out_of_range(position));
                }
                out.extend(&chars[cursor..position]);
                out.push(ch);
                cursor = position;
            }
            CharOp::Delete { position } => {
                if position < cursor || position >= len {
                    return Err(out_of_range(position));
                }
                out.extend(&chars[cursor..position]);
                cursor = position + 1;
            }
            CharOp::Replace { position, ch } => {
                if position < cursor || position >= len {
                    return Err(out_of_range(position));
                }
                out.extend(&chars[cursor..position]);
                out.push(ch);
                cursor = position + 1;
            }
        }
    }
    out.extend(&chars[cursor..]);
    Ok(out)
}

// ─── Hashing & stats ─────────────────────────────────────────────────────────

/// SHA-256 of the content, lowercase hex.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiffStats {
    pub insertions: usize,
    pub deletions: usize,
    pub replacements: usize,
    pub size: usize,
}

/// Count the edits an envelope carries. Line counts for line diffs, char
/// counts for char diffs.
pub fn diff_stats(envelope: &DiffEnvelope) -> DiffStats {
    let mut stats = DiffStats {
        size: envelope.size,
        ..DiffStats::default()
    };
    match &envelope.payload {
        DiffPayload::Lines(ops) => {
            for op in ops {
                match op {
                    LineOp::Insert { lines, .. } => stats.insertions += lines.len(),
                    LineOp::Delete { count, .. } => stats.deletions += count,
                    LineOp::Replace { .. } => stats.replacements += 1,
                }
            }
        }
        DiffPayload::Chars(edit) => {
            for op in &edit.ops {
                match op {
                    CharOp::Insert { .. } => stats.insertions += 1,
                    CharOp::Delete { .. } => stats.deletions += 1,
                    CharOp::Replace { .. } => stats.replacements += 1,
                }
            }
        }
        DiffPayload::Empty | DiffPayload::Content(_) | DiffPayload::Update(_) => {}
    }
    stats
}
