//! Splits a chapter's paragraph list into model-sized segments.
//!
//! Blank lines and inline-image placeholders never reach the model: they are
//! held out before segmentation and re-inserted verbatim afterwards, so the
//! recovered output always has the same length as the input.

pub const IMAGE_PLACEHOLDER_PREFIX: &str = "<图片>";

/// Lines the generation backend should never see.
pub fn is_passthrough(line: &str) -> bool {
    line.trim().is_empty() || line.trim_start().starts_with(IMAGE_PLACEHOLDER_PREFIX)
}

#[derive(Debug, Clone)]
pub struct FilteredLines {
    kept: Vec<String>,
    held: Vec<(usize, String)>,
    total: usize,
}

pub fn filter(lines: &[String]) -> FilteredLines {
    let mut kept = Vec::with_capacity(lines.len());
    let mut held = Vec::new();
    for (index, line) in lines.iter().enumerate() {
        if is_passthrough(line) {
            held.push((index, line.clone()));
        } else {
            kept.push(line.clone());
        }
    }
    FilteredLines {
        kept,
        held,
        total: lines.len(),
    }
}

impl FilteredLines {
    pub fn kept(&self) -> &[String] {
        &self.kept
    }

    /// Rebuild the original sequence from the translated stream, putting each
    /// held-out line back at its original position. If the translated stream
    /// comes up short the untranslated original fills the gap, so the output
    /// length always equals the input length.
    pub fn recover(&self, translated: Vec<String>) -> Vec<String> {
        let mut held = self.held.iter().peekable();
        let mut translated = translated.into_iter();
        let mut kept = self.kept.iter();
        let mut output = Vec::with_capacity(self.total);
        for index in 0..self.total {
            if let Some((held_index, line)) = held.peek()
                && *held_index == index
            {
                output.push(line.clone());
                held.next();
                continue;
            }
            let original = kept.next();
            match translated.next() {
                Some(line) => output.push(line),
                None => output.push(original.cloned().unwrap_or_default()),
            }
        }
        output
    }
}

/// Greedy packing: segments never split a line, stay within `budget` total
/// characters, and a single line longer than the budget becomes its own
/// oversized segment.
pub fn split(lines: &[String], budget: usize) -> Vec<Vec<String>> {
    let mut segments = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_len = 0usize;
    for line in lines {
        let line_len = line.chars().count();
        if !current.is_empty() && current_len + line_len > budget {
            segments.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current_len += line_len;
        current.push(line.clone());
        if current_len >= budget {
            segments.push(std::mem::take(&mut current));
            current_len = 0;
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }
    segments
}
