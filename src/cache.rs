use std::collections::HashMap;
use std::sync::Mutex;

use crate::glossary::Glossary;

/// Memoizes segment translations by content+glossary hash so that a worker
/// resuming an interrupted job re-translates nothing it already finished.
#[derive(Debug, Default)]
pub struct ResultCache {
    map: Mutex<HashMap<String, Vec<String>>>,
}

/// Deterministic key over the segment's original lines and the glossary
/// terms. The term map is ordered, so the same content always hashes the
/// same way; encoded lines must never be keyed, their identifiers change on
/// every encode.
pub fn segment_key(lines: &[String], glossary: &Glossary) -> String {
    let payload = serde_json::to_string(&(lines, &glossary.terms)).unwrap_or_default();
    format!("{:x}", md5::compute(payload))
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A stored entry only counts as a hit when its line count matches the
    /// request; anything else is treated as a miss.
    pub fn get(&self, key: &str, line_count: usize) -> Option<Vec<String>> {
        let map = self.map.lock().ok()?;
        map.get(key)
            .filter(|lines| lines.len() == line_count)
            .cloned()
    }

    pub fn save(&self, key: &str, lines: &[String]) {
        if let Ok(mut map) = self.map.lock() {
            map.insert(key.to_string(), lines.to_vec());
        }
    }
}
