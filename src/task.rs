use std::fmt;
use std::str::FromStr;

use anyhow::{Error, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Open upper bound used when a locator omits `end` ("translate everything").
pub const RANGE_OPEN_END: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRange {
    pub start: usize,
    pub end: usize,
}

impl Default for ChapterRange {
    fn default() -> Self {
        Self {
            start: 0,
            end: RANGE_OPEN_END,
        }
    }
}

impl ChapterRange {
    /// Clamp the half-open range to `items` and return the covered slice.
    pub fn slice<'a, T>(&self, items: &'a [T]) -> &'a [T] {
        let start = self.start.min(items.len());
        let end = self.end.min(items.len()).max(start);
        &items[start..end]
    }
}

/// A translation job's scope, parsed once at submission time. The canonical
/// locator form (`web/{provider}/{novel}?start=&end=`) is what operators
/// submit and what listings render back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranslateTask {
    Web {
        provider_id: String,
        novel_id: String,
        range: ChapterRange,
    },
    Wenku {
        novel_id: String,
        range: ChapterRange,
    },
}

impl TranslateTask {
    pub fn range(&self) -> ChapterRange {
        match self {
            TranslateTask::Web { range, .. } | TranslateTask::Wenku { range, .. } => *range,
        }
    }

    /// Provider/novel pair used against the chapter store. Library volumes
    /// live under the reserved "wenku" provider namespace.
    pub fn scope(&self) -> (&str, &str) {
        match self {
            TranslateTask::Web {
                provider_id,
                novel_id,
                ..
            } => (provider_id.as_str(), novel_id.as_str()),
            TranslateTask::Wenku { novel_id, .. } => ("wenku", novel_id.as_str()),
        }
    }
}

impl fmt::Display for TranslateTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranslateTask::Web {
                provider_id,
                novel_id,
                range,
            } => write!(
                f,
                "web/{}/{}?start={}&end={}",
                provider_id, novel_id, range.start, range.end
            ),
            TranslateTask::Wenku { novel_id, range } => write!(
                f,
                "wenku/{}?start={}&end={}",
                novel_id, range.start, range.end
            ),
        }
    }
}

impl FromStr for TranslateTask {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("task locator is empty"));
        }
        let (path, query) = match trimmed.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (trimmed, None),
        };
        let range = parse_range(query)?;

        let segments = path.split('/').collect::<Vec<_>>();
        match segments.as_slice() {
            ["web", provider_id, novel_id] => {
                if provider_id.is_empty() || novel_id.is_empty() {
                    return Err(anyhow!("task locator has empty path segment: '{}'", trimmed));
                }
                Ok(TranslateTask::Web {
                    provider_id: (*provider_id).to_string(),
                    novel_id: (*novel_id).to_string(),
                    range,
                })
            }
            ["wenku", novel_id] => {
                if novel_id.is_empty() {
                    return Err(anyhow!("task locator has empty path segment: '{}'", trimmed));
                }
                Ok(TranslateTask::Wenku {
                    novel_id: (*novel_id).to_string(),
                    range,
                })
            }
            _ => Err(anyhow!(
                "unknown task locator '{}' (expected web/{{provider}}/{{novel}} or wenku/{{novel}})",
                trimmed
            )),
        }
    }
}

fn parse_range(query: Option<&str>) -> Result<ChapterRange> {
    let mut range = ChapterRange::default();
    let Some(query) = query else {
        return Ok(range);
    };
    for pair in query.split('&').filter(|pair| !pair.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = value.trim();
        match key {
            "start" => {
                if !value.is_empty() {
                    range.start = value
                        .parse()
                        .map_err(|_| anyhow!("invalid start '{}' in task locator", value))?;
                }
            }
            "end" => {
                if !value.is_empty() {
                    range.end = value
                        .parse()
                        .map_err(|_| anyhow!("invalid end '{}' in task locator", value))?;
                }
            }
            _ => {}
        }
    }
    if range.end < range.start {
        return Err(anyhow!(
            "task range is inverted (start={}, end={})",
            range.start,
            range.end
        ));
    }
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_web_locator_with_range() {
        let task: TranslateTask = "web/kakuyomu/12345?start=3&end=10".parse().unwrap();
        assert_eq!(
            task,
            TranslateTask::Web {
                provider_id: "kakuyomu".to_string(),
                novel_id: "12345".to_string(),
                range: ChapterRange { start: 3, end: 10 },
            }
        );
        assert_eq!(task.scope(), ("kakuyomu", "12345"));
    }

    #[test]
    fn parses_wenku_locator_with_default_range() {
        let task: TranslateTask = "wenku/v42".parse().unwrap();
        assert_eq!(
            task,
            TranslateTask::Wenku {
                novel_id: "v42".to_string(),
                range: ChapterRange::default(),
            }
        );
        assert_eq!(task.range().end, RANGE_OPEN_END);
        assert_eq!(task.scope(), ("wenku", "v42"));
    }

    #[test]
    fn display_round_trips() {
        for locator in [
            "web/kakuyomu/12345?start=3&end=10",
            "wenku/v42?start=0&end=65536",
        ] {
            let task: TranslateTask = locator.parse().unwrap();
            assert_eq!(task.to_string(), locator);
            assert_eq!(task.to_string().parse::<TranslateTask>().unwrap(), task);
        }
    }

    #[test]
    fn rejects_malformed_locators() {
        for locator in [
            "",
            "web/only-provider",
            "web/a/b/c",
            "wenku/",
            "shelf/v42",
            "web/a/b?start=x",
            "web/a/b?start=9&end=3",
        ] {
            assert!(locator.parse::<TranslateTask>().is_err(), "{}", locator);
        }
    }

    #[test]
    fn range_slices_and_clamps() {
        let items = ["a", "b", "c", "d"];
        assert_eq!(ChapterRange { start: 1, end: 3 }.slice(&items), &["b", "c"]);
        assert_eq!(ChapterRange { start: 0, end: 99 }.slice(&items), &items);
        assert!(ChapterRange { start: 9, end: 99 }.slice(&items).is_empty());
    }
}
