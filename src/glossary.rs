use std::collections::{BTreeMap, HashSet};
use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protected vocabulary for one novel. The uuid is a version stamp: a stored
/// chapter translation is expired when its stamp no longer matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Glossary {
    pub uuid: String,
    pub terms: BTreeMap<String, String>,
}

impl Glossary {
    pub fn new(terms: BTreeMap<String, String>) -> Self {
        Self {
            uuid: Uuid::new_v4().to_string(),
            terms,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

/// Swaps protected terms for opaque identifiers around a translation call so
/// the model can neither mistranslate nor drop them. Identifiers are short
/// random letter runs containing a doubled letter, which real prose is
/// unlikely to contain.
pub struct GlossaryCodec {
    entries: Vec<CodecEntry>,
}

struct CodecEntry {
    source: String,
    target: String,
    token: String,
}

impl GlossaryCodec {
    pub fn new(glossary: &Glossary) -> Self {
        let mut rng = rand::thread_rng();
        let mut used: HashSet<String> = HashSet::new();
        let mut entries = glossary
            .terms
            .iter()
            .map(|(source, target)| CodecEntry {
                source: source.clone(),
                target: target.clone(),
                token: fresh_token(&mut rng, &mut used, glossary),
            })
            .collect::<Vec<_>>();
        // Longer sources substitute first so a term embedded in a longer term
        // cannot shadow it.
        entries.sort_by(|a, b| {
            b.source
                .chars()
                .count()
                .cmp(&a.source.chars().count())
                .then_with(|| a.source.cmp(&b.source))
        });
        Self { entries }
    }

    pub fn encode(&self, lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .map(|line| {
                let mut encoded = line.clone();
                for entry in &self.entries {
                    encoded = encoded.replace(&entry.source, &entry.token);
                }
                encoded
            })
            .collect()
    }

    pub fn decode(&self, lines: &[String]) -> Vec<String> {
        lines
            .iter()
            .map(|line| {
                let mut decoded = line.clone();
                for entry in &self.entries {
                    decoded = decoded.replace(&entry.token, &entry.target);
                }
                decoded
            })
            .collect()
    }
}

impl fmt::Debug for GlossaryCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlossaryCodec")
            .field("terms", &self.entries.len())
            .finish()
    }
}

const TOKEN_LEN: usize = 4;

fn fresh_token(rng: &mut impl Rng, used: &mut HashSet<String>, glossary: &Glossary) -> String {
    loop {
        let candidate: String = (0..TOKEN_LEN)
            .map(|_| rng.gen_range(b'a'..=b'z') as char)
            .collect();
        if !has_doubled_letter(&candidate) {
            continue;
        }
        if used.contains(&candidate) {
            continue;
        }
        let collides = glossary
            .terms
            .iter()
            .any(|(source, target)| source.contains(&candidate) || target.contains(&candidate));
        if collides {
            continue;
        }
        used.insert(candidate.clone());
        return candidate;
    }
}

fn has_doubled_letter(value: &str) -> bool {
    value
        .as_bytes()
        .windows(2)
        .any(|pair| pair[0] == pair[1])
}
