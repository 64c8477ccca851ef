use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::backend::{GenerateRequest, GenerateResponse, Sampling, TranslateBackend};
use crate::cache::{self, ResultCache};
use crate::chapters::FailCaseLog;
use crate::glossary::{Glossary, GlossaryCodec};
use crate::segment;

/// First attempt conservative, one retry with the diverse profile.
const ATTEMPTS: [Sampling; 2] = [Sampling::Conservative, Sampling::Diverse];

#[derive(Debug, Clone, Copy)]
pub struct TranslateConfig {
    pub segment_budget: usize,
    pub max_new_tokens: u32,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            segment_budget: 500,
            max_new_tokens: 1024,
        }
    }
}

/// Identifies the chapter a segment belongs to, for the fail-case log.
#[derive(Debug, Clone, Copy)]
pub struct ChapterRef<'a> {
    pub provider_id: &'a str,
    pub novel_id: &'a str,
    pub chapter_id: &'a str,
}

/// Translates a chapter's paragraph list end-to-end: hold out non-text lines,
/// protect glossary terms, chunk into segments, call the backend with a
/// bounded retry-then-fallback policy, then reassemble in original order.
pub struct SegmentTranslator {
    backend: Arc<dyn TranslateBackend>,
    fail_log: Arc<dyn FailCaseLog>,
    cache: Option<Arc<ResultCache>>,
    config: TranslateConfig,
}

impl SegmentTranslator {
    pub fn new(
        backend: Arc<dyn TranslateBackend>,
        fail_log: Arc<dyn FailCaseLog>,
        cache: Option<Arc<ResultCache>>,
        config: TranslateConfig,
    ) -> Self {
        Self {
            backend,
            fail_log,
            cache,
            config,
        }
    }

    pub async fn translate(
        &self,
        chapter: ChapterRef<'_>,
        paragraphs: &[String],
        glossary: &Glossary,
    ) -> Result<Vec<String>> {
        let filtered = segment::filter(paragraphs);
        let codec = GlossaryCodec::new(glossary);

        let mut translated = Vec::with_capacity(filtered.kept().len());
        for lines in segment::split(filtered.kept(), self.config.segment_budget) {
            translated.extend(self.translate_segment(chapter, &lines, &codec, glossary).await?);
        }
        Ok(filtered.recover(translated))
    }

    /// One segment end-to-end. The cache key covers the original lines, not
    /// the encoded ones: the codec mints fresh identifiers per chapter, so
    /// encoded text never repeats across calls.
    async fn translate_segment(
        &self,
        chapter: ChapterRef<'_>,
        lines: &[String],
        codec: &GlossaryCodec,
        glossary: &Glossary,
    ) -> Result<Vec<String>> {
        let key = cache::segment_key(lines, glossary);
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&key, lines.len())
        {
            info!(
                "segment served from cache ({} lines, chapter {})",
                lines.len(),
                chapter.chapter_id
            );
            return Ok(hit);
        }

        let encoded = codec.encode(lines);
        let prompt = encoded.join("\n");
        let mut last_output = String::new();
        for sampling in ATTEMPTS {
            let response = self
                .backend
                .generate(GenerateRequest::new(
                    prompt.clone(),
                    self.config.max_new_tokens,
                    sampling,
                ))
                .await?;
            let output = output_lines(&response.text);
            if !self.is_degraded(&response, output.len(), lines.len()) {
                let decoded = codec.decode(&output);
                if let Some(cache) = &self.cache {
                    cache.save(&key, &decoded);
                }
                return Ok(decoded);
            }
            warn!(
                "degraded segment output with {:?} sampling ({} lines in, {} out, {} tokens)",
                sampling,
                lines.len(),
                output.len(),
                response.tokens
            );
            last_output = response.text;
        }

        if let Err(err) = self
            .fail_log
            .record(
                chapter.provider_id,
                chapter.novel_id,
                chapter.chapter_id,
                &prompt,
                &last_output,
            )
            .await
        {
            warn!("failed to record fail case: {:#}", err);
        }
        warn!(
            "segment retries exhausted for chapter {}; translating line by line",
            chapter.chapter_id
        );
        Ok(codec.decode(&self.translate_lines(&encoded).await?))
    }

    /// Fallback path: each line alone, keeping the untranslated original over
    /// corrupted output.
    async fn translate_lines(&self, lines: &[String]) -> Result<Vec<String>> {
        let mut output = Vec::with_capacity(lines.len());
        for line in lines {
            let response = self
                .backend
                .generate(GenerateRequest::new(
                    line.clone(),
                    self.config.max_new_tokens,
                    Sampling::Conservative,
                ))
                .await?;
            let translated = output_lines(&response.text);
            if self.is_degraded(&response, translated.len(), 1) {
                output.push(line.clone());
            } else {
                output.push(translated.into_iter().next().unwrap_or_else(|| line.clone()));
            }
        }
        Ok(output)
    }

    fn is_degraded(&self, response: &GenerateResponse, output: usize, input: usize) -> bool {
        response.tokens >= self.config.max_new_tokens || output != input
    }
}

fn output_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chapters::MemFailCaseLog;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const CHAPTER: ChapterRef<'_> = ChapterRef {
        provider_id: "providerX",
        novel_id: "novel1",
        chapter_id: "c1",
    };

    /// Scripted backend: answers each prompt through `reply`, counting calls.
    struct StubBackend<F: Fn(&str) -> GenerateResponse + Send + Sync> {
        reply: F,
        calls: Mutex<Vec<String>>,
    }

    impl<F: Fn(&str) -> GenerateResponse + Send + Sync> StubBackend<F> {
        fn new(reply: F) -> Self {
            Self {
                reply,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<F: Fn(&str) -> GenerateResponse + Send + Sync> TranslateBackend for StubBackend<F> {
        async fn generate(&self, request: GenerateRequest) -> Result<GenerateResponse> {
            self.calls.lock().unwrap().push(request.prompt.clone());
            Ok((self.reply)(&request.prompt))
        }
    }

    fn echo_line(line: &str) -> String {
        format!("译:{}", line)
    }

    fn echo_backend() -> Arc<StubBackend<impl Fn(&str) -> GenerateResponse + Send + Sync>> {
        Arc::new(StubBackend::new(|prompt: &str| {
            let text = prompt
                .lines()
                .map(echo_line)
                .collect::<Vec<_>>()
                .join("\n");
            GenerateResponse { text, tokens: 8 }
        }))
    }

    fn translator(
        backend: Arc<dyn TranslateBackend>,
        fail_log: Arc<MemFailCaseLog>,
        cache: Option<Arc<ResultCache>>,
    ) -> SegmentTranslator {
        SegmentTranslator::new(
            backend,
            fail_log,
            cache,
            TranslateConfig {
                segment_budget: 500,
                max_new_tokens: 64,
            },
        )
    }

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn preserves_passthrough_lines_and_order() {
        let backend = echo_backend();
        let translator = translator(backend, Arc::new(MemFailCaseLog::new()), None);
        let input = lines(&["一", "", "<图片>x.png", "二"]);
        let output = translator
            .translate(CHAPTER, &input, &Glossary::default())
            .await
            .unwrap();
        assert_eq!(output, lines(&["译:一", "", "<图片>x.png", "译:二"]));
    }

    #[tokio::test]
    async fn retries_twice_then_falls_back_per_line() {
        // Always truncated: tokens == max_new_tokens.
        let backend = Arc::new(StubBackend::new(|prompt: &str| GenerateResponse {
            text: prompt.to_string(),
            tokens: 64,
        }));
        let fail_log = Arc::new(MemFailCaseLog::new());
        let translator = translator(backend.clone(), fail_log.clone(), None);

        let input = lines(&["一", "二"]);
        let output = translator
            .translate(CHAPTER, &input, &Glossary::default())
            .await
            .unwrap();
        // Per-line calls also degrade, so the originals survive.
        assert_eq!(output, input);

        let calls = backend.calls();
        let segment_prompt = "一\n二";
        let segment_calls = calls.iter().filter(|c| c.as_str() == segment_prompt).count();
        assert_eq!(segment_calls, 2, "retry budget is two attempts per segment");
        assert_eq!(calls.len(), 4, "two segment attempts plus one call per line");
        assert_eq!(fail_log.records().len(), 1);
        assert_eq!(fail_log.records()[0].0, segment_prompt);
    }

    #[tokio::test]
    async fn line_count_mismatch_triggers_retry() {
        // Collapses everything onto one line: degraded for multi-line input,
        // fine for single lines.
        let backend = Arc::new(StubBackend::new(|prompt: &str| GenerateResponse {
            text: prompt.replace('\n', ""),
            tokens: 8,
        }));
        let fail_log = Arc::new(MemFailCaseLog::new());
        let translator = translator(backend.clone(), fail_log.clone(), None);

        let input = lines(&["一", "二"]);
        let output = translator
            .translate(CHAPTER, &input, &Glossary::default())
            .await
            .unwrap();
        assert_eq!(output, input);
        assert_eq!(fail_log.records().len(), 1);
        // Fallback succeeded per line, nothing kept corrupted.
        assert_eq!(backend.calls().len(), 4);
    }

    #[tokio::test]
    async fn cache_hit_skips_the_backend() {
        let backend = echo_backend();
        let cache = Arc::new(ResultCache::new());
        let translator = translator(
            backend.clone(),
            Arc::new(MemFailCaseLog::new()),
            Some(cache),
        );

        // A glossed segment is the hard case: each translate() call mints
        // fresh codec identifiers, so only a key over the original lines can
        // hit on the second pass.
        let mut terms = BTreeMap::new();
        terms.insert("陛下".to_string(), "Your Majesty".to_string());
        let glossary = Glossary::new(terms);

        let input = lines(&["陛下は言った", "二"]);
        let first = translator
            .translate(CHAPTER, &input, &glossary)
            .await
            .unwrap();
        let calls_after_first = backend.calls().len();
        let second = translator
            .translate(CHAPTER, &input, &glossary)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(backend.calls().len(), calls_after_first);
        assert!(first[0].contains("Your Majesty"));
    }

    #[tokio::test]
    async fn glossary_terms_survive_the_round_trip() {
        let mut terms = BTreeMap::new();
        terms.insert("陛下".to_string(), "Your Majesty".to_string());
        let glossary = Glossary::new(terms);

        // The backend leaves identifier tokens untouched (they are plain
        // ascii) while translating the rest of the line.
        let backend = Arc::new(StubBackend::new(|prompt: &str| {
            let text = prompt
                .lines()
                .map(|line| line.replace("はお元気です", " is well"))
                .collect::<Vec<_>>()
                .join("\n");
            GenerateResponse { text, tokens: 8 }
        }));
        let translator = translator(backend, Arc::new(MemFailCaseLog::new()), None);

        let output = translator
            .translate(CHAPTER, &lines(&["陛下はお元気です"]), &glossary)
            .await
            .unwrap();
        assert_eq!(output, lines(&["Your Majesty is well"]));
    }
}
