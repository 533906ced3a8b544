//! Turns each backend's native output into the canonical [`GenerationResult`].
//!
//! Backends declare an [`OutputShape`] up front; the text is never inspected
//! to guess which rule applies. Adding a backend means picking a shape here.

use std::time::Duration;

use serde::Serialize;

use crate::{
    backend::BackendDescriptor,
    error::GenerationFailure,
    model::GenerationResult,
};

/// What a backend's raw text contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputShape {
    /// Decoded prompt + completion. The prompt is stripped, then whitespace trimmed.
    PromptIncluded,
    /// Decoded completion only. Passed through untouched.
    CompletionOnly,
    /// Cumulative completion text of the engine's latest step. Passed through.
    Cumulative,
}

pub fn normalize_text(shape: OutputShape, raw: &str, prompt: &str) -> String {
    match shape {
        OutputShape::PromptIncluded => strip_prompt(raw, prompt).trim().to_string(),
        OutputShape::CompletionOnly | OutputShape::Cumulative => raw.to_string(),
    }
}

fn strip_prompt<'a>(raw: &'a str, prompt: &str) -> &'a str {
    if let Some(rest) = raw.strip_prefix(prompt) {
        return rest;
    }
    // Detokenization does not always reproduce the prompt byte for byte, so
    // fall back to dropping as many characters as the prompt has.
    let skip = prompt.chars().count();
    match raw.char_indices().nth(skip) {
        Some((idx, _)) => &raw[idx..],
        None => "",
    }
}

/// Keeps only the last of a sequence of cumulative outputs.
///
/// A cumulative engine repeats everything generated so far at every step:
/// `"Hel"`, `"Hello wor"`, `"Hello world"`. The last item already is the whole
/// completion; concatenating the steps would duplicate text.
pub fn take_last<I: IntoIterator>(items: I) -> Option<I::Item> {
    items.into_iter().last()
}

/// Builds the canonical result from a backend's raw outcome.
pub fn normalize(
    descriptor: &BackendDescriptor,
    prompt: String,
    raw: Result<String, GenerationFailure>,
    elapsed: Duration,
) -> GenerationResult {
    let text = raw.map(|raw| normalize_text(descriptor.output_shape, &raw, &prompt));
    build_result(descriptor, prompt, text, elapsed)
}

/// Same as [`normalize`] for text that is already in canonical form.
pub(crate) fn build_result(
    descriptor: &BackendDescriptor,
    prompt: String,
    text: Result<String, GenerationFailure>,
    elapsed: Duration,
) -> GenerationResult {
    let mut result = GenerationResult {
        prompt,
        generated_text: String::new(),
        inference_time_seconds: round_millis(elapsed),
        backend_id: descriptor.id.clone(),
        device_used: descriptor.device.clone(),
        model_path: descriptor.model_path.clone(),
        error: None,
        failure_kind: None,
    };
    match text {
        Ok(text) => result.generated_text = text,
        Err(failure) => result.record_failure(&failure),
    }
    result
}

fn round_millis(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

/// Converts cumulative raw snapshots of a streaming generation into
/// incremental fragments whose concatenation is the normalized text.
#[derive(Debug)]
pub struct DeltaTracker {
    shape: OutputShape,
    prompt: String,
    emitted: String,
}

impl DeltaTracker {
    pub fn new(shape: OutputShape, prompt: impl Into<String>) -> Self {
        Self {
            shape,
            prompt: prompt.into(),
            emitted: String::new(),
        }
    }

    /// Returns the new fragment, if the snapshot extends what was emitted.
    ///
    /// A snapshot that rewrites earlier text (a re-decode merging bytes, or
    /// trimmed trailing whitespace) yields nothing; fragments already sent
    /// cannot be taken back.
    pub fn advance(&mut self, snapshot: &str) -> Option<String> {
        let normalized = normalize_text(self.shape, snapshot, &self.prompt);
        self.extend_to(&normalized)
    }

    /// Normalizes the final raw text. Returns the fragment still owed to the
    /// client, and the full text for the final marker.
    pub fn finish(&mut self, raw_final: &str) -> (Option<String>, String) {
        let full = normalize_text(self.shape, raw_final, &self.prompt);
        let tail = self.extend_to(&full);
        (tail, full)
    }

    pub fn emitted(&self) -> &str {
        &self.emitted
    }

    fn extend_to(&mut self, normalized: &str) -> Option<String> {
        let fragment = normalized.strip_prefix(self.emitted.as_str())?;
        if fragment.is_empty() {
            return None;
        }
        let fragment = fragment.to_string();
        self.emitted.push_str(&fragment);
        Some(fragment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, FailureKind};

    fn descriptor(shape: OutputShape) -> BackendDescriptor {
        BackendDescriptor {
            id: "test".into(),
            device: "cpu".into(),
            model_path: "/models/test".into(),
            output_shape: shape,
            supports_streaming: true,
            internal_batching: false,
        }
    }

    #[test]
    fn prompt_included_output_is_stripped_and_trimmed() {
        let text = normalize_text(
            OutputShape::PromptIncluded,
            "Count to 3\n 1, 2, 3. ",
            "Count to 3",
        );
        assert_eq!(text, "1, 2, 3.");

        // only whitespace is trimmed; punctuation after the prompt is completion
        let text = normalize_text(
            OutputShape::PromptIncluded,
            "Count to 3. 1, 2, 3.",
            "Count to 3",
        );
        assert_eq!(text, ". 1, 2, 3.");
    }

    #[test]
    fn prompt_included_output_with_empty_completion() {
        for prompt in ["", "Hello", "  spaced prompt  ", "héllo wörld"] {
            let raw = prompt.to_string();
            assert_eq!(normalize_text(OutputShape::PromptIncluded, &raw, prompt), "");
        }
    }

    #[test]
    fn prompt_included_for_many_pairs() {
        let pairs = [
            ("Hello", " world"),
            ("", "just completion"),
            ("Q: 2+2?", "\nA: 4\n"),
            ("日本語の", "テキスト"),
        ];
        for (prompt, completion) in pairs {
            let raw = format!("{prompt}{completion}");
            assert_eq!(
                normalize_text(OutputShape::PromptIncluded, &raw, prompt),
                completion.trim()
            );
        }
    }

    #[test]
    fn prompt_stripping_falls_back_to_character_count() {
        // decoded prompt collapsed one of its spaces
        let text = normalize_text(OutputShape::PromptIncluded, "a  bXYZ tail", "a   b");
        assert_eq!(text, "YZ tail");
        assert_eq!(normalize_text(OutputShape::PromptIncluded, "ab", "abcdef"), "");
    }

    #[test]
    fn other_shapes_pass_through() {
        let raw = "  Prompt then text ";
        assert_eq!(normalize_text(OutputShape::CompletionOnly, raw, "Prompt"), raw);
        assert_eq!(normalize_text(OutputShape::Cumulative, raw, "Prompt"), raw);
    }

    #[test]
    fn cumulative_steps_reduce_to_the_last() {
        let steps = vec!["Hel", "Hello wor", "Hello world"];
        assert_eq!(take_last(steps), Some("Hello world"));
        assert_eq!(take_last(Vec::<String>::new()), None);
    }

    #[test]
    fn normalize_builds_success_result() {
        let result = normalize(
            &descriptor(OutputShape::PromptIncluded),
            "Count to 3".into(),
            Ok("Count to 3 1, 2, 3.".into()),
            Duration::from_millis(1234),
        );
        assert!(result.is_success());
        assert_eq!(result.generated_text, "1, 2, 3.");
        assert_eq!(result.inference_time_seconds, 1.234);
        assert_eq!(result.backend_id, "test");
        assert_eq!(result.device_used, "cpu");
        assert_eq!(result.model_path, "/models/test");
    }

    #[test]
    fn normalize_builds_failure_result() {
        let result = normalize(
            &descriptor(OutputShape::CompletionOnly),
            "p".into(),
            Err(BackendError::OutOfMemory("tried to allocate 2 GiB".into()).into()),
            Duration::ZERO,
        );
        assert!(!result.is_success());
        assert!(result.generated_text.is_empty());
        assert_eq!(
            result.error.as_deref(),
            Some("out of memory: tried to allocate 2 GiB")
        );
        assert_eq!(result.failure_kind, Some(FailureKind::Backend));
    }

    #[test]
    fn tracker_fragments_concatenate_to_final_text() {
        let prompt = "Count to 3";
        let snapshots = [
            "Count to 3",
            "Count to 3\n",
            "Count to 3\n1,",
            "Count to 3\n1, 2, ",
            "Count to 3\n1, 2, 3.",
        ];
        let mut tracker = DeltaTracker::new(OutputShape::PromptIncluded, prompt);
        let mut streamed = String::new();
        for snapshot in snapshots {
            if let Some(fragment) = tracker.advance(snapshot) {
                streamed.push_str(&fragment);
            }
        }
        let (tail, full) = tracker.finish("Count to 3\n1, 2, 3.");
        if let Some(tail) = tail {
            streamed.push_str(&tail);
        }
        assert_eq!(full, "1, 2, 3.");
        assert_eq!(streamed, full);
        assert_eq!(tracker.emitted(), full);
    }

    #[test]
    fn tracker_skips_snapshots_that_rewrite_history() {
        let mut tracker = DeltaTracker::new(OutputShape::Cumulative, "");
        assert_eq!(tracker.advance("ab"), Some("ab".to_string()));
        assert_eq!(tracker.advance("aX"), None);
        assert_eq!(tracker.advance("abc"), Some("c".to_string()));
        let (tail, full) = tracker.finish("abc");
        assert_eq!(tail, None);
        assert_eq!(full, "abc");
    }
}
