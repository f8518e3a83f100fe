//! Thinking-marker substitution: `<thought>` (upstream) ↔ `<think>`
//! (OpenAI convention).
//!
//! Resolves Open Question #4 conservatively: streaming substitution
//! operates over a small ring buffer sized to the longer of the two tags,
//! never over the full body, so it can run on an unbounded byte stream
//! without buffering it.

const UPSTREAM_OPEN: &str = "<thought>";
const UPSTREAM_CLOSE: &str = "</thought>";
const OPENAI_OPEN: &str = "<think>";
const OPENAI_CLOSE: &str = "</think>";

/// Apply the substitution to a complete, already-buffered payload (used for
/// non-streaming responses, where the whole JSON body is in hand anyway).
#[must_use]
pub fn substitute_buffered(input: &str) -> String {
    input
        .replace(UPSTREAM_OPEN, OPENAI_OPEN)
        .replace(UPSTREAM_CLOSE, OPENAI_CLOSE)
}

/// Longest tag across both marker pairs; the ring buffer must be at least
/// this wide to guarantee it never looks across a tag it has already
/// flushed.
const MAX_TAG_LEN: usize = {
    let a = UPSTREAM_OPEN.len();
    let b = UPSTREAM_CLOSE.len();
    let c = OPENAI_OPEN.len();
    let d = OPENAI_CLOSE.len();
    let ab = if a > b { a } else { b };
    let cd = if c > d { c } else { d };
    if ab > cd {
        ab
    } else {
        cd
    }
};

/// Streaming substitution over a chunked byte source.
///
/// Holds back up to `MAX_TAG_LEN - 1` trailing bytes between calls to
/// [`Self::push`] so a tag split across two chunks is still recognized,
/// without ever buffering more than that.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    pending: Vec<u8>,
}

impl MarkerFilter {
    /// A fresh filter with an empty hold-back buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { pending: Vec::new() }
    }

    /// Feed the next chunk, returning bytes now safe to emit downstream.
    /// The final chunk of a response must go through [`Self::finish`]
    /// afterward to flush anything still held back.
    #[must_use]
    pub fn push(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        let substituted = substitute_buffered(&text);

        let safe_len = substituted.len().saturating_sub(MAX_TAG_LEN.saturating_sub(1));
        let mut boundary = safe_len;
        while boundary > 0 && !substituted.is_char_boundary(boundary) {
            boundary -= 1;
        }

        let (emit, hold) = substituted.split_at(boundary);
        self.pending = hold.as_bytes().to_vec();
        emit.as_bytes().to_vec()
    }

    /// Flush whatever remains after the source is exhausted.
    #[must_use]
    pub fn finish(mut self) -> Vec<u8> {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        substitute_buffered(&text).into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffered_substitution_swaps_both_tags() {
        let input = "<thought>reasoning</thought> answer";
        assert_eq!(substitute_buffered(input), "<think>reasoning</think> answer");
    }

    #[test]
    fn buffered_substitution_is_idempotent_without_markers() {
        let input = "plain text, no markers here";
        assert_eq!(substitute_buffered(input), input);
        assert_eq!(substitute_buffered(&substitute_buffered(input)), input);
    }

    #[test]
    fn streaming_filter_handles_tag_split_across_chunks() {
        let mut filter = MarkerFilter::new();
        let mut out = Vec::new();
        out.extend(filter.push(b"before <thou"));
        out.extend(filter.push(b"ght>reasoning</though"));
        out.extend(filter.push(b"t> after"));
        out.extend(filter.finish());
        assert_eq!(String::from_utf8(out).unwrap(), "before <think>reasoning</think> after");
    }

    #[test]
    fn streaming_filter_matches_buffered_result_for_whole_input() {
        let input = "a <thought>x</thought> b <thought>y</thought> c";
        let mut filter = MarkerFilter::new();
        let mut out = Vec::new();
        for byte in input.as_bytes() {
            out.extend(filter.push(&[*byte]));
        }
        out.extend(filter.finish());
        assert_eq!(String::from_utf8(out).unwrap(), substitute_buffered(input));
    }
}
