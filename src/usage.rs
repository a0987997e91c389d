use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

/// 计费用量累加器，随响应解析逐步填充。
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageInfo {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl UsageInfo {
    /// Fold a `usage` object out of a response payload. Absent or partial
    /// fields leave the current values untouched.
    pub fn absorb(&mut self, payload: &Value) {
        let Some(usage) = payload.get("usage") else {
            return;
        };
        if let Some(v) = usage.get("prompt_tokens").and_then(Value::as_i64) {
            self.prompt_tokens = v;
        }
        if let Some(v) = usage.get("completion_tokens").and_then(Value::as_i64) {
            self.completion_tokens = v;
        }
        if let Some(v) = usage.get("total_tokens").and_then(Value::as_i64) {
            self.total_tokens = v;
        }
    }
}

/// Parse a buffered JSON response body; bodies without a usage object come
/// back zeroed.
pub fn extract_usage(body: &[u8]) -> UsageInfo {
    let mut usage = UsageInfo::default();
    if let Ok(payload) = serde_json::from_slice::<Value>(body) {
        usage.absorb(&payload);
    }
    usage
}

/// What a finished (or abandoned) stream learned about the response.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: UsageInfo,
    pub model: String,
}

/// Splits a byte stream into complete lines without consuming the bytes
/// themselves; partial lines carry over between chunks.
#[derive(Debug, Default)]
struct LineScanner {
    pending: Vec<u8>,
}

impl LineScanner {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Ok(text) = String::from_utf8(line) {
                lines.push(text);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        String::from_utf8(std::mem::take(&mut self.pending)).ok()
    }
}

/// Watches SSE frames for usage data and fires the finalizer exactly once,
/// whichever termination comes first: the `[DONE]` sentinel, end of stream,
/// or being dropped on early client disconnect.
struct StreamAccountant<F: FnOnce(StreamOutcome)> {
    usage: UsageInfo,
    model: String,
    finalize: Option<F>,
}

impl<F: FnOnce(StreamOutcome)> StreamAccountant<F> {
    fn new(model: String, finalize: F) -> Self {
        Self {
            usage: UsageInfo::default(),
            model,
            finalize: Some(finalize),
        }
    }

    fn observe_line(&mut self, line: &str) {
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();
        if data == "[DONE]" {
            self.finish();
            return;
        }
        // Chunks that fail to parse are passed through without accounting.
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };
        self.usage.absorb(&chunk);
        if self.model.is_empty()
            && let Some(model) = chunk.get("model").and_then(Value::as_str)
        {
            self.model = model.to_string();
        }
    }

    fn finish(&mut self) {
        if let Some(finalize) = self.finalize.take() {
            finalize(StreamOutcome {
                usage: self.usage,
                model: std::mem::take(&mut self.model),
            });
        }
    }
}

impl<F: FnOnce(StreamOutcome)> Drop for StreamAccountant<F> {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Wrap an upstream byte stream in a pass-through observer. Bytes reach the
/// client untouched; completed `data: ` lines are scanned for usage and a
/// model name. `model` seeds the outcome and is backfilled from chunks when
/// empty.
pub fn observe_stream<S, E, F>(
    upstream: S,
    model: String,
    finalize: F,
) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    async_stream::stream! {
        let mut scanner = LineScanner::default();
        let mut accountant = StreamAccountant::new(model, finalize);
        let mut upstream = std::pin::pin!(upstream);

        while let Some(next) = upstream.next().await {
            match next {
                Ok(chunk) => {
                    for line in scanner.push(&chunk) {
                        accountant.observe_line(&line);
                    }
                    yield Ok(chunk);
                }
                Err(err) => {
                    accountant.finish();
                    yield Err(err);
                    break;
                }
            }
        }

        if let Some(line) = scanner.finish() {
            accountant.observe_line(&line);
        }
        accountant.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use futures_util::stream;

    use super::*;

    fn frames(parts: &[&str]) -> Vec<Result<Bytes, Infallible>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect()
    }

    fn sink() -> (Arc<Mutex<Vec<StreamOutcome>>>, impl FnOnce(StreamOutcome) + Send + 'static) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&outcomes);
        (outcomes, move |outcome| captured.lock().unwrap().push(outcome))
    }

    #[test]
    fn extract_usage_reads_counts_and_tolerates_absence() {
        let body = br#"{"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        let usage = extract_usage(body);
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);

        assert_eq!(extract_usage(br#"{"choices":[]}"#), UsageInfo::default());
        assert_eq!(extract_usage(b"not json"), UsageInfo::default());
    }

    #[test]
    fn line_scanner_handles_split_and_crlf_lines() {
        let mut scanner = LineScanner::default();
        assert!(scanner.push(b"data: {\"a\":").is_empty());
        assert_eq!(scanner.push(b"1}\r\ndata: x\n"), vec!["data: {\"a\":1}", "data: x"]);
        assert!(scanner.push(b"tail").is_empty());
        assert_eq!(scanner.finish().as_deref(), Some("tail"));
        assert!(scanner.finish().is_none());
    }

    #[tokio::test]
    async fn stream_passes_bytes_through_unchanged_and_extracts_usage() {
        let input = [
            "data: {\"model\":\"gpt-a\",\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"!\"}}]}\n\n",
            "data: {\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":3,\"total_tokens\":10}}\n\n",
            "data: [DONE]\n\n",
        ];
        let (outcomes, finalize) = sink();

        let observed = observe_stream(stream::iter(frames(&input)), String::new(), finalize);
        let collected: Vec<_> = observed.collect().await;

        let output: Vec<u8> = collected
            .into_iter()
            .flat_map(|r| r.unwrap().to_vec())
            .collect();
        assert_eq!(output, input.concat().into_bytes());

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].usage.total_tokens, 10);
        assert_eq!(outcomes[0].usage.prompt_tokens, 7);
        assert_eq!(outcomes[0].model, "gpt-a");
    }

    #[tokio::test]
    async fn finalizes_once_even_with_frames_after_done() {
        let input = [
            "data: {\"usage\":{\"total_tokens\":4}}\n",
            "data: [DONE]\n",
            "data: {\"usage\":{\"total_tokens\":99}}\n",
        ];
        let (outcomes, finalize) = sink();

        let observed = observe_stream(stream::iter(frames(&input)), "gpt-b".into(), finalize);
        let collected: Vec<_> = observed.collect().await;
        assert_eq!(collected.len(), 3);

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        // Recording happened at the sentinel, before the stray frame.
        assert_eq!(outcomes[0].usage.total_tokens, 4);
        assert_eq!(outcomes[0].model, "gpt-b");
    }

    #[tokio::test]
    async fn eof_without_sentinel_still_records() {
        let input = ["data: {\"usage\":{\"total_tokens\":6}}\n"];
        let (outcomes, finalize) = sink();

        let observed = observe_stream(stream::iter(frames(&input)), String::new(), finalize);
        let _: Vec<_> = observed.collect().await;

        assert_eq!(outcomes.lock().unwrap().len(), 1);
        assert_eq!(outcomes.lock().unwrap()[0].usage.total_tokens, 6);
    }

    #[tokio::test]
    async fn early_drop_records_exactly_once() {
        let input = [
            "data: {\"model\":\"gpt-c\"}\n",
            "data: {\"usage\":{\"total_tokens\":2}}\n",
            "data: [DONE]\n",
        ];
        let (outcomes, finalize) = sink();

        {
            let observed = observe_stream(stream::iter(frames(&input)), String::new(), finalize);
            let mut observed = std::pin::pin!(observed);
            // Client goes away after the first chunk.
            let first = observed.next().await;
            assert!(first.is_some());
        }

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].model, "gpt-c");
        assert_eq!(outcomes[0].usage.total_tokens, 0);
    }

    #[tokio::test]
    async fn malformed_chunks_are_ignored() {
        let input = [
            "data: {not json}\n",
            ": comment line\n",
            "data: {\"usage\":{\"total_tokens\":5}}\n",
            "data: [DONE]\n",
        ];
        let (outcomes, finalize) = sink();

        let observed = observe_stream(stream::iter(frames(&input)), String::new(), finalize);
        let collected: Vec<_> = observed.collect().await;
        assert_eq!(collected.len(), input.len());

        assert_eq!(outcomes.lock().unwrap()[0].usage.total_tokens, 5);
    }
}
