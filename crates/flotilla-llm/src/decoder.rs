use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flotilla_core::error::{FlotillaError, Result};
use flotilla_core::traits::InferenceStream;
use flotilla_core::types::*;

use crate::streaming::{SseEvent, SseParser};

/// Raw transport feed consumed by the decoder.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

// Wire payloads

#[derive(Deserialize)]
struct MessageStartData {
    message: MessageInfo,
}

#[derive(Deserialize)]
struct MessageInfo {
    id: String,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct BlockStartData {
    index: usize,
    content_block: StreamContentBlock,
}

#[derive(Deserialize)]
struct BlockDeltaData {
    index: usize,
    delta: DeltaInfo,
}

#[derive(Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    partial_json: String,
}

#[derive(Deserialize)]
struct BlockStopData {
    index: usize,
}

#[derive(Deserialize)]
struct MessageDeltaData {
    #[serde(default)]
    delta: MessageDeltaInfo,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize, Default)]
struct MessageDeltaInfo {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorData {
    error: ErrorInfo,
}

#[derive(Deserialize)]
struct ErrorInfo {
    #[serde(rename = "type", default)]
    error_type: String,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct TypeOnly {
    #[serde(rename = "type")]
    event_type: String,
}

/// In-progress state of one content block.
#[derive(Default)]
struct BlockAccumulator {
    tool_use: Option<(String, String)>,
    text: String,
    json: String,
}

impl BlockAccumulator {
    fn finalize(self) -> Option<ContentBlock> {
        match self.tool_use {
            Some((id, name)) => {
                let input = parse_tool_input(&name, &self.json);
                Some(ContentBlock::ToolUse { id, name, input })
            }
            None if !self.text.is_empty() => Some(ContentBlock::Text { text: self.text }),
            None => None,
        }
    }
}

/// Accumulated tool input that fails to parse becomes an empty object.
fn parse_tool_input(tool: &str, raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ Value::Object(_)) => v,
        Ok(_) | Err(_) => {
            warn!(tool = %tool, len = raw.len(), "Discarding malformed tool input JSON");
            Value::Object(Default::default())
        }
    }
}

fn parse_payload<T: DeserializeOwned>(name: &str, data: &str) -> Result<T> {
    serde_json::from_str(data)
        .map_err(|e| FlotillaError::streaming_failed(format!("failed to parse {}: {}", name, e)))
}

/// Map a wire `error` event onto the error taxonomy.
pub fn wire_error(error_type: &str, message: &str) -> FlotillaError {
    let text = format!("{}: {}", error_type, message);
    match error_type {
        "rate_limit_error" => FlotillaError::rate_limit(text),
        "overloaded_error" | "api_error" => FlotillaError::provider_unavailable(text),
        _ => FlotillaError::streaming_failed(text),
    }
}

enum Step {
    Skip,
    Emit(StreamEvent),
    Stop(StreamEvent),
    Failed(StreamEvent, FlotillaError),
}

/// Streaming Event Decoder.
///
/// Turns the `event:`/`data:` byte feed of a streamed model turn into
/// [`StreamEvent`]s, one per [`InferenceStream::next`] call, while building the
/// response progressively. Finished content blocks are kept in index order.
pub struct StreamDecoder {
    source: Option<ByteStream>,
    parser: SseParser,
    pending: VecDeque<SseEvent>,
    cancel: CancellationToken,
    blocks: BTreeMap<usize, BlockAccumulator>,
    finished: BTreeMap<usize, ContentBlock>,
    last_index: usize,
    response: InferenceResponse,
    current: Option<StreamEvent>,
    err: Option<FlotillaError>,
    done: bool,
    closed: bool,
}

impl StreamDecoder {
    pub fn new(source: ByteStream) -> Self {
        Self {
            source: Some(source),
            parser: SseParser::new(),
            pending: VecDeque::new(),
            cancel: CancellationToken::new(),
            blocks: BTreeMap::new(),
            finished: BTreeMap::new(),
            last_index: 0,
            response: InferenceResponse::default(),
            current: None,
            err: None,
            done: false,
            closed: false,
        }
    }

    /// Decode an HTTP response body.
    pub fn from_response(response: reqwest::Response) -> Self {
        let source = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| {
                    FlotillaError::streaming_failed(format!("stream read failed: {}", e))
                })
            })
            .boxed();
        Self::new(source)
    }

    /// Decode an in-memory feed delivered in the given chunks.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self::new(stream::iter(chunks.into_iter().map(Ok)).boxed())
    }

    /// Abort reads as soon as `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Drive the stream to its end and return the accumulated response.
    pub async fn drain(mut self) -> Result<InferenceResponse> {
        while self.advance().await {}
        match self.err.take() {
            Some(e) => Err(e),
            None => Ok(self.response),
        }
    }

    async fn advance(&mut self) -> bool {
        if self.done || self.closed || self.err.is_some() {
            return false;
        }

        loop {
            while let Some(raw) = self.pending.pop_front() {
                match self.handle(raw) {
                    Ok(Step::Skip) => continue,
                    Ok(Step::Emit(event)) => {
                        self.current = Some(event);
                        return true;
                    }
                    Ok(Step::Stop(event)) => {
                        self.current = Some(event);
                        self.finish();
                        return true;
                    }
                    Ok(Step::Failed(event, err)) => {
                        self.current = Some(event);
                        self.err = Some(err);
                        self.finish();
                        return true;
                    }
                    Err(err) => {
                        warn!(error = %err, "Fatal stream decode error");
                        self.err = Some(err);
                        self.finish();
                        return false;
                    }
                }
            }

            let Some(source) = self.source.as_mut() else {
                self.err = Some(FlotillaError::streaming_failed(
                    "stream ended before message_stop",
                ));
                self.finish();
                return false;
            };

            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                chunk = source.next() => Some(chunk),
            };

            match read {
                None => {
                    self.err = Some(FlotillaError::Cancelled);
                    self.finish();
                    return false;
                }
                Some(Some(Ok(bytes))) => {
                    let events = self.parser.feed(&bytes);
                    self.pending.extend(events);
                }
                Some(Some(Err(e))) => {
                    self.err = Some(e);
                    self.finish();
                    return false;
                }
                Some(None) => {
                    self.source = None;
                    let rest = self.parser.finish();
                    self.pending.extend(rest);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.source = None;
        self.pending.clear();
    }

    fn handle(&mut self, raw: SseEvent) -> Result<Step> {
        let name = match raw.event_type {
            Some(name) => name,
            // Feeds without `event:` lines still carry the type in the payload
            None => match serde_json::from_str::<TypeOnly>(&raw.data) {
                Ok(t) => t.event_type,
                Err(_) => return Ok(Step::Skip),
            },
        };
        let data = raw.data.as_str();

        match name.as_str() {
            "message_start" => {
                let payload: MessageStartData = parse_payload(&name, data)?;
                self.response.id = payload.message.id.clone();
                self.response.usage.input_tokens = payload.message.usage.input_tokens;
                Ok(Step::Emit(StreamEvent::MessageStart {
                    id: payload.message.id,
                    usage: self.response.usage,
                }))
            }

            "content_block_start" => {
                let payload: BlockStartData = parse_payload(&name, data)?;
                let block = payload.content_block;
                let acc = BlockAccumulator {
                    tool_use: block
                        .is_tool_use()
                        .then(|| (block.id.clone(), block.name.clone())),
                    text: block.text.clone(),
                    json: String::new(),
                };
                self.blocks.insert(payload.index, acc);
                self.last_index = payload.index;
                Ok(Step::Emit(StreamEvent::ContentBlockStart {
                    index: payload.index,
                    block,
                }))
            }

            "content_block_delta" => {
                let payload: BlockDeltaData = parse_payload(&name, data)?;
                let index = payload.index;
                let acc = self.blocks.entry(index).or_default();
                match payload.delta.delta_type.as_str() {
                    "text_delta" => {
                        acc.text.push_str(&payload.delta.text);
                        Ok(Step::Emit(StreamEvent::TextDelta {
                            index,
                            text: payload.delta.text,
                        }))
                    }
                    "input_json_delta" => {
                        acc.json.push_str(&payload.delta.partial_json);
                        Ok(Step::Emit(StreamEvent::InputJsonDelta {
                            index,
                            partial_json: payload.delta.partial_json,
                        }))
                    }
                    other => {
                        debug!(delta_type = %other, index, "Ignoring unsupported delta");
                        Ok(Step::Skip)
                    }
                }
            }

            "content_block_stop" => {
                let index = serde_json::from_str::<BlockStopData>(data)
                    .map(|p| p.index)
                    .unwrap_or(self.last_index);
                if let Some(block) = self.blocks.remove(&index).and_then(BlockAccumulator::finalize)
                {
                    self.finished.insert(index, block);
                    self.response.content = self.finished.values().cloned().collect();
                }
                Ok(Step::Emit(StreamEvent::ContentBlockStop { index }))
            }

            "message_delta" => {
                let payload: MessageDeltaData = parse_payload(&name, data)?;
                let stop_reason = payload.delta.stop_reason.map(StopReason::from);
                self.response.stop_reason = stop_reason.clone();
                self.response.usage.output_tokens = payload.usage.output_tokens;
                Ok(Step::Emit(StreamEvent::MessageDelta {
                    stop_reason,
                    usage: self.response.usage,
                }))
            }

            "message_stop" => {
                self.response.content = self.finished.values().cloned().collect();
                debug!(
                    id = %self.response.id,
                    blocks = self.response.content.len(),
                    input_tokens = self.response.usage.input_tokens,
                    output_tokens = self.response.usage.output_tokens,
                    "Stream complete"
                );
                Ok(Step::Stop(StreamEvent::MessageStop))
            }

            "ping" => Ok(Step::Emit(StreamEvent::Ping)),

            "error" => {
                let (error_type, message) = match serde_json::from_str::<ErrorData>(data) {
                    Ok(p) => (p.error.error_type, p.error.message),
                    Err(_) => ("stream_error".to_string(), data.to_string()),
                };
                let err = wire_error(&error_type, &message);
                Ok(Step::Failed(
                    StreamEvent::Error {
                        error_type,
                        message,
                    },
                    err,
                ))
            }

            other => {
                debug!(event = %other, "Ignoring unknown stream event");
                Ok(Step::Skip)
            }
        }
    }
}

impl InferenceStream for StreamDecoder {
    fn next(&mut self) -> BoxFuture<'_, bool> {
        Box::pin(self.advance())
    }

    fn event(&self) -> Option<&StreamEvent> {
        self.current.as_ref()
    }

    fn err(&self) -> Option<&FlotillaError> {
        self.err.as_ref()
    }

    fn take_err(&mut self) -> Option<FlotillaError> {
        self.err.take()
    }

    fn response(&self) -> &InferenceResponse {
        &self.response
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.source = None;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::encode_event;
    use flotilla_core::error::ErrorKind;
    use serde_json::json;

    fn feed(events: &[(&str, Value)]) -> String {
        events
            .iter()
            .map(|(name, data)| encode_event(name, &data.to_string()))
            .collect()
    }

    fn decoder(wire: &str) -> StreamDecoder {
        StreamDecoder::from_chunks(vec![Bytes::from(wire.to_string())])
    }

    fn tool_turn() -> String {
        feed(&[
            ("message_start", json!({"type": "message_start", "message": {"id": "msg_1", "usage": {"input_tokens": 10}}})),
            ("content_block_start", json!({"index": 0, "content_block": {"type": "tool_use", "id": "tu_1", "name": "lookup"}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"q\":"}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "\"x\"}"}})),
            ("content_block_stop", json!({"index": 0})),
            ("message_delta", json!({"delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 5}})),
            ("message_stop", json!({})),
        ])
    }

    async fn collect(d: &mut StreamDecoder) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while d.next().await {
            events.push(d.event().cloned().unwrap());
        }
        events
    }

    #[tokio::test]
    async fn test_tool_use_turn() {
        let mut d = decoder(&tool_turn());
        let events = collect(&mut d).await;
        assert!(d.err().is_none());
        assert_eq!(events.len(), 7);
        assert_eq!(events.last(), Some(&StreamEvent::MessageStop));

        let resp = d.response();
        assert_eq!(resp.id, "msg_1");
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        assert!(resp.has_tool_calls());
        assert_eq!(resp.usage, Usage { input_tokens: 10, output_tokens: 5 });
        assert_eq!(
            resp.content,
            vec![ContentBlock::ToolUse {
                id: "tu_1".into(),
                name: "lookup".into(),
                input: json!({"q": "x"}),
            }]
        );
    }

    #[tokio::test]
    async fn test_byte_by_byte_chunks() {
        let wire = tool_turn();
        let chunks = wire.bytes().map(|b| Bytes::from(vec![b])).collect();
        let resp = StreamDecoder::from_chunks(chunks).drain().await.unwrap();
        assert_eq!(resp.tool_calls()[0].2, &json!({"q": "x"}));
    }

    #[tokio::test]
    async fn test_blocks_in_index_order() {
        let wire = feed(&[
            ("message_start", json!({"message": {"id": "m", "usage": {"input_tokens": 1}}})),
            ("content_block_start", json!({"index": 0, "content_block": {"type": "text", "text": ""}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": "Let me "}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "text_delta", "text": "check."}})),
            ("content_block_stop", json!({"index": 0})),
            ("content_block_start", json!({"index": 1, "content_block": {"type": "tool_use", "id": "t1", "name": "read"}})),
            ("content_block_delta", json!({"index": 1, "delta": {"type": "input_json_delta", "partial_json": "{\"path\":\"a.txt\"}"}})),
            ("content_block_stop", json!({"index": 1})),
            ("message_delta", json!({"delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 9}})),
            ("message_stop", json!({})),
        ]);
        let resp = decoder(&wire).drain().await.unwrap();
        assert_eq!(resp.content.len(), 2);
        assert_eq!(resp.text(), "Let me check.");
        assert!(matches!(&resp.content[1], ContentBlock::ToolUse { name, .. } if name == "read"));
    }

    #[tokio::test]
    async fn test_empty_text_block_dropped() {
        let wire = feed(&[
            ("message_start", json!({"message": {"id": "m"}})),
            ("content_block_start", json!({"index": 0, "content_block": {"type": "text"}})),
            ("content_block_stop", json!({"index": 0})),
            ("message_delta", json!({"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 1}})),
            ("message_stop", json!({})),
        ]);
        let resp = decoder(&wire).drain().await.unwrap();
        assert!(resp.content.is_empty());
        assert_eq!(resp.stop_reason, Some(StopReason::EndTurn));
    }

    #[tokio::test]
    async fn test_malformed_tool_json_becomes_empty_input() {
        let wire = feed(&[
            ("message_start", json!({"message": {"id": "m"}})),
            ("content_block_start", json!({"index": 0, "content_block": {"type": "tool_use", "id": "t", "name": "write"}})),
            ("content_block_delta", json!({"index": 0, "delta": {"type": "input_json_delta", "partial_json": "{\"path\": \"rep"}})),
            ("content_block_stop", json!({"index": 0})),
            ("message_delta", json!({"delta": {"stop_reason": "max_tokens"}, "usage": {"output_tokens": 8192}})),
            ("message_stop", json!({})),
        ]);
        let resp = decoder(&wire).drain().await.unwrap();
        assert_eq!(resp.tool_calls()[0].2, &json!({}));
        assert_eq!(resp.stop_reason, Some(StopReason::MaxTokens));
    }

    #[tokio::test]
    async fn test_malformed_message_start_is_fatal() {
        let wire = "event: message_start\ndata: {not json\n\nevent: ping\ndata: {}\n\n";
        let mut d = decoder(wire);
        assert!(!d.next().await);
        assert!(d.err().unwrap().is(ErrorKind::StreamingFailed));
        assert!(d.err().unwrap().to_string().contains("message_start"));
        // Iteration stays stopped
        assert!(!d.next().await);
    }

    #[tokio::test]
    async fn test_malformed_delta_is_fatal() {
        let wire = feed(&[
            ("message_start", json!({"message": {"id": "m"}})),
            ("content_block_delta", json!({"index": "zero"})),
            ("message_stop", json!({})),
        ]);
        let mut d = decoder(&wire);
        assert!(d.next().await);
        assert!(!d.next().await);
        assert!(d.err().unwrap().to_string().contains("content_block_delta"));
    }

    #[tokio::test]
    async fn test_unknown_events_ignored() {
        let wire = format!(
            "{}{}{}",
            encode_event("message_start", r#"{"message":{"id":"m"}}"#),
            encode_event("vendor_metrics", r#"{"anything":true}"#),
            encode_event("message_stop", "{}"),
        );
        let mut d = decoder(&wire);
        let events = collect(&mut d).await;
        assert_eq!(events.len(), 2);
        assert!(d.err().is_none());
    }

    #[tokio::test]
    async fn test_ping_surfaces() {
        let wire = format!(
            "{}{}",
            encode_event("ping", "{}"),
            encode_event("message_stop", "{}")
        );
        let mut d = decoder(&wire);
        assert_eq!(collect(&mut d).await, vec![StreamEvent::Ping, StreamEvent::MessageStop]);
    }

    #[tokio::test]
    async fn test_error_event_terminates() {
        let wire = format!(
            "{}{}{}",
            encode_event("message_start", r#"{"message":{"id":"m"}}"#),
            encode_event("error", r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            encode_event("message_stop", "{}"),
        );
        let mut d = decoder(&wire);
        assert!(d.next().await);
        assert!(d.next().await);
        assert!(matches!(d.event(), Some(StreamEvent::Error { error_type, .. }) if error_type == "overloaded_error"));
        assert!(!d.next().await);
        let err = d.take_err().unwrap();
        assert!(err.is(ErrorKind::ProviderUnavailable));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_terminal_event_returns_true_once() {
        let mut d = decoder(&encode_event("message_stop", "{}"));
        assert!(d.next().await);
        assert_eq!(d.event(), Some(&StreamEvent::MessageStop));
        assert!(!d.next().await);
        assert!(!d.next().await);
        assert!(d.err().is_none());
    }

    #[tokio::test]
    async fn test_truncated_feed_is_streaming_failure() {
        let wire = encode_event("message_start", r#"{"message":{"id":"m"}}"#);
        let err = decoder(&wire).drain().await.unwrap_err();
        assert!(err.is(ErrorKind::StreamingFailed));
        assert!(err.to_string().contains("before message_stop"));
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from(encode_event("message_start", r#"{"message":{"id":"m"}}"#))),
            Err(FlotillaError::streaming_failed("connection reset")),
        ];
        let mut d = StreamDecoder::new(stream::iter(chunks).boxed());
        assert!(d.next().await);
        assert!(!d.next().await);
        assert!(d.err().unwrap().to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut d = decoder(&tool_turn());
        assert!(d.next().await);
        d.close();
        d.close();
        assert!(!d.next().await);
        assert!(d.err().is_none());
        assert_eq!(d.response().id, "msg_1");
    }

    #[tokio::test]
    async fn test_cancel_stops_reading() {
        let cancel = CancellationToken::new();
        let mut d = StreamDecoder::new(stream::pending::<Result<Bytes>>().boxed()).with_cancel(cancel.clone());
        cancel.cancel();
        assert!(!d.next().await);
        assert!(matches!(d.err(), Some(FlotillaError::Cancelled)));
    }

    #[tokio::test]
    async fn test_data_only_feed_uses_payload_type() {
        let wire = "data: {\"type\":\"message_start\",\"message\":{\"id\":\"m9\"}}\n\ndata: {\"type\":\"message_stop\"}\n\n";
        let resp = decoder(wire).drain().await.unwrap();
        assert_eq!(resp.id, "m9");
    }

    #[test]
    fn test_wire_error_mapping() {
        assert!(wire_error("rate_limit_error", "slow").is(ErrorKind::RateLimit));
        assert!(wire_error("api_error", "boom").is(ErrorKind::ProviderUnavailable));
        assert!(wire_error("invalid_request_error", "bad").is(ErrorKind::StreamingFailed));
    }
}
