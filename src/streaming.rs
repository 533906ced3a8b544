use std::convert::Infallible;

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::model::{GenerationResult, StreamEvent, TokenDelta};

/// Terminal frame: the final marker plus the complete result.
#[derive(Serialize)]
struct FinalFrame<'a> {
    text_fragment: &'a str,
    is_final: bool,
    #[serde(flatten)]
    result: &'a GenerationResult,
}

fn frame(event: &StreamEvent) -> String {
    let encoded = match event {
        StreamEvent::Delta(delta) => serde_json::to_string::<TokenDelta>(delta),
        StreamEvent::Final(result) => serde_json::to_string(&FinalFrame {
            text_fragment: "",
            is_final: true,
            result,
        }),
    };
    encoded.unwrap_or_default()
}

/// Frames stream events as SSE. Dropping the response (client disconnect)
/// drops the receiver, which ends the generation session.
pub fn event_stream(
    mut events: mpsc::Receiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        while let Some(event) = events.recv().await {
            yield Ok(Event::default().data(frame(&event)));
        }

        yield Ok(Event::default().data("[DONE]"));
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, GenerationFailure};

    fn result() -> GenerationResult {
        GenerationResult {
            prompt: "p".into(),
            generated_text: "Hello world".into(),
            inference_time_seconds: 0.25,
            backend_id: "batching".into(),
            device_used: "cuda".into(),
            model_path: "/m".into(),
            error: None,
            failure_kind: None,
        }
    }

    #[test]
    fn delta_frame() {
        let json: serde_json::Value =
            serde_json::from_str(&frame(&StreamEvent::Delta(TokenDelta::fragment("Hel")))).unwrap();
        assert_eq!(json, serde_json::json!({"text_fragment": "Hel", "is_final": false}));
    }

    #[test]
    fn final_frame_carries_result() {
        let json: serde_json::Value =
            serde_json::from_str(&frame(&StreamEvent::Final(result()))).unwrap();
        assert_eq!(json["is_final"], true);
        assert_eq!(json["text_fragment"], "");
        assert_eq!(json["generated_text"], "Hello world");
        assert_eq!(json["inference_time_seconds"], 0.25);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn failed_final_frame_carries_error() {
        let mut failed = result();
        failed.record_failure(&GenerationFailure::Backend(BackendError::Cancelled));
        let json: serde_json::Value =
            serde_json::from_str(&frame(&StreamEvent::Final(failed))).unwrap();
        assert_eq!(json["generated_text"], "");
        assert_eq!(json["error"], "generation was cancelled");
    }
}
