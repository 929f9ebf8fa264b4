use std::sync::Arc;

use futures_util::StreamExt;
use lmgate_middleware::{Flow, MiddlewareManager};
use lmgate_model::{merge_tool_calls, Context, Delta, DeltaStream, ResponseBody, WorkerError};

/// Folds one arriving Delta into the running `ctx.metadata.stream_content`
/// accumulator. Only `Delta::Text` accumulates — image/audio/video/embedding
/// chunks pass through untouched. Grounded on
/// `engine.py::Engine._stream_warpper`'s `stream_content`/`stream_reasoning`
/// concatenation, generalized to also merge `tool_calls` by index the way
/// `fold_text_stream` does for the non-streaming fold.
fn accumulate(existing: &mut Option<Delta>, delta: &Delta) {
    let Delta::Text {
        content,
        reasoning_content,
        tool_calls,
    } = delta
    else {
        return;
    };

    let entry = existing.get_or_insert_with(|| Delta::Text {
        content: Some(String::new()),
        reasoning_content: Some(String::new()),
        tool_calls: None,
    });

    let Delta::Text {
        content: acc_content,
        reasoning_content: acc_reasoning,
        tool_calls: acc_calls,
    } = entry
    else {
        return;
    };

    if let Some(c) = content {
        acc_content.get_or_insert_with(String::new).push_str(c);
    }
    if let Some(r) = reasoning_content {
        acc_reasoning.get_or_insert_with(String::new).push_str(r);
    }
    if let Some(t) = tool_calls {
        merge_tool_calls(acc_calls.get_or_insert_with(Vec::new), t.clone());
    }
}

/// Wraps a Worker's raw Delta stream with per-chunk middleware interception
/// and the `stream_content` accumulator, owning the Context for the
/// lifetime of the stream. Grounded on `engine.py::Engine._stream_warpper`'s
/// `generate()` inner async generator.
///
/// `ctx` is moved in rather than borrowed: the returned stream is `'static`
/// (axum response bodies must be), and by the time a streaming Response has
/// been produced the original caller has nothing further to do with the
/// Context — everything left to do (accumulate, intercept, possibly splice
/// in a tool-call follow-up) happens lazily as the body is polled.
///
/// A `Termination` raised by `per_chunk` (the Tools middleware, on seeing a
/// completed `<tool_calls>` block) must itself carry a stream body — that
/// follow-up stream is spliced in and the upstream is abandoned, matching
/// the original's `async for delta in e.response.body: yield delta`.
pub fn passthrough(
    mut ctx: Context,
    middleware: Arc<MiddlewareManager>,
    mut upstream: DeltaStream,
) -> DeltaStream {
    let stream = async_stream::try_stream! {
        while let Some(item) = upstream.next().await {
            let mut delta = item?;
            accumulate(&mut ctx.metadata.stream_content, &delta);

            match middleware.per_chunk(&mut ctx, &mut delta).await {
                Ok(Flow::Continue) => yield delta,
                Ok(Flow::Stop) => continue,
                Err(termination) => {
                    match termination.response.body {
                        ResponseBody::Stream(mut replacement) => {
                            while let Some(next) = replacement.next().await {
                                yield next?;
                            }
                        }
                        _ => {
                            let fatal: Result<(), WorkerError> = Err(WorkerError::Fatal(
                                "middleware termination during streaming carried no stream body"
                                    .to_string(),
                            ));
                            fatal?;
                        }
                    }
                    break;
                }
            }
        }
    };
    Box::pin(stream)
}
