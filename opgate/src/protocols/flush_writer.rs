//! Framing of streamed responses.
//!
//! Every payload goes through the post-resolve transformer and the post-resolve hooks of
//! subscriptions, then deduplication against the previous payload, then JSON Patch
//! compression, before it is framed for the wire:
//!
//! * raw framing: `<json>\n\n`
//! * server-sent events: `data: <json>\n\n`, terminated by `event: done\n\n`
//!
//! While the stream is idle a single `\n` is flushed every ping interval to keep
//! intermediaries from closing the connection.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use http::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::json_patch;
use super::sink::ResponseSink;
use crate::error::StreamError;
use crate::context::ResolveContext;
use crate::graphql;
use crate::hooks::HookPipeline;
use crate::hooks::TerminalResponder;
use crate::operation::PatchMode;
use crate::operation::RequestParams;
use crate::transform::PostResolveTransformer;

const SSE_DATA_PREFIX: &[u8] = b"data: ";
const SSE_DONE: &[u8] = b"event: done\n\n";
const MESSAGE_SEPARATOR: &[u8] = b"\n\n";
const PING: &[u8] = b"\n";

/// How payloads are framed and compressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushWriterOptions {
    pub sse: bool,
    pub subscribe_once: bool,
    pub json_patch: PatchMode,
    pub deduplicate: bool,
    /// Keep-alive interval, `None` disables pings
    pub ping_interval: Option<Duration>,
}

impl FlushWriterOptions {
    pub fn new(params: &RequestParams, ping_interval: Option<Duration>) -> Self {
        Self {
            sse: params.sse,
            subscribe_once: params.subscribe_once,
            json_patch: params.json_patch,
            deduplicate: params.deduplicate,
            ping_interval,
        }
    }
}

struct WriterState<S> {
    sink: Option<S>,
    /// Last payload written, before patch compression
    last_message: Option<Bytes>,
    last_activity: Instant,
    closed: bool,
}

impl<S: ResponseSink> WriterState<S> {
    async fn write_frame(&mut self, frame: &[u8]) -> Result<(), StreamError> {
        let Some(sink) = self.sink.as_mut() else {
            return Err(StreamError::ConnectionClosed);
        };
        sink.write(frame).await?;
        sink.flush().await?;
        self.last_activity = Instant::now();
        Ok(())
    }
}

struct PostResolveHooks {
    pipeline: Arc<HookPipeline>,
    ctx: Mutex<ResolveContext>,
}

/// Writes the messages of one streaming response.
///
/// Clones share the same connection. Writes are serialized, and the keep-alive task
/// never interleaves a ping with a message.
pub struct FlushWriter<S: ResponseSink> {
    state: Arc<Mutex<WriterState<S>>>,
    options: FlushWriterOptions,
    transformer: Option<Arc<PostResolveTransformer>>,
    hooks: Option<Arc<PostResolveHooks>>,
    done: CancellationToken,
}

impl<S: ResponseSink> Clone for FlushWriter<S> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            options: self.options,
            transformer: self.transformer.clone(),
            hooks: self.hooks.clone(),
            done: self.done.clone(),
        }
    }
}

impl<S: ResponseSink> std::fmt::Debug for FlushWriter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushWriter")
            .field("options", &self.options)
            .finish()
    }
}

impl<S: ResponseSink> FlushWriter<S> {
    /// Wraps `sink`, starting the keep-alive task when pings are enabled.
    ///
    /// The keep-alive task stops when the writer is closed or when `scope` is cancelled.
    pub fn new(
        sink: S,
        options: FlushWriterOptions,
        transformer: Option<Arc<PostResolveTransformer>>,
        scope: &CancellationToken,
    ) -> Result<Self, StreamError> {
        if !sink.supports_flush() {
            return Err(StreamError::NotFlushable);
        }
        let writer = Self {
            state: Arc::new(Mutex::new(WriterState {
                sink: Some(sink),
                last_message: None,
                last_activity: Instant::now(),
                closed: false,
            })),
            options,
            transformer,
            hooks: None,
            done: scope.child_token(),
        };
        if let Some(interval) = options.ping_interval.filter(|i| !i.is_zero()) {
            tokio::spawn(writer.clone().keep_alive(interval));
        }
        Ok(writer)
    }

    /// Runs the post-resolve hooks of `pipeline` on every payload before it is written.
    pub fn with_post_resolve_hooks(mut self, pipeline: Arc<HookPipeline>, ctx: ResolveContext) -> Self {
        self.hooks = Some(Arc::new(PostResolveHooks {
            pipeline,
            ctx: Mutex::new(ctx),
        }));
        self
    }

    /// Writes one payload.
    ///
    /// Payloads equal to the previous one are skipped when deduplication is on, and so
    /// are payloads whose patch against the previous one is empty.
    pub async fn write(&self, payload: Bytes) -> Result<(), StreamError> {
        let payload = match &self.transformer {
            Some(transformer) => transformer.transform(&payload)?,
            None => payload,
        };
        let payload = match &self.hooks {
            Some(hooks) => {
                let mut ctx = hooks.ctx.lock().await;
                match hooks.pipeline.post_resolve(&mut ctx, self, payload.clone()).await {
                    Ok(response) if response.done => return Ok(()),
                    Ok(response) => response.data,
                    Err(error) if error.is_cancelled() => return Ok(()),
                    Err(error) => {
                        tracing::error!(%error, "postResolve hooks failed, sending the payload unchanged");
                        payload
                    }
                }
            }
            None => payload,
        };

        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StreamError::ConnectionClosed);
        }
        if self.options.deduplicate && state.last_message.as_ref() == Some(&payload) {
            tracing::trace!("skipping duplicate payload");
            return Ok(());
        }

        let body = match (&state.last_message, self.options.json_patch) {
            (Some(previous), PatchMode::Enabled | PatchMode::Forced) => {
                match json_patch::create(previous, &payload) {
                    Ok(None) => return Ok(()),
                    Ok(Some(patch))
                        if self.options.json_patch == PatchMode::Forced
                            || patch.len() < payload.len() =>
                    {
                        patch
                    }
                    Ok(Some(_)) => payload.clone(),
                    Err(error) => {
                        tracing::warn!(%error, "could not create json patch, sending the full payload");
                        payload.clone()
                    }
                }
            }
            _ => payload.clone(),
        };

        let frame = self.frame(&body, !self.options.subscribe_once || self.options.sse);
        let written = state.write_frame(&frame).await;
        state.last_message = Some(payload);
        written?;

        if self.options.subscribe_once {
            self.close_locked(&mut state).await;
        }
        Ok(())
    }

    /// Writes a GraphQL error envelope as the last message of the stream, then closes it.
    pub async fn write_error(&self, message: &str) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        let envelope = graphql::Response::from_message(message).to_bytes();
        let frame = self.frame(&envelope, true);
        if let Err(error) = state.write_frame(&frame).await {
            tracing::debug!(%error, "could not write error to the client");
        }
        self.close_locked(&mut state).await;
    }

    /// Ends the stream. Closing twice does nothing.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state).await;
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    fn frame(&self, body: &[u8], separator: bool) -> Bytes {
        let mut frame = BytesMut::with_capacity(body.len() + 8);
        if self.options.sse {
            frame.put_slice(SSE_DATA_PREFIX);
        }
        frame.put_slice(body);
        if separator {
            frame.put_slice(MESSAGE_SEPARATOR);
        }
        frame.freeze()
    }

    async fn close_locked(&self, state: &mut WriterState<S>) {
        if state.closed {
            return;
        }
        state.closed = true;
        self.done.cancel();
        if self.options.sse {
            if let Err(error) = state.write_frame(SSE_DONE).await {
                tracing::debug!(%error, "could not write the end of the stream");
            }
        }
        state.sink = None;
    }

    async fn keep_alive(self, interval: Duration) {
        loop {
            let deadline = {
                let state = self.state.lock().await;
                if state.closed {
                    return;
                }
                state.last_activity + interval
            };
            tokio::select! {
                _ = self.done.cancelled() => return,
                _ = tokio::time::sleep_until(deadline) => {}
            }
            // a message being written resets the timer anyway
            let Ok(mut state) = self.state.try_lock() else {
                continue;
            };
            if state.closed {
                return;
            }
            if state.last_activity + interval > Instant::now() {
                continue;
            }
            if let Err(error) = state.write_frame(PING).await {
                tracing::debug!(%error, "keep-alive failed, stopping");
                return;
            }
        }
    }
}

#[async_trait]
impl<S: ResponseSink> TerminalResponder for FlushWriter<S> {
    async fn respond(&self, status: StatusCode, message: &str) {
        tracing::debug!(%status, message, "ending stream with a terminal response");
        self.write_error(message).await;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use http::HeaderMap;
    use http::Method;
    use http::Uri;

    use super::*;
    use crate::context::ClientRequest;
    use crate::error::HookError;
    use crate::hooks::MiddlewareHook;
    use crate::hooks::MockHookCaller;
    use crate::operation::Operation;
    use crate::operation::OperationHooks;
    use crate::operation::OperationKind;
    use crate::protocols::sink::test_support::RecordingSink;
    use crate::transform::PostResolveTransformation;

    const ME_0: &[u8] = br#"{"response":{"data":{"me":{"name":"Jens","bio":"Founder & CEO of WunderGraph","counter":0}}}}"#;
    const ME_1: &[u8] = br#"{"response":{"data":{"me":{"name":"Jens","bio":"Founder & CEO of WunderGraph","counter":1}}}}"#;

    fn new_writer(options: FlushWriterOptions) -> (RecordingSink, FlushWriter<RecordingSink>) {
        let sink = RecordingSink::new();
        let writer = FlushWriter::new(sink.clone(), options, None, &CancellationToken::new())
            .unwrap();
        (sink, writer)
    }

    #[tokio::test]
    async fn raw_messages_are_separated_by_blank_lines() {
        let (sink, writer) = new_writer(FlushWriterOptions::default());
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        writer.write(Bytes::from_static(ME_1)).await.unwrap();
        writer.close().await;

        insta::assert_snapshot!(sink.output().trim_end(), @r###"
        {"response":{"data":{"me":{"name":"Jens","bio":"Founder & CEO of WunderGraph","counter":0}}}}

        {"response":{"data":{"me":{"name":"Jens","bio":"Founder & CEO of WunderGraph","counter":1}}}}

        "###);
    }

    #[tokio::test]
    async fn server_sent_events_with_json_patch() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            sse: true,
            json_patch: PatchMode::Enabled,
            ..Default::default()
        });
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        writer.write(Bytes::from_static(ME_1)).await.unwrap();
        writer.close().await;

        insta::assert_snapshot!(sink.output().trim_end(), @r###"
        data: {"response":{"data":{"me":{"name":"Jens","bio":"Founder & CEO of WunderGraph","counter":0}}}}

        data: [{"op":"replace","path":"/response/data/me/counter","value":1}]

        event: done

        "###);
    }

    #[tokio::test]
    async fn full_payload_wins_when_smaller_than_the_patch() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            json_patch: PatchMode::Enabled,
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        writer.write(Bytes::from_static(br#"{"b":2}"#)).await.unwrap();
        assert_eq!(sink.frames()[1], Bytes::from_static(b"{\"b\":2}\n\n"));
    }

    #[tokio::test]
    async fn forced_patches_are_sent_regardless_of_size() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            json_patch: PatchMode::Forced,
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        writer.write(Bytes::from_static(br#"{"b":2}"#)).await.unwrap();

        let patch: ::json_patch::Patch =
            serde_json::from_slice(sink.frames()[1].trim_ascii_end()).unwrap();
        let mut patched = serde_json::json!({"a": 1});
        ::json_patch::patch(&mut patched, &patch).unwrap();
        assert_eq!(patched, serde_json::json!({"b": 2}));
    }

    #[tokio::test]
    async fn empty_patches_are_not_written() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            json_patch: PatchMode::Enabled,
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        writer.write(Bytes::from_static(br#"{ "a": 1 }"#)).await.unwrap();
        assert_eq!(sink.frames().len(), 1);
    }

    #[tokio::test]
    async fn duplicates_are_skipped() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            deduplicate: true,
            ..Default::default()
        });
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        writer.write(Bytes::from_static(ME_1)).await.unwrap();
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        assert_eq!(sink.frames().len(), 3);

        // without deduplication every payload is written
        let (sink, writer) = new_writer(FlushWriterOptions::default());
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        writer.write(Bytes::from_static(ME_0)).await.unwrap();
        assert_eq!(sink.frames().len(), 2);
    }

    #[tokio::test]
    async fn payloads_are_transformed_before_deduplication() {
        let transformer = PostResolveTransformer::new(vec![PostResolveTransformation::Get {
            from: vec!["data".into(), "me".into(), "name".into()],
            to: vec!["data".into(), "me".into()],
        }]);
        let sink = RecordingSink::new();
        let writer = FlushWriter::new(
            sink.clone(),
            FlushWriterOptions {
                deduplicate: true,
                ..Default::default()
            },
            Some(Arc::new(transformer)),
            &CancellationToken::new(),
        )
        .unwrap();
        writer
            .write(Bytes::from_static(br#"{"data":{"me":{"name":"Jens","counter":0}}}"#))
            .await
            .unwrap();
        writer
            .write(Bytes::from_static(br#"{"data":{"me":{"name":"Jens","counter":1}}}"#))
            .await
            .unwrap();

        insta::assert_snapshot!(sink.output().trim_end(), @r###"
        {"data":{"me":"Jens"}}

        "###);
    }

    #[tokio::test]
    async fn subscribe_once_closes_after_the_first_message() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            subscribe_once: true,
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        assert!(writer.is_closed().await);
        assert!(matches!(
            writer.write(Bytes::from_static(br#"{"a":2}"#)).await,
            Err(StreamError::ConnectionClosed)
        ));
        assert_eq!(sink.output(), r#"{"a":1}"#);

        let (sink, writer) = new_writer(FlushWriterOptions {
            subscribe_once: true,
            sse: true,
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        assert_eq!(sink.output(), "data: {\"a\":1}\n\nevent: done\n\n");
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            sse: true,
            ..Default::default()
        });
        writer.close().await;
        writer.clone().close().await;
        assert_eq!(sink.output(), "event: done\n\n");
    }

    #[tokio::test]
    async fn terminal_responses_are_written_in_band() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            sse: true,
            json_patch: PatchMode::Forced,
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        writer
            .respond(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            .await;
        assert!(writer.is_closed().await);

        insta::assert_snapshot!(sink.output().trim_end(), @r###"
        data: {"a":1}

        data: {"errors":[{"message":"Internal Server Error"}]}

        event: done

        "###);
    }

    #[tokio::test]
    async fn sinks_must_support_flushing() {
        let result = FlushWriter::new(
            RecordingSink::not_flushable(),
            FlushWriterOptions::default(),
            None,
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(StreamError::NotFlushable)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_streams_are_kept_alive() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            deduplicate: true,
            ping_interval: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.output(), "{\"a\":1}\n\n\n\n");

        // pings leave the deduplication baseline alone
        writer.write(Bytes::from_static(br#"{"a":1}"#)).await.unwrap();
        writer.write(Bytes::from_static(br#"{"a":2}"#)).await.unwrap();
        assert_eq!(sink.output(), "{\"a\":1}\n\n\n\n{\"a\":2}\n\n");

        writer.close().await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sink.frames().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_postpone_pings() {
        let (sink, writer) = new_writer(FlushWriterOptions {
            ping_interval: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        for n in 0..4 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            writer.write(Bytes::from(format!("{{\"n\":{n}}}"))).await.unwrap();
        }
        assert!(sink.frames().iter().all(|frame| frame.as_ref() != PING));
        writer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pings_stop_with_their_scope() {
        let scope = CancellationToken::new();
        let sink = RecordingSink::new();
        let _writer = FlushWriter::new(
            sink.clone(),
            FlushWriterOptions {
                ping_interval: Some(Duration::from_millis(50)),
                ..Default::default()
            },
            None,
            &scope,
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.frames().len(), 1);

        scope.cancel();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(sink.frames().len(), 1);
    }

    fn subscription_writer(client: MockHookCaller) -> (RecordingSink, FlushWriter<RecordingSink>) {
        let operation = Operation::builder()
            .name("Counter")
            .kind(OperationKind::Subscription)
            .content("subscription Counter { counter }")
            .hooks(OperationHooks {
                mutating_post_resolve: true,
                ..Default::default()
            })
            .build();
        let pipeline = HookPipeline::new(Some(Arc::new(client)), Arc::new(operation), None);
        let ctx = ResolveContext::new(
            Bytes::new(),
            CancellationToken::new(),
            ClientRequest::new(
                Method::GET,
                Uri::from_static("/operations/Counter"),
                HeaderMap::new(),
            ),
        );
        let (sink, writer) = new_writer(FlushWriterOptions::default());
        (sink, writer.with_post_resolve_hooks(Arc::new(pipeline), ctx))
    }

    #[tokio::test]
    async fn subscription_payloads_run_post_resolve_hooks() {
        let mut calls = 0;
        let mut client = MockHookCaller::new();
        client
            .expect_call()
            .withf(|request| request.hook == MiddlewareHook::MutatingPostResolve)
            .times(2)
            .returning(move |request| {
                calls += 1;
                if calls == 1 {
                    Ok(Some(
                        serde_json::from_str(r#"{"response":{"data":{"counter":100}}}"#).unwrap(),
                    ))
                } else {
                    Err(HookError::Timeout { hook: request.hook })
                }
            });
        let (sink, writer) = subscription_writer(client);

        writer
            .write(Bytes::from_static(br#"{"data":{"counter":1}}"#))
            .await
            .unwrap();
        // a failing hook leaves the payload as it is
        writer
            .write(Bytes::from_static(br#"{"data":{"counter":2}}"#))
            .await
            .unwrap();

        insta::assert_snapshot!(sink.output().trim_end(), @r###"
        {"data":{"counter":100}}

        {"data":{"counter":2}}
        "###);
    }

    #[tokio::test]
    async fn subscription_hooks_without_response_end_the_stream() {
        let mut client = MockHookCaller::new();
        client.expect_call().times(1).returning(|_| Ok(None));
        let (sink, writer) = subscription_writer(client);

        writer
            .write(Bytes::from_static(br#"{"data":{"counter":1}}"#))
            .await
            .unwrap();
        assert!(writer.is_closed().await);
        assert_eq!(
            sink.output(),
            "{\"errors\":[{\"message\":\"Internal Server Error\"}]}\n\n"
        );
    }
}
