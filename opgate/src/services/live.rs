//! Live queries: a query re-executed on a timer, streaming only the results that changed.
use std::time::Duration;

use bytes::Bytes;
use tracing::Instrument;

use super::resolver::Resolver;
use crate::context::ResolveContext;
use crate::error::StreamError;
use crate::hooks::HookPipeline;
use crate::protocols::FlushWriter;
use crate::protocols::ResponseSink;

/// Drives one live query until the client goes away, a hook fails, or the writer is closed.
pub struct LiveQuery<'a, R: Resolver> {
    pipeline: &'a HookPipeline,
    resolver: &'a R,
    plan: &'a R::Plan,
    polling_interval: Duration,
}

impl<'a, R: Resolver> LiveQuery<'a, R> {
    pub fn new(
        pipeline: &'a HookPipeline,
        resolver: &'a R,
        plan: &'a R::Plan,
        polling_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            resolver,
            plan,
            polling_interval,
        }
    }

    /// Runs the loop. The first execution happens immediately.
    ///
    /// Every execution starts from the variables `ctx` had on entry. Results equal to the
    /// last one written are not handed to the writer.
    pub async fn run<S: ResponseSink>(&self, ctx: &mut ResolveContext, writer: &FlushWriter<S>) {
        let variables = ctx.variables.clone();
        let cancel = ctx.cancel.clone();
        let mut last_payload: Option<Bytes> = None;
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("client disconnected, stopping live query");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = self.polling_interval;

            ctx.variables = variables.clone();
            let result = self
                .pipeline
                .run(ctx, writer, self.resolver, self.plan)
                .instrument(tracing::debug_span!("live_query_tick"))
                .await;
            let response = match result {
                Ok(response) if response.done => return,
                Ok(response) => response,
                Err(error) if error.is_cancelled() => {
                    tracing::debug!("live query cancelled");
                    return;
                }
                Err(error) => {
                    tracing::error!(
                        "operation.name" = %self.pipeline.operation().name,
                        "live query failed: {error}"
                    );
                    writer.write_error(&error.to_string()).await;
                    return;
                }
            };

            if last_payload.as_ref() == Some(&response.data) {
                continue;
            }
            match writer.write(response.data.clone()).await {
                Ok(()) => {}
                Err(StreamError::ConnectionClosed) => {
                    tracing::debug!("connection closed, stopping live query");
                    return;
                }
                Err(error) => {
                    tracing::error!(
                        "operation.name" = %self.pipeline.operation().name,
                        "could not write live query result: {error}"
                    );
                    writer.write_error(&error.to_string()).await;
                    return;
                }
            }
            last_payload = Some(response.data);
            if writer.is_closed().await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use http::HeaderMap;
    use http::Method;
    use http::Uri;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::context::ClientRequest;
    use crate::error::HookError;
    use crate::hooks::HookCaller;
    use crate::hooks::MiddlewareHook;
    use crate::hooks::MockHookCaller;
    use crate::operation::Operation;
    use crate::operation::OperationHooks;
    use crate::operation::OperationKind;
    use crate::protocols::FlushWriterOptions;
    use crate::protocols::sink::test_support::RecordingSink;
    use crate::services::resolver::MockEngine;

    const X: &[u8] = br#"{"data":{"me":{"name":"Jens"}}}"#;
    const Y: &[u8] = br#"{"data":{"me":{"name":"Stefan"}}}"#;

    fn pipeline(hooks: OperationHooks, client: Option<MockHookCaller>) -> HookPipeline {
        let operation = Operation::builder()
            .name("Me")
            .kind(OperationKind::Query)
            .content("query Me { me { name } }")
            .hooks(hooks)
            .build();
        HookPipeline::new(
            client.map(|client| Arc::new(client) as Arc<dyn HookCaller>),
            Arc::new(operation),
            None,
        )
    }

    fn context(cancel: &CancellationToken) -> ResolveContext {
        ResolveContext::new(
            Bytes::from_static(br#"{"id":1}"#),
            cancel.clone(),
            ClientRequest::new(
                Method::GET,
                Uri::from_static("/operations/Me?wg_live"),
                HeaderMap::new(),
            ),
        )
    }

    fn recording_writer(
        options: FlushWriterOptions,
        cancel: &CancellationToken,
    ) -> (RecordingSink, FlushWriter<RecordingSink>) {
        let sink = RecordingSink::new();
        let writer = FlushWriter::new(sink.clone(), options, None, cancel).unwrap();
        (sink, writer)
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn unchanged_results_are_not_written() {
        let mut engine = MockEngine::new();
        let mut ticks = 0;
        engine.expect_resolve().times(3).returning(move |_, _| {
            ticks += 1;
            Ok(Bytes::from_static(if ticks < 3 { X } else { Y }))
        });
        let pipeline = pipeline(OperationHooks::default(), None);
        let cancel = CancellationToken::new();
        let (sink, writer) = recording_writer(FlushWriterOptions::default(), &cancel);
        let mut ctx = context(&cancel);

        let plan = String::new();
        let live = LiveQuery::new(&pipeline, &engine, &plan, Duration::from_secs(1));
        tokio::join!(live.run(&mut ctx, &writer), async {
            tokio::time::sleep(Duration::from_millis(2500)).await;
            cancel.cancel();
        });

        assert_eq!(
            sink.frames(),
            vec![
                Bytes::from(format!("{}\n\n", std::str::from_utf8(X).unwrap())),
                Bytes::from(format!("{}\n\n", std::str::from_utf8(Y).unwrap())),
            ]
        );
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn every_tick_starts_from_the_request_variables() {
        let mut client = MockHookCaller::new();
        client
            .expect_call()
            .withf(|request| {
                request.hook == MiddlewareHook::MutatingPreResolve
                    && request.envelope.input.as_ref().map(|i| i.get()) == Some(r#"{"id":1}"#)
            })
            .times(2)
            .returning(|_| Ok(Some(serde_json::from_str(r#"{"input":{"id":2}}"#).unwrap())));
        let mut engine = MockEngine::new();
        engine
            .expect_resolve()
            .withf(|ctx, _| ctx.variables == Bytes::from_static(br#"{"id":2}"#))
            .times(2)
            .returning(|_, _| Ok(Bytes::from_static(X)));
        let pipeline = pipeline(
            OperationHooks {
                mutating_pre_resolve: true,
                ..Default::default()
            },
            Some(client),
        );
        let cancel = CancellationToken::new();
        let (_sink, writer) = recording_writer(FlushWriterOptions::default(), &cancel);
        let mut ctx = context(&cancel);

        let plan = String::new();
        let live = LiveQuery::new(&pipeline, &engine, &plan, Duration::from_secs(1));
        tokio::join!(live.run(&mut ctx, &writer), async {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            cancel.cancel();
        });
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn hook_failures_end_the_stream_in_band() {
        let mut client = MockHookCaller::new();
        client
            .expect_call()
            .times(1)
            .returning(|request| Err(HookError::Timeout { hook: request.hook }));
        let mut engine = MockEngine::new();
        engine.expect_resolve().times(0);
        let pipeline = pipeline(
            OperationHooks {
                mutating_pre_resolve: true,
                ..Default::default()
            },
            Some(client),
        );
        let cancel = CancellationToken::new();
        let (sink, writer) = recording_writer(
            FlushWriterOptions {
                sse: true,
                ..Default::default()
            },
            &cancel,
        );

        let plan = String::new();
        let live = LiveQuery::new(&pipeline, &engine, &plan, Duration::from_secs(1));
        live.run(&mut context(&cancel), &writer).await;

        assert!(writer.is_closed().await);
        insta::assert_snapshot!(sink.output().trim_end(), @r###"
        data: {"errors":[{"message":"preResolve hooks failed: hook mutatingPreResolve timed out"}]}

        event: done
        "###);
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn cancelled_clients_get_nothing() {
        let mut engine = MockEngine::new();
        engine.expect_resolve().times(0);
        let pipeline = pipeline(OperationHooks::default(), None);
        let cancel = CancellationToken::new();
        let (sink, writer) = recording_writer(FlushWriterOptions::default(), &cancel);
        cancel.cancel();

        let plan = String::new();
        let live = LiveQuery::new(&pipeline, &engine, &plan, Duration::from_secs(1));
        live.run(&mut context(&cancel), &writer).await;
        assert!(sink.frames().is_empty());
    }

    #[test_log::test(tokio::test(start_paused = true))]
    async fn subscribe_once_stops_after_the_first_write() {
        let mut engine = MockEngine::new();
        engine
            .expect_resolve()
            .times(1)
            .returning(|_, _| Ok(Bytes::from_static(X)));
        let pipeline = pipeline(OperationHooks::default(), None);
        let cancel = CancellationToken::new();
        let (sink, writer) = recording_writer(
            FlushWriterOptions {
                subscribe_once: true,
                ..Default::default()
            },
            &cancel,
        );

        let plan = String::new();
        let live = LiveQuery::new(&pipeline, &engine, &plan, Duration::from_secs(1));
        live.run(&mut context(&cancel), &writer).await;
        assert_eq!(sink.frames(), vec![Bytes::from_static(X)]);
    }
}
