//! Relays generated fragments to the caller's output channel
//!
//! Every response ends with exactly one terminal event unless the channel
//! itself is gone. Sequence numbers are contiguous from 0, the terminal
//! event included.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::providers::FragmentStream;
use crate::types::{ChunkEvent, ModelDescriptor, PipelineEvent, RetrievedDocument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("output channel closed")]
pub struct ChannelClosed;

/// Where pipeline events go: a websocket connection, a CLI printer, a test
#[async_trait]
pub trait OutputChannel: Send + Sync {
    async fn emit(&self, event: PipelineEvent) -> Result<(), ChannelClosed>;
}

#[async_trait]
impl OutputChannel for mpsc::Sender<PipelineEvent> {
    async fn emit(&self, event: PipelineEvent) -> Result<(), ChannelClosed> {
        self.send(event).await.map_err(|_| ChannelClosed)
    }
}

/// What happened while relaying one response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    /// Concatenation of every relayed fragment
    pub text: String,
    /// Partial chunks emitted, not counting the terminal event
    pub chunks: u64,
    /// Mid-stream failure, if any
    pub error: Option<String>,
    /// Stopped early by cancellation or a closed channel
    pub cancelled: bool,
}

pub struct StreamDispatcher<'a> {
    request_id: String,
    channel: &'a dyn OutputChannel,
    cancel: CancellationToken,
    next_seq: u64,
}

impl<'a> StreamDispatcher<'a> {
    pub const CANCELLED: &'static str = "cancelled";
    /// How long a cancelled request waits on a full channel to deliver its terminal event
    pub const TERMINAL_GRACE: Duration = Duration::from_secs(1);

    pub fn new(
        request_id: impl Into<String>,
        channel: &'a dyn OutputChannel,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            channel,
            cancel,
            next_seq: 0,
        }
    }

    /// Emit the reranked sources. Sent once per request. Fails when the
    /// channel is closed, or when the request is cancelled while the
    /// channel is full.
    pub async fn sources_ready(
        &self,
        documents: Vec<RetrievedDocument>,
    ) -> Result<(), ChannelClosed> {
        let event = PipelineEvent::SourcesReady {
            request_id: self.request_id.clone(),
            documents,
        };
        self.emit_unless_cancelled(event).await.unwrap_or(Err(ChannelClosed))
    }

    /// `None` when the request was cancelled before the channel took the event
    async fn emit_unless_cancelled(&self, event: PipelineEvent) -> Option<Result<(), ChannelClosed>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            sent = self.channel.emit(event) => Some(sent),
        }
    }

    /// Deliver the terminal event. Once the request is cancelled a stalled
    /// reader gets `TERMINAL_GRACE` to take it before the channel counts as gone.
    async fn emit_terminal(&self, terminal: ChunkEvent) -> Result<(), ChannelClosed> {
        let mut emit = self.channel.emit(PipelineEvent::Chunk(terminal));
        tokio::select! {
            biased;
            sent = &mut emit => return sent,
            _ = self.cancel.cancelled() => {}
        }
        tokio::time::timeout(Self::TERMINAL_GRACE, emit)
            .await
            .unwrap_or(Err(ChannelClosed))
    }

    /// Pull fragments until the stream ends, fails, or the request is
    /// cancelled. The stream is dropped before the terminal event is sent,
    /// which releases the provider call.
    pub async fn relay(mut self, mut fragments: FragmentStream, model: &ModelDescriptor) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut channel_closed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                next = fragments.next() => next,
            };

            match next {
                Some(Ok(fragment)) => {
                    let chunk = ChunkEvent::partial(&self.request_id, self.next_seq, fragment.clone());
                    match self.emit_unless_cancelled(PipelineEvent::Chunk(chunk)).await {
                        Some(Ok(())) => {}
                        Some(Err(ChannelClosed)) => {
                            report.cancelled = true;
                            channel_closed = true;
                            break;
                        }
                        // cancelled while the channel was full
                        None => {
                            report.cancelled = true;
                            break;
                        }
                    }
                    report.text.push_str(&fragment);
                    self.next_seq += 1;
                    report.chunks += 1;
                }
                Some(Err(e)) => {
                    report.error = Some(e.to_string());
                    break;
                }
                None => break,
            }
        }
        drop(fragments);

        if channel_closed {
            debug!(
                "Channel for {} closed after {} chunks, generation released",
                self.request_id, report.chunks
            );
            return report;
        }

        let error = if report.cancelled {
            debug!("Request {} cancelled after {} chunks", self.request_id, report.chunks);
            Some(Self::CANCELLED.to_string())
        } else {
            report.error.clone()
        };
        let terminal = ChunkEvent::terminal(
            &self.request_id,
            self.next_seq,
            report.text.clone(),
            error,
            Some(model.label()),
        );
        if self.emit_terminal(terminal).await.is_err() {
            debug!("Terminal event for {} not delivered", self.request_id);
            report.cancelled = true;
        }
        report
    }

    /// Terminal error event for a request whose generation never started
    pub async fn fail(self, error: &str) -> Result<(), ChannelClosed> {
        let terminal = ChunkEvent::terminal(
            &self.request_id,
            self.next_seq,
            String::new(),
            Some(error.to_string()),
            None,
        );
        self.emit_terminal(terminal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::LlmProvider;
    use crate::testing::{Behavior, ScriptedProvider, drain, small};
    use crate::types::{GenerationRequest, Prompt};
    use futures::stream;

    fn chunks(events: &[PipelineEvent]) -> Vec<&ChunkEvent> {
        events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::Chunk(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    fn assert_contiguous(events: &[PipelineEvent]) {
        let chunks = chunks(events);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.seq, i as u64);
        }
        assert_eq!(chunks.iter().filter(|c| c.is_final).count(), 1);
        assert!(chunks.last().unwrap().is_final);
    }

    fn fragment_stream(items: Vec<Result<&str, ProviderError>>) -> FragmentStream {
        stream::iter(
            items
                .into_iter()
                .map(|r| r.map(str::to_string))
                .collect::<Vec<_>>(),
        )
        .boxed()
    }

    #[tokio::test]
    async fn test_relay_numbers_chunks_and_terminates() {
        let (tx, rx) = mpsc::channel(16);
        let model = small("openai", "gpt-4o-mini", 0);
        let report = StreamDispatcher::new("r1", &tx, CancellationToken::new())
            .relay(fragment_stream(vec![Ok("Greens "), Ok("favor "), Ok("rail.")]), &model)
            .await;
        drop(tx);

        assert_eq!(report.text, "Greens favor rail.");
        assert_eq!(report.chunks, 3);
        assert!(!report.cancelled);

        let events = drain(rx).await;
        assert_contiguous(&events);
        let last = chunks(&events).last().copied().unwrap().clone();
        assert_eq!(last.seq, 3);
        assert_eq!(last.text, "Greens favor rail.");
        assert_eq!(last.model.as_deref(), Some("openai/gpt-4o-mini"));
        assert!(last.error.is_none());
    }

    #[tokio::test]
    async fn test_empty_stream_still_terminates() {
        let (tx, rx) = mpsc::channel(4);
        let model = small("openai", "gpt-4o-mini", 0);
        StreamDispatcher::new("r1", &tx, CancellationToken::new())
            .relay(fragment_stream(vec![]), &model)
            .await;
        drop(tx);

        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert_contiguous(&events);
    }

    #[tokio::test]
    async fn test_mid_stream_error_marks_terminal() {
        let (tx, rx) = mpsc::channel(16);
        let model = small("openai", "gpt-4o-mini", 0);
        let report = StreamDispatcher::new("r1", &tx, CancellationToken::new())
            .relay(
                fragment_stream(vec![
                    Ok("partial "),
                    Err(ProviderError::Transient("connection reset".into())),
                    Ok("never"),
                ]),
                &model,
            )
            .await;
        drop(tx);

        assert!(report.error.as_deref().unwrap().contains("connection reset"));
        let events = drain(rx).await;
        assert_contiguous(&events);
        let last = chunks(&events).last().copied().unwrap().clone();
        assert_eq!(last.text, "partial ");
        assert!(last.error.is_some());
    }

    async fn endless(provider: &ScriptedProvider) -> FragmentStream {
        let request = GenerationRequest::new(small("p", "m", 0), Prompt::new("s", "u"));
        provider.stream(&request).await.unwrap()
    }

    #[tokio::test]
    async fn test_closed_channel_releases_stream() {
        let provider = ScriptedProvider::new("p").with("m", Behavior::Endless);
        let fragments = endless(&provider).await;
        let model = small("p", "m", 0);

        let (tx, mut rx) = mpsc::channel(1);
        let reader = async move {
            for _ in 0..3 {
                rx.recv().await;
            }
        };
        let (report, _) = tokio::join!(
            StreamDispatcher::new("r1", &tx, CancellationToken::new()).relay(fragments, &model),
            reader
        );

        assert!(report.cancelled);
        assert_eq!(provider.released(), 1);
    }

    #[tokio::test]
    async fn test_cancel_token_stops_and_reports() {
        let provider = ScriptedProvider::new("p").with("m", Behavior::Endless);
        let fragments = endless(&provider).await;
        let model = small("p", "m", 0);
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::channel(64);
        let reader = async {
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                let done = matches!(&event, PipelineEvent::Chunk(c) if c.is_final);
                events.push(event);
                if events.len() == 2 {
                    cancel.cancel();
                }
                if done {
                    break;
                }
            }
            events
        };
        let (report, events) = tokio::join!(
            StreamDispatcher::new("r1", &tx, cancel.clone()).relay(fragments, &model),
            reader
        );

        assert!(report.cancelled);
        assert_eq!(provider.released(), 1);
        assert_contiguous(&events);
        let last = chunks(&events).last().copied().unwrap().clone();
        assert_eq!(last.error.as_deref(), Some(StreamDispatcher::CANCELLED));
    }

    #[tokio::test]
    async fn test_cancel_while_channel_full_releases_stream() {
        let provider = ScriptedProvider::new("p").with("m", Behavior::Endless);
        let fragments = endless(&provider).await;
        let model = small("p", "m", 0);
        let cancel = CancellationToken::new();

        // nobody reads, so the second chunk waits on a full channel
        let (tx, rx) = mpsc::channel(1);
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            })
        };
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            StreamDispatcher::new("r1", &tx, cancel).relay(fragments, &model),
        )
        .await
        .expect("relay returns once cancelled");
        canceller.await.unwrap();

        assert!(report.cancelled);
        assert_eq!(report.chunks, 1);
        assert_eq!(provider.released(), 1);

        drop(tx);
        let events = drain(rx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], PipelineEvent::Chunk(c) if c.seq == 0 && !c.is_final));
    }

    #[tokio::test]
    async fn test_cancelled_terminal_reaches_slow_reader() {
        let provider = ScriptedProvider::new("p").with("m", Behavior::Endless);
        let fragments = endless(&provider).await;
        let model = small("p", "m", 0);
        let cancel = CancellationToken::new();

        let (tx, mut rx) = mpsc::channel(1);
        let reader = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let mut events = Vec::new();
            while let Some(event) = rx.recv().await {
                let done = matches!(&event, PipelineEvent::Chunk(c) if c.is_final);
                events.push(event);
                if done {
                    break;
                }
            }
            events
        };
        let (report, events) = tokio::join!(
            StreamDispatcher::new("r1", &tx, cancel.clone()).relay(fragments, &model),
            reader
        );

        assert!(report.cancelled);
        assert_eq!(provider.released(), 1);
        assert_contiguous(&events);
        assert_eq!(events.len(), 2);
        let last = chunks(&events).last().copied().unwrap().clone();
        assert_eq!(last.error.as_deref(), Some(StreamDispatcher::CANCELLED));
        assert_eq!(last.text, report.text);
    }

    #[tokio::test]
    async fn test_sources_then_fail() {
        let (tx, rx) = mpsc::channel(4);
        let dispatcher = StreamDispatcher::new("r9", &tx, CancellationToken::new());
        dispatcher.sources_ready(Vec::new()).await.unwrap();
        dispatcher.fail("all providers exhausted").await.unwrap();
        drop(tx);

        let events = drain(rx).await;
        assert_eq!(events[0].name(), "sources.ready");
        assert_eq!(events[1].name(), "answer.complete");
        assert_contiguous(&events);
    }
}
