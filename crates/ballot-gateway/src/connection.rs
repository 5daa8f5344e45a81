//! Per-connection state: outbound queue and in-flight answers

use std::collections::HashMap;

use async_trait::async_trait;
use ballot_core::{ChannelClosed, OutputChannel, PipelineEvent};
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::GatewayEvent;

/// One WebSocket client.
///
/// Answers started on the connection get child tokens of `shutdown`, so
/// closing the connection cancels every one of them.
pub struct Connection {
    outbound: mpsc::Sender<String>,
    shutdown: CancellationToken,
    answers: Mutex<HashMap<String, CancellationToken>>,
}

impl Connection {
    pub fn new(outbound: mpsc::Sender<String>) -> Self {
        Self {
            outbound,
            shutdown: CancellationToken::new(),
            answers: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a JSON message for the client
    pub async fn send<T: Serialize>(&self, message: &T) -> Result<(), ChannelClosed> {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to serialize outbound message: {}", e);
                return Ok(());
            }
        };
        self.outbound.send(text).await.map_err(|_| ChannelClosed)
    }

    /// Register an answer and get the token that cancels it
    pub async fn begin_answer(&self, request_id: &str) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.answers
            .lock()
            .await
            .insert(request_id.to_string(), token.clone());
        token
    }

    pub async fn finish_answer(&self, request_id: &str) {
        self.answers.lock().await.remove(request_id);
    }

    /// Returns false if no such answer is in flight
    pub async fn cancel_answer(&self, request_id: &str) -> bool {
        match self.answers.lock().await.get(request_id) {
            Some(token) => {
                debug!("Cancelling answer {}", request_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.answers.lock().await.len()
    }

    /// Cancel everything still running on this connection
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl OutputChannel for Connection {
    async fn emit(&self, event: PipelineEvent) -> Result<(), ChannelClosed> {
        self.send(&GatewayEvent::from(&event)).await
    }
}
