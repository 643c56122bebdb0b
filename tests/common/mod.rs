// Shared test fixtures — not all items used by every test binary.
#![allow(unused)]

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Once};
use tokio::sync::Mutex;
use toolgate::orchestrator::{LlmRunner, ProtocolMessage, RunEvent, RunRequest, WireSink};

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// LLM runner that replays scripted event sequences, one per run, and
/// records the requests it saw.
pub struct ScriptedRunner {
    scripts: Mutex<VecDeque<Vec<RunEvent>>>,
    pub requests: Mutex<Vec<RunRequest>>,
    pub generated: String,
    pub valid_models: Vec<String>,
}

impl ScriptedRunner {
    pub fn new(scripts: Vec<Vec<RunEvent>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
            generated: "generated stem".to_string(),
            valid_models: vec!["gpt-test".to_string()],
        })
    }

    /// A run that streams `text` in two chunks and completes.
    pub fn simple_response(text: &str) -> Vec<RunEvent> {
        let (first, second) = text.split_at(text.len() / 2);
        vec![
            RunEvent::RunStarted,
            RunEvent::ResponseChunk {
                content: first.to_string(),
            },
            RunEvent::ResponseChunk {
                content: second.to_string(),
            },
            RunEvent::RunCompleted,
        ]
    }
}

#[async_trait]
impl LlmRunner for ScriptedRunner {
    async fn run_stream(&self, request: RunRequest) -> BoxStream<'static, RunEvent> {
        self.requests.lock().await.push(request);
        let events = self
            .scripts
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| vec![RunEvent::RunFailed {
                error: "no scripted response".into(),
            }]);
        Box::pin(futures_util::stream::iter(events))
    }

    async fn generate(&self, _prompt: &str, _model: Option<&str>) -> anyhow::Result<String> {
        Ok(self.generated.clone())
    }

    fn is_valid_model(&self, model: &str) -> bool {
        self.valid_models.iter().any(|m| m == model)
    }
}

/// Wire sink that records every message sent per connection.
#[derive(Default)]
pub struct RecordingWire {
    pub sent: Mutex<Vec<(String, ProtocolMessage)>>,
}

impl RecordingWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn messages(&self) -> Vec<ProtocolMessage> {
        self.sent.lock().await.iter().map(|(_, m)| m.clone()).collect()
    }

    pub async fn of_type(&self, message_type: &str) -> Vec<ProtocolMessage> {
        self.messages()
            .await
            .into_iter()
            .filter(|m| m.message_type == message_type)
            .collect()
    }

    pub async fn types(&self) -> Vec<String> {
        self.messages()
            .await
            .into_iter()
            .map(|m| m.message_type)
            .collect()
    }

    pub async fn last_payload(&self, message_type: &str) -> Option<Value> {
        self.of_type(message_type).await.last().map(|m| m.payload.clone())
    }
}

#[async_trait]
impl WireSink for RecordingWire {
    async fn send(&self, connection_id: &str, message: ProtocolMessage) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((connection_id.to_string(), message));
        Ok(())
    }
}
