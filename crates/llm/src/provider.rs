use std::future::Future;
use std::pin::Pin;

use snafu::Snafu;
use tokio::sync::{mpsc, oneshot};

use mosaic_core::{Role, StreamEvent};

/// Connection settings for one provider instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub api_key: String,
    pub base_url: String,
    pub default_model: Option<String>,
}

impl ProviderConfig {
    pub fn new(
        provider_id: impl Into<String>,
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        default_model: Option<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into().trim().to_string(),
            api_key: api_key.into().trim().to_string(),
            base_url: base_url.into().trim().to_string(),
            default_model,
        }
    }
}

/// One part of an outbound turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text(String),
    InlineImage { data: String, media_type: String },
}

/// One conversational turn in the outbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Creates a turn holding a single text part.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Part::Text(text.into())])
    }
}

/// One streaming generation request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub model_id: String,
    pub turns: Vec<Turn>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl GenerateRequest {
    pub fn new(model_id: impl Into<String>, turns: Vec<Turn>) -> Self {
        Self {
            model_id: model_id.into(),
            turns,
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

pub type ProviderWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;
pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ProviderError {
    #[snafu(display("missing API key for provider '{provider_id}'"))]
    MissingApiKey {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("provider '{provider_id}' is not supported"))]
    UnsupportedProvider {
        stage: &'static str,
        provider_id: String,
    },
    #[snafu(display("generation request has no turns"))]
    EmptyTurnSet { stage: &'static str },
    #[snafu(display("http request failed on `{stage}`, {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("provider returned status {status}: {body}"))]
    UnexpectedStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
}

/// Receiver half of one provider stream plus its cancellation handle.
///
/// Dropping the stream signals cancellation to the worker so abandoned
/// exchanges stop provider IO promptly.
pub struct ProviderEventStream {
    events: mpsc::UnboundedReceiver<StreamEvent>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

/// A live stream paired with the worker future that feeds it.
///
/// The caller spawns the worker on its runtime and consumes the stream; the
/// two halves communicate only through the event channel.
pub struct ProviderStreamHandle {
    pub stream: ProviderEventStream,
    pub worker: ProviderWorker,
}

impl ProviderEventStream {
    fn new(events: mpsc::UnboundedReceiver<StreamEvent>, cancel_tx: oneshot::Sender<()>) -> Self {
        Self {
            events,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Waits for the next event; `None` means the worker is gone.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Signals the worker to stop. Returns false when it already has.
    pub fn cancel(&mut self) -> bool {
        self.cancel_tx
            .take()
            .map(|tx| tx.send(()).is_ok())
            .unwrap_or(false)
    }
}

impl Drop for ProviderEventStream {
    fn drop(&mut self) {
        if let Some(cancel_tx) = self.cancel_tx.take() {
            let _ = cancel_tx.send(());
        }
    }
}

/// A streaming generative model endpoint.
pub trait LlmProvider: Send + Sync {
    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn default_model(&self) -> &str;
    fn stream_generate(&self, request: GenerateRequest) -> ProviderResult<ProviderStreamHandle>;
}

/// Builds the channel wiring shared by adapters and scripted test providers.
pub fn make_event_stream() -> (
    mpsc::UnboundedSender<StreamEvent>,
    ProviderEventStream,
    oneshot::Receiver<()>,
) {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = oneshot::channel();
    (
        event_tx,
        ProviderEventStream::new(event_rx, cancel_tx),
        cancel_rx,
    )
}
