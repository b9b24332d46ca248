use futures::StreamExt;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, ensure};
use tokio::sync::{mpsc, oneshot};

use mosaic_core::{ResponseFragment, StreamEvent};

use super::provider::{
    EmptyTurnSetSnafu, GenerateRequest, HttpRequestSnafu, LlmProvider, MissingApiKeySnafu, Part,
    ProviderConfig, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker,
    UnexpectedStatusSnafu, make_event_stream,
};

pub const GEMINI_PROVIDER_ID: &str = "gemini";

/// Default image-capable chat model.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash-image";

/// Public Generative Language API endpoint.
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Streaming adapter for the `streamGenerateContent` REST endpoint.
///
/// The endpoint answers with server-sent events whose `data:` payloads are
/// JSON chunks; each chunk maps to one [`ResponseFragment`]. Any transport or
/// status failure is reported as a single terminal error event, never as a
/// panic or a propagated `Err` past stream open.
pub struct GeminiAdapter {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl GeminiAdapter {
    pub fn new(config: ProviderConfig) -> ProviderResult<Self> {
        ensure!(
            !config.api_key.is_empty(),
            MissingApiKeySnafu {
                stage: "gemini-adapter-new",
                provider_id: config.provider_id.clone(),
            }
        );

        Ok(Self {
            config,
            client: reqwest::Client::new(),
        })
    }

    fn request_url(config: &ProviderConfig, model_id: &str) -> String {
        let base_url = if config.base_url.is_empty() {
            DEFAULT_GEMINI_BASE_URL
        } else {
            config.base_url.as_str()
        };
        let base_url = base_url.trim_end_matches('/');

        format!(
            "{base_url}/models/{model_id}:streamGenerateContent?alt=sse&key={key}",
            key = config.api_key
        )
    }

    async fn open_stream(
        client: &reqwest::Client,
        config: &ProviderConfig,
        request: &GenerateRequest,
    ) -> ProviderResult<reqwest::Response> {
        let url = Self::request_url(config, &request.model_id);
        let body = wire_request(request);

        let response = client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "send-generate-request",
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return UnexpectedStatusSnafu {
                stage: "generate-http-status",
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        Ok(response)
    }

    fn emit_error_event(event_tx: &mpsc::UnboundedSender<StreamEvent>, error: ProviderError) {
        let _ = event_tx.send(StreamEvent::Error(error.to_string()));
    }

    async fn run_stream_worker(
        client: reqwest::Client,
        config: ProviderConfig,
        request: GenerateRequest,
        event_tx: mpsc::UnboundedSender<StreamEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let response = match Self::open_stream(&client, &config, &request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::error!(
                    provider_id = %config.provider_id,
                    model_id = %request.model_id,
                    error = %error,
                    "failed to open provider stream"
                );
                Self::emit_error_event(&event_tx, error);
                return;
            }
        };

        let mut body = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut cancelled = false;
        let mut stream_failed = false;

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    cancelled = true;
                    // Dropping the body stream closes the connection.
                    tracing::debug!("provider stream cancelled");
                    break;
                }
                next_chunk = body.next() => {
                    match next_chunk {
                        Some(Ok(bytes)) => {
                            for line in lines.push(&bytes) {
                                if let Some(fragment) = parse_sse_line(&line)
                                    && event_tx.send(StreamEvent::Fragment(fragment)).is_err()
                                {
                                    return;
                                }
                            }
                        }
                        Some(Err(source)) => {
                            stream_failed = true;
                            tracing::warn!(error = %source, "provider stream failed mid-body");
                            Self::emit_error_event(
                                &event_tx,
                                ProviderError::HttpRequest {
                                    stage: "read-stream-chunk",
                                    source,
                                },
                            );
                            break;
                        }
                        None => break,
                    }
                }
            }
        }

        if !cancelled && !stream_failed {
            let _ = event_tx.send(StreamEvent::Done);
        }
    }
}

impl LlmProvider for GeminiAdapter {
    fn id(&self) -> &str {
        &self.config.provider_id
    }

    fn name(&self) -> &str {
        "Google Gemini"
    }

    fn default_model(&self) -> &str {
        self.config
            .default_model
            .as_deref()
            .unwrap_or(DEFAULT_GEMINI_MODEL)
    }

    fn stream_generate(&self, request: GenerateRequest) -> ProviderResult<ProviderStreamHandle> {
        ensure!(
            !request.turns.is_empty(),
            EmptyTurnSetSnafu {
                stage: "stream-generate",
            }
        );

        let (event_tx, stream, cancel_rx) = make_event_stream();
        let worker: ProviderWorker = Box::pin(Self::run_stream_worker(
            self.client.clone(),
            self.config.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(ProviderStreamHandle { stream, worker })
    }
}

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    contents: Vec<WireContent<'a>>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<WireGenerationConfig>,
}

#[derive(Debug, Serialize)]
struct WireContent<'a> {
    role: &'static str,
    parts: Vec<WirePart<'a>>,
}

#[derive(Debug, Serialize)]
struct WirePart<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    inline_data: Option<WireInlineData<'a>>,
}

#[derive(Debug, Serialize)]
struct WireInlineData<'a> {
    #[serde(rename = "mimeType")]
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
struct WireGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(rename = "maxOutputTokens", skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u64>,
}

fn wire_request(request: &GenerateRequest) -> WireRequest<'_> {
    let contents = request
        .turns
        .iter()
        .map(|turn| WireContent {
            role: turn.role.as_str(),
            parts: turn
                .parts
                .iter()
                .map(|part| match part {
                    Part::Text(text) => WirePart {
                        text: Some(text.as_str()),
                        inline_data: None,
                    },
                    Part::InlineImage { data, media_type } => WirePart {
                        text: None,
                        inline_data: Some(WireInlineData {
                            mime_type: media_type,
                            data,
                        }),
                    },
                })
                .collect(),
        })
        .collect();

    let generation_config = if request.temperature.is_none() && request.max_tokens.is_none() {
        None
    } else {
        Some(WireGenerationConfig {
            temperature: request.temperature,
            max_output_tokens: request.max_tokens,
        })
    };

    WireRequest {
        contents,
        generation_config,
    }
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    candidates: Vec<ChunkCandidate>,
}

#[derive(Debug, Deserialize)]
struct ChunkCandidate {
    content: Option<ChunkContent>,
}

#[derive(Debug, Deserialize)]
struct ChunkContent {
    #[serde(default)]
    parts: Vec<ChunkPart>,
}

#[derive(Debug, Deserialize)]
struct ChunkPart {
    text: Option<String>,
    #[serde(rename = "inlineData", alias = "inline_data")]
    inline_data: Option<ChunkInlineData>,
}

#[derive(Debug, Deserialize)]
struct ChunkInlineData {
    data: String,
}

/// Reassembles complete lines from the response byte stream.
///
/// SSE data lines can straddle network chunk boundaries, so bytes are
/// buffered until a newline arrives and only whole lines are decoded.
#[derive(Debug, Default)]
struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

/// Maps one SSE line to a fragment; non-data and unparseable lines yield
/// nothing.
fn parse_sse_line(line: &str) -> Option<ResponseFragment> {
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => Some(fragment_from_chunk(chunk)),
        Err(error) => {
            tracing::debug!(%error, "skipping unparseable stream line");
            None
        }
    }
}

fn fragment_from_chunk(chunk: StreamChunk) -> ResponseFragment {
    let mut text = String::new();
    let mut image = None;

    if let Some(candidate) = chunk.candidates.into_iter().next()
        && let Some(content) = candidate.content
    {
        for part in content.parts {
            if let Some(part_text) = part.text {
                text.push_str(&part_text);
            }
            if let Some(inline) = part.inline_data {
                // A chunk rarely carries more than one image; the last
                // inline part wins.
                image = Some(inline.data);
            }
        }
    }

    ResponseFragment { text, image }
}
