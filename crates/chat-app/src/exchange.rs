//! The stream aggregator: drives one request/response exchange against the
//! provider and folds its fragment stream into the store's in-flight record.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use mosaic_core::{
    ChatMessage, ConversationStore, MessageId, MessagePatch, ResponseFragment, Role, StreamEvent,
};
use mosaic_llm::{GenerateRequest, LlmProvider, Part, ProviderStreamHandle, Turn};

/// Literal appended to the in-flight record when the provider fails.
///
/// Error text is in-band: to the store and every observer it is
/// indistinguishable from model output.
pub const ERROR_FRAGMENT_TEXT: &str =
    "[Error: Failed to generate response. Please check your connection or API key.]";

/// Media type attached to current-turn image payloads.
pub const INPUT_IMAGE_MEDIA_TYPE: &str = "image/jpeg";

/// Builds the outbound turn list for one exchange.
///
/// History covers every record prior to the current exchange's appends and
/// is replayed text-only: prior image attachments are intentionally omitted
/// to keep replays cheap. Records without content are skipped rather than
/// sent as empty turns, and so are records whose only content was images.
/// The current turn carries its images first, then the prompt text.
pub fn build_turns(history: &[ChatMessage], prompt: &str, images: &[String]) -> Vec<Turn> {
    let mut turns = Vec::with_capacity(history.len() + 1);

    for message in history {
        if !message.has_content() {
            continue;
        }
        if message.text.is_empty() {
            // Image-only records have nothing left to replay once their
            // images are dropped.
            continue;
        }
        turns.push(Turn::text(message.role, message.text.clone()));
    }

    let mut parts = Vec::with_capacity(images.len() + 1);
    for image in images {
        parts.push(Part::InlineImage {
            data: strip_data_uri_prefix(image).to_string(),
            media_type: INPUT_IMAGE_MEDIA_TYPE.to_string(),
        });
    }
    if !prompt.is_empty() {
        parts.push(Part::Text(prompt.to_string()));
    }
    turns.push(Turn::new(Role::User, parts));

    turns
}

/// Strips a `data:<type>;base64,` prefix so only the raw payload travels.
pub fn strip_data_uri_prefix(payload: &str) -> &str {
    if payload.starts_with("data:") {
        match payload.split_once(',') {
            Some((_, data)) => data,
            None => payload,
        }
    } else {
        payload
    }
}

/// Drives one exchange to completion.
///
/// Consumes the provider's event stream in arrival order, pushing each
/// folded snapshot to the store. Provider failures, before or after the
/// first fragment, surface as one synthesized in-band error fragment;
/// partial content is never rolled back. Finalization is handled by a drop
/// guard so the streaming flag clears on every exit path.
pub(crate) async fn run(
    store: Arc<ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    request: GenerateRequest,
    model_message_id: MessageId,
    started_at: Instant,
    busy: Arc<AtomicBool>,
) {
    let _finalize = FinalizeGuard {
        store: store.clone(),
        model_message_id,
        busy,
    };

    let mut fold = FragmentFold::new(started_at);

    let handle = match provider.stream_generate(request) {
        Ok(handle) => handle,
        Err(error) => {
            tracing::error!(error = %error, "failed to start provider stream");
            fold.apply_error(&store, model_message_id);
            return;
        }
    };

    let ProviderStreamHandle { mut stream, worker } = handle;
    tokio::spawn(worker);

    loop {
        match stream.recv().await {
            Some(StreamEvent::Fragment(fragment)) => {
                fold.apply_fragment(&store, model_message_id, fragment);
            }
            Some(StreamEvent::Error(cause)) => {
                tracing::warn!(%cause, "provider stream failed, surfacing in-band error text");
                fold.apply_error(&store, model_message_id);
                break;
            }
            Some(StreamEvent::Done) | None => break,
        }
    }
}

/// Accumulator state folded over one exchange's fragments.
struct FragmentFold {
    started_at: Instant,
    text: String,
    images: Vec<String>,
    latency: Option<Duration>,
}

impl FragmentFold {
    fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            text: String::new(),
            images: Vec::new(),
            latency: None,
        }
    }

    /// Folds one fragment and pushes the updated snapshot to the store.
    fn apply_fragment(&mut self, store: &ConversationStore, id: MessageId, fragment: ResponseFragment) {
        // Latency is measured on the first fragment received at all,
        // content-bearing or not, and recorded exactly once.
        let latency_patch = if self.latency.is_none() {
            let latency = self.started_at.elapsed();
            self.latency = Some(latency);
            Some(latency)
        } else {
            None
        };

        if !fragment.text.is_empty() {
            self.text.push_str(&fragment.text);
        }
        if let Some(image) = fragment.image {
            self.images.push(image);
        }

        let mut patch = MessagePatch::new()
            .with_text(self.text.clone())
            .with_images(self.images.clone());
        if let Some(latency) = latency_patch {
            patch = patch.with_latency(latency);
        }
        store.update(id, patch);
    }

    /// Synthesizes the terminal in-band error fragment.
    ///
    /// The fixed literal joins already-accumulated text on its own line; on a
    /// pre-content failure it becomes the whole message body.
    fn apply_error(&mut self, store: &ConversationStore, id: MessageId) {
        let text = if self.text.is_empty() {
            ERROR_FRAGMENT_TEXT.to_string()
        } else {
            format!("\n{ERROR_FRAGMENT_TEXT}")
        };
        self.apply_fragment(store, id, ResponseFragment::text(text));
    }
}

/// Clears the in-flight flags when the exchange ends, however it ends.
///
/// Clearing must survive every exit path, including unwinding, so the store
/// never keeps a permanently streaming record after a failure.
struct FinalizeGuard {
    store: Arc<ConversationStore>,
    model_message_id: MessageId,
    busy: Arc<AtomicBool>,
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        self.store.update(
            self.model_message_id,
            MessagePatch::new().with_streaming(false),
        );
        self.busy.store(false, Ordering::Release);
    }
}
