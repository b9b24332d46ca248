//! The submit-gated boundary the front-end talks to.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use mosaic_core::{ChatMessage, ConversationSnapshot, ConversationStore, MessageId};
use mosaic_llm::{GenerateRequest, LlmProvider};

use crate::exchange;

/// Rejection reasons for a submission that never reaches the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    /// Blank prompt text with no images attached.
    EmptyPrompt,
    /// Another exchange is still in flight.
    Busy,
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::EmptyPrompt => {
                write!(f, "a submission needs prompt text or at least one image")
            }
            SubmitError::Busy => write!(f, "an exchange is already in flight"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Handle for one accepted exchange.
pub struct ExchangeHandle {
    pub user_message_id: MessageId,
    pub model_message_id: MessageId,
    task: JoinHandle<()>,
}

impl ExchangeHandle {
    /// Waits until the exchange has finalized its record.
    pub async fn wait(self) {
        if let Err(error) = self.task.await {
            tracing::error!(%error, "exchange task aborted");
        }
    }
}

/// Coordinator for one conversation against one provider.
///
/// Exactly one exchange may be in flight at a time; the busy gate plays the
/// role of a front-end's disabled submit control, so the store never holds
/// two streaming records.
pub struct ChatSession {
    store: Arc<ConversationStore>,
    provider: Arc<dyn LlmProvider>,
    model_id: String,
    busy: Arc<AtomicBool>,
}

impl ChatSession {
    /// Creates a session speaking to the given provider and model.
    pub fn new(provider: Arc<dyn LlmProvider>, model_id: impl Into<String>) -> Self {
        Self {
            store: Arc::new(ConversationStore::new()),
            provider,
            model_id: model_id.into(),
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Read access to the conversation log.
    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Subscribes to conversation snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.store.subscribe()
    }

    /// True while an exchange is in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Submits one user turn and spawns the exchange driving its response.
    ///
    /// Validation happens here, before the aggregator is ever invoked: blank
    /// submissions are rejected and the busy gate serializes exchanges.
    pub fn submit(
        &self,
        text: impl Into<String>,
        images: Vec<String>,
    ) -> Result<ExchangeHandle, SubmitError> {
        let text = text.into();
        if text.trim().is_empty() && images.is_empty() {
            return Err(SubmitError::EmptyPrompt);
        }

        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SubmitError::Busy);
        }

        // History is everything recorded before this exchange's two appends.
        let history = self.store.messages();

        let user_message_id = self.store.alloc_message_id();
        let model_message_id = self.store.alloc_message_id();

        let request_turns = exchange::build_turns(&history, &text, &images);
        let request = GenerateRequest::new(self.model_id.clone(), request_turns);

        self.store
            .append(ChatMessage::user(user_message_id, text, images));

        let placeholder = ChatMessage::model_placeholder(model_message_id);
        let started_at = placeholder.created_at;
        self.store.append(placeholder);

        let task = tokio::spawn(exchange::run(
            self.store.clone(),
            self.provider.clone(),
            request,
            model_message_id,
            started_at,
            self.busy.clone(),
        ));

        Ok(ExchangeHandle {
            user_message_id,
            model_message_id,
            task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use tokio::sync::oneshot;

    use mosaic_core::{ResponseFragment, Role, StreamEvent};
    use mosaic_llm::{
        Part, ProviderError, ProviderResult, ProviderStreamHandle, ProviderWorker, Turn,
        make_event_stream,
    };

    use crate::exchange::ERROR_FRAGMENT_TEXT;

    /// One scripted provider call.
    struct Script {
        fail_to_start: bool,
        before_gate: Vec<StreamEvent>,
        gate: Option<oneshot::Receiver<()>>,
        after_gate: Vec<StreamEvent>,
    }

    fn scripted(events: Vec<StreamEvent>) -> Script {
        Script {
            fail_to_start: false,
            before_gate: events,
            gate: None,
            after_gate: Vec::new(),
        }
    }

    fn failing() -> Script {
        Script {
            fail_to_start: true,
            before_gate: Vec::new(),
            gate: None,
            after_gate: Vec::new(),
        }
    }

    /// Replays scripts call by call and records every request it was given.
    struct ScriptedProvider {
        calls: Mutex<Vec<GenerateRequest>>,
        scripts: Mutex<Vec<Script>>,
    }

    impl ScriptedProvider {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                scripts: Mutex::new(scripts),
            })
        }

        fn calls(&self) -> Vec<GenerateRequest> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            "scripted"
        }

        fn name(&self) -> &str {
            "Scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }

        fn stream_generate(
            &self,
            request: GenerateRequest,
        ) -> ProviderResult<ProviderStreamHandle> {
            self.calls.lock().expect("calls lock").push(request);

            let mut scripts = self.scripts.lock().expect("scripts lock");
            assert!(!scripts.is_empty(), "unscripted provider call");
            let script = scripts.remove(0);
            drop(scripts);

            if script.fail_to_start {
                return Err(ProviderError::MissingApiKey {
                    stage: "scripted",
                    provider_id: "scripted".to_string(),
                });
            }

            let (event_tx, stream, _cancel_rx) = make_event_stream();
            let worker: ProviderWorker = Box::pin(async move {
                for event in script.before_gate {
                    let _ = event_tx.send(event);
                }
                if let Some(gate) = script.gate {
                    let _ = gate.await;
                }
                for event in script.after_gate {
                    let _ = event_tx.send(event);
                }
            });

            Ok(ProviderStreamHandle { stream, worker })
        }
    }

    fn session_with(scripts: Vec<Script>) -> (Arc<ScriptedProvider>, ChatSession) {
        let provider = ScriptedProvider::new(scripts);
        let session = ChatSession::new(provider.clone(), "scripted-model");
        (provider, session)
    }

    fn model_record(session: &ChatSession, id: MessageId) -> ChatMessage {
        session
            .store()
            .messages()
            .iter()
            .find(|message| message.id == id)
            .cloned()
            .expect("model record present")
    }

    #[tokio::test]
    async fn first_submit_sends_a_single_text_turn() {
        let (provider, session) = session_with(vec![scripted(vec![StreamEvent::Done])]);

        session
            .submit("Hello", Vec::new())
            .expect("accepted")
            .wait()
            .await;

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].turns,
            vec![Turn::new(Role::User, vec![Part::Text("Hello".to_string())])]
        );
    }

    #[tokio::test]
    async fn current_turn_carries_images_before_text() {
        let (provider, session) = session_with(vec![scripted(vec![StreamEvent::Done])]);

        let handle = session
            .submit("Describe this", vec!["aW1n".to_string()])
            .expect("accepted");
        let user_id = handle.user_message_id;
        handle.wait().await;

        let calls = provider.calls();
        assert_eq!(
            calls[0].turns[0].parts,
            vec![
                Part::InlineImage {
                    data: "aW1n".to_string(),
                    media_type: "image/jpeg".to_string(),
                },
                Part::Text("Describe this".to_string()),
            ]
        );

        // The input images also land on the finalized user record.
        let user = session
            .store()
            .messages()
            .iter()
            .find(|message| message.id == user_id)
            .cloned()
            .expect("user record present");
        assert_eq!(user.images, vec!["aW1n".to_string()]);
    }

    #[tokio::test]
    async fn text_deltas_fold_into_the_final_record() {
        let (_provider, session) = session_with(vec![scripted(vec![
            StreamEvent::Fragment(ResponseFragment::text("Hi")),
            StreamEvent::Fragment(ResponseFragment::text(" there")),
            StreamEvent::Done,
        ])]);

        let handle = session.submit("greet me", Vec::new()).expect("accepted");
        let model_id = handle.model_message_id;
        handle.wait().await;

        let record = model_record(&session, model_id);
        assert_eq!(record.text, "Hi there");
        assert!(!record.streaming);
        assert!(record.latency.is_some());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn generated_images_arrive_in_order() {
        let (_provider, session) = session_with(vec![scripted(vec![
            StreamEvent::Fragment(ResponseFragment::image("first")),
            StreamEvent::Fragment(ResponseFragment::image("second")),
            StreamEvent::Done,
        ])]);

        let handle = session.submit("draw", Vec::new()).expect("accepted");
        let model_id = handle.model_message_id;
        handle.wait().await;

        let record = model_record(&session, model_id);
        assert_eq!(
            record.images,
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn mid_stream_failure_keeps_partial_text_and_appends_the_literal() {
        let (_provider, session) = session_with(vec![scripted(vec![
            StreamEvent::Fragment(ResponseFragment::text("Partial")),
            StreamEvent::Error("connection reset".to_string()),
        ])]);

        let handle = session.submit("go", Vec::new()).expect("accepted");
        let model_id = handle.model_message_id;
        handle.wait().await;

        let record = model_record(&session, model_id);
        assert_eq!(record.text, format!("Partial\n{ERROR_FRAGMENT_TEXT}"));
        assert!(!record.streaming);
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn pre_stream_failure_surfaces_the_bare_literal() {
        let (_provider, session) = session_with(vec![failing()]);

        let handle = session.submit("go", Vec::new()).expect("accepted");
        let model_id = handle.model_message_id;
        handle.wait().await;

        let record = model_record(&session, model_id);
        assert_eq!(record.text, ERROR_FRAGMENT_TEXT);
        assert!(!record.streaming);
        assert!(record.latency.is_some());
        assert!(!session.is_busy());
    }

    #[tokio::test]
    async fn stale_empty_records_are_excluded_from_history() {
        // First exchange produces no fragments, leaving an empty model
        // record behind.
        let (provider, session) = session_with(vec![
            scripted(vec![StreamEvent::Done]),
            scripted(vec![StreamEvent::Done]),
        ]);

        session
            .submit("first", Vec::new())
            .expect("accepted")
            .wait()
            .await;
        session
            .submit("second", Vec::new())
            .expect("accepted")
            .wait()
            .await;

        let calls = provider.calls();
        let history_turns = &calls[1].turns;
        assert_eq!(history_turns.len(), 2);
        assert_eq!(history_turns[0].parts, vec![Part::Text("first".to_string())]);
        assert_eq!(
            history_turns[1].parts,
            vec![Part::Text("second".to_string())]
        );
    }

    #[tokio::test]
    async fn prior_images_are_never_replayed() {
        let (provider, session) = session_with(vec![
            scripted(vec![
                StreamEvent::Fragment(ResponseFragment::image("b3V0")),
                StreamEvent::Fragment(ResponseFragment::text("made an image")),
                StreamEvent::Done,
            ]),
            scripted(vec![StreamEvent::Done]),
        ]);

        session
            .submit("draw", vec!["aW5wdXQ=".to_string()])
            .expect("accepted")
            .wait()
            .await;
        session
            .submit("thanks", Vec::new())
            .expect("accepted")
            .wait()
            .await;

        let calls = provider.calls();
        let replay = &calls[1].turns;
        assert!(
            replay
                .iter()
                .flat_map(|turn| turn.parts.iter())
                .all(|part| matches!(part, Part::Text(_)))
        );
        assert_eq!(replay[0].parts, vec![Part::Text("draw".to_string())]);
        assert_eq!(
            replay[1].parts,
            vec![Part::Text("made an image".to_string())]
        );
    }

    #[tokio::test]
    async fn blank_submissions_are_rejected_before_any_append() {
        let (provider, session) = session_with(Vec::new());

        assert_eq!(
            session.submit("   ", Vec::new()).err(),
            Some(SubmitError::EmptyPrompt)
        );
        assert!(session.store().is_empty());
        assert!(!session.is_busy());
        assert!(provider.calls().is_empty());
    }

    #[tokio::test]
    async fn image_only_submissions_are_accepted() {
        let (provider, session) = session_with(vec![scripted(vec![StreamEvent::Done])]);

        session
            .submit("", vec!["aW1n".to_string()])
            .expect("accepted")
            .wait()
            .await;

        let calls = provider.calls();
        assert_eq!(
            calls[0].turns[0].parts,
            vec![Part::InlineImage {
                data: "aW1n".to_string(),
                media_type: "image/jpeg".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn busy_gate_serializes_exchanges() {
        let (gate_tx, gate_rx) = oneshot::channel();
        let (_provider, session) = session_with(vec![
            Script {
                fail_to_start: false,
                before_gate: vec![StreamEvent::Fragment(ResponseFragment::text("x"))],
                gate: Some(gate_rx),
                after_gate: vec![StreamEvent::Done],
            },
            scripted(vec![StreamEvent::Done]),
        ]);

        let mut updates = session.subscribe();
        let handle = session.submit("go", Vec::new()).expect("accepted");

        // Wait for the first fragment so the exchange is mid-flight.
        loop {
            updates.changed().await.expect("store alive");
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.iter().any(|message| message.text == "x") {
                let streaming = snapshot
                    .iter()
                    .filter(|message| message.streaming)
                    .count();
                assert_eq!(streaming, 1);
                break;
            }
        }

        assert!(session.is_busy());
        assert_eq!(
            session.submit("again", Vec::new()).err(),
            Some(SubmitError::Busy)
        );

        gate_tx.send(()).expect("worker alive");
        handle.wait().await;

        assert!(!session.is_busy());
        session
            .submit("again", Vec::new())
            .expect("accepted after finalize")
            .wait()
            .await;
    }

    #[tokio::test]
    async fn records_are_appended_in_submission_order() {
        let (_provider, session) = session_with(vec![scripted(vec![StreamEvent::Done])]);

        let handle = session.submit("Hello", Vec::new()).expect("accepted");
        let (user_id, model_id) = (handle.user_message_id, handle.model_message_id);
        handle.wait().await;

        let snapshot = session.store().messages();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, user_id);
        assert_eq!(snapshot[0].role, Role::User);
        assert_eq!(snapshot[0].text, "Hello");
        assert_eq!(snapshot[1].id, model_id);
        assert_eq!(snapshot[1].role, Role::Model);
        assert!(user_id < model_id);
    }
}
