use std::time::{Duration, Instant};

/// Stable identifier for one message record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Creates a typed message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Chat speaker role.
///
/// A record's role never changes after creation, and the internal vocabulary
/// maps 1:1 onto the provider's turn roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Model,
}

impl Role {
    /// Wire name used in provider payloads.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// One entry in the conversation log.
///
/// User records are complete at creation and never stream. Model records
/// start as empty streaming placeholders and accumulate text and images
/// fragment by fragment until their stream ends or fails.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    /// Accumulated message text; the concatenation target while streaming.
    pub text: String,
    /// Base64 image payloads in arrival order, data-URI prefix stripped.
    pub images: Vec<String>,
    /// Monotonic creation time; latency is measured against this.
    pub created_at: Instant,
    /// True only while the record still receives stream updates.
    pub streaming: bool,
    /// Time from record creation to the first received fragment.
    /// Set at most once and never updated afterwards.
    pub latency: Option<Duration>,
}

impl ChatMessage {
    /// Creates a finalized user record.
    pub fn user(id: MessageId, text: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            id,
            role: Role::User,
            text: text.into(),
            images,
            created_at: Instant::now(),
            streaming: false,
            latency: None,
        }
    }

    /// Creates the empty model placeholder an exchange streams into.
    pub fn model_placeholder(id: MessageId) -> Self {
        Self {
            id,
            role: Role::Model,
            text: String::new(),
            images: Vec::new(),
            created_at: Instant::now(),
            streaming: true,
            latency: None,
        }
    }

    /// Returns true when the record carries any text or image content.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.images.is_empty()
    }
}

/// Shallow field-overwrite patch for [`crate::store::ConversationStore::update`].
///
/// Fields left as `None` keep the record's current value. Latency is only
/// ever carried by the patch that first computed it; a later write against
/// an already-set latency is ignored.
#[derive(Debug, Clone, Default)]
pub struct MessagePatch {
    pub text: Option<String>,
    pub images: Option<Vec<String>>,
    pub latency: Option<Duration>,
    pub streaming: Option<bool>,
}

impl MessagePatch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the accumulated text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Replaces the image payload list.
    pub fn with_images(mut self, images: Vec<String>) -> Self {
        self.images = Some(images);
        self
    }

    /// Records first-fragment latency.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Sets or clears the streaming flag.
    pub fn with_streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }

    pub(crate) fn apply(self, message: &mut ChatMessage) {
        if let Some(text) = self.text {
            message.text = text;
        }
        if let Some(images) = self.images {
            message.images = images;
        }
        if let Some(latency) = self.latency {
            // First write wins; latency never moves once recorded.
            if message.latency.is_none() {
                message.latency = Some(latency);
            }
        }
        if let Some(streaming) = self.streaming {
            message.streaming = streaming;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_records_are_complete_at_creation() {
        let message = ChatMessage::user(MessageId::new(1), "hello", vec!["aGk=".to_string()]);

        assert_eq!(message.role, Role::User);
        assert!(!message.streaming);
        assert!(message.latency.is_none());
        assert!(message.has_content());
    }

    #[test]
    fn model_placeholder_starts_empty_and_streaming() {
        let message = ChatMessage::model_placeholder(MessageId::new(2));

        assert_eq!(message.role, Role::Model);
        assert!(message.streaming);
        assert!(message.text.is_empty());
        assert!(message.images.is_empty());
        assert!(!message.has_content());
    }

    #[test]
    fn patch_overwrites_only_present_fields() {
        let mut message = ChatMessage::model_placeholder(MessageId::new(3));

        MessagePatch::new().with_text("partial").apply(&mut message);
        assert_eq!(message.text, "partial");
        assert!(message.streaming);

        MessagePatch::new().with_streaming(false).apply(&mut message);
        assert_eq!(message.text, "partial");
        assert!(!message.streaming);
    }

    #[test]
    fn latency_is_write_once() {
        let mut message = ChatMessage::model_placeholder(MessageId::new(4));

        MessagePatch::new()
            .with_latency(Duration::from_millis(120))
            .apply(&mut message);
        MessagePatch::new()
            .with_latency(Duration::from_millis(900))
            .apply(&mut message);

        assert_eq!(message.latency, Some(Duration::from_millis(120)));
    }

    #[test]
    fn roles_map_onto_the_wire_vocabulary() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Model.as_str(), "model");
    }
}
