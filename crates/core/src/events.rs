/// One partial response delivered by the model stream.
///
/// Both sides are optional: a fragment with empty text and no image is legal
/// and carries no content, though it still participates in first-fragment
/// latency timing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseFragment {
    /// Text delta to append to the in-flight record.
    pub text: String,
    /// Base64 image payload generated by the model, if any.
    pub image: Option<String>,
}

impl ResponseFragment {
    /// Creates a text-only fragment.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }

    /// Creates an image-only fragment.
    pub fn image(data: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            image: Some(data.into()),
        }
    }

    /// Returns true when the fragment carries a text delta or an image.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || self.image.is_some()
    }
}

/// Provider-agnostic stream event mapped into chat domain language.
///
/// Exactly one exchange is ever in flight and its aggregator exclusively
/// owns the receiving end, so events carry no routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// A partial response to fold into the in-flight record.
    Fragment(ResponseFragment),
    /// The stream finished normally.
    Done,
    /// The stream failed terminally; the payload names the cause.
    Error(String),
}
