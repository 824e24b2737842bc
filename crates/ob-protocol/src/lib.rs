// ob-protocol: minimal OneBot v11 wire-frame model.
//
// Frames are kept as `serde_json::Value` end to end so that unknown fields
// survive forwarding verbatim.  This crate only reads the handful of fields
// the dispatcher needs (frame kind, message text, sender, echo) and knows how
// to rewrite the text and echo fields in place.

use serde_json::Value;

// ---------------------------------------------------------------------------
// Frame classification
// ---------------------------------------------------------------------------

/// The coarse kind of an incoming frame.
///
/// OneBot v11 events carry a `post_type` discriminator.  API calls and API
/// responses have no `post_type`; they are told apart by the presence of
/// `action` (call) versus `status` + `retcode` (response).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    MessageEvent,
    ApiCall,
    ApiResponse,
    MetaEvent,
    Other,
}

/// Classify a parsed JSON frame.
///
/// Never fails: anything unrecognized is `Other` and gets forwarded as-is.
pub fn classify(frame: &Value) -> FrameKind {
    match frame.get("post_type").and_then(Value::as_str) {
        Some("message") => FrameKind::MessageEvent,
        Some("meta_event") => FrameKind::MetaEvent,
        Some(_) => FrameKind::Other,
        None => {
            if frame.get("action").is_some() {
                FrameKind::ApiCall
            } else if frame.get("status").is_some() && frame.get("retcode").is_some() {
                FrameKind::ApiResponse
            } else {
                FrameKind::Other
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Message events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Private,
    Group,
}

/// The fields of a message event the dispatcher actually routes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    pub kind: MessageKind,
    pub user_id: i64,
    pub group_id: Option<i64>,
    /// Plain text content: `raw_message` if present, else `message`.
    pub text: String,
    /// `sender.nickname`, when the implementation supplies one.
    pub nickname: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("missing field: {0}")]
    MissingField(&'static str),
    #[error("unknown message_type: {0}")]
    UnknownMessageType(String),
}

impl MessageEvent {
    /// Extract the routed fields from a `post_type = "message"` frame.
    ///
    /// The text is taken from `raw_message` when present.  Otherwise
    /// `message` is accepted either as a plain string
    /// (`message_post_format = "string"`) or as a segment array, in which
    /// case the `text` segments are concatenated.
    pub fn parse(frame: &Value) -> Result<Self, ParseError> {
        let kind = match frame.get("message_type").and_then(Value::as_str) {
            Some("private") => MessageKind::Private,
            Some("group") => MessageKind::Group,
            Some(other) => return Err(ParseError::UnknownMessageType(other.to_owned())),
            None => return Err(ParseError::MissingField("message_type")),
        };
        let user_id = frame
            .get("user_id")
            .and_then(Value::as_i64)
            .ok_or(ParseError::MissingField("user_id"))?;
        let group_id = frame.get("group_id").and_then(Value::as_i64);
        let text = message_text(frame).ok_or(ParseError::MissingField("raw_message"))?;
        let nickname = frame
            .get("sender")
            .and_then(|s| s.get("nickname"))
            .and_then(Value::as_str)
            .map(str::to_owned);
        Ok(MessageEvent {
            kind,
            user_id,
            group_id,
            text,
            nickname,
        })
    }
}

fn message_text(frame: &Value) -> Option<String> {
    if let Some(raw) = frame.get("raw_message").and_then(Value::as_str) {
        return Some(raw.to_owned());
    }
    match frame.get("message") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(segments)) => {
            let mut out = String::new();
            for seg in segments {
                if seg.get("type").and_then(Value::as_str) == Some("text") {
                    if let Some(t) = seg
                        .get("data")
                        .and_then(|d| d.get("text"))
                        .and_then(Value::as_str)
                    {
                        out.push_str(t);
                    }
                }
            }
            Some(out)
        }
        _ => None,
    }
}

/// Rewrite the text content of a message event in place.
///
/// Used for prefix stripping before forwarding.  `raw_message` is rewritten
/// when present; `message` only when it is a plain string (a segment array is
/// left untouched since the dispatcher does not re-segment).
pub fn set_message_text(frame: &mut Value, text: &str) {
    let Some(obj) = frame.as_object_mut() else {
        return;
    };
    if obj.get("raw_message").is_some_and(Value::is_string) {
        obj.insert("raw_message".to_owned(), Value::String(text.to_owned()));
    }
    if obj.get("message").is_some_and(Value::is_string) {
        obj.insert("message".to_owned(), Value::String(text.to_owned()));
    }
}

// ---------------------------------------------------------------------------
// Echo ids
// ---------------------------------------------------------------------------

/// Read the echo id of an API call or response.
///
/// OneBot specifies a string, but some implementations emit numbers; those
/// are stringified so correlation still works.
pub fn echo_of(frame: &Value) -> Option<String> {
    match frame.get("echo") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Set (or overwrite) the echo id of a frame.
pub fn set_echo(frame: &mut Value, echo: &str) {
    if let Some(obj) = frame.as_object_mut() {
        obj.insert("echo".to_owned(), Value::String(echo.to_owned()));
    }
}

/// Generate a fresh echo id for calls that arrived without one.
pub fn generate_echo() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ---------------------------------------------------------------------------
// Reply synthesis
// ---------------------------------------------------------------------------

/// Build the api_call that sends `text` back to the originator of `event`.
///
/// Group messages are answered in the group, private messages privately.
/// The returned frame carries a generated echo so the implementation's
/// response can be recognized (and discarded) by the caller.
pub fn reply_frame(event: &MessageEvent, text: &str) -> (Value, String) {
    let echo = generate_echo();
    let frame = match event.kind {
        MessageKind::Group => serde_json::json!({
            "action": "send_group_msg",
            "params": { "group_id": event.group_id, "message": text },
            "echo": echo,
        }),
        MessageKind::Private => serde_json::json!({
            "action": "send_private_msg",
            "params": { "user_id": event.user_id, "message": text },
            "echo": echo,
        }),
    };
    (frame, echo)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
