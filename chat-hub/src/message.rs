use std::{
    fmt,
    str::FromStr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use thiserror::Error;

/// Separates the sender's display name from the payload on the wire.
pub const SEPARATOR: char = ':';

pub const MAX_NAME_LEN: usize = 32;

/// Process-unique identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    /// Hands out monotonically increasing ids, starting at 1.
    pub fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("Username is required in Header")]
    Empty,
    #[error("Username must be at most {MAX_NAME_LEN} characters")]
    TooLong,
    #[error("Username must not contain '{SEPARATOR}'")]
    Separator,
    #[error("Username must not contain control characters")]
    Control,
}

/// A trimmed, non-empty name that can never make the `name:payload` framing
/// ambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(Arc<str>);

impl DisplayName {
    pub fn parse(raw: &str) -> Result<Self, NameError> {
        let name = raw.trim();
        if name.is_empty() {
            return Err(NameError::Empty);
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(NameError::TooLong);
        }
        if name.contains(SEPARATOR) {
            return Err(NameError::Separator);
        }
        if name.chars().any(char::is_control) {
            return Err(NameError::Control);
        }
        Ok(Self(Arc::from(name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DisplayName {
    type Err = NameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DisplayName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DisplayName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One chat payload as it travels from a pump's reader through the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    from: ClientId,
    name: DisplayName,
    text: String,
}

impl ChatMessage {
    pub fn new(from: ClientId, name: DisplayName, text: impl Into<String>) -> Self {
        Self {
            from,
            name,
            text: text.into(),
        }
    }

    pub fn from(&self) -> ClientId {
        self.from
    }

    pub fn name(&self) -> &DisplayName {
        &self.name
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Renders the text frame a recipient sees.
    pub fn to_frame(&self) -> String {
        encode_frame(self.name.as_str(), &self.text)
    }
}

pub fn encode_frame(name: &str, text: &str) -> String {
    let mut frame = String::with_capacity(name.len() + 1 + text.len());
    frame.push_str(name);
    frame.push(SEPARATOR);
    frame.push_str(text);
    frame
}

/// A decoded inbound frame on the client side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: String,
    pub text: String,
}

impl ChatLine {
    /// Splits at the first separator. Names never contain one, so any further
    /// separators belong to the payload.
    pub fn parse(frame: &str) -> Option<Self> {
        let (from, text) = frame.split_once(SEPARATOR)?;
        Some(Self {
            from: from.to_string(),
            text: text.to_string(),
        })
    }

    pub fn to_frame(&self) -> String {
        encode_frame(&self.from, &self.text)
    }
}
