//! Messages and protocol constants.
//!
//! The wire carries no framing: a message is exactly the bytes handed to one
//! `send_all` call, bounded by the application buffer size. Line terminators
//! are a display convention only.

use bytes::Bytes;
use std::borrow::Cow;
use std::fmt;

/// Default TCP port the responder binds to.
pub const DEFAULT_PORT: u16 = 42999;

/// Default host the initiator dials.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Upper bound on a single message, in bytes.
pub const BUFFER_SIZE: usize = 1024;

/// Pending-connection queue length for the listening socket.
pub const BACKLOG: u32 = 2;

/// Sent by the responder as soon as a connection is accepted.
pub const GREETING: &str = "connection established successfully";

/// Sent by the responder after every non-terminator message.
pub const ACKNOWLEDGMENT: &str = "Message received.";

/// Message texts that end a session.
pub const DEFAULT_TERMINATORS: &[&str] = &["exit", "bye"];

/// An immutable, fully received (or fully composed) message.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Message(Bytes);

impl Message {
    /// Wrap raw bytes.
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Wire bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the message carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Text for display and terminator matching.
    ///
    /// Invalid UTF-8 is replaced; one trailing `\n` or `\r\n` is dropped.
    pub fn text(&self) -> Cow<'_, str> {
        match String::from_utf8_lossy(&self.0) {
            Cow::Borrowed(s) => Cow::Borrowed(trim_line_end(s)),
            Cow::Owned(s) => Cow::Owned(trim_line_end(&s).to_string()),
        }
    }
}

fn trim_line_end(s: &str) -> &str {
    let s = s.strip_suffix('\n').unwrap_or(s);
    s.strip_suffix('\r').unwrap_or(s)
}

impl From<&'static str> for Message {
    fn from(s: &'static str) -> Self {
        Self(Bytes::from_static(s.as_bytes()))
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self(Bytes::from(s))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

/// Case-sensitive set of end-of-session texts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Terminators(Vec<String>);

impl Terminators {
    /// Build from any list of texts.
    pub fn new<I, T>(texts: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self(texts.into_iter().map(Into::into).collect())
    }

    /// Whether `message` is exactly one of the terminators.
    pub fn matches(&self, message: &Message) -> bool {
        let text = message.text();
        self.0.iter().any(|t| t.as_str() == text)
    }

    /// Whether `text` is exactly one of the terminators.
    pub fn matches_text(&self, text: &str) -> bool {
        self.0.iter().any(|t| t == text)
    }
}

impl Default for Terminators {
    fn default() -> Self {
        Self::new(DEFAULT_TERMINATORS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_drops_single_line_end() {
        assert_eq!(Message::from("hello\n").text(), "hello");
        assert_eq!(Message::from("hello\r\n").text(), "hello");
        assert_eq!(Message::from("hello\n\n").text(), "hello\n");
        assert_eq!(Message::from("hello").text(), "hello");
    }

    #[test]
    fn test_text_is_lossy_for_invalid_utf8() {
        let msg = Message::from(vec![b'o', b'k', 0xff]);
        assert_eq!(msg.text(), "ok\u{fffd}");
        assert_eq!(msg.len(), 3);
    }

    #[test]
    fn test_terminators_are_case_sensitive() {
        let terms = Terminators::default();
        assert!(terms.matches(&Message::from("exit")));
        assert!(terms.matches(&Message::from("bye\n")));
        assert!(!terms.matches(&Message::from("Bye")));
        assert!(!terms.matches(&Message::from("EXIT")));
        assert!(!terms.matches(&Message::from("bye now")));
        assert!(terms.matches_text("bye"));
    }

    #[test]
    fn test_custom_terminators() {
        let terms = Terminators::new(["close"]);
        assert!(terms.matches(&Message::from("close")));
        assert!(!terms.matches(&Message::from("exit")));
    }
}
