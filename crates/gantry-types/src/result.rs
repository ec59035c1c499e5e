//! Code results - what the firmware said about one code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Severity of a single firmware message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageSeverity {
    /// Informational output.
    Info,
    /// Warning; the code still completed.
    Warning,
    /// Error; the code failed on the firmware side.
    Error,
}

impl MessageSeverity {
    /// Wire id used in code-reply packets.
    #[must_use]
    pub fn wire_id(self) -> u8 {
        match self {
            MessageSeverity::Info => 0,
            MessageSeverity::Warning => 1,
            MessageSeverity::Error => 2,
        }
    }
}

impl TryFrom<u8> for MessageSeverity {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(MessageSeverity::Info),
            1 => Ok(MessageSeverity::Warning),
            2 => Ok(MessageSeverity::Error),
            other => Err(other),
        }
    }
}

/// One (severity, text) pair of a code result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Severity of this message.
    pub severity: MessageSeverity,
    /// Message text.
    pub text: String,
}

/// Ordered sequence of firmware messages produced for one code.
///
/// An empty result means "success, no output". Replies flagged `Push`
/// accumulate into the last message until the final reply closes it; see
/// [`CodeResult::append`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeResult {
    messages: Vec<Message>,
}

impl CodeResult {
    /// Creates an empty (successful) result.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a result with a single message.
    #[must_use]
    pub fn with_message(severity: MessageSeverity, text: impl Into<String>) -> Self {
        Self {
            messages: vec![Message {
                severity,
                text: text.into(),
            }],
        }
    }

    /// Appends reply content.
    ///
    /// If the previous append was flagged `Push` and the severities match,
    /// the content continues the last message; otherwise a new message is
    /// started. Empty content never opens a message.
    pub fn append(&mut self, severity: MessageSeverity, content: &str, continues: bool) {
        if continues {
            if let Some(last) = self.messages.last_mut() {
                if last.severity == severity {
                    last.text.push_str(content);
                    return;
                }
            }
        }
        if !content.is_empty() {
            self.messages.push(Message {
                severity,
                text: content.to_string(),
            });
        }
    }

    /// Returns true if no messages were produced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns true if any message has error severity.
    #[must_use]
    pub fn has_error(&self) -> bool {
        self.messages
            .iter()
            .any(|m| m.severity == MessageSeverity::Error)
    }

    /// Iterates over the messages in order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Number of messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }
}

impl fmt::Display for CodeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, message) in self.messages.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            match message.severity {
                MessageSeverity::Info => write!(f, "{}", message.text)?,
                MessageSeverity::Warning => write!(f, "Warning: {}", message.text)?,
                MessageSeverity::Error => write!(f, "Error: {}", message.text)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_content_continues_last_message() {
        let mut result = CodeResult::new();
        result.append(MessageSeverity::Info, "Bed temperature: ", false);
        result.append(MessageSeverity::Info, "60.0C", true);

        assert_eq!(result.len(), 1);
        assert_eq!(result.to_string(), "Bed temperature: 60.0C");
    }

    #[test]
    fn severity_change_starts_new_message() {
        let mut result = CodeResult::new();
        result.append(MessageSeverity::Info, "homing", false);
        result.append(MessageSeverity::Error, "endstop not hit", true);

        assert_eq!(result.len(), 2);
        assert!(result.has_error());
    }

    #[test]
    fn empty_content_opens_nothing() {
        let mut result = CodeResult::new();
        result.append(MessageSeverity::Info, "", false);
        assert!(result.is_empty());
    }

    #[test]
    fn display_prefixes_severities() {
        let mut result = CodeResult::new();
        result.append(MessageSeverity::Warning, "cold extrude prevented", false);
        assert_eq!(result.to_string(), "Warning: cold extrude prevented");
    }
}
