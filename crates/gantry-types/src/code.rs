//! Code - a single G/M/T command unit.
//!
//! A [`Code`] is the unit of work travelling from a client or job file to
//! the firmware. Once handed to a channel processor a code is immutable
//! until its completion is signalled; everything that varies afterwards
//! (reply content, completion state) lives outside the code itself.
//!
//! # Example
//!
//! ```
//! use gantry_types::{Code, CodeChannel, CodeKind, CodeParameter, ParamValue};
//!
//! let mut code = Code::new(CodeKind::G, 1, CodeChannel::File);
//! code.parameters.push(CodeParameter {
//!     letter: 'X',
//!     value: ParamValue::Float(12.5),
//! });
//!
//! assert_eq!(code.to_string(), "G1 X12.5");
//! assert!(code.parameter('X').is_some());
//! assert!(code.parameter('Y').is_none());
//! ```

use crate::channel::CodeChannel;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric type of a code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CodeKind {
    /// Motion/geometry command (`G…`).
    G,
    /// Machine command (`M…`).
    M,
    /// Tool change (`T…`).
    T,
    /// A line containing only a comment.
    Comment,
    /// A blank line.
    Empty,
}

impl CodeKind {
    /// Returns the command letter, if the kind carries one.
    #[must_use]
    pub fn letter(self) -> Option<char> {
        match self {
            CodeKind::G => Some('G'),
            CodeKind::M => Some('M'),
            CodeKind::T => Some('T'),
            CodeKind::Comment | CodeKind::Empty => None,
        }
    }
}

/// A single parameter value.
///
/// The wire encoding distinguishes integer, unsigned, float and string
/// payloads; the reader picks the narrowest type that represents the
/// source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    /// Signed integer parameter.
    Int(i32),
    /// Unsigned integer parameter.
    Uint(u32),
    /// Floating point parameter.
    Float(f32),
    /// Quoted string parameter.
    Text(String),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Uint(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "\"{v}\""),
        }
    }
}

/// One `letter → value` entry in a code's ordered parameter list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeParameter {
    /// Parameter letter, upper-cased (`X`, `Y`, `P`, …).
    pub letter: char,
    /// The parsed value.
    pub value: ParamValue,
}

/// A single command unit.
///
/// Carries everything the channel processors and the wire encoder need:
/// the command itself, its origin channel, and - for file sources - the
/// byte range it was read from, which the job executor uses to advance
/// and restore file positions across pause/resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Code {
    /// Numeric type of the command.
    pub kind: CodeKind,
    /// Major number (`G1` → 1). `None` for comments and blank lines.
    pub major: Option<i32>,
    /// Optional minor number (`G54.3` → 3).
    pub minor: Option<i8>,
    /// Ordered parameter list.
    pub parameters: Vec<CodeParameter>,
    /// Channel the code originated on.
    pub channel: CodeChannel,
    /// Byte offset in the source file. Present for file sources, absent
    /// for macro and interactive codes.
    pub file_offset: Option<u64>,
    /// Byte length of the source line, including the terminator.
    pub length: u32,
    /// Trailing comment text, without the delimiter.
    pub comment: Option<String>,
}

impl Code {
    /// Creates a code with the given kind and major number and no
    /// parameters.
    #[must_use]
    pub fn new(kind: CodeKind, major: i32, channel: CodeChannel) -> Self {
        Self {
            kind,
            major: Some(major),
            minor: None,
            parameters: Vec::new(),
            channel,
            file_offset: None,
            length: 0,
            comment: None,
        }
    }

    /// Creates a comment-only code.
    #[must_use]
    pub fn comment(text: impl Into<String>, channel: CodeChannel) -> Self {
        Self {
            kind: CodeKind::Comment,
            major: None,
            minor: None,
            parameters: Vec::new(),
            channel,
            file_offset: None,
            length: 0,
            comment: Some(text.into()),
        }
    }

    /// Returns the value of the first parameter with the given letter.
    #[must_use]
    pub fn parameter(&self, letter: char) -> Option<&ParamValue> {
        self.parameters
            .iter()
            .find(|p| p.letter == letter)
            .map(|p| &p.value)
    }

    /// Returns true for comment-only and blank codes, which never reach
    /// the firmware.
    #[must_use]
    pub fn is_executable(&self) -> bool {
        matches!(self.kind, CodeKind::G | CodeKind::M | CodeKind::T)
    }

    /// Byte offset just past this code in its source file, if it came
    /// from a file.
    #[must_use]
    pub fn end_offset(&self) -> Option<u64> {
        self.file_offset.map(|o| o + u64::from(self.length))
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind.letter(), self.major) {
            (Some(letter), Some(major)) => {
                write!(f, "{letter}{major}")?;
                if let Some(minor) = self.minor {
                    write!(f, ".{minor}")?;
                }
            }
            _ => {
                if let Some(comment) = &self.comment {
                    return write!(f, ";{comment}");
                }
                return Ok(());
            }
        }
        for param in &self.parameters {
            write!(f, " {}{}", param.letter, param.value)?;
        }
        Ok(())
    }
}
