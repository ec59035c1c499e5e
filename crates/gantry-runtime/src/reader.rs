//! Line-oriented code reader for job and macro files.
//!
//! This is the boundary to the G-code parser collaborator: the core
//! only needs a stream of [`Code`] values with byte positions, so the
//! reader tokenises one line at a time - command word, parameter words,
//! quoted strings, trailing comment - and leaves every motion semantic
//! to the firmware.
//!
//! Job readers track byte offsets so the job executor can commit and
//! restore file positions; macro readers do not, since macro codes
//! carry no file position on the wire.

use gantry_types::{Code, CodeChannel, CodeKind, CodeParameter, DaemonError, ParamValue};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};

/// Streaming reader turning a file into codes.
#[derive(Debug)]
pub struct CodeReader {
    reader: BufReader<File>,
    filename: PathBuf,
    channel: CodeChannel,
    offset: u64,
    length: u64,
    track_offsets: bool,
}

impl CodeReader {
    /// Opens a job file; codes carry their byte offsets.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] if the file cannot be opened.
    pub async fn open_job(path: &Path, channel: CodeChannel) -> Result<Self, DaemonError> {
        Self::open(path, channel, true).await
    }

    /// Opens a macro file; codes carry no byte offsets.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] if the file cannot be opened.
    pub async fn open_macro(path: &Path, channel: CodeChannel) -> Result<Self, DaemonError> {
        Self::open(path, channel, false).await
    }

    async fn open(path: &Path, channel: CodeChannel, track_offsets: bool) -> Result<Self, DaemonError> {
        let file = File::open(path)
            .await
            .map_err(|e| DaemonError::FileError(format!("{}: {e}", path.display())))?;
        let length = file
            .metadata()
            .await
            .map_err(|e| DaemonError::FileError(format!("{}: {e}", path.display())))?
            .len();
        Ok(Self {
            reader: BufReader::new(file),
            filename: path.to_path_buf(),
            channel,
            offset: 0,
            length,
            track_offsets,
        })
    }

    /// Total file length in bytes.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// The file this reader sources.
    #[must_use]
    pub fn filename(&self) -> &Path {
        &self.filename
    }

    /// Repositions the reader to an absolute byte offset.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] on a seek failure.
    pub async fn seek(&mut self, offset: u64) -> Result<(), DaemonError> {
        self.reader
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| DaemonError::FileError(format!("{}: {e}", self.filename.display())))?;
        self.offset = offset;
        Ok(())
    }

    /// Reads the next code, or `None` at end of file.
    ///
    /// # Errors
    ///
    /// Returns [`DaemonError::FileError`] on an I/O error or an
    /// unparseable line. The reader stays usable: the failed line is
    /// consumed and the byte offset advanced past it.
    pub async fn next(&mut self) -> Result<Option<Code>, DaemonError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| DaemonError::FileError(format!("{}: {e}", self.filename.display())))?;
        if read == 0 {
            return Ok(None);
        }

        let start = self.offset;
        self.offset += read as u64;

        let mut code = parse_code(&line, self.channel).map_err(|e| match e {
            DaemonError::FileError(msg) => {
                DaemonError::FileError(format!("{} @{start}: {msg}", self.filename.display()))
            }
            other => other,
        })?;
        if self.track_offsets {
            code.file_offset = Some(start);
        }
        code.length = read as u32;
        Ok(Some(code))
    }
}

/// Parses one line of text into a code.
///
/// # Errors
///
/// Returns [`DaemonError::FileError`] on malformed input: a missing
/// command number, an unterminated string, or a parameter value that is
/// neither a number nor a string.
pub fn parse_code(line: &str, channel: CodeChannel) -> Result<Code, DaemonError> {
    let (content, comment) = split_comment(line);
    let mut chars = content.trim().chars().peekable();

    let Some(letter) = chars.next() else {
        return Ok(Code {
            kind: if comment.is_some() {
                CodeKind::Comment
            } else {
                CodeKind::Empty
            },
            major: None,
            minor: None,
            parameters: Vec::new(),
            channel,
            file_offset: None,
            length: 0,
            comment,
        });
    };

    let kind = match letter.to_ascii_uppercase() {
        'G' => CodeKind::G,
        'M' => CodeKind::M,
        'T' => CodeKind::T,
        other => {
            return Err(DaemonError::FileError(format!(
                "unexpected command letter '{other}'"
            )))
        }
    };

    let number = take_number_token(&mut chars);
    if number.is_empty() {
        return Err(DaemonError::FileError(format!(
            "command letter '{letter}' without a number"
        )));
    }
    let (major, minor) = parse_code_number(&number)?;

    let mut parameters = Vec::new();
    loop {
        // Skip whitespace between words.
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        let Some(param_letter) = chars.next() else {
            break;
        };
        if !param_letter.is_ascii_alphabetic() {
            return Err(DaemonError::FileError(format!(
                "unexpected character '{param_letter}' in parameter list"
            )));
        }
        let value = take_value(&mut chars)?;
        parameters.push(CodeParameter {
            letter: param_letter.to_ascii_uppercase(),
            value,
        });
    }

    Ok(Code {
        kind,
        major: Some(major),
        minor,
        parameters,
        channel,
        file_offset: None,
        length: 0,
        comment,
    })
}

fn split_comment(line: &str) -> (&str, Option<String>) {
    let mut in_string = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_string = !in_string,
            ';' if !in_string => {
                let comment = line[i + 1..].trim_end_matches(['\r', '\n']).to_string();
                return (&line[..i], Some(comment));
            }
            _ => {}
        }
    }
    (line.trim_end_matches(['\r', '\n']), None)
}

fn take_number_token(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut token = String::new();
    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' || (token.is_empty() && c == '-') {
            token.push(c);
            chars.next();
        } else {
            break;
        }
    }
    token
}

fn parse_code_number(token: &str) -> Result<(i32, Option<i8>), DaemonError> {
    match token.split_once('.') {
        Some((major, minor)) => {
            let major = major
                .parse()
                .map_err(|_| DaemonError::FileError(format!("bad command number '{token}'")))?;
            let minor = minor
                .parse()
                .map_err(|_| DaemonError::FileError(format!("bad command number '{token}'")))?;
            Ok((major, Some(minor)))
        }
        None => {
            let major = token
                .parse()
                .map_err(|_| DaemonError::FileError(format!("bad command number '{token}'")))?;
            Ok((major, None))
        }
    }
}

fn take_value(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
) -> Result<ParamValue, DaemonError> {
    match chars.peek() {
        Some('"') => {
            chars.next();
            let mut text = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    return Ok(ParamValue::Text(text));
                }
                text.push(c);
            }
            Err(DaemonError::FileError("unterminated string".into()))
        }
        _ => {
            let token = take_number_token(chars);
            if token.is_empty() {
                // Flag-style parameter without a value (e.g. `G28 X`).
                return Ok(ParamValue::Uint(0));
            }
            if !token.contains('.') {
                if let Ok(v) = token.parse::<i32>() {
                    return Ok(if v >= 0 {
                        ParamValue::Uint(v as u32)
                    } else {
                        ParamValue::Int(v)
                    });
                }
                if let Ok(v) = token.parse::<u32>() {
                    return Ok(ParamValue::Uint(v));
                }
            }
            token
                .parse::<f32>()
                .map(ParamValue::Float)
                .map_err(|_| DaemonError::FileError(format!("bad parameter value '{token}'")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(line: &str) -> Code {
        parse_code(line, CodeChannel::File).unwrap()
    }

    #[test]
    fn parses_motion_code() {
        let code = parse("G1 X10 Y-2.5 F3000");
        assert_eq!(code.kind, CodeKind::G);
        assert_eq!(code.major, Some(1));
        assert_eq!(code.parameters.len(), 3);
        assert_eq!(code.parameter('Y'), Some(&ParamValue::Float(-2.5)));
        assert_eq!(code.parameter('F'), Some(&ParamValue::Uint(3000)));
    }

    #[test]
    fn parses_macro_invocation() {
        let code = parse("M98 P\"homing/homeall.g\"");
        assert_eq!(code.major, Some(98));
        assert_eq!(
            code.parameter('P'),
            Some(&ParamValue::Text("homing/homeall.g".into()))
        );
    }

    #[test]
    fn parses_minor_number() {
        let code = parse("G54.3");
        assert_eq!(code.major, Some(54));
        assert_eq!(code.minor, Some(3));
    }

    #[test]
    fn comment_line_is_not_executable() {
        let code = parse("; pure comment");
        assert_eq!(code.kind, CodeKind::Comment);
        assert_eq!(code.comment.as_deref(), Some(" pure comment"));
        assert!(!code.is_executable());
    }

    #[test]
    fn trailing_comment_is_captured() {
        let code = parse("G28 ; home all");
        assert_eq!(code.major, Some(28));
        assert_eq!(code.comment.as_deref(), Some(" home all"));
    }

    #[test]
    fn semicolon_inside_string_is_content() {
        let code = parse("M117 S\"a;b\"");
        assert_eq!(code.parameter('S'), Some(&ParamValue::Text("a;b".into())));
        assert!(code.comment.is_none());
    }

    #[test]
    fn flag_parameter_defaults_to_zero() {
        let code = parse("G28 X");
        assert_eq!(code.parameter('X'), Some(&ParamValue::Uint(0)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_code("Q99", CodeChannel::File).is_err());
        assert!(parse_code("G", CodeChannel::File).is_err());
        assert!(parse_code("M117 S\"open", CodeChannel::File).is_err());
    }

    #[tokio::test]
    async fn reader_tracks_offsets_for_jobs() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "G1 X10\nG1 X20\nM400\n").unwrap();

        let mut reader = CodeReader::open_job(file.path(), CodeChannel::File)
            .await
            .unwrap();
        assert_eq!(reader.length(), 19);

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.file_offset, Some(0));
        assert_eq!(first.length, 7);

        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.file_offset, Some(7));
        assert_eq!(second.end_offset(), Some(14));

        let third = reader.next().await.unwrap().unwrap();
        assert_eq!(third.major, Some(400));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn macro_reader_leaves_offsets_empty() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "G91\nG1 Z5\n").unwrap();

        let mut reader = CodeReader::open_macro(file.path(), CodeChannel::File)
            .await
            .unwrap();
        let code = reader.next().await.unwrap().unwrap();
        assert_eq!(code.file_offset, None);
        assert_eq!(code.length, 4);
    }

    #[tokio::test]
    async fn seek_restarts_from_offset() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "G1 X10\nG1 X20\n").unwrap();

        let mut reader = CodeReader::open_job(file.path(), CodeChannel::File)
            .await
            .unwrap();
        reader.next().await.unwrap();
        reader.seek(7).await.unwrap();

        let code = reader.next().await.unwrap().unwrap();
        assert_eq!(code.file_offset, Some(7));
        assert_eq!(code.parameter('X'), Some(&ParamValue::Uint(20)));
    }

    #[tokio::test]
    async fn missing_file_is_a_file_error() {
        let err = CodeReader::open_job(Path::new("/nonexistent/job.g"), CodeChannel::File)
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::FileError(_)));
    }
}
