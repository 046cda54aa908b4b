//! The framing layer of the Kalah Game Protocol. One frame per CR/LF
//! terminated line:
//!
//! ```text
//! frame   := [id ('@' ref)? SP] command (SP argument)* CRLF
//! ```
//!
//! Arguments are quoted strings (with `\n`, `\t`, `\\` and `\"` escapes),
//! decimals, floats, board literals in the `<…>` form, or bare words.
//! Parsing is forgiving: surplus whitespace is insignificant, empty lines
//! parse to nothing, and a trailing `@ref` token after the command is
//! accepted as the reference. Both sides are used consistently across the
//! server and its test clients.

use std::fmt::{Display, Formatter};

use kalah::Board;

/// Protocol version announced in the greeting, major part.
pub const VERSION_MAJOR: u32 = 1;
/// Protocol version announced in the greeting, minor part.
pub const VERSION_MINOR: u32 = 0;
/// Protocol version announced in the greeting, patch part.
pub const VERSION_PATCH: u32 = 1;

/// The only operating mode this server speaks.
pub const MODE_FREEPLAY: &str = "freeplay";

/// One argument of a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Argument {
    /// A quoted string or bare word.
    Text(String),
    /// A decimal integer.
    Integer(i64),
    /// A floating point number.
    Real(f64),
    /// A board literal in the `<…>` wire form.
    Board(Board),
}

impl Argument {
    /// The integer value, if this argument is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Argument::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// The textual value of a word or quoted string.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Argument::Text(text) => Some(text),
            _ => None,
        }
    }
}

/// A tokenised protocol line: optional id, optional reference to a peer id,
/// the command word and its arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub id: Option<u64>,
    pub reference: Option<u64>,
    pub command: String,
    pub args: Vec<Argument>,
}

impl Frame {
    /// A frame without id and reference, an unsolicited notification.
    pub fn bare(command: &str) -> Frame {
        Frame {
            id: None,
            reference: None,
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Attaches an id.
    pub fn with_id(mut self, id: u64) -> Frame {
        self.id = Some(id);
        self
    }

    /// Attaches a reference to a peer id.
    pub fn with_reference(mut self, reference: u64) -> Frame {
        self.reference = Some(reference);
        self
    }

    /// Appends an argument.
    pub fn arg(mut self, argument: Argument) -> Frame {
        self.args.push(argument);
        self
    }

    /// Parses one line. `Ok(None)` for blank lines; `Err` for malformed
    /// frames, which callers log and discard without disconnecting.
    pub fn parse(line: &str) -> Result<Option<Frame>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let mut tokens = tokenise(line)?;
        if tokens.is_empty() {
            return Ok(None);
        }

        let mut id = None;
        let mut reference = None;

        // a leading bare token of the shape `id` or `id@ref`
        if let Token::Word(first) = &tokens[0]
            && let Some((parsed_id, parsed_ref)) = parse_id_token(first)
        {
            if tokens.len() < 2 {
                return Err(format!("id without command: {:?}", line));
            }
            id = Some(parsed_id);
            reference = parsed_ref;
            tokens.remove(0);
        }

        let command = match tokens.remove(0) {
            Token::Word(word) if !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric()) => {
                word
            }
            other => return Err(format!("not a command word: {:?}", other)),
        };

        let mut args = Vec::new();
        for token in tokens {
            match token {
                // a trailing `@ref` names the request this frame answers
                Token::Word(word) if word.starts_with('@') => {
                    let value: u64 = word[1..]
                        .parse()
                        .map_err(|_| format!("bad reference token: {:?}", word))?;
                    if reference.is_none() {
                        reference = Some(value);
                    }
                }
                Token::Word(word) => args.push(classify(&word)),
                Token::Quoted(text) => args.push(Argument::Text(text)),
            }
        }

        Ok(Some(Frame {
            id,
            reference,
            command,
            args,
        }))
    }
}

/// Renders the canonical wire form, without the trailing CRLF.
impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if let Some(id) = self.id {
            write!(f, "{}", id)?;
            if let Some(reference) = self.reference {
                write!(f, "@{}", reference)?;
            }
            write!(f, " ")?;
        }
        write!(f, "{}", self.command)?;
        for argument in &self.args {
            match argument {
                Argument::Text(text) => write!(f, " {}", quote(text))?,
                Argument::Integer(value) => write!(f, " {}", value)?,
                Argument::Real(value) => write!(f, " {}", value)?,
                Argument::Board(board) => write!(f, " {}", board)?,
            }
        }
        Ok(())
    }
}

/// Quotes and escapes a string for the wire.
pub fn quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

/// A raw token before argument classification.
#[derive(Debug)]
enum Token {
    Word(String),
    Quoted(String),
}

/// Splits a line on whitespace, keeping quoted strings and `<…>` board
/// literals together.
fn tokenise(line: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    None => return Err(format!("unterminated quote: {:?}", line)),
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        None => return Err(format!("dangling escape: {:?}", line)),
                        Some('n') => text.push('\n'),
                        Some('t') => text.push('\t'),
                        Some('\\') => text.push('\\'),
                        Some('"') => text.push('"'),
                        Some(other) => text.push(other),
                    },
                    Some(other) => text.push(other),
                }
            }
            tokens.push(Token::Quoted(text));
        } else if c == '<' {
            // board literals may contain whitespace
            let mut literal = String::new();
            loop {
                match chars.next() {
                    None => return Err(format!("unterminated board literal: {:?}", line)),
                    Some('>') => {
                        literal.push('>');
                        break;
                    }
                    Some(other) => literal.push(other),
                }
            }
            tokens.push(Token::Word(literal));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            tokens.push(Token::Word(word));
        }
    }

    Ok(tokens)
}

/// Recognises `id` and `id@ref` leading tokens.
fn parse_id_token(token: &str) -> Option<(u64, Option<u64>)> {
    if !token.chars().next()?.is_ascii_digit() {
        return None;
    }
    match token.split_once('@') {
        None => token.parse().ok().map(|id| (id, None)),
        Some((id, reference)) => {
            let id = id.parse().ok()?;
            let reference = reference.parse().ok()?;
            Some((id, Some(reference)))
        }
    }
}

/// Interprets a bare token as the most specific argument kind.
fn classify(word: &str) -> Argument {
    if word.starts_with('<')
        && let Ok(board) = word.parse::<Board>()
    {
        return Argument::Board(board);
    }
    if let Ok(value) = word.parse::<i64>() {
        return Argument::Integer(value);
    }
    if let Ok(value) = word.parse::<f64>() {
        return Argument::Real(value);
    }
    Argument::Text(word.into())
}
