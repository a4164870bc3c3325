//! Script parsing.
//!
//! Source text is tokenised with logos and the token stream is turned
//! into a [`Script`] with chumsky. Whitespace is a token of its own so
//! adjacent pieces such as `${NAME}x` or `'a'"b"` join into one word.

use chumsky::{input::ValueInput, prelude::*};
use logos::Logos;
use std::fmt;
use thiserror::Error;

/// Span type used by the parser
pub type Span = SimpleSpan;

#[derive(Debug, Clone, Default, Error, PartialEq, Eq)]
pub enum ParseError {
    #[default]
    #[error("unexpected character")]
    UnexpectedCharacter,

    #[error("unsupported shell syntax near '{0}'")]
    Unsupported(String),

    #[error("unterminated {0} quote")]
    UnterminatedQuote(&'static str),

    #[error("unterminated parameter expansion '${{'")]
    UnterminatedBrace,

    #[error("bad parameter expansion '${{{0}}}'")]
    BadSubstitution(String),

    #[error("syntax error near unexpected token '{0}'")]
    UnexpectedToken(String),
}

/// A parsed script: and-or lists separated by `;` or newlines
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Script {
    pub lists: Vec<AndOrList>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndOrList {
    pub first: Command,
    pub rest: Vec<(Connector, Command)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

/// A simple command with its prefix assignments
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Command {
    pub assignments: Vec<Assignment>,
    pub words: Vec<Word>,
}

impl Command {
    /// Leading `NAME=value` words become assignments
    fn from_words(words: Vec<Word>) -> Self {
        let mut command = Command::default();
        for word in words {
            if command.words.is_empty() {
                if let Some(assignment) = word.as_assignment() {
                    command.assignments.push(assignment);
                    continue;
                }
            }
            command.words.push(word);
        }
        command
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub name: String,
    pub value: Word,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Word {
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal { text: String, quoted: bool },
    Param { name: String, quoted: bool },
}

impl Word {
    fn from_segments(segments: impl IntoIterator<Item = Segment>) -> Self {
        let mut word = Word::default();
        for segment in segments {
            word.push(segment);
        }
        word
    }

    /// Append, merging literal text with a preceding literal of the same quoting
    fn push(&mut self, segment: Segment) {
        if let Segment::Literal { text, quoted } = &segment {
            if let Some(Segment::Literal {
                text: last,
                quoted: last_quoted,
            }) = self.segments.last_mut()
            {
                if last_quoted == quoted {
                    last.push_str(text);
                    return;
                }
            }
        }
        self.segments.push(segment);
    }

    /// Split `NAME=value` off the front if this word is an assignment
    fn as_assignment(&self) -> Option<Assignment> {
        let Some(Segment::Literal {
            text,
            quoted: false,
        }) = self.segments.first()
        else {
            return None;
        };

        let (name, value) = text.split_once('=')?;
        if !is_name(name) {
            return None;
        }

        let mut rest = Vec::new();
        if !value.is_empty() {
            rest.push(Segment::Literal {
                text: value.to_string(),
                quoted: false,
            });
        }
        rest.extend(self.segments[1..].iter().cloned());

        Some(Assignment {
            name: name.to_string(),
            value: Word { segments: rest },
        })
    }
}

pub(crate) fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c == '_' || c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn is_special(name: &str) -> bool {
    matches!(name, "@" | "*" | "#" | "?")
        || (!name.is_empty() && name.chars().all(|c| c.is_ascii_digit()))
}

fn literal(text: impl Into<String>, quoted: bool) -> Segment {
    Segment::Literal {
        text: text.into(),
        quoted,
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = ParseError)]
pub enum Token {
    #[regex(r"[ \t\r]+")]
    Blank,

    #[token(";")]
    #[token("\n")]
    Separator,

    #[token("&&")]
    And,

    #[token("||")]
    Or,

    /// Unquoted word text
    #[regex(
        r#"[^ \t\r\n'"\\$;&|<>()`{}#][^ \t\r\n'"\\$;&|<>()`]*"#,
        lex_slice,
        allow_greedy = true
    )]
    Bare(String),

    /// `'...'`, content taken literally
    #[regex(r"'[^']*'", lex_single_quoted)]
    SingleQuoted(String),

    /// `"..."` with parameter expansion inside
    #[regex(r#""([^"\\]|\\(.|\n))*""#, lex_double_quoted)]
    DoubleQuoted(Vec<Segment>),

    /// `\c` quotes one character
    #[regex(r"\\[^\n]", lex_tail)]
    Escaped(String),

    /// A backslash at the very end of the script
    #[token("\\")]
    Backslash,

    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*", lex_tail)]
    #[regex(r"\$[0-9@*#?]", lex_tail)]
    #[regex(r"\$\{[^}]*\}", lex_braced_param)]
    Param(String),

    /// `$` not starting an expansion
    #[token("$")]
    Dollar,

    #[regex(r"[|&<>(){}`]", lex_slice)]
    #[token("$(", lex_slice)]
    Unsupported(String),

    #[regex(r"'[^']*", allow_greedy = true)]
    UnterminatedSingle,

    #[regex(r#""([^"\\]|\\(.|\n))*"#, allow_greedy = true)]
    UnterminatedDouble,

    #[regex(r"\$\{[^}]*", allow_greedy = true)]
    UnterminatedBrace,

    #[regex(r"#[^\n]*", allow_greedy = true)]
    Comment,

    #[regex(r"\\\r?\n")]
    LineContinuation,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Blank => write!(f, " "),
            Token::Separator => write!(f, ";"),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Bare(text) | Token::Unsupported(text) => write!(f, "{}", text),
            Token::SingleQuoted(text) => write!(f, "'{}'", text),
            Token::DoubleQuoted(_) => write!(f, "\"...\""),
            Token::Escaped(text) => write!(f, "\\{}", text),
            Token::Backslash => write!(f, "\\"),
            Token::Param(name) => write!(f, "${{{}}}", name),
            Token::Dollar => write!(f, "$"),
            Token::UnterminatedSingle => write!(f, "'"),
            Token::UnterminatedDouble => write!(f, "\""),
            Token::UnterminatedBrace => write!(f, "${{"),
            Token::Comment => write!(f, "#"),
            Token::LineContinuation => write!(f, "\\"),
        }
    }
}

fn lex_slice<'s, T: Logos<'s, Source = str>>(lex: &mut logos::Lexer<'s, T>) -> String {
    lex.slice().to_string()
}

fn lex_single_quoted(lex: &mut logos::Lexer<Token>) -> String {
    let s = lex.slice();
    s[1..s.len() - 1].to_string()
}

/// Drop the leading sigil: `$NAME` → `NAME`, `\c` → `c`
fn lex_tail<'s, T: Logos<'s, Source = str>>(lex: &mut logos::Lexer<'s, T>) -> String {
    lex.slice()[1..].to_string()
}

/// `${NAME}` → `NAME`
fn lex_braced_param<'s, T: Logos<'s, Source = str>>(
    lex: &mut logos::Lexer<'s, T>,
) -> Result<String, ParseError> {
    let s = lex.slice();
    let name = &s[2..s.len() - 1];
    if is_name(name) || is_special(name) {
        Ok(name.to_string())
    } else {
        Err(ParseError::BadSubstitution(name.to_string()))
    }
}

/// Pieces of a double-quoted string
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = ParseError)]
enum Quoted {
    #[regex(r"[^\\$`]+", lex_slice, allow_greedy = true)]
    // Only these characters lose their backslash
    #[regex(r#"\\["\\$`]"#, lex_tail)]
    #[regex(r#"\\[^\n"\\$`]"#, lex_slice)]
    Text(String),

    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*", lex_tail)]
    #[regex(r"\$[0-9@*#?]", lex_tail)]
    #[regex(r"\$\{[^}]*\}", lex_braced_param)]
    Param(String),

    #[token("$")]
    Dollar,

    #[token("$(", lex_slice)]
    #[token("`", lex_slice)]
    Unsupported(String),

    #[regex(r"\$\{[^}]*", allow_greedy = true)]
    UnterminatedBrace,

    #[regex(r"\\\r?\n")]
    LineContinuation,
}

fn lex_double_quoted(lex: &mut logos::Lexer<Token>) -> Result<Vec<Segment>, ParseError> {
    let s = lex.slice();
    // An empty "" still yields an (empty) quoted field
    let mut segments = vec![literal("", true)];

    for part in Quoted::lexer(&s[1..s.len() - 1]) {
        match part? {
            Quoted::Text(text) => segments.push(literal(text, true)),
            Quoted::Param(name) => segments.push(Segment::Param { name, quoted: true }),
            Quoted::Dollar => segments.push(literal("$", true)),
            Quoted::Unsupported(text) => return Err(ParseError::Unsupported(text)),
            Quoted::UnterminatedBrace => return Err(ParseError::UnterminatedBrace),
            Quoted::LineContinuation => {}
        }
    }

    Ok(segments)
}

/// Tokenise a script, dropping comments and line continuations
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>, ParseError> {
    let mut tokens = Vec::new();

    for (result, span) in Token::lexer(source).spanned() {
        match result? {
            Token::Comment | Token::LineContinuation => {}
            Token::Unsupported(text) => return Err(ParseError::Unsupported(text)),
            Token::UnterminatedSingle => return Err(ParseError::UnterminatedQuote("single")),
            Token::UnterminatedDouble => return Err(ParseError::UnterminatedQuote("double")),
            Token::UnterminatedBrace => return Err(ParseError::UnterminatedBrace),
            token => tokens.push((token, span.into())),
        }
    }

    Ok(tokens)
}

/// Parse a script body
pub fn parse(source: &str) -> Result<Script, ParseError> {
    let tokens = tokenize(source)?;
    let end_span: Span = (source.len()..source.len()).into();

    let result = script_parser()
        .parse(tokens.as_slice().map(end_span, |(t, s)| (t, s)))
        .into_result()
        .map_err(|errors| {
            let near = errors
                .first()
                .and_then(|e| e.found())
                .map(|token| token.to_string())
                .unwrap_or_else(|| "end of script".to_string());
            ParseError::UnexpectedToken(near)
        });
    result
}

fn script_parser<'tokens, 'src: 'tokens, I>(
) -> impl Parser<'tokens, I, Script, extra::Err<Rich<'tokens, Token, Span>>>
where
    I: ValueInput<'tokens, Token = Token, Span = Span>,
{
    let blanks = just(Token::Blank).repeated().at_least(1);
    let gap = choice((just(Token::Blank), just(Token::Separator))).repeated();

    let piece = select! {
        Token::Bare(text) => vec![literal(text, false)],
        Token::SingleQuoted(text) => vec![literal(text, true)],
        Token::DoubleQuoted(segments) => segments,
        Token::Escaped(text) => vec![literal(text, true)],
        Token::Backslash => vec![literal("\\", false)],
        Token::Param(name) => vec![Segment::Param { name, quoted: false }],
        Token::Dollar => vec![literal("$", false)],
    };

    let word = piece
        .repeated()
        .at_least(1)
        .collect::<Vec<_>>()
        .map(|pieces| Word::from_segments(pieces.into_iter().flatten()));

    let command = word
        .separated_by(blanks)
        .allow_leading()
        .allow_trailing()
        .at_least(1)
        .collect::<Vec<_>>()
        .map(Command::from_words);

    // A newline may follow && and ||
    let connector = choice((
        just(Token::And).to(Connector::And),
        just(Token::Or).to(Connector::Or),
    ))
    .then_ignore(gap.clone());

    let list = command
        .clone()
        .then(connector.then(command).repeated().collect::<Vec<_>>())
        .map(|(first, rest)| AndOrList { first, rest });

    gap.clone()
        .ignore_then(list.then_ignore(gap).repeated().collect::<Vec<_>>())
        .then_ignore(end())
        .map(|lists| Script { lists })
}
