use crate::error::ParseError;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

pub const MAXARGS: usize = 128;

/// The kind of descriptor rebinding a redirection asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectOp {
    /// `<`
    In,
    /// `>` and `>>`
    Out,
    /// `>|`
    Clobber,
    /// `<>`
    InOut,
    /// `&>` and `&>>`: stdout and stderr to the same file.
    ErrOut,
    /// `<&n`
    DupIn,
    /// `>&n`
    DupOut,
    /// `<&-` and `>&-`
    Close,
}

/// One redirection as written on the command line.
///
/// `left_fd` is `None` when the user did not give a descriptor number; the
/// resolver picks stdin or stdout depending on `op`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirection {
    pub left_fd: Option<RawFd>,
    pub right_fd: Option<RawFd>,
    pub filename: Option<PathBuf>,
    pub op: RedirectOp,
    pub append: bool,
}

/// A simple command: `NAME=value... argv... redirections...`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimpleCommand {
    pub argv: Vec<String>,
    pub env_bindings: Vec<String>,
    pub redirections: Vec<Redirection>,
}

impl SimpleCommand {
    fn is_empty(&self) -> bool {
        self.argv.is_empty() && self.env_bindings.is_empty() && self.redirections.is_empty()
    }
}

/// One stage of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Simple(SimpleCommand),
}

/// How a pipeline relates to the one before it on the same line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    None,
    And,
    Or,
}

/// A parsed pipeline: `cmd | cmd | ... [&]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    pub commands: Vec<Command>,
    pub connector: Connector,
    pub background: bool,
    pub source_text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum TokenKind {
    Word { text: String, assignment: bool },
    Pipe,
    AndIf,
    OrIf,
    Amp,
    Semi,
    Redirect {
        fd: Option<RawFd>,
        op: RedirectOp,
        append: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

impl TokenKind {
    fn describe(&self) -> String {
        match self {
            TokenKind::Word { text, .. } => text.clone(),
            TokenKind::Pipe => "|".into(),
            TokenKind::AndIf => "&&".into(),
            TokenKind::OrIf => "||".into(),
            TokenKind::Amp => "&".into(),
            TokenKind::Semi => ";".into(),
            TokenKind::Redirect { op, append, .. } => redirect_symbol(*op, *append).into(),
        }
    }
}

fn redirect_symbol(op: RedirectOp, append: bool) -> &'static str {
    match (op, append) {
        (RedirectOp::In, _) => "<",
        (RedirectOp::Out, false) => ">",
        (RedirectOp::Out, true) => ">>",
        (RedirectOp::Clobber, _) => ">|",
        (RedirectOp::InOut, _) => "<>",
        (RedirectOp::ErrOut, false) => "&>",
        (RedirectOp::ErrOut, true) => "&>>",
        (RedirectOp::DupIn, _) => "<&",
        (RedirectOp::DupOut, _) => ">&",
        (RedirectOp::Close, _) => "&-",
    }
}

/// Parses one input line into the pipelines it contains.
///
/// - Tokenization (quotes, escapes, `$` and `~` expansion)
/// - Pipes, `&&`, `||`, `;` and a trailing `&` per pipeline
/// - Redirections with optional descriptor numbers, kept in the order they
///   were written so the last one on a descriptor wins
/// - Leading `NAME=value` words as per-command environment bindings
///
/// `last_status` is substituted for `$?`.
pub fn parse_command_line(cmdline: &str, last_status: i32) -> Result<Vec<Pipeline>, ParseError> {
    let tokens = tokenize(cmdline, last_status)?;

    let mut pipelines = Vec::new();
    let mut commands: Vec<Command> = Vec::new();
    let mut current = SimpleCommand::default();
    let mut connector = Connector::None;
    let mut span: Option<(usize, usize)> = None;
    // Set after `|`, `&&` or `||`, which all need something to follow.
    let mut dangling = false;

    let mut iter = tokens.into_iter().peekable();
    while let Some(token) = iter.next() {
        let (start, end) = (token.start, token.end);
        match token.kind {
            TokenKind::Word { text, assignment } => {
                if assignment && current.argv.is_empty() {
                    current.env_bindings.push(text);
                } else if current.argv.len() < MAXARGS - 1 {
                    current.argv.push(text);
                } else {
                    return Err(ParseError::UnexpectedToken(text));
                }
                dangling = false;
            }
            TokenKind::Redirect { fd, op, append } => {
                let target = match iter.next() {
                    Some(Token {
                        kind: TokenKind::Word { text, .. },
                        end: target_end,
                        ..
                    }) => {
                        span = Some((span.map_or(start, |s| s.0), target_end));
                        text
                    }
                    _ => {
                        return Err(ParseError::MissingRedirectTarget(
                            redirect_symbol(op, append).into(),
                        ))
                    }
                };
                current.redirections.push(build_redirection(fd, op, append, target)?);
                dangling = false;
                continue;
            }
            TokenKind::Pipe => {
                if current.is_empty() {
                    return Err(ParseError::UnexpectedToken("|".into()));
                }
                commands.push(Command::Simple(std::mem::take(&mut current)));
                dangling = true;
            }
            TokenKind::AndIf | TokenKind::OrIf | TokenKind::Amp | TokenKind::Semi => {
                if current.is_empty() {
                    return Err(ParseError::UnexpectedToken(token.kind.describe()));
                }
                commands.push(Command::Simple(std::mem::take(&mut current)));
                let (s, e) = span.unwrap_or((start, start));
                pipelines.push(Pipeline {
                    commands: std::mem::take(&mut commands),
                    connector,
                    background: token.kind == TokenKind::Amp,
                    source_text: cmdline[s..e].trim().to_string(),
                });
                span = None;
                connector = match token.kind {
                    TokenKind::AndIf => Connector::And,
                    TokenKind::OrIf => Connector::Or,
                    _ => Connector::None,
                };
                dangling = matches!(token.kind, TokenKind::AndIf | TokenKind::OrIf);
                continue;
            }
        }
        span = Some((span.map_or(start, |s| s.0), end));
    }

    if dangling {
        return Err(ParseError::UnexpectedEnd);
    }
    if !current.is_empty() {
        commands.push(Command::Simple(current));
    }
    if !commands.is_empty() {
        let (s, e) = span.unwrap_or((0, cmdline.len()));
        pipelines.push(Pipeline {
            commands,
            connector,
            background: false,
            source_text: cmdline[s..e].trim().to_string(),
        });
    }
    Ok(pipelines)
}

fn build_redirection(
    fd: Option<RawFd>,
    op: RedirectOp,
    append: bool,
    target: String,
) -> Result<Redirection, ParseError> {
    let mut redirection = Redirection {
        left_fd: fd,
        right_fd: None,
        filename: None,
        op,
        append,
    };
    match op {
        RedirectOp::DupIn | RedirectOp::DupOut => {
            if target == "-" {
                let natural = if op == RedirectOp::DupIn { 0 } else { 1 };
                redirection.left_fd = Some(fd.unwrap_or(natural));
                redirection.op = RedirectOp::Close;
            } else if let Ok(n) = target.parse::<RawFd>() {
                redirection.right_fd = Some(n);
            } else if op == RedirectOp::DupOut && fd.is_none() {
                // `>&file` is the old spelling of `&>file`.
                redirection.op = RedirectOp::ErrOut;
                redirection.filename = Some(PathBuf::from(target));
            } else {
                return Err(ParseError::BadDescriptorWord(target));
            }
        }
        _ => redirection.filename = Some(PathBuf::from(target)),
    }
    Ok(redirection)
}

/// Splits the input command line into tokens. This function handles:
///
/// - Quoted strings (single quotes literal, double quotes expanding `$`)
/// - Backslash escapes
/// - Operators: `|`, `||`, `&`, `&&`, `;` and the redirection family,
///   including a leading descriptor number such as `2>`
fn tokenize(input: &str, last_status: i32) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(start, ch)) = chars.peek() {
        if ch.is_whitespace() {
            chars.next();
            continue;
        }
        if ch == '#' {
            break;
        }
        if let Some(kind) = operator(&mut chars, None) {
            let end = chars.peek().map_or(input.len(), |&(i, _)| i);
            tokens.push(Token { kind, start, end });
            continue;
        }

        let mut word = String::new();
        let mut plain_digits = true;
        let mut quoted = false;
        let mut assignment = false;
        let mut first = true;
        while let Some(&(_, c)) = chars.peek() {
            if c.is_whitespace() || is_operator_start(c) {
                // `2>file`: an unquoted all-digit word glued to `<`/`>` is a descriptor.
                if (c == '<' || c == '>') && !word.is_empty() && plain_digits && !quoted {
                    let fd = word
                        .parse::<RawFd>()
                        .map_err(|_| ParseError::BadDescriptorWord(word.clone()))?;
                    if let Some(kind) = operator(&mut chars, Some(fd)) {
                        let end = chars.peek().map_or(input.len(), |&(i, _)| i);
                        tokens.push(Token { kind, start, end });
                        word.clear();
                    }
                }
                break;
            }
            chars.next();
            match c {
                '\'' => {
                    quoted = true;
                    loop {
                        match chars.next() {
                            Some((_, '\'')) => break,
                            Some((_, q)) => word.push(q),
                            None => return Err(ParseError::UnterminatedQuote('\'')),
                        }
                    }
                }
                '"' => {
                    quoted = true;
                    loop {
                        match chars.next() {
                            Some((_, '"')) => break,
                            Some((_, '\\')) => match chars.peek() {
                                Some(&(_, e @ ('"' | '\\' | '$'))) => {
                                    chars.next();
                                    word.push(e);
                                }
                                _ => word.push('\\'),
                            },
                            Some((_, '$')) => word.push_str(&expand_parameter(&mut chars, last_status)),
                            Some((_, q)) => word.push(q),
                            None => return Err(ParseError::UnterminatedQuote('"')),
                        }
                    }
                }
                '\\' => {
                    quoted = true;
                    if let Some((_, e)) = chars.next() {
                        word.push(e);
                    }
                }
                '$' => word.push_str(&expand_parameter(&mut chars, last_status)),
                '~' if first && chars.peek().map_or(true, |&(_, n)| n == '/' || n.is_whitespace()) => {
                    match dirs_next::home_dir() {
                        Some(home) => word.push_str(&home.to_string_lossy()),
                        None => word.push('~'),
                    }
                }
                '=' if !quoted && !assignment && is_name(&word) => {
                    assignment = true;
                    word.push('=');
                }
                _ => word.push(c),
            }
            plain_digits = plain_digits && c.is_ascii_digit();
            first = false;
        }
        if !word.is_empty() || quoted {
            let end = chars.peek().map_or(input.len(), |&(i, _)| i);
            tokens.push(Token {
                kind: TokenKind::Word {
                    text: word,
                    assignment,
                },
                start,
                end,
            });
        }
    }
    Ok(tokens)
}

fn is_operator_start(c: char) -> bool {
    matches!(c, '<' | '>' | '|' | '&' | ';')
}

fn is_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Consumes an operator at the current position, if there is one.
fn operator<I>(chars: &mut std::iter::Peekable<I>, fd: Option<RawFd>) -> Option<TokenKind>
where
    I: Iterator<Item = (usize, char)> + Clone,
{
    let mut lookahead = chars.clone();
    let (_, first) = lookahead.next()?;
    let second = lookahead.next().map(|(_, c)| c);
    let third = lookahead.next().map(|(_, c)| c);

    let redirect = |op, append| TokenKind::Redirect { fd, op, append };
    let (kind, len) = match (first, second, third) {
        ('|', Some('|'), _) if fd.is_none() => (TokenKind::OrIf, 2),
        ('|', _, _) if fd.is_none() => (TokenKind::Pipe, 1),
        ('&', Some('>'), Some('>')) if fd.is_none() => (redirect(RedirectOp::ErrOut, true), 3),
        ('&', Some('>'), _) if fd.is_none() => (redirect(RedirectOp::ErrOut, false), 2),
        ('&', Some('&'), _) if fd.is_none() => (TokenKind::AndIf, 2),
        ('&', _, _) if fd.is_none() => (TokenKind::Amp, 1),
        (';', _, _) if fd.is_none() => (TokenKind::Semi, 1),
        ('>', Some('>'), _) => (redirect(RedirectOp::Out, true), 2),
        ('>', Some('|'), _) => (redirect(RedirectOp::Clobber, false), 2),
        ('>', Some('&'), _) => (redirect(RedirectOp::DupOut, false), 2),
        ('>', _, _) => (redirect(RedirectOp::Out, false), 1),
        ('<', Some('>'), _) => (redirect(RedirectOp::InOut, false), 2),
        ('<', Some('&'), _) => (redirect(RedirectOp::DupIn, false), 2),
        ('<', _, _) => (redirect(RedirectOp::In, false), 1),
        _ => return None,
    };
    for _ in 0..len {
        chars.next();
    }
    Some(kind)
}

/// Expands the parameter following a `$` that has already been consumed.
fn expand_parameter<I>(chars: &mut std::iter::Peekable<I>, last_status: i32) -> String
where
    I: Iterator<Item = (usize, char)>,
{
    match chars.peek() {
        Some(&(_, '?')) => {
            chars.next();
            last_status.to_string()
        }
        Some(&(_, '$')) => {
            chars.next();
            std::process::id().to_string()
        }
        Some(&(_, '{')) => {
            chars.next();
            let mut name = String::new();
            for (_, c) in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            env_expand(&name)
        }
        Some(&(_, c)) if c.is_ascii_alphabetic() || c == '_' => {
            let mut name = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if !(c.is_ascii_alphanumeric() || c == '_') {
                    break;
                }
                name.push(c);
                chars.next();
            }
            env_expand(&name)
        }
        _ => "$".to_string(),
    }
}

fn env_expand(name: &str) -> String {
    std::env::var(name).unwrap_or_default()
}
