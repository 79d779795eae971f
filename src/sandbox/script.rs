//! The cube program language and its interpreter.
//!
//! Programs are line oriented: one statement per line, `#` starts a comment, arguments are
//! whitespace separated and may be double-quoted (`\"` and `\\` escapes). `repeat <n>` opens a
//! block closed by `end`. The interpreter only touches the outside world through the
//! [`ExecutionApi`] it is handed.

use std::collections::VecDeque;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use super::api::ExecutionApi;
use crate::channel::ChannelError;
use crate::cube::{Axis, CubeError, Face, Move};
use crate::protocol::{FailureReport, Level};

/// Nesting limit for `load`.
pub const MAX_LOAD_DEPTH: usize = 8;

const DEFAULT_OVERLAY_MS: u64 = 3000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("syntax error at {file}:{line}: {message}")]
    Syntax { file: String, line: usize, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementKind {
    Moves(Vec<Move>),
    Range { face: Face, start: u8, end: u8, angle: i8 },
    Face { face: Face, slice: u8, angle: i8 },
    Rotate { axis: Axis, angle: i8 },
    Shuffle(u32),
    Reset,
    Log { level: Level, message: String },
    Overlay { level: Level, title: String, message: String, duration: u64 },
    Inspect { face: Face, row: u8, col: u8 },
    Expect { face: Face, row: u8, col: u8, colour: Face },
    ExpectSolved,
    Sleep(Duration),
    Load(String),
    Repeat { count: u32, body: Vec<Statement> },
    Fail(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub line: usize,
    /// Trimmed source text, used in stack frames.
    pub text: String,
    pub kind: StatementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub file: String,
    pub statements: Vec<Statement>,
}

impl Program {
    pub fn parse(file: &str, text: &str) -> Result<Self, ScriptError> {
        let mut lines = text.lines().enumerate().map(|(index, line)| (index + 1, line));
        let statements = parse_block(file, &mut lines, None)?;
        Ok(Self {
            file: file.to_string(),
            statements,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Text(String),
}

/// Splits a line into tokens. Also returns the byte offset where the code ends, i.e. where a
/// trailing comment starts (`#` outside a string) or the line length.
fn tokenize(line: &str) -> Result<(Vec<Token>, usize), String> {
    let mut tokens = Vec::new();
    let mut chars = line.char_indices().peekable();
    let mut code_end = line.len();

    while let Some((at, c)) = chars.next() {
        match c {
            '#' => {
                code_end = at;
                break;
            }
            c if c.is_whitespace() => continue,
            '"' => {
                let mut text = String::new();
                loop {
                    match chars.next().map(|(_, c)| c) {
                        Some('"') => break,
                        Some('\\') => match chars.next().map(|(_, c)| c) {
                            Some(escaped @ ('"' | '\\')) => text.push(escaped),
                            Some('n') => text.push('\n'),
                            Some(other) => return Err(format!("unknown escape `\\{other}`")),
                            None => return Err("unterminated string".to_string()),
                        },
                        Some(other) => text.push(other),
                        None => return Err("unterminated string".to_string()),
                    }
                }
                tokens.push(Token::Text(text));
            }
            c => {
                let mut word = String::from(c);
                while let Some(&(_, next)) = chars.peek() {
                    if next.is_whitespace() || next == '#' || next == '"' {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }

    Ok((tokens, code_end))
}

struct Args {
    tokens: VecDeque<Token>,
}

impl Args {
    fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn peek_word(&self) -> Option<&str> {
        match self.tokens.front() {
            Some(Token::Word(word)) => Some(word),
            _ => None,
        }
    }

    fn peek_is_text(&self) -> bool {
        matches!(self.tokens.front(), Some(Token::Text(_)))
    }

    fn word(&mut self, what: &str) -> Result<String, String> {
        match self.tokens.pop_front() {
            Some(Token::Word(word)) => Ok(word),
            Some(Token::Text(text)) => Err(format!("expected {what}, found string \"{text}\"")),
            None => Err(format!("missing {what}")),
        }
    }

    fn text(&mut self, what: &str) -> Result<String, String> {
        match self.tokens.pop_front() {
            Some(Token::Word(value) | Token::Text(value)) => Ok(value),
            None => Err(format!("missing {what}")),
        }
    }

    fn parse<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, String> {
        let word = self.word(what)?;
        word.parse().map_err(|_| format!("invalid {what} `{word}`"))
    }

    fn parse_or<T: std::str::FromStr>(&mut self, what: &str, default: T) -> Result<T, String> {
        if self.is_empty() {
            Ok(default)
        } else {
            self.parse(what)
        }
    }

    fn finish(self) -> Result<(), String> {
        match self.tokens.front() {
            None => Ok(()),
            Some(Token::Word(extra) | Token::Text(extra)) => Err(format!("unexpected argument `{extra}`")),
        }
    }
}

fn parse_block<'t>(
    file: &str,
    lines: &mut impl Iterator<Item = (usize, &'t str)>,
    opened_at: Option<usize>,
) -> Result<Vec<Statement>, ScriptError> {
    let syntax = |line: usize, message: String| ScriptError::Syntax {
        file: file.to_string(),
        line,
        message,
    };

    let mut statements = Vec::new();
    while let Some((line, raw)) = lines.next() {
        let (tokens, code_end) = tokenize(raw).map_err(|m| syntax(line, m))?;
        let mut tokens: VecDeque<Token> = tokens.into();
        let keyword = match tokens.pop_front() {
            None => continue,
            Some(Token::Word(keyword)) => keyword,
            Some(Token::Text(text)) => return Err(syntax(line, format!("expected a statement, found \"{text}\""))),
        };
        let mut args = Args { tokens };

        let kind = match keyword.as_str() {
            "end" => {
                args.finish().map_err(|m| syntax(line, m))?;
                return match opened_at {
                    Some(_) => Ok(statements),
                    None => Err(syntax(line, "`end` without `repeat`".to_string())),
                };
            }
            "repeat" => {
                let count = args.parse("repeat count").map_err(|m| syntax(line, m))?;
                args.finish().map_err(|m| syntax(line, m))?;
                let body = parse_block(file, lines, Some(line))?;
                StatementKind::Repeat { count, body }
            }
            other => parse_statement(other, args).map_err(|m| syntax(line, m))?,
        };

        statements.push(Statement {
            line,
            text: raw[..code_end].trim().to_string(),
            kind,
        });
    }

    match opened_at {
        Some(line) => Err(syntax(line, "`repeat` without `end`".to_string())),
        None => Ok(statements),
    }
}

fn parse_statement(keyword: &str, mut args: Args) -> Result<StatementKind, String> {
    let kind = match keyword {
        "move" => {
            let mut moves = Vec::new();
            while !args.is_empty() {
                moves.push(args.parse::<Move>("move")?);
            }
            if moves.is_empty() {
                return Err("`move` needs at least one move".to_string());
            }
            StatementKind::Moves(moves)
        }
        "range" => StatementKind::Range {
            face: args.parse("face")?,
            start: args.parse("slice start")?,
            end: args.parse("slice end")?,
            angle: args.parse_or("angle", 1)?,
        },
        "face" => StatementKind::Face {
            face: args.parse("face")?,
            slice: args.parse_or("slice", 1)?,
            angle: args.parse_or("angle", 1)?,
        },
        "rotate" => StatementKind::Rotate {
            axis: args.parse("axis")?,
            angle: args.parse_or("angle", 1)?,
        },
        "shuffle" => StatementKind::Shuffle(args.parse("move count")?),
        "reset" => StatementKind::Reset,
        "log" => {
            let level = if args.tokens.len() > 1 { args.parse("level")? } else { Level::Info };
            StatementKind::Log {
                level,
                message: args.text("message")?,
            }
        }
        "overlay" => {
            let level = match args.peek_word().map(str::parse::<Level>) {
                Some(Ok(level)) => {
                    args.tokens.pop_front();
                    level
                }
                _ => Level::Info,
            };
            let title = args.text("title")?;
            let message = if args.peek_is_text() { args.text("message")? } else { String::new() };
            let duration = args.parse_or("duration", DEFAULT_OVERLAY_MS)?;
            StatementKind::Overlay {
                level,
                title,
                message,
                duration,
            }
        }
        "inspect" => StatementKind::Inspect {
            face: args.parse("face")?,
            row: args.parse("row")?,
            col: args.parse("column")?,
        },
        "expect" => StatementKind::Expect {
            face: args.parse("face")?,
            row: args.parse("row")?,
            col: args.parse("column")?,
            colour: args.parse("colour")?,
        },
        "expect_solved" => StatementKind::ExpectSolved,
        "sleep" => StatementKind::Sleep(Duration::from_millis(args.parse("milliseconds")?)),
        "load" => StatementKind::Load(args.text("path")?),
        "fail" => StatementKind::Fail(args.text("message")?),
        other => return Err(format!("unknown statement `{other}`")),
    };
    args.finish()?;
    Ok(kind)
}

/// A thrown program error, unwound into a stack of statement frames (innermost first).
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramFailure {
    pub message: String,
    pub frames: Vec<String>,
}

impl ProgramFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            frames: Vec::new(),
        }
    }

    pub fn into_report(self) -> FailureReport {
        let mut stack = format!("Error: {}", self.message);
        for frame in &self.frames {
            stack.push_str("\n    at ");
            stack.push_str(frame);
        }
        FailureReport {
            message: self.message,
            stack,
        }
    }
}

impl From<ScriptError> for ProgramFailure {
    fn from(err: ScriptError) -> Self {
        let ScriptError::Syntax { file, line, .. } = &err;
        Self {
            frames: vec![format!("{file}:{line}")],
            message: err.to_string(),
        }
    }
}

impl From<CubeError> for ProgramFailure {
    fn from(err: CubeError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<ChannelError> for ProgramFailure {
    fn from(err: ChannelError) -> Self {
        Self::new(err.to_string())
    }
}

pub struct Interpreter<'a> {
    api: &'a ExecutionApi,
}

impl<'a> Interpreter<'a> {
    pub fn new(api: &'a ExecutionApi) -> Self {
        Self { api }
    }

    pub async fn run(&self, program: &Program) -> Result<(), ProgramFailure> {
        self.execute(&program.file, &program.statements, 0).await
    }

    fn execute<'s>(
        &'s self,
        file: &'s str,
        statements: &'s [Statement],
        depth: usize,
    ) -> BoxFuture<'s, Result<(), ProgramFailure>> {
        Box::pin(async move {
            for statement in statements {
                if let Err(mut failure) = self.step(file, statement, depth).await {
                    failure
                        .frames
                        .push(format!("{} ({}:{})", statement.text, file, statement.line));
                    return Err(failure);
                }
                // Keeps statement loops without any I/O abortable.
                tokio::task::yield_now().await;
            }
            Ok(())
        })
    }

    async fn step(&self, file: &str, statement: &Statement, depth: usize) -> Result<(), ProgramFailure> {
        let cube = &self.api.cube;
        let ui = &self.api.ui;

        match &statement.kind {
            StatementKind::Moves(moves) => {
                for mv in moves {
                    cube.apply(*mv).await?;
                }
            }
            StatementKind::Range { face, start, end, angle } => cube.range(*face, *start, *end, *angle).await?,
            StatementKind::Face { face, slice, angle } => cube.face(*face, *slice, *angle).await?,
            StatementKind::Rotate { axis, angle } => cube.rotate(*axis, *angle).await?,
            StatementKind::Shuffle(count) => cube.shuffle(*count).await?,
            StatementKind::Reset => cube.reset().await?,
            StatementKind::Log { level, message } => ui.log(message.clone(), *level).await?,
            StatementKind::Overlay {
                level,
                title,
                message,
                duration,
            } => {
                ui.overlay(title.clone(), message.clone(), *level, Duration::from_millis(*duration))
                    .await?
            }
            StatementKind::Inspect { face, row, col } => {
                let colour = cube.sticker(*face, *row, *col)?;
                ui.log(format!("{face}[{row},{col}] = {colour}"), Level::Info).await?;
            }
            StatementKind::Expect { face, row, col, colour } => {
                let actual = cube.sticker(*face, *row, *col)?;
                if actual != *colour {
                    return Err(ProgramFailure::new(format!(
                        "expected {face}[{row},{col}] to be {colour} but found {actual}"
                    )));
                }
            }
            StatementKind::ExpectSolved => {
                if !cube.is_solved() {
                    return Err(ProgramFailure::new("expected the cube to be solved"));
                }
            }
            StatementKind::Sleep(duration) => self.api.system.sleep(*duration).await,
            StatementKind::Load(path) => {
                if depth >= MAX_LOAD_DEPTH {
                    return Err(ProgramFailure::new(format!(
                        "cannot load `{path}`: nesting deeper than {MAX_LOAD_DEPTH}"
                    )));
                }
                let text = self
                    .api
                    .system
                    .load_source(path)
                    .await
                    .map_err(|err| ProgramFailure::new(format!("cannot load `{path}`: {err}")))?;
                let program = Program::parse(path, &text)?;
                self.execute(&program.file, &program.statements, depth + 1).await?;
            }
            StatementKind::Repeat { count, body } => {
                for _ in 0..*count {
                    self.execute(file, body, depth).await?;
                }
            }
            StatementKind::Fail(message) => return Err(ProgramFailure::new(message.clone())),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_statements_with_comments_and_strings() {
        let program = Program::parse(
            "demo",
            r#"
            # warm up
            move R U' F2   # three moves
            log success "done \"ok\""
            overlay warning "Heads up" 1500
            "#,
        )
        .expect("program parses");

        assert_eq!(program.statements.len(), 3);
        assert_eq!(program.statements[0].line, 3);
        assert_eq!(program.statements[0].text, "move R U' F2");
        assert_eq!(
            program.statements[0].kind,
            StatementKind::Moves(vec![
                Move::outer(Face::R, 1),
                Move::outer(Face::U, -1),
                Move::outer(Face::F, 2)
            ])
        );
        assert_eq!(
            program.statements[1].kind,
            StatementKind::Log {
                level: Level::Success,
                message: "done \"ok\"".into()
            }
        );
        assert_eq!(
            program.statements[2].kind,
            StatementKind::Overlay {
                level: Level::Warning,
                title: "Heads up".into(),
                message: String::new(),
                duration: 1500
            }
        );
    }

    #[test]
    fn hash_inside_string_stays_in_frame_text() {
        let program = Program::parse("p", "log \"step #1\"  # first\nmove R#turn").unwrap();
        assert_eq!(program.statements[0].text, "log \"step #1\"");
        assert_eq!(
            program.statements[0].kind,
            StatementKind::Log {
                level: Level::Info,
                message: "step #1".into()
            }
        );
        assert_eq!(program.statements[1].text, "move R");
    }

    #[test]
    fn repeat_blocks_nest() {
        let program = Program::parse("p", "repeat 2\n  repeat 3\n    move R\n  end\nend\nexpect_solved").unwrap();
        match &program.statements[0].kind {
            StatementKind::Repeat { count: 2, body } => {
                assert!(matches!(&body[0].kind, StatementKind::Repeat { count: 3, body } if body.len() == 1));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(program.statements[1].kind, StatementKind::ExpectSolved);
    }

    #[test]
    fn syntax_errors_name_the_line() {
        let err = Program::parse("p", "move R\nspin R").unwrap_err();
        assert_eq!(
            err,
            ScriptError::Syntax {
                file: "p".into(),
                line: 2,
                message: "unknown statement `spin`".into()
            }
        );

        assert!(Program::parse("p", "repeat 2\nmove R").is_err());
        assert!(Program::parse("p", "end").is_err());
        assert!(Program::parse("p", "log \"open").is_err());
        assert!(Program::parse("p", "reset now").is_err());
    }

    #[test]
    fn failure_report_lists_frames_innermost_first() {
        let failure = ProgramFailure {
            message: "boom".into(),
            frames: vec!["fail \"boom\" (p:3)".into(), "repeat 2 (p:2)".into()],
        };
        let report = failure.into_report();
        assert_eq!(report.message, "boom");
        assert_eq!(report.stack, "Error: boom\n    at fail \"boom\" (p:3)\n    at repeat 2 (p:2)");
    }
}
