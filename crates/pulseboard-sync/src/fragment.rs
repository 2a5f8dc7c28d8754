//! Declarative fragment calls carried by `RUN_FRAGMENT`.
//!
//! A fragment is a sequence of `name(arg, ...);` statements whose arguments
//! are string, number, or boolean literals. Nothing is evaluated: accepted
//! calls are handed to the channel owner, which decides what each name means.
//! A channel only accepts the names its [`GenericOpPolicy`] lists.

use crate::error::ProtocolError;
use crate::protocol::OperationCode;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentArg {
    Str(String),
    Number(f64),
    Bool(bool),
}

impl FragmentArg {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Str(value) => value.trim().parse().ok(),
            Self::Bool(_) => None,
        }
    }

    /// Numbers and strings both render as text, so either may serve as an id.
    pub fn to_text(&self) -> String {
        match self {
            Self::Str(value) => value.clone(),
            Self::Number(value) => value.to_string(),
            Self::Bool(value) => value.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentCall {
    pub name: String,
    pub args: Vec<FragmentArg>,
}

impl FragmentCall {
    pub fn new(name: impl Into<String>, args: Vec<FragmentArg>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&FragmentArg> {
        self.args.get(index)
    }
}

impl fmt::Display for FragmentCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            match arg {
                FragmentArg::Str(value) => write!(f, "{value:?}")?,
                FragmentArg::Number(value) => write!(f, "{value}")?,
                FragmentArg::Bool(value) => write!(f, "{value}")?,
            }
        }
        write!(f, ");")
    }
}

/// Which generic operations a channel opts into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenericOpPolicy {
    pub allow_set_content: bool,
    pub fragments: BTreeSet<String>,
}

impl GenericOpPolicy {
    /// Neither generic operation is accepted.
    pub fn deny_all() -> Self {
        Self::default()
    }

    /// Content replacement only.
    pub fn content_only() -> Self {
        Self {
            allow_set_content: true,
            fragments: BTreeSet::new(),
        }
    }

    pub fn allow_fragment(mut self, name: impl Into<String>) -> Self {
        self.fragments.insert(name.into());
        self
    }

    pub fn allows_fragments(&self) -> bool {
        !self.fragments.is_empty()
    }

    pub fn check_set_content(&self) -> Result<(), ProtocolError> {
        if self.allow_set_content {
            Ok(())
        } else {
            Err(ProtocolError::GenericOpDisabled(
                OperationCode::SetContent.as_str(),
            ))
        }
    }

    /// Parse `source` and keep it only if every call is allow-listed.
    pub fn admit(&self, source: &str) -> Result<Vec<FragmentCall>, ProtocolError> {
        if !self.allows_fragments() {
            return Err(ProtocolError::GenericOpDisabled(
                OperationCode::RunFragment.as_str(),
            ));
        }
        let calls = parse_fragment(source)?;
        if let Some(call) = calls
            .iter()
            .find(|call| !self.fragments.contains(&call.name))
        {
            return Err(ProtocolError::FragmentRejected(format!(
                "{} is not an allowed call",
                call.name
            )));
        }
        Ok(calls)
    }
}

/// Parse a fragment into its calls. Empty input yields no calls.
pub fn parse_fragment(source: &str) -> Result<Vec<FragmentCall>, ProtocolError> {
    let mut parser = Parser {
        chars: source.chars().collect(),
        pos: 0,
    };
    let mut calls = Vec::new();
    loop {
        parser.skip_separators();
        if parser.at_end() {
            return Ok(calls);
        }
        calls.push(parser.call()?);
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let next = self.peek();
        if next.is_some() {
            self.pos += 1;
        }
        next
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while self
            .peek()
            .is_some_and(|c| c.is_whitespace() || c == ';')
        {
            self.pos += 1;
        }
    }

    fn reject(&self, reason: &str) -> ProtocolError {
        ProtocolError::FragmentRejected(format!("{reason} at offset {}", self.pos))
    }

    fn expect(&mut self, wanted: char) -> Result<(), ProtocolError> {
        self.skip_whitespace();
        if self.bump() == Some(wanted) {
            Ok(())
        } else {
            Err(self.reject(&format!("expected '{wanted}'")))
        }
    }

    fn identifier(&mut self) -> Result<String, ProtocolError> {
        self.skip_whitespace();
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(self.reject("expected call name"));
        }
        Ok(name)
    }

    fn call(&mut self) -> Result<FragmentCall, ProtocolError> {
        let name = self.identifier()?;
        self.expect('(')?;
        let mut args = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(')') {
            self.pos += 1;
        } else {
            loop {
                args.push(self.argument()?);
                self.skip_whitespace();
                match self.bump() {
                    Some(',') => {}
                    Some(')') => break,
                    _ => return Err(self.reject("expected ',' or ')'")),
                }
            }
        }
        self.skip_whitespace();
        match self.peek() {
            None | Some(';') => Ok(FragmentCall { name, args }),
            Some(_) => Err(self.reject("expected ';'")),
        }
    }

    fn argument(&mut self) -> Result<FragmentArg, ProtocolError> {
        self.skip_whitespace();
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                self.string(quote).map(FragmentArg::Str)
            }
            Some(c) if c == '-' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if c.is_ascii_alphabetic() => match self.identifier()?.as_str() {
                "true" => Ok(FragmentArg::Bool(true)),
                "false" => Ok(FragmentArg::Bool(false)),
                _ => Err(self.reject("only literal arguments are allowed")),
            },
            _ => Err(self.reject("expected literal argument")),
        }
    }

    fn string(&mut self, quote: char) -> Result<String, ProtocolError> {
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(self.reject("unterminated string")),
                Some(c) if c == quote => return Ok(value),
                Some('\\') => match self.bump() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some(escaped) => value.push(escaped),
                    None => return Err(self.reject("unterminated escape")),
                },
                Some(c) => value.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<FragmentArg, ProtocolError> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(FragmentArg::Number)
            .map_err(|_| self.reject("invalid number"))
    }
}
