//! Shell parser
//!
//! Command text → AST. Covers the Bourne subset the sandbox speaks:
//! simple commands with assignments and redirects, pipelines, `&&`/`||`
//! lists, `if`/`while`/`until`/`for`, subshells, brace groups, and
//! function definitions. Quoting is resolved here into per-segment
//! quote marks; expansion happens at execution time.

use std::rc::Rc;

/// Quote context a word segment was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quote {
    /// Unquoted: expansion, splitting, and globbing apply
    None,
    /// Single-quoted: fully literal
    Single,
    /// Double-quoted: expansion applies, splitting and globbing do not
    Double,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seg {
    pub text: String,
    pub quote: Quote,
}

/// One word: a run of adjacent segments (`a"b"'c'` is three).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Word {
    pub segs: Vec<Seg>,
}

impl Word {
    pub fn from_literal(text: &str) -> Self {
        Word {
            segs: vec![Seg {
                text: text.to_string(),
                quote: Quote::None,
            }],
        }
    }

    /// The raw text, quote marks dropped.
    pub fn flat_text(&self) -> String {
        self.segs.iter().map(|s| s.text.as_str()).collect()
    }

    /// `Some(text)` when this is a single unquoted segment — the only
    /// shape keywords may take.
    fn as_keyword(&self) -> Option<&str> {
        match self.segs.as_slice() {
            [seg] if seg.quote == Quote::None => Some(&seg.text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirKind {
    /// `< target`
    In,
    /// `> target`
    Out,
    /// `>> target`
    Append,
    /// `>& fd` (e.g. `2>&1`)
    Dup,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Redirect {
    pub fd: u32,
    pub kind: RedirKind,
    pub target: Word,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SimpleCmd {
    pub assignments: Vec<(String, Word)>,
    pub words: Vec<Word>,
    pub redirects: Vec<Redirect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AndOrOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Simple(SimpleCmd),
    Pipeline {
        stages: Vec<Command>,
        negate: bool,
    },
    AndOr {
        op: AndOrOp,
        left: Box<Command>,
        right: Box<Command>,
    },
    Seq(Vec<Command>),
    If {
        cond: Box<Command>,
        then_body: Box<Command>,
        elifs: Vec<(Command, Command)>,
        else_body: Option<Box<Command>>,
    },
    Loop {
        until: bool,
        cond: Box<Command>,
        body: Box<Command>,
    },
    For {
        var: String,
        items: Option<Vec<Word>>,
        body: Box<Command>,
    },
    Subshell {
        body: Box<Command>,
        redirects: Vec<Redirect>,
    },
    Group {
        body: Box<Command>,
        redirects: Vec<Redirect>,
    },
    FuncDef {
        name: String,
        body: Rc<Command>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "syntax error: {}", self.message)
    }
}

impl ParseError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

// =========================================================================
// Lexer
// =========================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(Word),
    /// Operator: | ; & && || ( ) { } newline
    Op(&'static str),
    /// Redirect operator with its fd (explicit or default)
    Redir(u32, RedirKind),
}

fn is_word_break(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '&' | ';' | '(' | ')' | '<' | '>')
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    input: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            input,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn tokens(mut self) -> Result<Vec<Token>, ParseError> {
        let mut out = Vec::new();
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' => {
                    self.bump();
                }
                '\n' => {
                    self.bump();
                    out.push(Token::Op("\n"));
                }
                '#' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                '|' => {
                    self.bump();
                    if self.peek() == Some('|') {
                        self.bump();
                        out.push(Token::Op("||"));
                    } else {
                        out.push(Token::Op("|"));
                    }
                }
                '&' => {
                    self.bump();
                    if self.peek() == Some('&') {
                        self.bump();
                        out.push(Token::Op("&&"));
                    } else {
                        out.push(Token::Op("&"));
                    }
                }
                ';' => {
                    self.bump();
                    out.push(Token::Op(";"));
                }
                '(' => {
                    self.bump();
                    out.push(Token::Op("("));
                }
                ')' => {
                    self.bump();
                    out.push(Token::Op(")"));
                }
                '<' => {
                    self.bump();
                    out.push(Token::Redir(0, RedirKind::In));
                }
                '>' => {
                    self.bump();
                    out.push(self.finish_out_redirect(1));
                }
                c if c.is_ascii_digit() && self.redirect_follows_digits() => {
                    let fd = self.take_digits();
                    match self.bump() {
                        Some('>') => out.push(self.finish_out_redirect(fd)),
                        Some('<') => out.push(Token::Redir(fd, RedirKind::In)),
                        _ => return Err(ParseError::new("expected redirect operator")),
                    }
                }
                _ => {
                    let word = self.word()?;
                    out.push(Token::Word(word));
                }
            }
        }
        Ok(out)
    }

    /// `>` already consumed; decide between `>`, `>>`, `>&`.
    fn finish_out_redirect(&mut self, fd: u32) -> Token {
        match self.peek() {
            Some('>') => {
                self.bump();
                Token::Redir(fd, RedirKind::Append)
            }
            Some('&') => {
                self.bump();
                Token::Redir(fd, RedirKind::Dup)
            }
            _ => Token::Redir(fd, RedirKind::Out),
        }
    }

    /// At a digit run: is it immediately followed by `<` or `>`?
    fn redirect_follows_digits(&self) -> bool {
        let mut offset = 0;
        while matches!(self.peek_at(offset), Some(c) if c.is_ascii_digit()) {
            offset += 1;
        }
        matches!(self.peek_at(offset), Some('<') | Some('>'))
    }

    fn take_digits(&mut self) -> u32 {
        let mut value = 0u32;
        while let Some(c) = self.peek() {
            let Some(digit) = c.to_digit(10) else { break };
            value = value * 10 + digit;
            self.bump();
        }
        value
    }

    fn word(&mut self) -> Result<Word, ParseError> {
        let mut segs: Vec<Seg> = Vec::new();
        let mut current = String::new();

        let flush = |segs: &mut Vec<Seg>, current: &mut String| {
            if !current.is_empty() {
                segs.push(Seg {
                    text: std::mem::take(current),
                    quote: Quote::None,
                });
            }
        };

        while let Some(c) = self.peek() {
            match c {
                '\'' => {
                    flush(&mut segs, &mut current);
                    self.bump();
                    let mut text = String::new();
                    loop {
                        match self.bump() {
                            Some('\'') => break,
                            Some(c) => text.push(c),
                            None => return Err(ParseError::new("unterminated single quote")),
                        }
                    }
                    segs.push(Seg {
                        text,
                        quote: Quote::Single,
                    });
                }
                '"' => {
                    flush(&mut segs, &mut current);
                    self.bump();
                    let mut text = String::new();
                    loop {
                        match self.bump() {
                            Some('"') => break,
                            Some('\\') => match self.bump() {
                                Some(e @ ('"' | '\\' | '$' | '`')) => {
                                    // Keep the escape so expansion sees
                                    // the character as literal.
                                    text.push('\\');
                                    text.push(e);
                                }
                                Some(other) => {
                                    text.push('\\');
                                    text.push(other);
                                }
                                None => {
                                    return Err(ParseError::new("unterminated double quote"))
                                }
                            },
                            Some('$') if self.peek() == Some('(') => {
                                text.push('$');
                                self.consume_balanced_parens(&mut text)?;
                            }
                            Some(c) => text.push(c),
                            None => return Err(ParseError::new("unterminated double quote")),
                        }
                    }
                    segs.push(Seg {
                        text,
                        quote: Quote::Double,
                    });
                }
                '\\' => {
                    self.bump();
                    match self.bump() {
                        Some('\n') => {} // line continuation
                        Some(c) => {
                            flush(&mut segs, &mut current);
                            segs.push(Seg {
                                text: c.to_string(),
                                quote: Quote::Single,
                            });
                        }
                        None => return Err(ParseError::new("trailing backslash")),
                    }
                }
                '$' if self.peek_at(1) == Some('(') => {
                    current.push('$');
                    self.bump();
                    self.consume_balanced_parens(&mut current)?;
                }
                '$' if self.peek_at(1) == Some('{') => {
                    current.push('$');
                    self.bump();
                    self.bump();
                    current.push('{');
                    loop {
                        match self.bump() {
                            Some('}') => {
                                current.push('}');
                                break;
                            }
                            Some(c) => current.push(c),
                            None => return Err(ParseError::new("unterminated ${")),
                        }
                    }
                }
                '`' => {
                    self.bump();
                    current.push('`');
                    loop {
                        match self.bump() {
                            Some('`') => {
                                current.push('`');
                                break;
                            }
                            Some('\\') => {
                                if let Some(e) = self.bump() {
                                    current.push(e);
                                }
                            }
                            Some(c) => current.push(c),
                            None => return Err(ParseError::new("unterminated backquote")),
                        }
                    }
                }
                c if is_word_break(c) => break,
                c => {
                    current.push(c);
                    self.bump();
                }
            }
        }
        flush(&mut segs, &mut current);
        if segs.is_empty() {
            return Err(ParseError::new(format!(
                "empty word at byte {} of {:?}",
                self.pos, self.input
            )));
        }
        Ok(Word { segs })
    }

    /// `(` is next; copy through the matching `)`, nesting included.
    fn consume_balanced_parens(&mut self, into: &mut String) -> Result<(), ParseError> {
        self.bump();
        into.push('(');
        let mut depth = 1;
        while depth > 0 {
            match self.bump() {
                Some('(') => {
                    depth += 1;
                    into.push('(');
                }
                Some(')') => {
                    depth -= 1;
                    into.push(')');
                }
                Some(c) => into.push(c),
                None => return Err(ParseError::new("unterminated $(")),
            }
        }
        Ok(())
    }
}

// =========================================================================
// Parser
// =========================================================================

pub fn parse(input: &str) -> Result<Command, ParseError> {
    let tokens = Lexer::new(input).tokens()?;
    let mut parser = Parser { tokens, pos: 0 };
    let list = parser.parse_list(&[])?;
    if !parser.at_end() {
        return Err(ParseError::new(format!(
            "unexpected token near {:?}",
            parser.describe_current()
        )));
    }
    Ok(list)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn describe_current(&self) -> String {
        match self.peek() {
            Some(Token::Word(word)) => word.flat_text(),
            Some(Token::Op(op)) => op.to_string(),
            Some(Token::Redir(fd, _)) => format!("{}>", fd),
            None => "end of input".to_string(),
        }
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.as_keyword() == Some(kw))
    }

    fn expect_keyword(&mut self, kw: &str) -> Result<(), ParseError> {
        if self.at_keyword(kw) {
            self.pos += 1;
            Ok(())
        } else {
            Err(ParseError::new(format!(
                "expected `{}`, found {:?}",
                kw,
                self.describe_current()
            )))
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Some(Token::Op("\n"))) {
            self.pos += 1;
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), Some(Token::Op("\n")) | Some(Token::Op(";"))) {
            self.pos += 1;
        }
    }

    /// A sequence of and-or lists separated by `;`, `&`, or newlines,
    /// stopping before any keyword in `stop`.
    fn parse_list(&mut self, stop: &[&str]) -> Result<Command, ParseError> {
        let mut commands = Vec::new();
        loop {
            self.skip_separators();
            if self.at_end()
                || matches!(self.peek(), Some(Token::Op(")")))
                || stop.iter().any(|kw| self.at_keyword(kw))
            {
                break;
            }
            commands.push(self.parse_and_or(stop)?);
            match self.peek() {
                Some(Token::Op(";")) | Some(Token::Op("&")) | Some(Token::Op("\n")) => {
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if commands.is_empty() {
            return Err(ParseError::new("empty command"));
        }
        if commands.len() == 1 {
            Ok(commands.pop().expect("checked length"))
        } else {
            Ok(Command::Seq(commands))
        }
    }

    fn parse_and_or(&mut self, stop: &[&str]) -> Result<Command, ParseError> {
        let mut left = self.parse_pipeline(stop)?;
        loop {
            let op = match self.peek() {
                Some(Token::Op("&&")) => AndOrOp::And,
                Some(Token::Op("||")) => AndOrOp::Or,
                _ => break,
            };
            self.pos += 1;
            self.skip_newlines();
            let right = self.parse_pipeline(stop)?;
            left = Command::AndOr {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_pipeline(&mut self, stop: &[&str]) -> Result<Command, ParseError> {
        let mut negate = false;
        while self.at_keyword("!") {
            self.pos += 1;
            negate = !negate;
        }
        let mut stages = vec![self.parse_command(stop)?];
        while matches!(self.peek(), Some(Token::Op("|"))) {
            self.pos += 1;
            self.skip_newlines();
            stages.push(self.parse_command(stop)?);
        }
        if stages.len() == 1 && !negate {
            Ok(stages.pop().expect("checked length"))
        } else {
            Ok(Command::Pipeline { stages, negate })
        }
    }

    fn parse_command(&mut self, stop: &[&str]) -> Result<Command, ParseError> {
        if self.at_keyword("if") {
            return self.parse_if();
        }
        if self.at_keyword("while") {
            return self.parse_loop(false);
        }
        if self.at_keyword("until") {
            return self.parse_loop(true);
        }
        if self.at_keyword("for") {
            return self.parse_for();
        }
        if matches!(self.peek(), Some(Token::Op("("))) {
            self.pos += 1;
            let body = self.parse_list(&[])?;
            match self.bump() {
                Some(Token::Op(")")) => {}
                _ => return Err(ParseError::new("expected `)`")),
            }
            let redirects = self.parse_trailing_redirects()?;
            return Ok(Command::Subshell {
                body: Box::new(body),
                redirects,
            });
        }
        if self.at_keyword("{") {
            self.pos += 1;
            let body = self.parse_list(&["}"])?;
            self.expect_keyword("}")?;
            let redirects = self.parse_trailing_redirects()?;
            return Ok(Command::Group {
                body: Box::new(body),
                redirects,
            });
        }
        // Function definition: NAME ( ) body
        if let Some(Token::Word(word)) = self.peek() {
            if let Some(name) = word.as_keyword() {
                let name = name.to_string();
                if is_valid_name(&name)
                    && matches!(self.tokens.get(self.pos + 1), Some(Token::Op("(")))
                    && matches!(self.tokens.get(self.pos + 2), Some(Token::Op(")")))
                {
                    self.pos += 3;
                    self.skip_newlines();
                    let body = self.parse_command(stop)?;
                    return Ok(Command::FuncDef {
                        name,
                        body: Rc::new(body),
                    });
                }
            }
        }
        self.parse_simple(stop)
    }

    fn parse_trailing_redirects(&mut self) -> Result<Vec<Redirect>, ParseError> {
        let mut redirects = Vec::new();
        while let Some(Token::Redir(fd, kind)) = self.peek().cloned() {
            self.pos += 1;
            let target = match self.bump() {
                Some(Token::Word(word)) => word,
                _ => return Err(ParseError::new("redirect missing target")),
            };
            redirects.push(Redirect { fd, kind, target });
        }
        Ok(redirects)
    }

    fn parse_simple(&mut self, stop: &[&str]) -> Result<Command, ParseError> {
        let mut cmd = SimpleCmd::default();
        let mut words_started = false;
        loop {
            if !words_started && stop.iter().any(|kw| self.at_keyword(kw)) && cmd.words.is_empty()
            {
                break;
            }
            match self.peek().cloned() {
                Some(Token::Word(word)) => {
                    // Assignment prefix: NAME=value before the first word.
                    if !words_started {
                        if let Some((name, value)) = split_assignment(&word) {
                            self.pos += 1;
                            cmd.assignments.push((name, value));
                            continue;
                        }
                    }
                    if !words_started
                        && cmd.words.is_empty()
                        && stop.iter().any(|kw| word.as_keyword() == Some(kw))
                    {
                        break;
                    }
                    self.pos += 1;
                    cmd.words.push(word);
                    words_started = true;
                }
                Some(Token::Redir(fd, kind)) => {
                    self.pos += 1;
                    let target = match self.bump() {
                        Some(Token::Word(word)) => word,
                        _ => return Err(ParseError::new("redirect missing target")),
                    };
                    cmd.redirects.push(Redirect { fd, kind, target });
                }
                _ => break,
            }
        }
        if cmd.words.is_empty() && cmd.assignments.is_empty() && cmd.redirects.is_empty() {
            return Err(ParseError::new(format!(
                "expected command, found {:?}",
                self.describe_current()
            )));
        }
        Ok(Command::Simple(cmd))
    }

    fn parse_if(&mut self) -> Result<Command, ParseError> {
        self.expect_keyword("if")?;
        let cond = self.parse_list(&["then"])?;
        self.expect_keyword("then")?;
        let then_body = self.parse_list(&["elif", "else", "fi"])?;
        let mut elifs = Vec::new();
        while self.at_keyword("elif") {
            self.pos += 1;
            let elif_cond = self.parse_list(&["then"])?;
            self.expect_keyword("then")?;
            let elif_body = self.parse_list(&["elif", "else", "fi"])?;
            elifs.push((elif_cond, elif_body));
        }
        let else_body = if self.at_keyword("else") {
            self.pos += 1;
            Some(Box::new(self.parse_list(&["fi"])?))
        } else {
            None
        };
        self.expect_keyword("fi")?;
        Ok(Command::If {
            cond: Box::new(cond),
            then_body: Box::new(then_body),
            elifs,
            else_body,
        })
    }

    fn parse_loop(&mut self, until: bool) -> Result<Command, ParseError> {
        self.expect_keyword(if until { "until" } else { "while" })?;
        let cond = self.parse_list(&["do"])?;
        self.expect_keyword("do")?;
        let body = self.parse_list(&["done"])?;
        self.expect_keyword("done")?;
        Ok(Command::Loop {
            until,
            cond: Box::new(cond),
            body: Box::new(body),
        })
    }

    fn parse_for(&mut self) -> Result<Command, ParseError> {
        self.expect_keyword("for")?;
        let var = match self.bump() {
            Some(Token::Word(word)) => match word.as_keyword() {
                Some(name) if is_valid_name(name) => name.to_string(),
                _ => return Err(ParseError::new("bad for-loop variable")),
            },
            _ => return Err(ParseError::new("for: missing variable")),
        };
        self.skip_newlines();
        let items = if self.at_keyword("in") {
            self.pos += 1;
            let mut items = Vec::new();
            while let Some(Token::Word(word)) = self.peek() {
                if word.as_keyword() == Some("do") {
                    break;
                }
                items.push(word.clone());
                self.pos += 1;
            }
            Some(items)
        } else {
            None
        };
        self.skip_separators();
        self.expect_keyword("do")?;
        let body = self.parse_list(&["done"])?;
        self.expect_keyword("done")?;
        Ok(Command::For {
            var,
            items,
            body: Box::new(body),
        })
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// `NAME=rest` with a valid name and the `NAME=` part unquoted.
fn split_assignment(word: &Word) -> Option<(String, Word)> {
    let first = word.segs.first()?;
    if first.quote != Quote::None {
        return None;
    }
    let eq = first.text.find('=')?;
    let name = &first.text[..eq];
    if !is_valid_name(name) {
        return None;
    }
    let mut value_segs = Vec::new();
    let rest = &first.text[eq + 1..];
    if !rest.is_empty() {
        value_segs.push(Seg {
            text: rest.to_string(),
            quote: Quote::None,
        });
    }
    value_segs.extend(word.segs[1..].iter().cloned());
    Some((name.to_string(), Word { segs: value_segs }))
}
