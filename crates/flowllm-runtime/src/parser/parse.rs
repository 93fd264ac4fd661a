//! Recursive-descent grammar over the token stream.
//!
//! ```text
//! program    := line (NEWLINE line)*
//! line       := IDENT '=' expr
//!             | IDENT '.' 'ops' '.' IDENT '=' expr
//!             | expr                        (last line only)
//! expr       := seq
//! seq        := par ('>>' par)*
//! par        := attach ('|' attach)*
//! attach     := primary ('<<' child_map)*
//! child_map  := '{' IDENT ':' expr (',' IDENT ':' expr)* ','? '}'
//! primary    := IDENT call_args? | '(' expr ')'
//! call_args  := '(' (IDENT '=' literal (',' IDENT '=' literal)* ','?)? ')'
//! ```
//!
//! Identifiers resolve against assigned variables first, then the registry
//! snapshot; anything else is `UnknownOp`.

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::lexer::{Spanned, Token, tokenize};
use super::{OpExpr, ParseError};

pub(super) fn parse_program<F>(content: &str, is_known: &F) -> Result<OpExpr, ParseError>
where
    F: Fn(&str) -> bool,
{
    let tokens = tokenize(content)?;
    if matches!(tokens.first().map(|s| &s.token), Some(Token::Eof) | None) {
        return Err(ParseError::EmptyExpression);
    }

    let mut parser = Parser {
        tokens,
        position: 0,
        env: HashMap::new(),
        is_known,
    };
    parser.program()
}

struct Parser<'a, F> {
    tokens: Vec<Spanned>,
    position: usize,
    /// Variables assigned by earlier lines.
    env: HashMap<String, OpExpr>,
    is_known: &'a F,
}

impl<F> Parser<'_, F>
where
    F: Fn(&str) -> bool,
{
    fn current(&self) -> &Spanned {
        &self.tokens[self.position.min(self.tokens.len() - 1)]
    }

    fn peek(&self, offset: usize) -> &Token {
        let index = (self.position + offset).min(self.tokens.len() - 1);
        &self.tokens[index].token
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.current().clone();
        if self.position < self.tokens.len() - 1 {
            self.position += 1;
        }
        spanned
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if &self.current().token == expected {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(ParseError::syntax(
                self.current().position,
                format!("expected {what}"),
            ))
        }
    }

    fn program(&mut self) -> Result<OpExpr, ParseError> {
        loop {
            let is_last_line = self.line_is_last();
            let line = self.line()?;

            if is_last_line {
                let Some(expr) = line else {
                    return Err(ParseError::NotAnExpression);
                };
                self.expect(&Token::Eof, "end of input")?;
                return Ok(expr);
            }
            if line.is_some() {
                return Err(ParseError::syntax(
                    self.current().position,
                    "only assignments are allowed before the final expression",
                ));
            }
            self.expect(&Token::Newline, "a newline between statements")?;
        }
    }

    /// Whether the current line runs to EOF (no further separator).
    fn line_is_last(&self) -> bool {
        let mut offset = 0;
        loop {
            match self.peek(offset) {
                Token::Newline => return false,
                Token::Eof => return true,
                _ => offset += 1,
            }
        }
    }

    /// Parse one line. Returns `Some(expr)` for an expression line, `None`
    /// for an assignment (recorded into the environment).
    fn line(&mut self) -> Result<Option<OpExpr>, ParseError> {
        // Assignment lookahead: `name =` or `name.ops.child =`.
        if let Token::Ident(name) = self.peek(0).clone() {
            if self.peek(1) == &Token::Equals {
                self.advance();
                self.advance();
                let value = self.expr()?;
                self.env.insert(name, value);
                return Ok(None);
            }
            if self.peek(1) == &Token::Dot {
                return self.attribute_assignment(&name).map(|()| None);
            }
        }

        self.expr().map(Some)
    }

    /// `var.ops.NAME = expr` appends a named child to an assigned variable.
    fn attribute_assignment(&mut self, target: &str) -> Result<(), ParseError> {
        let position = self.current().position;
        self.advance(); // target ident
        self.expect(&Token::Dot, "`.`")?;
        match self.advance().token {
            Token::Ident(field) if field == "ops" => {}
            _ => {
                return Err(ParseError::syntax(
                    position,
                    "attribute assignment must use the form `var.ops.NAME = expr`",
                ));
            }
        }
        self.expect(&Token::Dot, "`.`")?;
        let child_name = match self.advance().token {
            Token::Ident(name) => name,
            _ => return Err(ParseError::syntax(position, "expected a child op name")),
        };
        self.expect(&Token::Equals, "`=`")?;
        let child = self.expr()?;

        let Some(parent) = self.env.remove(target) else {
            return Err(ParseError::syntax(
                position,
                format!("`{target}` is not assigned on an earlier line"),
            ));
        };
        self.reject_combinator_parent(&parent, position)?;
        let updated = match parent {
            OpExpr::Attach {
                parent,
                mut children,
            } => {
                children.push((child_name, child));
                OpExpr::Attach { parent, children }
            }
            other => OpExpr::Attach {
                parent: Box::new(other),
                children: vec![(child_name, child)],
            },
        };
        self.env.insert(target.to_string(), updated);
        Ok(())
    }

    fn expr(&mut self) -> Result<OpExpr, ParseError> {
        self.seq()
    }

    fn seq(&mut self) -> Result<OpExpr, ParseError> {
        let mut left = self.par()?;
        while self.eat(&Token::Seq) {
            let right = self.par()?;
            left = left >> right;
        }
        Ok(left)
    }

    fn par(&mut self) -> Result<OpExpr, ParseError> {
        let mut left = self.attach()?;
        while self.eat(&Token::Par) {
            let right = self.attach()?;
            left = left | right;
        }
        Ok(left)
    }

    fn attach(&mut self) -> Result<OpExpr, ParseError> {
        let mut left = self.primary()?;
        while self.current().token == Token::Attach {
            let position = self.current().position;
            self.advance();
            self.reject_combinator_parent(&left, position)?;
            let children = self.child_map()?;
            left = match left {
                OpExpr::Attach {
                    parent,
                    children: mut existing,
                } => {
                    existing.extend(children);
                    OpExpr::Attach {
                        parent,
                        children: existing,
                    }
                }
                other => OpExpr::Attach {
                    parent: Box::new(other),
                    children,
                },
            };
        }
        Ok(left)
    }

    /// The composition tree stays fully typed at parse time: `<<` cannot
    /// extend a sequential or parallel node.
    fn reject_combinator_parent(
        &self,
        parent: &OpExpr,
        position: usize,
    ) -> Result<(), ParseError> {
        match parent {
            OpExpr::Seq(_) => Err(ParseError::syntax(
                position,
                "`<<` is not supported on a sequential composition",
            )),
            OpExpr::Par(_) => Err(ParseError::syntax(
                position,
                "`<<` is not supported on a parallel composition",
            )),
            _ => Ok(()),
        }
    }

    fn child_map(&mut self) -> Result<Vec<(String, OpExpr)>, ParseError> {
        self.expect(&Token::LBrace, "`{` after `<<`")?;
        let mut children = Vec::new();
        loop {
            if self.eat(&Token::RBrace) {
                break;
            }
            let name = match self.advance().token {
                Token::Ident(name) => name,
                Token::Str(name) => name,
                _ => {
                    return Err(ParseError::syntax(
                        self.current().position,
                        "expected a child name",
                    ));
                }
            };
            self.expect(&Token::Colon, "`:` after the child name")?;
            let child = self.expr()?;
            children.push((name, child));
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RBrace, "`}` to close the child map")?;
                break;
            }
        }
        if children.is_empty() {
            return Err(ParseError::syntax(
                self.current().position,
                "child map must not be empty",
            ));
        }
        Ok(children)
    }

    fn primary(&mut self) -> Result<OpExpr, ParseError> {
        let spanned = self.advance();
        match spanned.token {
            Token::Ident(name) => {
                if self.current().token == Token::LParen {
                    let args = self.call_args()?;
                    if !(self.is_known)(&name) {
                        return Err(ParseError::UnknownOp(name));
                    }
                    return Ok(OpExpr::op_with(name, args));
                }
                // Bare identifier: variable reference, then registry name.
                if let Some(expr) = self.env.get(&name) {
                    return Ok(expr.clone());
                }
                if !(self.is_known)(&name) {
                    return Err(ParseError::UnknownOp(name));
                }
                Ok(OpExpr::op(name))
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(inner)
            }
            Token::Str(_) | Token::Int(_) | Token::Float(_) | Token::Bool(_) => {
                Err(ParseError::NotAnOp)
            }
            _ => Err(ParseError::syntax(
                spanned.position,
                "expected an op name or `(`",
            )),
        }
    }

    fn call_args(&mut self) -> Result<BTreeMap<String, Value>, ParseError> {
        self.expect(&Token::LParen, "`(`")?;
        let mut args = BTreeMap::new();
        loop {
            if self.eat(&Token::RParen) {
                break;
            }
            let key = match self.advance().token {
                Token::Ident(key) => key,
                _ => {
                    return Err(ParseError::syntax(
                        self.current().position,
                        "expected `key=value` constructor arguments",
                    ));
                }
            };
            self.expect(&Token::Equals, "`=` after the argument name")?;
            let value = self.literal()?;
            args.insert(key, value);
            if !self.eat(&Token::Comma) {
                self.expect(&Token::RParen, "`)` to close the arguments")?;
                break;
            }
        }
        Ok(args)
    }

    fn literal(&mut self) -> Result<Value, ParseError> {
        let spanned = self.advance();
        match spanned.token {
            Token::Str(s) => Ok(Value::String(s)),
            Token::Int(n) => Ok(Value::Number(n.into())),
            Token::Float(f) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .ok_or_else(|| ParseError::syntax(spanned.position, "invalid float literal")),
            Token::Bool(b) => Ok(Value::Bool(b)),
            _ => Err(ParseError::syntax(
                spanned.position,
                "expected a string, number, or bool literal",
            )),
        }
    }
}
