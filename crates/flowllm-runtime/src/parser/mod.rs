//! The flow expression language.
//!
//! Flows are written in a restricted, line-oriented expression language over
//! registered op names:
//!
//! ```text
//! stage = fetch_op >> clean_op
//! branches = (summarize_op | cite_op(tool_index=1))
//! stage >> branches
//! ```
//!
//! Constructs: op constructor calls (bare name or `name(key=literal, ...)`),
//! `>>` (sequential), `|` (parallel), `<<` (attach named children, map
//! syntax `{name: expr}`), parentheses, variable assignment, and
//! `var.ops.NAME = expr` attribute assignment. Every line but the last must
//! be an assignment; the last line must be an expression evaluating to an
//! op. Precedence, tightest first: `<<`, `|`, `>>`; all left-associative.
//!
//! This is a real lexer + recursive-descent parser producing an [`OpExpr`]
//! AST. The AST serializes back with [`OpExpr::to_expression`], and
//! serialize-then-reparse yields a structurally equal tree. Op instances
//! are built fresh from the AST for every invocation.

mod lexer;
mod parse;

use std::collections::BTreeMap;
use std::ops::{BitOr, Shl, Shr};

use flowllm_core::{FlowError, FlowResult};
use serde_json::Value;

use crate::op::combinators::{ParallelOp, SequentialOp};
use crate::op::{BoxedOp, OpSpec};
use crate::service::ServiceHandle;

/// Why an expression failed to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// Input is empty (or only comments and blank lines).
    EmptyExpression,
    /// The last line is an assignment, not an expression.
    NotAnExpression,
    /// The last line evaluates to a literal, not an op.
    NotAnOp,
    /// Name not present in the registry snapshot.
    UnknownOp(String),
    Syntax { position: usize, message: String },
}

impl ParseError {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        ParseError::Syntax {
            position,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::EmptyExpression => write!(f, "flow content is empty"),
            ParseError::NotAnExpression => {
                write!(f, "the last line must be an expression, not an assignment")
            }
            ParseError::NotAnOp => write!(f, "the last line does not evaluate to an op"),
            ParseError::UnknownOp(name) => write!(f, "op `{name}` is not registered"),
            ParseError::Syntax { position, message } => {
                write!(f, "{message} (at offset {position})")
            }
        }
    }
}

impl From<ParseError> for FlowError {
    fn from(error: ParseError) -> Self {
        match error {
            ParseError::UnknownOp(name) => FlowError::UnknownOp { name },
            other => FlowError::Parse {
                message: other.to_string(),
            },
        }
    }
}

/// A composed flow expression.
///
/// `Seq`/`Par` children are kept flattened (left-associativity folds chains
/// into one node), which makes structural equality line up with the
/// expression algebra.
#[derive(Debug, Clone, PartialEq)]
pub enum OpExpr {
    /// An op constructor call.
    Call {
        name: String,
        args: BTreeMap<String, Value>,
    },
    Seq(Vec<OpExpr>),
    Par(Vec<OpExpr>),
    /// `parent << {name: child, ...}`
    Attach {
        parent: Box<OpExpr>,
        children: Vec<(String, OpExpr)>,
    },
}

impl OpExpr {
    /// A bare constructor call.
    pub fn op(name: impl Into<String>) -> Self {
        OpExpr::Call {
            name: name.into(),
            args: BTreeMap::new(),
        }
    }

    /// A constructor call with arguments.
    pub fn op_with(name: impl Into<String>, args: BTreeMap<String, Value>) -> Self {
        OpExpr::Call {
            name: name.into(),
            args,
        }
    }

    /// Parse flow content. `is_known` is the registry snapshot check for op
    /// names (configured op instances included).
    pub fn parse<F>(content: &str, is_known: F) -> Result<OpExpr, ParseError>
    where
        F: Fn(&str) -> bool,
    {
        parse::parse_program(content, &is_known)
    }

    /// Serialize back into the expression language.
    pub fn to_expression(&self) -> String {
        match self {
            OpExpr::Call { name, args } => {
                if args.is_empty() {
                    name.clone()
                } else {
                    let rendered: Vec<String> = args
                        .iter()
                        .map(|(key, value)| format!("{key}={}", render_literal(value)))
                        .collect();
                    format!("{name}({})", rendered.join(", "))
                }
            }
            OpExpr::Seq(children) => children
                .iter()
                .map(|child| child.to_expression())
                .collect::<Vec<_>>()
                .join(" >> "),
            OpExpr::Par(children) => children
                .iter()
                .map(|child| match child {
                    OpExpr::Seq(_) => format!("({})", child.to_expression()),
                    _ => child.to_expression(),
                })
                .collect::<Vec<_>>()
                .join(" | "),
            OpExpr::Attach { parent, children } => {
                let rendered: Vec<String> = children
                    .iter()
                    .map(|(name, child)| format!("{name}: {}", child.to_expression()))
                    .collect();
                format!("{} << {{{}}}", parent.to_expression(), rendered.join(", "))
            }
        }
    }

    /// Build a fresh op tree for one invocation.
    pub fn build(&self, service: &ServiceHandle) -> FlowResult<BoxedOp> {
        match self {
            OpExpr::Call { name, args } => build_call(service, name, args),
            OpExpr::Seq(children) => {
                let built: FlowResult<Vec<BoxedOp>> =
                    children.iter().map(|child| child.build(service)).collect();
                Ok(Box::new(SequentialOp::new(built?)?))
            }
            OpExpr::Par(children) => {
                let built: FlowResult<Vec<BoxedOp>> =
                    children.iter().map(|child| child.build(service)).collect();
                Ok(Box::new(ParallelOp::new(built?)?))
            }
            OpExpr::Attach { parent, children } => {
                let mut op = parent.build(service)?;
                for (name, child_expr) in children {
                    let child = child_expr.build(service)?;
                    if child.spec().async_mode != op.spec().async_mode {
                        return Err(FlowError::Parse {
                            message: format!(
                                "child `{name}` does not match the async mode of `{}`",
                                op.spec().name
                            ),
                        });
                    }
                    op.attach_child(name.clone(), child)?;
                }
                Ok(op)
            }
        }
    }

}

fn render_literal(value: &Value) -> String {
    // JSON literal syntax matches the expression language's literals.
    value.to_string()
}

fn build_call(
    service: &ServiceHandle,
    name: &str,
    args: &BTreeMap<String, Value>,
) -> FlowResult<BoxedOp> {
    let config = service.config().op.get(name).cloned().unwrap_or_default();
    let backend = if config.backend.is_empty() {
        name
    } else {
        config.backend.as_str()
    };
    let ctor = service.registry().op(backend)?;

    let mut spec = OpSpec::new(name);
    spec.max_retries = config.max_retries.max(1);
    spec.raise_on_failure = config.raise_on_failure;
    if !config.llm.is_empty() {
        spec.llm = config.llm;
    }
    if !config.embedding_model.is_empty() {
        spec.embedding_model = config.embedding_model;
    }
    if !config.vector_store.is_empty() {
        spec.vector_store = config.vector_store;
    }
    if spec.language.is_empty() {
        spec.language = service.config().language.clone();
    }
    for (key, value) in config.params {
        spec.apply_arg(&key, value)?;
    }
    for (key, value) in args {
        spec.apply_arg(key, value.clone())?;
    }
    ctor(spec)
}

impl Shr for OpExpr {
    type Output = OpExpr;

    /// `a >> b`: sequential composition, flattened.
    fn shr(self, rhs: OpExpr) -> OpExpr {
        let mut children = match self {
            OpExpr::Seq(children) => children,
            other => vec![other],
        };
        match rhs {
            OpExpr::Seq(mut rest) => children.append(&mut rest),
            other => children.push(other),
        }
        OpExpr::Seq(children)
    }
}

impl BitOr for OpExpr {
    type Output = OpExpr;

    /// `a | b`: parallel composition, flattened.
    fn bitor(self, rhs: OpExpr) -> OpExpr {
        let mut children = match self {
            OpExpr::Par(children) => children,
            other => vec![other],
        };
        match rhs {
            OpExpr::Par(mut rest) => children.append(&mut rest),
            other => children.push(other),
        }
        OpExpr::Par(children)
    }
}

impl Shl<(&str, OpExpr)> for OpExpr {
    type Output = OpExpr;

    /// `parent << ("name", child)`: attach a named child.
    fn shl(self, (name, child): (&str, OpExpr)) -> OpExpr {
        match self {
            OpExpr::Attach {
                parent,
                mut children,
            } => {
                children.push((name.to_string(), child));
                OpExpr::Attach { parent, children }
            }
            other => OpExpr::Attach {
                parent: Box::new(other),
                children: vec![(name.to_string(), child)],
            },
        }
    }
}
