//! Abstract syntax tree consumed by the interpreter.
//!
//! A front end (lexer + parser) produces [`Script`]s; the runtime only
//! consumes them. Statement lists are reference-counted slices
//! (`Rc<[Statement]>`) so that ownership can be transferred into
//! method and block maps without copying the tree.

mod span;

pub use span::{Pos, Span};

use std::rc::Rc;

/// A parsed source file: the file name and its top-level statements.
#[derive(Debug, Clone)]
pub struct Script {
    /// File name, used in error reports and stack traces.
    pub name: Rc<str>,
    pub statements: Rc<[Statement]>,
}

impl Script {
    pub fn new(name: impl Into<Rc<str>>, statements: Vec<Statement>) -> Self {
        Self {
            name: name.into(),
            statements: statements.into(),
        }
    }
}

/// A single top-level or body statement.
#[derive(Debug, Clone)]
pub struct Statement {
    pub expression: Expression,
}

impl Statement {
    pub fn new(expression: Expression) -> Self {
        Self { expression }
    }

    pub fn span(&self) -> Span {
        self.expression.span()
    }
}

/// The different forms an expression can take.
#[derive(Debug, Clone)]
pub enum Expression {
    /// `(| slots |. statements)` — a slots object, or a method when the
    /// literal carries code.
    ObjectLiteral(ObjectLiteral),
    /// `[ :args | statements ]`
    BlockLiteral(BlockLiteral),
    /// `receiver selector: argument ...`
    Message(Message),
    /// `^ expression` — non-local return.
    Return(ReturnExpr),
    /// A bare name, resolved against the current `self`.
    Identifier(Identifier),
    /// `'...'`
    String(StringLiteral),
    /// Integer or floating-point literal.
    Number(Number),
}

impl Expression {
    pub fn span(&self) -> Span {
        match self {
            Expression::ObjectLiteral(o) => o.span,
            Expression::BlockLiteral(b) => b.span,
            Expression::Message(m) => m.span,
            Expression::Return(r) => r.span,
            Expression::Identifier(i) => i.span,
            Expression::String(s) => s.span,
            Expression::Number(n) => n.span,
        }
    }
}

/// An object literal.
///
/// When `statements` is non-empty the literal denotes a *method*: the
/// code is kept, unevaluated, and runs each time the object is
/// activated. With no statements it denotes a plain slots object whose
/// slot initializers are evaluated on the spot.
#[derive(Debug, Clone)]
pub struct ObjectLiteral {
    pub slots: Vec<SlotDecl>,
    pub statements: Rc<[Statement]>,
    pub span: Span,
}

/// A block literal. Argument slots are declared with
/// [`SlotDecl::is_argument`].
#[derive(Debug, Clone)]
pub struct BlockLiteral {
    pub slots: Vec<SlotDecl>,
    pub statements: Rc<[Statement]>,
    pub span: Span,
}

/// A slot declaration inside an object or block literal.
///
/// `x = 3` is constant, `x <- 3` mutable, `p* = other` a parent slot,
/// `:a` (in a block) an argument. A keyword slot such as
/// `add: a With: b = (...)` carries the argument names in `arguments`
/// and its method body in `value`.
#[derive(Debug, Clone)]
pub struct SlotDecl {
    pub name: String,
    pub is_mutable: bool,
    pub is_parent: bool,
    pub is_argument: bool,
    /// Argument names for keyword method slots; empty otherwise.
    pub arguments: Vec<String>,
    /// The initializer expression. Argument slots have none.
    pub value: Option<Expression>,
    pub span: Span,
}

impl SlotDecl {
    pub fn constant(name: impl Into<String>, value: Expression) -> Self {
        let span = value.span();
        Self {
            name: name.into(),
            is_mutable: false,
            is_parent: false,
            is_argument: false,
            arguments: Vec::new(),
            value: Some(value),
            span,
        }
    }

    pub fn mutable(name: impl Into<String>, value: Expression) -> Self {
        Self {
            is_mutable: true,
            ..Self::constant(name, value)
        }
    }

    pub fn parent(name: impl Into<String>, value: Expression) -> Self {
        Self {
            is_parent: true,
            ..Self::constant(name, value)
        }
    }

    pub fn argument(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_mutable: true,
            is_parent: false,
            is_argument: true,
            arguments: Vec::new(),
            value: None,
            span: Span::origin(),
        }
    }

    pub fn method(
        name: impl Into<String>,
        arguments: Vec<String>,
        body: Expression,
    ) -> Self {
        let span = body.span();
        Self {
            name: name.into(),
            is_mutable: false,
            is_parent: false,
            is_argument: false,
            arguments,
            value: Some(body),
            span,
        }
    }
}

/// A message send.
///
/// `receiver` is `None` for implicit-receiver sends (the current
/// `self`), which the parser emits for bare keyword sends inside
/// method bodies such as `x: v`.
#[derive(Debug, Clone)]
pub struct Message {
    pub receiver: Option<Box<Expression>>,
    pub selector: String,
    pub arguments: Vec<Expression>,
    pub span: Span,
}

/// `^ expression` — returns from the lexically enclosing method.
#[derive(Debug, Clone)]
pub struct ReturnExpr {
    pub expression: Box<Expression>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Identifier {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct StringLiteral {
    pub value: String,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Number {
    pub value: NumberValue,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberValue {
    Int(i64),
    Float(f64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_display_as_line_and_column() {
        let span = Span::new(Pos::new(0, 1, 1), Pos::new(12, 2, 5));
        assert_eq!(format!("{span}"), "1:1-2:5");
        assert_eq!(format!("{}", span.start), "1:1");
    }

    #[test]
    fn statement_lists_share_ownership() {
        let stmt = Statement::new(Expression::Number(Number {
            value: NumberValue::Int(7),
            span: Span::origin(),
        }));
        let script = Script::new("test.prl", vec![stmt]);
        let shared = Rc::clone(&script.statements);
        assert_eq!(Rc::strong_count(&script.statements), 2);
        assert_eq!(shared.len(), 1);
    }
}
