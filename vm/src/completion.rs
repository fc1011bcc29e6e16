use std::rc::Rc;

use ast::Span;
use heap::TrackedRef;
use object::{ActivationRef, Value};

use crate::activation::Activation;

/// The tagged result of one evaluation step.
///
/// Every recursive evaluation must propagate non-normal completions
/// immediately. Allocation failures are not completions — they travel
/// as the `Err` side of [`crate::EvalResult`] and abort the script.
#[derive(Debug)]
pub enum Completion {
    Normal(Value),
    Error(RuntimeError),
    /// Unwinds activations until (and including) `target`, which
    /// yields `value` as its return value. The value is held in a
    /// tracked reference so it survives any collection during the
    /// unwind; whoever absorbs or converts the completion must release
    /// the reference.
    NonLocalReturn {
        target: ActivationRef,
        value: TrackedRef,
    },
}

/// One line of a stack trace, recorded as an error unwinds.
#[derive(Debug, Clone)]
pub struct TraceEntry {
    pub name: Rc<str>,
    pub file: Rc<str>,
    pub span: Span,
}

/// A non-resumable error raised by the evaluator or a primitive.
///
/// Unwinds the entire activation stack; each activation pop appends a
/// trace entry, so the finished trace reads newest-first.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub file: Rc<str>,
    pub span: Span,
    pub trace: Vec<TraceEntry>,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, file: Rc<str>, span: Span) -> Self {
        Self {
            message: message.into(),
            file,
            span,
            trace: Vec::new(),
        }
    }

    /// Record an unwound activation. Called as the error propagates
    /// through each pop, newest frame first.
    pub fn push_frame(&mut self, frame: &Activation) {
        self.trace.push(TraceEntry {
            name: Rc::clone(&frame.name),
            file: Rc::clone(&frame.file),
            span: frame.span,
        });
    }
}

impl std::fmt::Display for RuntimeError {
    /// The driver's report format:
    ///
    /// ```text
    /// file:line:column: error: <message>
    ///   at <name> file:line:column
    ///   ...
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}: error: {}",
            self.file, self.span.start.line, self.span.start.column, self.message
        )?;
        for entry in &self.trace {
            write!(
                f,
                "\n  at {} {}:{}:{}",
                entry.name, entry.file, entry.span.start.line, entry.span.start.column
            )?;
        }
        Ok(())
    }
}

impl Completion {
    pub fn error(
        message: impl Into<String>,
        file: Rc<str>,
        span: Span,
    ) -> Self {
        Completion::Error(RuntimeError::new(message, file, span))
    }

    pub fn is_normal(&self) -> bool {
        matches!(self, Completion::Normal(_))
    }
}
