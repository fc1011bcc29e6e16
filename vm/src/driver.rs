//! Driver surface: run a script against a prepared world and report
//! errors in the `file:line:column: error: <message>` format with a
//! newest-first activation trace.

use std::rc::Rc;

use ast::{Script, Span};
use heap::AllocationError;
use object::{ActivationRef, Value};

use crate::activation::{Activation, ActivationKind, MAX_ACTIVATIONS};
use crate::completion::{Completion, RuntimeError};
use crate::interpreter::eval_statements;
use crate::{EvalResult, Vm};

/// Why a script did not produce a value.
#[derive(Debug)]
pub enum ExecError {
    /// Unwound the whole activation stack; never caught by the program.
    Runtime(RuntimeError),
    /// The heap could not satisfy an allocation; fatal.
    Allocation(AllocationError),
}

impl std::fmt::Display for ExecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecError::Runtime(err) => write!(f, "{err}"),
            ExecError::Allocation(err) => write!(f, "fatal: {err}"),
        }
    }
}

impl std::error::Error for ExecError {}

/// Execute a script's statements against the lobby. The value of the
/// last statement is the result; the activation stack is empty again
/// on every exit path.
pub fn execute_script(vm: &mut Vm, script: &Script) -> Result<Value, ExecError> {
    let result = match execute_sub_script(vm, script) {
        Ok(completion) => completion,
        Err(err) => return Err(ExecError::Allocation(err)),
    };
    debug_assert!(vm.world.activations.is_empty(), "activation imbalance");
    match result {
        Completion::Normal(value) => Ok(value),
        Completion::Error(err) => Err(ExecError::Runtime(err)),
        Completion::NonLocalReturn { .. } => {
            unreachable!("execute_sub_script resolves non-local returns")
        }
    }
}

/// Run a script in its own activation, sharing the caller's world.
/// Used for nested loads; never yields a `NonLocalReturn` completion
/// (one targeting the script frame is absorbed, any other becomes the
/// runtime error "non-local return past method boundary").
pub fn execute_sub_script(vm: &mut Vm, script: &Script) -> EvalResult {
    let span = script
        .statements
        .first()
        .map(|statement| statement.span())
        .unwrap_or(Span::origin());

    if vm.world.activations.depth() >= MAX_ACTIVATIONS {
        return Ok(Completion::error(
            "activation stack overflow",
            Rc::clone(&script.name),
            span,
        ));
    }

    let frame = Activation {
        kind: ActivationKind::Method,
        object: vm.world.well_known.nil,
        receiver: vm.lobby(),
        bindings: Vec::new(),
        name: Rc::from("(script)"),
        file: Rc::clone(&script.name),
        span,
        parent: ActivationRef::NULL,
        nlr_target: ActivationRef::NULL,
    };
    let frame_ref = vm
        .world
        .activations
        .push(frame)
        .expect("depth checked above");

    let result = eval_statements(vm, &script.statements);
    let popped = vm.world.activations.pop().expect("activation balance");

    match result? {
        Completion::Normal(value) => Ok(Completion::Normal(value)),
        Completion::NonLocalReturn { target, value } if target == frame_ref => {
            let result = vm.heap.tracked(&value);
            vm.heap.untrack(value);
            Ok(Completion::Normal(result))
        }
        Completion::NonLocalReturn { value, .. } => {
            vm.heap.untrack(value);
            let mut err = RuntimeError::new(
                "non-local return past method boundary",
                Rc::clone(&script.name),
                span,
            );
            err.push_frame(&popped);
            Ok(Completion::Error(err))
        }
        Completion::Error(mut err) => {
            err.push_frame(&popped);
            Ok(Completion::Error(err))
        }
    }
}
