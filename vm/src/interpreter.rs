//! The recursive expression evaluator.
//!
//! Turns AST expressions into [`Completion`]s, resolving identifiers
//! through the activation chain and the receiver's parent graph,
//! dispatching messages, and constructing objects from literals.
//!
//! GC discipline: every evaluated temporary that must survive a later
//! evaluation step is pushed onto the rooted `scratch` stack; raw
//! pointers are never held across anything that can allocate.

use std::rc::Rc;

use ast::{
    BlockLiteral, Expression, Message, NumberValue, ObjectLiteral, ReturnExpr,
    SlotDecl, Span, Statement, StringLiteral,
};
use object::{
    byte_array_allocation_size, lookup, map_allocation_size, selector_hash,
    slots_object_allocation_size, ActivationRef, ByteArray, Header, Intent,
    LookupResult, Map, MapKind, MethodCode, ObjectType, Slot, SlotFlags,
    SlotsObject, Value, MAX_ASSIGNABLE_SLOTS, NO_PRIMITIVE,
};

use crate::activation::{Activation, ActivationKind, MAX_ACTIVATIONS};
use crate::alloc::{alloc_byte_array, alloc_map, alloc_slots_object};
use crate::completion::Completion;
use crate::{EvalResult, Vm};

/// Evaluate statements in order; the value of the last statement is
/// the result, `nil` for an empty list. Non-normal completions
/// propagate immediately.
pub fn eval_statements(vm: &mut Vm, statements: &[Statement]) -> EvalResult {
    let mut result = vm.world.well_known.nil;
    for statement in statements {
        match eval_expression(vm, &statement.expression)? {
            Completion::Normal(value) => result = value,
            other => return Ok(other),
        }
    }
    Ok(Completion::Normal(result))
}

pub fn eval_expression(vm: &mut Vm, expression: &Expression) -> EvalResult {
    match expression {
        Expression::Number(number) => Ok(Completion::Normal(match number.value {
            NumberValue::Int(n) => Value::from_i64(n),
            NumberValue::Float(f) => Value::from_f64(f),
        })),
        Expression::String(literal) => eval_string(vm, literal),
        Expression::Identifier(ident) => eval_identifier(vm, ident),
        Expression::Message(message) => eval_message(vm, message),
        Expression::Return(ret) => eval_return(vm, ret),
        Expression::ObjectLiteral(literal) => {
            if literal.statements.is_empty() {
                construct_object(
                    vm,
                    ObjectType::Slots,
                    MapKind::Slots,
                    &[],
                    &literal.slots,
                    None,
                    "(object)",
                    literal.span,
                    None,
                )
            } else {
                construct_method(vm, "(method)", &[], literal)
            }
        }
        Expression::BlockLiteral(literal) => construct_block(vm, literal),
    }
}

fn eval_string(vm: &mut Vm, literal: &StringLiteral) -> EvalResult {
    let Vm { heap, world } = vm;
    heap.ensure_space(byte_array_allocation_size(literal.value.len()), world)?;
    let map = world.well_known.byte_array_map;
    // SAFETY: space ensured; the shared byte-array map is valid.
    let value =
        unsafe { alloc_byte_array(heap, map, literal.value.as_bytes()) };
    Ok(Completion::Normal(value))
}

// ── Identifier resolution ─────────────────────────────────────────────

fn is_method_object(value: Value) -> bool {
    value.is_ref()
        // SAFETY: live reference.
        && unsafe { value.as_ref::<Header>() }.object_type()
            == ObjectType::Method
}

fn is_block_object(value: Value) -> bool {
    value.is_ref()
        // SAFETY: live reference.
        && unsafe { value.as_ref::<Header>() }.object_type()
            == ObjectType::Block
}

/// # Safety
///
/// The slot's name must reference a live byte array.
unsafe fn slot_name_matches(slot: &Slot, name: &str) -> bool {
    let slot_name: &ByteArray = slot.name.as_ref();
    slot_name.bytes() == name.as_bytes()
}

/// Search one activation's method/block map for `name`.
/// Returns the bound value: activation bindings for mutable and
/// argument slots, the inline value for constants.
fn find_in_frame(vm: &Vm, frame_ref: ActivationRef, name: &str, hash: u32) -> Option<Value> {
    let frame = vm.world.activations.get(frame_ref)?;
    if !frame.object.is_ref() {
        return None;
    }
    // SAFETY: the activated object and its map are live and rooted by
    // the frame itself.
    unsafe {
        let object: &SlotsObject = frame.object.as_ref();
        let map_value = object.map;
        let map: &Map = map_value.as_ref();
        for slot in map.slots() {
            if slot.hash() != hash || !slot_name_matches(slot, name) {
                continue;
            }
            if slot.is_mutable() {
                return Some(frame.bindings[slot.assignable_index()]);
            }
            return Some(slot.value);
        }
    }
    None
}

/// Resolve `name` against the running activation chain: the current
/// frame's arguments, locals, and constants, then — for blocks — the
/// lexically enclosing frames.
fn resolve_in_activations(vm: &Vm, name: &str) -> Option<Value> {
    let hash = selector_hash(name.as_bytes());
    let mut current = vm.world.activations.top_ref();
    while let Some(frame_ref) = current {
        if let Some(value) = find_in_frame(vm, frame_ref, name, hash) {
            return Some(value);
        }
        let frame = vm.world.activations.get(frame_ref)?;
        current = match frame.kind {
            ActivationKind::Block => Some(frame.parent),
            ActivationKind::Method => None,
        };
    }
    None
}

/// Assign into a mutable binding of the running activation chain.
fn assign_in_activations(vm: &mut Vm, name: &str, value: Value) -> bool {
    let hash = selector_hash(name.as_bytes());
    let mut current = vm.world.activations.top_ref();
    while let Some(frame_ref) = current {
        let Some(frame) = vm.world.activations.get(frame_ref) else {
            return false;
        };
        let next = match frame.kind {
            ActivationKind::Block => Some(frame.parent),
            ActivationKind::Method => None,
        };
        let hit = if frame.object.is_ref() {
            // SAFETY: the activated object and its map are live.
            unsafe {
                let object: &SlotsObject = frame.object.as_ref();
                let map_value = object.map;
                let map: &Map = map_value.as_ref();
                map.slots()
                    .iter()
                    .find(|slot| {
                        slot.hash() == hash
                            && slot.is_mutable()
                            && slot_name_matches(slot, name)
                    })
                    .map(|slot| slot.assignable_index())
            }
        } else {
            None
        };
        if let Some(index) = hit {
            let frame = vm
                .world
                .activations
                .get_mut(frame_ref)
                .expect("frame verified live");
            frame.bindings[index] = value;
            return true;
        }
        current = next;
    }
    false
}

fn eval_identifier(vm: &mut Vm, ident: &ast::Identifier) -> EvalResult {
    let name = ident.name.as_str();
    if name == "self" {
        return Ok(Completion::Normal(vm.current_self()));
    }
    if name.starts_with('_') {
        let receiver = vm.current_self();
        return dispatch_primitive(vm, name, receiver, &[], ident.span);
    }

    if let Some(value) = resolve_in_activations(vm, name) {
        let receiver = vm.current_self();
        return maybe_activate(vm, value, receiver, ident.span);
    }

    let receiver = vm.current_self();
    let hash = selector_hash(name.as_bytes());
    // SAFETY: receiver and the well-known table hold live values.
    let found = unsafe {
        lookup(
            receiver,
            name.as_bytes(),
            hash,
            Intent::Read,
            &vm.world.well_known,
        )
    };
    match found {
        LookupResult::Value { value, .. } => {
            maybe_activate(vm, value, receiver, ident.span)
        }
        _ => Ok(Completion::error(
            format!("did not understand '{name}'"),
            vm.current_file(),
            ident.span,
        )),
    }
}

/// A resolved method activates immediately with zero arguments;
/// anything else is returned as-is.
fn maybe_activate(
    vm: &mut Vm,
    value: Value,
    receiver: Value,
    span: Span,
) -> EvalResult {
    if is_method_object(value) {
        activate_method(vm, value, receiver, &[], span)
    } else {
        Ok(Completion::Normal(value))
    }
}

// ── Message sends ─────────────────────────────────────────────────────

fn eval_message(vm: &mut Vm, message: &Message) -> EvalResult {
    let implicit = message.receiver.is_none();
    let receiver = match &message.receiver {
        Some(expr) => match eval_expression(vm, expr)? {
            Completion::Normal(value) => value,
            other => return Ok(other),
        },
        None => vm.current_self(),
    };

    // Receiver and arguments stay rooted on the scratch stack across
    // each other's (potentially allocating) evaluation.
    let base = vm.world.scratch.len();
    vm.world.scratch.push(receiver);
    for argument in &message.arguments {
        match eval_expression(vm, argument) {
            Ok(Completion::Normal(value)) => vm.world.scratch.push(value),
            Ok(other) => {
                vm.world.scratch.truncate(base);
                return Ok(other);
            }
            Err(err) => {
                vm.world.scratch.truncate(base);
                return Err(err);
            }
        }
    }

    let result = dispatch(vm, implicit, base, &message.selector, message.span);
    vm.world.scratch.truncate(base);
    result
}

fn is_single_keyword(selector: &str) -> bool {
    selector.ends_with(':')
        && selector.bytes().filter(|&b| b == b':').count() == 1
}

/// `value`, `value:`, `value:With:`, … up to eight arguments.
fn block_arity_selector_matches(selector: &str, argc: usize) -> bool {
    match argc {
        0 => selector == "value",
        1..=8 => {
            selector.len() == 6 + (argc - 1) * 5
                && selector.starts_with("value:")
                && selector[6..].as_bytes().chunks(5).all(|c| c == b"With:")
        }
        _ => false,
    }
}

/// Dispatch the prepared send: receiver at `scratch[base]`, arguments
/// after it.
fn dispatch(
    vm: &mut Vm,
    implicit: bool,
    base: usize,
    selector: &str,
    span: Span,
) -> EvalResult {
    let _guard =
        tracing::trace_span!("send", selector = %selector).entered();
    let argc = vm.world.scratch.len() - base - 1;

    // Reserved selectors bypass lookup entirely.
    if selector.starts_with('_') {
        let receiver = vm.world.scratch[base];
        let args: Vec<Value> = vm.world.scratch[base + 1..].to_vec();
        return dispatch_primitive(vm, selector, receiver, &args, span);
    }

    // `x: v` with an implicit receiver assigns a method/block local
    // before it is a send.
    if implicit && argc == 1 && is_single_keyword(selector) {
        let name = &selector[..selector.len() - 1];
        let value = vm.world.scratch[base + 1];
        if assign_in_activations(vm, name, value) {
            return Ok(Completion::Normal(value));
        }
    }

    let receiver = vm.world.scratch[base];

    // A block activates only through its own arity selector; anything
    // else falls through to ordinary lookup.
    if is_block_object(receiver) {
        // SAFETY: live block object.
        let block_arity = unsafe {
            let object: &SlotsObject = receiver.as_ref();
            let map_value = object.map;
            map_value.as_ref::<Map>().argument_slot_count() as usize
        };
        if argc == block_arity && block_arity_selector_matches(selector, argc) {
            return activate_block(vm, base, span);
        }
    }

    let hash = selector_hash(selector.as_bytes());
    // SAFETY: receiver and the well-known table hold live values.
    let found = unsafe {
        lookup(
            receiver,
            selector.as_bytes(),
            hash,
            Intent::Read,
            &vm.world.well_known,
        )
    };
    match found {
        LookupResult::Value { value, .. } => {
            if is_method_object(value) {
                let args: Vec<Value> = vm.world.scratch[base + 1..].to_vec();
                activate_method(vm, value, receiver, &args, span)
            } else {
                Ok(Completion::Normal(value))
            }
        }
        _ => {
            // Assignment to a mutable slot is the keyword selector
            // `name:`; the slot is located on the direct receiver only.
            if argc == 1 && is_single_keyword(selector) {
                let name = &selector[..selector.len() - 1];
                let name_hash = selector_hash(name.as_bytes());
                // SAFETY: as above.
                let assign = unsafe {
                    lookup(
                        receiver,
                        name.as_bytes(),
                        name_hash,
                        Intent::Assign,
                        &vm.world.well_known,
                    )
                };
                if let LookupResult::Assignable { holder, index } = assign {
                    let value = vm.world.scratch[base + 1];
                    // SAFETY: the holder is a live slots-layout object
                    // whose assignable array covers `index`.
                    unsafe {
                        (*(holder.ref_bits() as *mut SlotsObject))
                            .set_value(index, value);
                    }
                    vm.heap.write_barrier(holder, value);
                    return Ok(Completion::Normal(value));
                }
            }
            Ok(Completion::error(
                format!("did not understand '{selector}'"),
                vm.current_file(),
                span,
            ))
        }
    }
}

// ── Primitive dispatch ────────────────────────────────────────────────

pub fn dispatch_primitive(
    vm: &mut Vm,
    selector: &str,
    receiver: Value,
    args: &[Value],
    span: Span,
) -> EvalResult {
    let Some(&index) = vm.world.primitive_index.get(selector) else {
        return Ok(Completion::error(
            format!("unknown primitive '{selector}'"),
            vm.current_file(),
            span,
        ));
    };
    call_primitive(vm, index, receiver, args, span)
}

/// Invoke a registry entry by stored index. An out-of-range index can
/// only come from a corrupted map and panics.
pub fn call_primitive(
    vm: &mut Vm,
    index: usize,
    receiver: Value,
    args: &[Value],
    span: Span,
) -> EvalResult {
    let desc = vm.world.primitives[index];
    if desc.arity as usize != args.len() {
        return Ok(Completion::error(
            format!(
                "{}: expected {} arguments, got {}",
                desc.name,
                desc.arity,
                args.len()
            ),
            vm.current_file(),
            span,
        ));
    }
    (desc.func)(vm, receiver, args, span)
}

// ── Activation ────────────────────────────────────────────────────────

/// Bind arguments and locals and run a method body.
///
/// Non-local returns targeting this activation are caught here and
/// become the send's normal result.
pub fn activate_method(
    vm: &mut Vm,
    method: Value,
    receiver: Value,
    args: &[Value],
    span: Span,
) -> EvalResult {
    debug_assert!(is_method_object(method));

    // Primitive-backed methods carry a registry index instead of code.
    // SAFETY: method object and its map are live.
    let primitive = unsafe {
        let object: &SlotsObject = method.as_ref();
        let map_value = object.map;
        map_value.as_ref::<Map>().primitive
    };
    if primitive != NO_PRIMITIVE {
        return call_primitive(vm, primitive as usize, receiver, args, span);
    }

    if vm.world.activations.depth() >= MAX_ACTIVATIONS {
        return Ok(Completion::error(
            "activation stack overflow",
            vm.current_file(),
            span,
        ));
    }

    // SAFETY: method object and its map are live; no allocation occurs
    // until the frame (which roots everything) is pushed.
    let (statements, frame) = unsafe {
        let object: &SlotsObject = method.as_ref();
        let map_value = object.map;
        let map: &Map = map_value.as_ref();
        let code = map.method_code().expect("interpreted map without code");

        if map.argument_slot_count() as usize != args.len() {
            return Ok(Completion::error(
                format!(
                    "'{}' expects {} arguments, got {}",
                    code.name,
                    map.argument_slot_count(),
                    args.len()
                ),
                vm.current_file(),
                span,
            ));
        }

        let mut bindings =
            vec![vm.world.well_known.nil; map.assignable_slot_count() as usize];
        let mut next_arg = 0;
        for slot in map.slots() {
            if slot.is_argument() {
                bindings[slot.assignable_index()] = args[next_arg];
                next_arg += 1;
            } else if slot.is_mutable() {
                // Locals start from the initializer values stored in
                // the method object.
                let index = slot.assignable_index();
                bindings[index] = object.value(index);
            }
        }

        let frame = Activation {
            kind: ActivationKind::Method,
            object: method,
            receiver,
            bindings,
            name: Rc::clone(&code.name),
            file: Rc::clone(&code.file),
            span,
            parent: ActivationRef::NULL,
            nlr_target: ActivationRef::NULL,
        };
        (Rc::clone(&code.statements), frame)
    };

    run_activation(vm, frame, &statements)
}

/// Push a frame, run the statements, pop, and sort out the completion.
fn run_activation(
    vm: &mut Vm,
    frame: Activation,
    statements: &[Statement],
) -> EvalResult {
    let frame_ref = vm
        .world
        .activations
        .push(frame)
        .expect("depth checked before frame construction");

    let result = eval_statements(vm, statements);
    let popped = vm.world.activations.pop().expect("activation balance");

    match result? {
        Completion::Normal(value) => Ok(Completion::Normal(value)),
        Completion::NonLocalReturn { target, value } if target == frame_ref => {
            let result = vm.heap.tracked(&value);
            vm.heap.untrack(value);
            Ok(Completion::Normal(result))
        }
        other @ Completion::NonLocalReturn { .. } => Ok(other),
        Completion::Error(mut err) => {
            err.push_frame(&popped);
            Ok(Completion::Error(err))
        }
    }
}

/// Activate the block at `scratch[base]` with the arguments after it.
///
/// The receiver comes from the captured parent activation; non-local
/// returns escape past this frame unless it is the target.
fn activate_block(vm: &mut Vm, base: usize, span: Span) -> EvalResult {
    let block = vm.world.scratch[base];
    let args: Vec<Value> = vm.world.scratch[base + 1..].to_vec();

    // SAFETY: block object and its map are live.
    let (parent_ref, nlr_target, arg_count, assignable) = unsafe {
        let object: &SlotsObject = block.as_ref();
        let map_value = object.map;
        let map: &Map = map_value.as_ref();
        (
            map.parent_activation,
            map.nlr_target,
            map.argument_slot_count() as usize,
            map.assignable_slot_count() as usize,
        )
    };

    let Some(parent) = vm.world.activations.get(parent_ref) else {
        return Ok(Completion::error(
            "block invoked after its home method returned",
            vm.current_file(),
            span,
        ));
    };
    let receiver = parent.receiver;

    debug_assert_eq!(arg_count, args.len(), "dispatch checked the arity");
    if vm.world.activations.depth() >= MAX_ACTIVATIONS {
        return Ok(Completion::error(
            "activation stack overflow",
            vm.current_file(),
            span,
        ));
    }

    // SAFETY: as above; no allocation before the frame is pushed.
    let (statements, frame) = unsafe {
        let object: &SlotsObject = block.as_ref();
        let map_value = object.map;
        let map: &Map = map_value.as_ref();
        let code = map.method_code().expect("block map without code");

        let mut bindings = vec![vm.world.well_known.nil; assignable];
        let mut next_arg = 0;
        for slot in map.slots() {
            if slot.is_argument() {
                bindings[slot.assignable_index()] = args[next_arg];
                next_arg += 1;
            } else if slot.is_mutable() {
                let index = slot.assignable_index();
                bindings[index] = object.value(index);
            }
        }

        let frame = Activation {
            kind: ActivationKind::Block,
            object: block,
            receiver,
            bindings,
            name: Rc::clone(&code.name),
            file: Rc::clone(&code.file),
            span,
            parent: parent_ref,
            nlr_target,
        };
        (Rc::clone(&code.statements), frame)
    };

    run_activation(vm, frame, &statements)
}

// ── Non-local return ──────────────────────────────────────────────────

fn eval_return(vm: &mut Vm, ret: &ReturnExpr) -> EvalResult {
    let target = vm
        .world
        .activations
        .top()
        .expect("return outside any activation")
        .nlr_target;

    let value = match eval_expression(vm, &ret.expression)? {
        Completion::Normal(value) => value,
        other => return Ok(other),
    };

    if !vm.world.activations.is_live(target) {
        return Ok(Completion::error(
            "non-local return past method boundary",
            vm.current_file(),
            ret.span,
        ));
    }

    let tracked = vm.heap.track(value);
    Ok(Completion::NonLocalReturn {
        target,
        value: tracked,
    })
}

// ── Literal construction ──────────────────────────────────────────────

/// A slot declaration denotes a method when it declares arguments or
/// its value is an object literal carrying code.
fn method_body(decl: &SlotDecl) -> Option<&ObjectLiteral> {
    if decl.is_argument || decl.is_mutable {
        return None;
    }
    match &decl.value {
        Some(Expression::ObjectLiteral(literal))
            if !decl.arguments.is_empty() || !literal.statements.is_empty() =>
        {
            Some(literal)
        }
        _ => None,
    }
}

fn construct_method(
    vm: &mut Vm,
    name: &str,
    argument_names: &[String],
    literal: &ObjectLiteral,
) -> EvalResult {
    construct_object(
        vm,
        ObjectType::Method,
        MapKind::Method,
        argument_names,
        &literal.slots,
        Some(&literal.statements),
        name,
        literal.span,
        None,
    )
}

/// A block captures the current top activation as its lexical parent
/// and that activation's non-local-return target as its own.
fn construct_block(vm: &mut Vm, literal: &BlockLiteral) -> EvalResult {
    let parent = vm
        .world
        .activations
        .top_ref()
        .expect("block literal outside any activation");
    let nlr_target = vm
        .world
        .activations
        .top()
        .expect("block literal outside any activation")
        .nlr_target;
    construct_object(
        vm,
        ObjectType::Block,
        MapKind::Block,
        &[],
        &literal.slots,
        Some(&literal.statements),
        "(block)",
        literal.span,
        Some((parent, nlr_target)),
    )
}

/// Shared construction path for slots objects, methods, and blocks.
///
/// Slot initializers are evaluated in declaration order onto the
/// rooted scratch stack, names are interned, then the map and the
/// object are allocated back-to-back under one space reservation.
#[allow(clippy::too_many_arguments)]
fn construct_object(
    vm: &mut Vm,
    object_type: ObjectType,
    kind: MapKind,
    argument_names: &[String],
    decls: &[SlotDecl],
    statements: Option<&Rc<[Statement]>>,
    name: &str,
    span: Span,
    block_refs: Option<(ActivationRef, ActivationRef)>,
) -> EvalResult {
    let base = vm.world.scratch.len();

    // Phase 1: initializer values, in declaration order.
    for decl in decls {
        if decl.is_argument {
            continue;
        }
        let value = if let Some(body) = method_body(decl) {
            match construct_method(vm, &decl.name, &decl.arguments, body)? {
                Completion::Normal(value) => value,
                other => {
                    vm.world.scratch.truncate(base);
                    return Ok(other);
                }
            }
        } else if !decl.arguments.is_empty() {
            vm.world.scratch.truncate(base);
            return Ok(Completion::error(
                format!("slot '{}' declares arguments but no method body", decl.name),
                vm.current_file(),
                decl.span,
            ));
        } else {
            match &decl.value {
                Some(expr) => match eval_expression(vm, expr) {
                    Ok(Completion::Normal(value)) => value,
                    Ok(other) => {
                        vm.world.scratch.truncate(base);
                        return Ok(other);
                    }
                    Err(err) => {
                        vm.world.scratch.truncate(base);
                        return Err(err);
                    }
                },
                None => vm.world.well_known.nil,
            }
        };
        vm.world.scratch.push(value);
    }

    // Phase 2: layout.
    let declared_arguments =
        decls.iter().filter(|d| d.is_argument).count();
    let argument_count = argument_names.len() + declared_arguments;
    let mutable_count =
        decls.iter().filter(|d| !d.is_argument && d.is_mutable).count();
    let assignable_total = argument_count + mutable_count;
    if assignable_total > MAX_ASSIGNABLE_SLOTS {
        vm.world.scratch.truncate(base);
        return Ok(Completion::error(
            format!("too many assignable slots ({assignable_total})"),
            vm.current_file(),
            span,
        ));
    }
    let slot_total = argument_count
        + decls.iter().filter(|d| !d.is_argument).count();

    // Phase 3: intern names (may collect; scratch is rooted).
    for arg_name in argument_names {
        if let Err(err) = vm.intern(arg_name) {
            vm.world.scratch.truncate(base);
            return Err(err);
        }
    }
    for decl in decls {
        if let Err(err) = vm.intern(&decl.name) {
            vm.world.scratch.truncate(base);
            return Err(err);
        }
    }

    // Phase 4: one reservation covers the map and the object, so no
    // collection can run between the two allocations.
    let total = map_allocation_size(slot_total as u32)
        + slots_object_allocation_size(assignable_total);
    {
        let Vm { heap, world } = vm;
        if let Err(err) = heap.ensure_space(total, world) {
            world.scratch.truncate(base);
            return Err(err);
        }
    }

    // Phase 5: build descriptors from the (post-reservation) rooted
    // values and allocate.
    let nil = vm.world.well_known.nil;
    let mut slots: Vec<Slot> = Vec::with_capacity(slot_total);
    let mut assignables: Vec<Value> = vec![nil; assignable_total];
    let mut next_index = 0usize;

    for arg_name in argument_names {
        let name_value = *vm
            .world
            .interner
            .get(arg_name.as_str())
            .expect("interned above");
        slots.push(Slot::new(
            SlotFlags::MUTABLE.with(SlotFlags::ARGUMENT),
            selector_hash(arg_name.as_bytes()),
            name_value,
            Value::from_i64(next_index as i64),
        ));
        next_index += 1;
    }

    let mut scratch_index = base;
    for decl in decls {
        let name_value = *vm
            .world
            .interner
            .get(decl.name.as_str())
            .expect("interned above");
        let hash = selector_hash(decl.name.as_bytes());
        if decl.is_argument {
            slots.push(Slot::new(
                SlotFlags::MUTABLE.with(SlotFlags::ARGUMENT),
                hash,
                name_value,
                Value::from_i64(next_index as i64),
            ));
            next_index += 1;
        } else if decl.is_mutable {
            let value = vm.world.scratch[scratch_index];
            scratch_index += 1;
            assignables[next_index] = value;
            let mut flags = SlotFlags::MUTABLE;
            if decl.is_parent {
                flags = flags.with(SlotFlags::PARENT);
            }
            slots.push(Slot::new(
                flags,
                hash,
                name_value,
                Value::from_i64(next_index as i64),
            ));
            next_index += 1;
        } else {
            let value = vm.world.scratch[scratch_index];
            scratch_index += 1;
            let mut flags = SlotFlags::NONE;
            if decl.is_parent {
                flags = flags.with(SlotFlags::PARENT);
            }
            slots.push(Slot::new(flags, hash, name_value, value));
        }
    }

    let code = match statements {
        Some(statements) => Box::into_raw(Box::new(MethodCode {
            statements: Rc::clone(statements),
            file: vm.current_file(),
            name: Rc::from(name),
            span,
        })),
        None => core::ptr::null_mut(),
    };

    let map_map = vm.world.well_known.map_map;
    let Vm { heap, .. } = vm;
    // SAFETY: space reserved above; all slot names and values were
    // re-read after the reservation.
    let value = unsafe {
        let map = alloc_map(
            heap,
            map_map,
            kind,
            &slots,
            assignable_total as u8,
            argument_count as u8,
            code,
            NO_PRIMITIVE,
        );
        if let Some((parent, nlr_target)) = block_refs {
            let map_ptr = map.ref_bits() as *mut Map;
            (*map_ptr).parent_activation = parent;
            (*map_ptr).nlr_target = nlr_target;
        }
        alloc_slots_object(heap, object_type, map, &assignables)
    };
    vm.world.scratch.truncate(base);
    Ok(Completion::Normal(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{execute_script, ExecError};
    use ast::{Identifier, Number, Script, Statement};
    use heap::HeapSettings;

    // ── AST builders ───────────────────────────────────────────────

    fn sp() -> Span {
        Span::origin()
    }

    fn int(n: i64) -> Expression {
        Expression::Number(ast::Number {
            value: NumberValue::Int(n),
            span: sp(),
        })
    }

    fn float(f: f64) -> Expression {
        Expression::Number(Number {
            value: NumberValue::Float(f),
            span: sp(),
        })
    }

    fn string(s: &str) -> Expression {
        Expression::String(StringLiteral {
            value: s.to_string(),
            span: sp(),
        })
    }

    fn ident(name: &str) -> Expression {
        Expression::Identifier(Identifier {
            name: name.to_string(),
            span: sp(),
        })
    }

    fn send(receiver: Expression, selector: &str, args: Vec<Expression>) -> Expression {
        Expression::Message(Message {
            receiver: Some(Box::new(receiver)),
            selector: selector.to_string(),
            arguments: args,
            span: sp(),
        })
    }

    fn isend(selector: &str, args: Vec<Expression>) -> Expression {
        Expression::Message(Message {
            receiver: None,
            selector: selector.to_string(),
            arguments: args,
            span: sp(),
        })
    }

    fn ret(e: Expression) -> Expression {
        Expression::Return(ReturnExpr {
            expression: Box::new(e),
            span: sp(),
        })
    }

    fn body(exprs: Vec<Expression>) -> Vec<Statement> {
        exprs.into_iter().map(Statement::new).collect()
    }

    fn obj(slots: Vec<SlotDecl>, statements: Vec<Expression>) -> Expression {
        Expression::ObjectLiteral(ObjectLiteral {
            slots,
            statements: body(statements).into(),
            span: sp(),
        })
    }

    fn block(slots: Vec<SlotDecl>, statements: Vec<Expression>) -> Expression {
        Expression::BlockLiteral(BlockLiteral {
            slots,
            statements: body(statements).into(),
            span: sp(),
        })
    }

    fn script(exprs: Vec<Expression>) -> Script {
        Script::new("test.prl", body(exprs))
    }

    fn new_vm() -> Vm {
        Vm::new(HeapSettings::default()).expect("bootstrap")
    }

    fn run(vm: &mut Vm, exprs: Vec<Expression>) -> Result<Value, ExecError> {
        let result = execute_script(vm, &script(exprs));
        assert!(vm.world.activations.is_empty(), "activation imbalance");
        result
    }

    fn run_int(vm: &mut Vm, exprs: Vec<Expression>) -> i64 {
        let value = run(vm, exprs).expect("script failed");
        assert!(value.is_fixnum(), "expected fixnum, got {value:?}");
        // SAFETY: just checked.
        unsafe { value.to_i64() }
    }

    fn runtime_error(vm: &mut Vm, exprs: Vec<Expression>) -> crate::completion::RuntimeError {
        match run(vm, exprs) {
            Err(ExecError::Runtime(err)) => err,
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    // ── Literals and identifiers ───────────────────────────────────

    #[test]
    fn number_literals() {
        let mut vm = new_vm();
        assert_eq!(run_int(&mut vm, vec![int(42)]), 42);

        let value = run(&mut vm, vec![float(2.5)]).unwrap();
        assert!(value.is_float());
        assert_eq!(unsafe { value.to_f64() }, 2.5);
    }

    #[test]
    fn empty_script_yields_nil() {
        let mut vm = new_vm();
        let value = run(&mut vm, vec![]).unwrap();
        assert!(value.identical(vm.world.well_known.nil));
    }

    #[test]
    fn self_resolves_to_lobby_at_top_level() {
        let mut vm = new_vm();
        let value = run(&mut vm, vec![ident("self")]).unwrap();
        assert!(value.identical(vm.lobby()));
    }

    #[test]
    fn lobby_knows_the_singletons() {
        let mut vm = new_vm();
        let value = run(&mut vm, vec![ident("true")]).unwrap();
        assert!(value.identical(vm.world.well_known.true_obj));
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let mut vm = new_vm();
        let err = runtime_error(&mut vm, vec![ident("nonesuch")]);
        assert!(err.message.contains("did not understand 'nonesuch'"));
    }

    #[test]
    fn string_literals_are_byte_arrays() {
        let mut vm = new_vm();
        let size = run_int(
            &mut vm,
            vec![send(string("hello"), "_BytesSize", vec![])],
        );
        assert_eq!(size, 5);
    }

    #[test]
    fn byte_array_concatenation() {
        let mut vm = new_vm();
        let size = run_int(
            &mut vm,
            vec![send(
                send(string("foo"), "_BytesConcat:", vec![string("bars")]),
                "_BytesSize",
                vec![],
            )],
        );
        assert_eq!(size, 7);
    }

    // ── End-to-end scripts ─────────────────────────────────────────

    #[test]
    fn scenario_constant_slots() {
        // (| x = 3. y = 4 |) x  =>  3
        let mut vm = new_vm();
        let literal = obj(
            vec![
                SlotDecl::constant("x", int(3)),
                SlotDecl::constant("y", int(4)),
            ],
            vec![],
        );
        assert_eq!(run_int(&mut vm, vec![send(literal, "x", vec![])]), 3);
    }

    #[test]
    fn scenario_keyword_method() {
        // (| add: a With: b = (a + b) |) add: 2 With: 3  =>  5
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "add:With:",
            vec!["a".into(), "b".into()],
            obj(vec![], vec![send(ident("a"), "+", vec![ident("b")])]),
        );
        let literal = obj(vec![method], vec![]);
        assert_eq!(
            run_int(&mut vm, vec![send(literal, "add:With:", vec![int(2), int(3)])]),
            5
        );
    }

    #[test]
    fn scenario_mutable_slot_assignment() {
        // (| x <- 1. set: v = (x: v) |) set: 42  =>  42, and x is now 42
        let mut vm = new_vm();
        let box_literal = obj(
            vec![
                SlotDecl::mutable("x", int(1)),
                SlotDecl::method(
                    "set:",
                    vec!["v".into()],
                    obj(vec![], vec![isend("x:", vec![ident("v")])]),
                ),
            ],
            vec![],
        );
        let install = isend(
            "_AddSlots:",
            vec![obj(vec![SlotDecl::constant("box", box_literal)], vec![])],
        );

        let result = run_int(
            &mut vm,
            vec![
                install,
                send(ident("box"), "set:", vec![int(42)]),
                send(ident("box"), "x", vec![]),
            ],
        );
        assert_eq!(result, 42);
    }

    #[test]
    fn assignment_send_yields_the_assigned_value() {
        let mut vm = new_vm();
        let box_literal = obj(vec![SlotDecl::mutable("x", int(1))], vec![]);
        let install = isend(
            "_AddSlots:",
            vec![obj(vec![SlotDecl::constant("box", box_literal)], vec![])],
        );
        let result = run_int(
            &mut vm,
            vec![install, send(ident("box"), "x:", vec![int(9)])],
        );
        assert_eq!(result, 9);
    }

    #[test]
    fn scenario_non_local_return() {
        // (| foo = ([ ^ 7 ] value + 1000) |) foo  =>  7
        let mut vm = new_vm();
        let foo = SlotDecl::constant(
            "foo",
            obj(
                vec![],
                vec![send(
                    send(block(vec![], vec![ret(int(7))]), "value", vec![]),
                    "+",
                    vec![int(1000)],
                )],
            ),
        );
        let literal = obj(vec![foo], vec![]);
        assert_eq!(run_int(&mut vm, vec![send(literal, "foo", vec![])]), 7);
    }

    #[test]
    fn scenario_stack_overflow() {
        // A method that sends itself without a base case overflows the
        // activation stack; the trace covers the full depth. The deep
        // native recursion needs a large thread stack.
        std::thread::Builder::new()
            .stack_size(256 << 20)
            .spawn(|| {
                let mut vm = new_vm();
                let run_method = SlotDecl::constant(
                    "run",
                    obj(vec![], vec![ident("run")]),
                );
                let literal = obj(vec![run_method], vec![]);
                let err = runtime_error(&mut vm, vec![send(literal, "run", vec![])]);
                assert!(err.message.contains("activation stack overflow"));
                assert_eq!(err.trace.len(), MAX_ACTIVATIONS);
            })
            .expect("spawn")
            .join()
            .expect("join");
    }

    #[test]
    fn scenario_gc_stress() {
        // 10,000 short-lived strings churn a small heap inside a
        // method whose receiver delegates to a long-lived parent; the
        // parent slot still resolves afterwards and the receiver keeps
        // its identity as seen through a tracked reference.
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .try_init();
        let settings = HeapSettings {
            eden_size: 64 << 10,
            survivor_size: 32 << 10,
            old_size: 4 << 20,
            promote_age: 2,
        };
        let mut vm = Vm::new(settings).expect("bootstrap");

        let mut spin_body: Vec<Expression> = (0..10_000)
            .map(|i| string(&format!("short-lived payload {i:05} ................")))
            .collect();
        spin_body.push(ident("marker"));

        let literal = obj(
            vec![
                SlotDecl::parent("p", obj(
                    vec![SlotDecl::constant("marker", int(99))],
                    vec![],
                )),
                SlotDecl::constant("spin", obj(vec![], spin_body)),
            ],
            vec![],
        );
        let install = isend(
            "_AddSlots:",
            vec![obj(vec![SlotDecl::constant("o", literal)], vec![])],
        );

        let receiver = run(&mut vm, vec![install, ident("o")]).unwrap();
        let handle = vm.heap.track(receiver);

        assert_eq!(run_int(&mut vm, vec![send(ident("o"), "spin", vec![])]), 99);
        assert!(vm.heap.minor_collections() > 0, "stress must collect");

        // The tracked reference still reaches the same object and its
        // parent chain.
        let receiver = vm.heap.tracked(&handle);
        let hash = selector_hash(b"marker");
        // SAFETY: receiver is rooted and live.
        let found = unsafe {
            lookup(receiver, b"marker", hash, Intent::Read, &vm.world.well_known)
        };
        match found {
            LookupResult::Value { value, .. } => {
                assert_eq!(unsafe { value.to_i64() }, 99);
            }
            other => panic!("parent lookup failed after GC: {other:?}"),
        }
        vm.heap.untrack(handle);
        assert_eq!(vm.heap.live_tracked(), 0);
    }

    // ── Blocks ─────────────────────────────────────────────────────

    #[test]
    fn block_with_argument() {
        // [ :a | a * 2 ] value: 21  =>  42
        let mut vm = new_vm();
        let b = block(
            vec![SlotDecl::argument("a")],
            vec![send(ident("a"), "*", vec![int(2)])],
        );
        assert_eq!(run_int(&mut vm, vec![send(b, "value:", vec![int(21)])]), 42);
    }

    #[test]
    fn block_reads_enclosing_method_argument() {
        // (| twice: n = ([ n + n ] value) |) twice: 8  =>  16
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "twice:",
            vec!["n".into()],
            obj(
                vec![],
                vec![send(
                    block(vec![], vec![send(ident("n"), "+", vec![ident("n")])]),
                    "value",
                    vec![],
                )],
            ),
        );
        let literal = obj(vec![method], vec![]);
        assert_eq!(
            run_int(&mut vm, vec![send(literal, "twice:", vec![int(8)])]),
            16
        );
    }

    #[test]
    fn block_arity_mismatch_is_an_error() {
        let mut vm = new_vm();
        let b = block(vec![SlotDecl::argument("a")], vec![ident("a")]);
        let err = runtime_error(&mut vm, vec![send(b, "value", vec![])]);
        assert!(err.message.contains("did not understand 'value'"));
    }

    #[test]
    fn block_invoked_after_home_returned_is_an_error() {
        // (| maker = ([ ^ 1 ]) |) maker value — the block's home
        // activation is gone by the time `value` arrives.
        let mut vm = new_vm();
        let maker = SlotDecl::constant(
            "maker",
            obj(vec![], vec![block(vec![], vec![ret(int(1))])]),
        );
        let install = isend(
            "_AddSlots:",
            vec![obj(
                vec![SlotDecl::constant("holder", obj(vec![maker], vec![]))],
                vec![],
            )],
        );
        let err = runtime_error(
            &mut vm,
            vec![
                install,
                send(send(ident("holder"), "maker", vec![]), "value", vec![]),
            ],
        );
        assert!(err.message.contains("after its home method returned"));
    }

    #[test]
    fn top_level_return_is_absorbed_by_the_script() {
        let mut vm = new_vm();
        assert_eq!(run_int(&mut vm, vec![ret(int(5)), int(6)]), 5);
    }

    // ── Methods and locals ─────────────────────────────────────────

    #[test]
    fn method_argument_can_be_reassigned() {
        // (| tweak: n = (n: 5. n) |) tweak: 1  =>  5
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "tweak:",
            vec!["n".into()],
            obj(vec![], vec![isend("n:", vec![int(5)]), ident("n")]),
        );
        let literal = obj(vec![method], vec![]);
        assert_eq!(
            run_int(&mut vm, vec![send(literal, "tweak:", vec![int(1)])]),
            5
        );
    }

    #[test]
    fn method_locals_rebind_per_activation() {
        // A mutable local starts from its initializer on every
        // activation; assigning it does not leak into the next call.
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "bump:",
            vec!["v".into()],
            obj(
                vec![SlotDecl::mutable("t", int(10))],
                vec![isend("t:", vec![ident("v")]), ident("t")],
            ),
        );
        let install = isend(
            "_AddSlots:",
            vec![obj(
                vec![SlotDecl::constant("c", obj(vec![method], vec![]))],
                vec![],
            )],
        );
        let first = run_int(
            &mut vm,
            vec![install, send(ident("c"), "bump:", vec![int(1)])],
        );
        assert_eq!(first, 1);
        let second =
            run_int(&mut vm, vec![send(ident("c"), "bump:", vec![int(2)])]);
        assert_eq!(second, 2);
    }

    #[test]
    fn method_arity_mismatch_is_an_error() {
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "one:",
            vec!["a".into()],
            obj(vec![], vec![ident("a")]),
        );
        let literal = obj(vec![method], vec![]);
        // `one:` with one argument resolves; sending plain `one` is a
        // different selector and must miss.
        let err = runtime_error(&mut vm, vec![send(literal, "one", vec![])]);
        assert!(err.message.contains("did not understand 'one'"));
    }

    // ── Dispatch details ───────────────────────────────────────────

    #[test]
    fn float_arithmetic_through_traits() {
        let mut vm = new_vm();
        let value = run(
            &mut vm,
            vec![send(float(1.5), "+", vec![float(2.25)])],
        )
        .unwrap();
        assert!(value.is_float());
        assert_eq!(unsafe { value.to_f64() }, 3.75);
    }

    #[test]
    fn comparison_yields_boolean_objects() {
        let mut vm = new_vm();
        let value = run(&mut vm, vec![send(int(3), "<", vec![int(4)])]).unwrap();
        assert!(value.identical(vm.world.well_known.true_obj));
        let value = run(&mut vm, vec![send(int(4), "<", vec![int(3)])]).unwrap();
        assert!(value.identical(vm.world.well_known.false_obj));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let mut vm = new_vm();
        let err = runtime_error(&mut vm, vec![send(int(1), "/", vec![int(0)])]);
        assert!(err.message.contains("division by zero"));
    }

    #[test]
    fn primitive_type_mismatch_names_the_argument() {
        let mut vm = new_vm();
        let err = runtime_error(
            &mut vm,
            vec![send(int(1), "_IntAdd:", vec![float(1.0)])],
        );
        assert!(err.message.contains("_IntAdd:"));
        assert!(err.message.contains("argument 1"));
    }

    #[test]
    fn unknown_primitive_is_an_error() {
        let mut vm = new_vm();
        let err = runtime_error(&mut vm, vec![isend("_Bogus:", vec![int(1)])]);
        assert!(err.message.contains("unknown primitive '_Bogus:'"));
    }

    #[test]
    fn data_slot_hit_with_arguments_returns_the_value() {
        // Hit on a non-method value returns it even for keyword sends.
        let mut vm = new_vm();
        let literal = obj(vec![SlotDecl::constant("k:", int(7))], vec![]);
        assert_eq!(run_int(&mut vm, vec![send(literal, "k:", vec![int(1)])]), 7);
    }

    #[test]
    fn parent_selector_on_fixnum_yields_traits() {
        let mut vm = new_vm();
        let value = run(&mut vm, vec![send(int(1), "parent", vec![])]).unwrap();
        assert!(value.identical(vm.world.well_known.fixnum_traits));
    }

    #[test]
    fn identical_primitive_compares_identity() {
        let mut vm = new_vm();
        let value = run(
            &mut vm,
            vec![send(ident("nil"), "_Identical:", vec![ident("nil")])],
        )
        .unwrap();
        assert!(value.identical(vm.world.well_known.true_obj));
    }

    #[test]
    fn current_activation_reifies_transparently() {
        // Lookup on the reified activation delegates to its receiver.
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "probe",
            vec![],
            obj(vec![], vec![isend("_CurrentActivation", vec![])]),
        );
        let literal = obj(
            vec![SlotDecl::constant("tag", int(31)), method],
            vec![],
        );
        let act = run(&mut vm, vec![send(literal, "probe", vec![])]).unwrap();
        let hash = selector_hash(b"tag");
        // SAFETY: value just produced by the script.
        let found = unsafe {
            lookup(act, b"tag", hash, Intent::Read, &vm.world.well_known)
        };
        match found {
            LookupResult::Value { value, .. } => {
                assert_eq!(unsafe { value.to_i64() }, 31);
            }
            other => panic!("expected delegation to receiver, got {other:?}"),
        }
    }

    #[test]
    fn add_slots_rejects_assignable_additions() {
        let mut vm = new_vm();
        let err = runtime_error(
            &mut vm,
            vec![isend(
                "_AddSlots:",
                vec![obj(vec![SlotDecl::mutable("m", int(1))], vec![])],
            )],
        );
        assert!(err.message.contains("cannot add assignable slots"));
    }

    #[test]
    fn activation_stack_balances_after_errors() {
        let mut vm = new_vm();
        let method = SlotDecl::method(
            "boom",
            vec![],
            obj(vec![], vec![ident("kaput")]),
        );
        let literal = obj(vec![method], vec![]);
        let err = runtime_error(&mut vm, vec![send(literal, "boom", vec![])]);
        assert!(err.message.contains("did not understand 'kaput'"));
        assert!(vm.world.activations.is_empty());
        assert_eq!(vm.world.scratch.len(), 0);

        // Error traces read newest-first: the failing method before
        // the script frame.
        assert_eq!(err.trace.len(), 2);
        assert_eq!(&*err.trace[0].name, "boom");
        assert_eq!(&*err.trace[1].name, "(script)");
    }

    #[test]
    fn error_report_format() {
        let mut vm = new_vm();
        let err = runtime_error(&mut vm, vec![ident("ghost")]);
        let report = err.to_string();
        assert!(
            report.starts_with("test.prl:1:1: error: did not understand 'ghost'"),
            "unexpected report: {report}"
        );
        assert!(report.contains("\n  at (script) test.prl:1:1"));
    }
}
