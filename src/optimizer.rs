use std::{cell::RefCell, rc::Rc};

use tracing::debug;

use crate::{
    program::{Instruction, Program},
    vm::{Machine, Value},
};

/// Folds `<int> <int> <arith-op>` windows until none are left.
pub fn constant_fold(program: &Program) -> Program {
    let mut current = program.clone();
    loop {
        let next = fold_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

/// Performs the first available fold, or returns the program unchanged.
fn fold_once(program: &Program) -> Program {
    let pinned = program.highest_literal_target();
    for (offset, window) in program.instructions().windows(3).enumerate() {
        let [Instruction::Push(Value::Integer(a)), Instruction::Push(Value::Integer(b)), Instruction::Op(op)] =
            window
        else {
            continue;
        };
        if !op.is_arithmetic() {
            continue;
        }
        // Something jumps into the window, so it has to stay intact.
        if program.is_jump_target(offset + 1) || program.is_jump_target(offset + 2) {
            continue;
        }
        // Literal targets are not relocated, so only code past them may shrink.
        if pinned.map_or(false, |target| offset < target) {
            continue;
        }
        // A computed address is relative to the unfolded layout.
        if program.feeds_address(offset + 2) {
            continue;
        }
        let Some(result) = evaluate(window) else {
            continue;
        };

        debug!(a, %op, b, result, "constant folded");
        return program.collapse(offset, window.len(), Instruction::from(result));
    }
    program.clone()
}

/// Runs the window on a scratch machine. Faulting windows are not folded.
fn evaluate(window: &[Instruction]) -> Option<i64> {
    let mut machine = Machine::with_io(
        Program::new(window.to_vec()),
        Rc::new(RefCell::new(std::io::empty())),
        Rc::new(RefCell::new(std::io::sink())),
    );
    machine.run().ok()?;
    match machine.top() {
        Some(Value::Integer(n)) => Some(*n),
        _ => None,
    }
}
