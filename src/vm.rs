mod stack;
mod value;

use std::{
    cell::RefCell,
    io::{BufRead, Write},
    rc::Rc,
};

use tracing::debug;

use crate::program::{Instruction, OpCode, Program};

use self::stack::Stack;
pub use self::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackKind {
    Data,
    Return,
}

impl std::fmt::Display for StackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackKind::Data => write!(f, "data"),
            StackKind::Return => write!(f, "return"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Stack underflow on the {0} stack")]
    StackUnderflow(StackKind),
    #[error("Unknown opcode: '{0}'")]
    UnknownOpcode(String),
    #[error("Jump address must be a valid integer below {len}, found '{target}'")]
    InvalidJumpTarget { target: Value, len: usize },
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Integer overflow in '{0}'")]
    IntegerOverflow(OpCode),
    #[error("Invalid operands for '{op}': {a:?} and {b:?}")]
    TypeMismatch { op: OpCode, a: Value, b: Value },
    #[error("Cannot convert {0:?} to an integer")]
    InvalidCast(Value),
    #[error("Machine has already halted")]
    Halted,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a run ended without a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    EndOfProgram,
    Exit,
    /// `read` reached the end of its input.
    EndOfInput,
}

pub struct Machine {
    program: Program,
    ip: usize,
    stack: Stack<Value>,
    return_stack: Stack<usize>,
    /// `None` reads the process stdin, one line per `read`.
    input: Option<Rc<RefCell<dyn BufRead>>>,
    output: Rc<RefCell<dyn Write>>,
    halted: bool,
}

impl Machine {
    /// Machine reading the process stdin and writing to stdout.
    pub fn new(program: Program) -> Self {
        Self::build(program, None, Rc::new(RefCell::new(std::io::stdout())))
    }

    pub fn with_io(
        program: Program,
        input: Rc<RefCell<dyn BufRead>>,
        output: Rc<RefCell<dyn Write>>,
    ) -> Self {
        Self::build(program, Some(input), output)
    }

    fn build(
        program: Program,
        input: Option<Rc<RefCell<dyn BufRead>>>,
        output: Rc<RefCell<dyn Write>>,
    ) -> Self {
        Self {
            program,
            ip: 0,
            stack: Stack::new(),
            return_stack: Stack::new(),
            input,
            output,
            halted: false,
        }
    }

    /// Data stack, bottom first.
    pub fn stack(&self) -> &[Value] {
        self.stack.as_slice()
    }

    pub fn return_stack(&self) -> &[usize] {
        self.return_stack.as_slice()
    }

    pub fn top(&self) -> Option<&Value> {
        self.stack.peek(0)
    }

    /// Runs until the program halts or faults. A machine runs only once;
    /// after a fault its stacks are left as they were before the faulting
    /// instruction.
    pub fn run(&mut self) -> Result<Halt, RuntimeError> {
        if self.halted {
            return Err(RuntimeError::Halted);
        }
        self.halted = true;

        loop {
            match self.step() {
                Ok(Some(halt)) => {
                    debug!(?halt, ip = self.ip, depth = self.stack.len(), "machine halted");
                    return Ok(halt);
                }
                Ok(None) => {}
                Err(error) => {
                    debug!(%error, ip = self.ip, "machine faulted");
                    return Err(error);
                }
            }
        }
    }

    fn step(&mut self) -> Result<Option<Halt>, RuntimeError> {
        let Some(instruction) = self.program.get(self.ip).cloned() else {
            return Ok(Some(Halt::EndOfProgram));
        };

        #[cfg(feature = "trace")]
        tracing::trace!(ip = self.ip, %instruction, stack = %self.stack, "dispatch");

        self.ip += 1;
        match instruction {
            Instruction::Push(value) => {
                self.stack.push(value);
                Ok(None)
            }
            Instruction::Op(op) => self.execute(op),
            Instruction::Unknown(word) => Err(RuntimeError::UnknownOpcode(word)),
        }
    }

    fn execute(&mut self, op: OpCode) -> Result<Option<Halt>, RuntimeError> {
        match op {
            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Div
            | OpCode::Mod
            | OpCode::Less
            | OpCode::Equal
            | OpCode::Greater => self.binary(|a, b| binary_op(op, a, b))?,
            OpCode::Dup => {
                let value = self.peek(0)?.clone();
                self.stack.push(value);
            }
            OpCode::Drop => {
                self.pop()?;
            }
            OpCode::Swap => {
                self.require(2)?;
                let b = self.pop()?;
                let a = self.pop()?;
                self.stack.push(b);
                self.stack.push(a);
            }
            OpCode::Over => {
                let value = self.peek(1)?.clone();
                self.stack.push(value);
            }
            OpCode::True => self.stack.push(Value::Boolean(true)),
            OpCode::False => self.stack.push(Value::Boolean(false)),
            OpCode::Write => {
                let value = self.pop()?;
                let mut output = self.output.borrow_mut();
                write!(output, "{}", value)?;
                output.flush()?;
            }
            OpCode::Dot => {
                let value = self.pop()?;
                let mut output = self.output.borrow_mut();
                writeln!(output, "{}", value)?;
                output.flush()?;
            }
            OpCode::Read => {
                let mut line = String::new();
                let read = match &self.input {
                    Some(input) => input.borrow_mut().read_line(&mut line)?,
                    None => std::io::stdin().read_line(&mut line)?,
                };
                if read == 0 {
                    return Ok(Some(Halt::EndOfInput));
                }
                let line = line.strip_suffix('\n').unwrap_or(&line);
                let line = line.strip_suffix('\r').unwrap_or(line);
                self.stack.push(Value::String(line.to_string()));
            }
            OpCode::Jmp => {
                self.ip = self.pop_address()?;
            }
            OpCode::Call => {
                let address = self.pop_address()?;
                self.return_stack.push(self.ip);
                self.ip = address;
            }
            OpCode::Return => {
                self.ip = self
                    .return_stack
                    .pop()
                    .ok_or(RuntimeError::StackUnderflow(StackKind::Return))?;
            }
            OpCode::At => self.return_stack.push(self.ip - 1),
            OpCode::Exit => return Ok(Some(Halt::Exit)),
            OpCode::If => {
                self.require(3)?;
                let false_clause = self.pop()?;
                let true_clause = self.pop()?;
                let test = self.pop()?;
                self.stack.push(if test.is_truthy() {
                    true_clause
                } else {
                    false_clause
                });
            }
            OpCode::Stack => self.dump_stack()?,
            OpCode::CastInt => {
                let value = self.peek(0)?;
                let cast = match value {
                    Value::Integer(n) => *n,
                    Value::Address(_) => value
                        .as_integer()
                        .ok_or_else(|| RuntimeError::InvalidCast(value.clone()))?,
                    Value::Boolean(b) => i64::from(*b),
                    Value::String(s) => s
                        .trim()
                        .parse()
                        .map_err(|_| RuntimeError::InvalidCast(value.clone()))?,
                };
                self.pop()?;
                self.stack.push(Value::Integer(cast));
            }
            OpCode::CastStr => {
                let value = self.pop()?;
                self.stack.push(Value::String(value.to_string()));
            }
        }
        Ok(None)
    }

    /// Writes both stacks, top first, without changing them.
    pub fn dump_stack(&self) -> Result<(), RuntimeError> {
        let mut output = self.output.borrow_mut();
        writeln!(output, "Data stack:")?;
        for value in self.stack.as_slice().iter().rev() {
            writeln!(output, " - type {}, value '{}'", value.type_name(), value)?;
        }
        writeln!(output, "Return stack:")?;
        for address in self.return_stack.as_slice().iter().rev() {
            writeln!(output, " - address {}", address)?;
        }
        output.flush()?;
        Ok(())
    }

    fn require(&self, count: usize) -> Result<(), RuntimeError> {
        if self.stack.len() < count {
            Err(RuntimeError::StackUnderflow(StackKind::Data))
        } else {
            Ok(())
        }
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or(RuntimeError::StackUnderflow(StackKind::Data))
    }

    fn peek(&self, distance: usize) -> Result<&Value, RuntimeError> {
        self.stack
            .peek(distance)
            .ok_or(RuntimeError::StackUnderflow(StackKind::Data))
    }

    fn pop_address(&mut self) -> Result<usize, RuntimeError> {
        let target = self.peek(0)?;
        let len = self.program.len();
        let address = target
            .as_address(len)
            .ok_or_else(|| RuntimeError::InvalidJumpTarget {
                target: target.clone(),
                len,
            })?;
        self.pop()?;
        Ok(address)
    }

    fn binary(
        &mut self,
        op: impl Fn(&Value, &Value) -> Result<Value, RuntimeError>,
    ) -> Result<(), RuntimeError> {
        let result = op(self.peek(1)?, self.peek(0)?)?;
        self.pop()?;
        self.pop()?;
        self.stack.push(result);
        Ok(())
    }
}

/// Applies an arithmetic or comparison opcode to `a op b`, where `b` was on top.
pub fn binary_op(op: OpCode, a: &Value, b: &Value) -> Result<Value, RuntimeError> {
    let mismatch = || RuntimeError::TypeMismatch {
        op,
        a: a.clone(),
        b: b.clone(),
    };

    if op == OpCode::Equal {
        return Ok(Value::Boolean(a.loosely_equals(b)));
    }

    if let (Some(x), Some(y)) = (a.as_integer(), b.as_integer()) {
        let overflow = || RuntimeError::IntegerOverflow(op);
        let result = match op {
            OpCode::Add => Value::Integer(x.checked_add(y).ok_or_else(overflow)?),
            OpCode::Sub => Value::Integer(x.checked_sub(y).ok_or_else(overflow)?),
            OpCode::Mul => Value::Integer(x.checked_mul(y).ok_or_else(overflow)?),
            OpCode::Div => Value::Integer(floor_div(x, y)?.ok_or_else(overflow)?),
            OpCode::Mod => Value::Integer(floor_mod(x, y)?),
            OpCode::Less => Value::Boolean(x < y),
            OpCode::Greater => Value::Boolean(x > y),
            _ => return Err(mismatch()),
        };
        return Ok(result);
    }

    match (op, a, b) {
        (OpCode::Add, Value::String(x), Value::String(y)) => Ok(Value::String(format!("{x}{y}"))),
        (OpCode::Less, Value::String(x), Value::String(y)) => Ok(Value::Boolean(x < y)),
        (OpCode::Greater, Value::String(x), Value::String(y)) => Ok(Value::Boolean(x > y)),
        _ => Err(mismatch()),
    }
}

/// Quotient rounded toward negative infinity. `None` on overflow.
fn floor_div(a: i64, b: i64) -> Result<Option<i64>, RuntimeError> {
    if b == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    let Some(q) = a.checked_div(b) else {
        return Ok(None);
    };
    if a % b != 0 && ((a < 0) != (b < 0)) {
        Ok(Some(q - 1))
    } else {
        Ok(Some(q))
    }
}

/// Remainder carrying the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> Result<i64, RuntimeError> {
    if b == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    let r = a.wrapping_rem(b);
    if r != 0 && ((r < 0) != (b < 0)) {
        Ok(r + b)
    } else {
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    struct Run {
        machine: Machine,
        result: Result<Halt, RuntimeError>,
        output: String,
    }

    fn execute_with_input(code: Vec<Instruction>, input: &'static str) -> Run {
        let output = Rc::new(RefCell::new(Vec::new()));
        let mut machine = Machine::with_io(
            Program::new(code),
            Rc::new(RefCell::new(input.as_bytes())),
            output.clone(),
        );
        let result = machine.run();
        let output = String::from_utf8(output.take()).unwrap();
        Run {
            machine,
            result,
            output,
        }
    }

    fn execute(code: Vec<Instruction>) -> Run {
        execute_with_input(code, "")
    }

    #[test_case(7, 3, "+", 10; "add")]
    #[test_case(7, 3, "-", 4; "sub")]
    #[test_case(7, 3, "*", 21; "mul")]
    #[test_case(7, 3, "/", 2; "div")]
    #[test_case(7, 3, "%", 1; "mod")]
    #[test_case(-7, 2, "/", -4; "div floors negative quotient")]
    #[test_case(-7, 2, "%", 1; "mod takes divisor sign")]
    #[test_case(7, -2, "%", -1; "mod negative divisor")]
    #[test_case(7, 3, "sub", 4; "word alias")]
    fn test_arithmetic(a: i64, b: i64, op: &str, expected: i64) {
        let run = execute(vec![a.into(), b.into(), op.into()]);
        assert_eq!(run.result.unwrap(), Halt::EndOfProgram);
        assert_eq!(run.machine.stack(), &[Value::Integer(expected)]);
    }

    #[test_case(1, 2, "<", true; "less")]
    #[test_case(2, 1, "<", false; "not less")]
    #[test_case(2, 1, ">", true; "greater")]
    #[test_case(2, 2, "==", true; "equal")]
    #[test_case(2, 3, "=", false; "not equal")]
    fn test_comparison(a: i64, b: i64, op: &str, expected: bool) {
        let run = execute(vec![a.into(), b.into(), op.into()]);
        assert_eq!(run.machine.stack(), &[Value::Boolean(expected)]);
    }

    #[test]
    fn test_division_by_zero() {
        for op in ["/", "%"] {
            let run = execute(vec![1.into(), 0.into(), op.into()]);
            assert!(matches!(run.result, Err(RuntimeError::DivisionByZero)));
            assert_eq!(run.machine.stack(), &[Value::Integer(1), Value::Integer(0)]);
        }
    }

    #[test]
    fn test_overflow() {
        let run = execute(vec![i64::MAX.into(), 1.into(), "+".into()]);
        assert!(matches!(
            run.result,
            Err(RuntimeError::IntegerOverflow(OpCode::Add))
        ));
    }

    #[test]
    fn test_string_concatenation_and_mismatch() {
        let run = execute(vec!["\"ab\"".into(), "\"cd\"".into(), "+".into()]);
        assert_eq!(run.machine.stack(), &[Value::from("abcd")]);

        let run = execute(vec!["\"ab\"".into(), 1.into(), "+".into()]);
        assert!(matches!(
            run.result,
            Err(RuntimeError::TypeMismatch { op: OpCode::Add, .. })
        ));
        assert_eq!(run.machine.stack().len(), 2);
    }

    #[test]
    fn test_dup_drop_drop_restores_stack() {
        let run = execute(vec![1.into(), 2.into(), "dup".into(), "drop".into(), "drop".into()]);
        assert_eq!(run.machine.stack(), &[Value::Integer(1)]);
    }

    #[test]
    fn test_swap_is_its_own_inverse() {
        let run = execute(vec![1.into(), 2.into(), "swap".into()]);
        assert_eq!(run.machine.stack(), &[Value::Integer(2), Value::Integer(1)]);
        let run = execute(vec![1.into(), 2.into(), "swap".into(), "swap".into()]);
        assert_eq!(run.machine.stack(), &[Value::Integer(1), Value::Integer(2)]);
    }

    #[test]
    fn test_over() {
        let run = execute(vec![1.into(), 2.into(), "over".into()]);
        let expected = [Value::Integer(1), Value::Integer(2), Value::Integer(1)];
        assert_eq!(run.machine.stack(), &expected);
    }

    #[test]
    fn test_underflow_leaves_stack_intact() {
        let run = execute(vec!["+".into()]);
        assert!(matches!(
            run.result,
            Err(RuntimeError::StackUnderflow(StackKind::Data))
        ));

        let run = execute(vec![1.into(), "+".into()]);
        assert!(matches!(
            run.result,
            Err(RuntimeError::StackUnderflow(StackKind::Data))
        ));
        assert_eq!(run.machine.stack(), &[Value::Integer(1)]);

        let run = execute(vec![1.into(), 2.into(), "if".into()]);
        assert!(run.result.is_err());
        assert_eq!(run.machine.stack().len(), 2);
    }

    #[test]
    fn test_jump_out_of_range() {
        let run = execute(vec![1000.into(), "jmp".into(), "exit".into()]);
        assert!(matches!(
            run.result,
            Err(RuntimeError::InvalidJumpTarget { len: 3, .. })
        ));
        assert_eq!(run.machine.stack(), &[Value::Integer(1000)]);

        let run = execute(vec!["\"0\"".into(), "jmp".into()]);
        assert!(matches!(run.result, Err(RuntimeError::InvalidJumpTarget { .. })));
    }

    #[test]
    fn test_jmp_skips_instructions() {
        let run = execute(vec![3.into(), "jmp".into(), 99.into(), 1.into()]);
        assert_eq!(run.machine.stack(), &[Value::Integer(1)]);
    }

    #[test]
    fn test_call_and_return() {
        let run = execute(vec![
            Instruction::Push(Value::Address(4)),
            "call".into(),
            "exit".into(),
            99.into(),
            42.into(),
            "return".into(),
        ]);
        assert_eq!(run.result.unwrap(), Halt::Exit);
        assert_eq!(run.machine.stack(), &[Value::Integer(42)]);
        assert!(run.machine.return_stack().is_empty());
    }

    #[test]
    fn test_return_underflow() {
        let run = execute(vec!["return".into()]);
        assert!(matches!(
            run.result,
            Err(RuntimeError::StackUnderflow(StackKind::Return))
        ));
    }

    #[test]
    fn test_at_records_its_own_address() {
        let run = execute(vec![1.into(), "@".into(), "exit".into()]);
        assert_eq!(run.machine.return_stack(), &[1]);
    }

    #[test]
    fn test_exit_stops_before_remaining_code() {
        let run = execute(vec!["exit".into(), 1.into()]);
        assert_eq!(run.result.unwrap(), Halt::Exit);
        assert!(run.machine.stack().is_empty());
    }

    #[test_case(Value::Integer(0), "no"; "zero")]
    #[test_case(Value::from(""), "no"; "empty string")]
    #[test_case(Value::Boolean(false), "no"; "false")]
    #[test_case(Value::Integer(1), "yes"; "one")]
    #[test_case(Value::from("x"), "yes"; "non empty string")]
    #[test_case(Value::Boolean(true), "yes"; "true")]
    #[test_case(Value::Integer(-1), "yes"; "negative one")]
    fn test_if_selects_value(test: Value, expected: &str) {
        let run = execute(vec![
            Instruction::Push(test),
            "\"yes\"".into(),
            "\"no\"".into(),
            "if".into(),
        ]);
        assert_eq!(run.machine.stack(), &[Value::from(expected)]);
    }

    #[test]
    fn test_write_and_dot() {
        let run = execute(vec![
            "\"a\"".into(),
            "write".into(),
            1.into(),
            "write".into(),
            "true".into(),
            ".".into(),
            2.into(),
            "dot".into(),
        ]);
        assert_eq!(run.output, "a1true\n2\n");
    }

    #[test]
    fn test_read_pushes_line_and_halts_at_end_of_input() {
        let run = execute_with_input(
            vec!["read".into(), "read".into(), "read".into(), 1.into()],
            "first\r\nsecond\n",
        );
        assert_eq!(run.result.unwrap(), Halt::EndOfInput);
        assert_eq!(run.machine.stack(), &[Value::from("first"), Value::from("second")]);
    }

    #[test]
    fn test_stack_dump() {
        let run = execute(vec![
            1.into(),
            "\"two\"".into(),
            Instruction::Push(Value::Address(6)),
            "call".into(),
            "exit".into(),
            "exit".into(),
            "stack".into(),
        ]);
        let expected = "Data stack:\n - type string, value 'two'\n - type integer, value '1'\n\
                        Return stack:\n - address 4\n";
        assert_eq!(run.output, expected);
        assert_eq!(run.machine.stack().len(), 2);
    }

    #[test]
    fn test_casts() {
        let run = execute(vec!["\" 12 \"".into(), "cast_int".into(), 3.into(), "cast_str".into()]);
        assert_eq!(run.machine.stack(), &[Value::Integer(12), Value::from("3")]);

        let run = execute(vec!["true".into(), "cast_int".into()]);
        assert_eq!(run.machine.stack(), &[Value::Integer(1)]);

        let run = execute(vec!["\"twelve\"".into(), "cast_int".into()]);
        assert!(matches!(run.result, Err(RuntimeError::InvalidCast(_))));
        assert_eq!(run.machine.stack(), &[Value::from("twelve")]);
    }

    #[test]
    fn test_unknown_opcode() {
        let run = execute(vec![1.into(), "frobnicate".into(), 2.into()]);
        match run.result {
            Err(RuntimeError::UnknownOpcode(word)) => assert_eq!(word, "frobnicate"),
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(run.machine.stack(), &[Value::Integer(1)]);
    }

    #[test]
    fn test_default_machines_share_stdin() {
        let mut first = Machine::new(Program::new(vec![1.into()]));
        let mut second = Machine::new(Program::new(vec![2.into()]));
        assert!(first.input.is_none() && second.input.is_none());
        assert_eq!(second.run().unwrap(), Halt::EndOfProgram);
        assert_eq!(first.run().unwrap(), Halt::EndOfProgram);
        assert_eq!(first.stack(), &[Value::Integer(1)]);
        assert_eq!(second.stack(), &[Value::Integer(2)]);
    }

    #[test]
    fn test_machine_does_not_resume() {
        let mut run = execute(vec![1.into()]);
        assert!(matches!(run.machine.run(), Err(RuntimeError::Halted)));
    }
}
