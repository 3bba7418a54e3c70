use std::io::Write;

use rustc_hash::FxHashMap;

use crate::{tokenizer::Token, vm::Value};

/// Every operation the machine dispatches. Aliases share a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Less,
    Equal,
    Greater,
    Dup,
    Drop,
    Swap,
    Over,
    True,
    False,
    Write,
    Dot,
    Read,
    Jmp,
    Call,
    Return,
    At,
    Exit,
    If,
    Stack,
    CastInt,
    CastStr,
}

impl OpCode {
    /// Every spelling the dispatcher accepts, aliases included.
    pub const NAMES: &'static [(&'static str, OpCode)] = &[
        ("%", OpCode::Mod),
        ("*", OpCode::Mul),
        ("+", OpCode::Add),
        ("-", OpCode::Sub),
        (".", OpCode::Dot),
        ("/", OpCode::Div),
        ("<", OpCode::Less),
        ("==", OpCode::Equal),
        ("=", OpCode::Equal),
        (">", OpCode::Greater),
        ("@", OpCode::At),
        ("add", OpCode::Add),
        ("at", OpCode::At),
        ("call", OpCode::Call),
        ("cast_int", OpCode::CastInt),
        ("cast_str", OpCode::CastStr),
        ("div", OpCode::Div),
        ("dot", OpCode::Dot),
        ("drop", OpCode::Drop),
        ("dup", OpCode::Dup),
        ("exit", OpCode::Exit),
        ("false", OpCode::False),
        ("if", OpCode::If),
        ("jmp", OpCode::Jmp),
        ("mod", OpCode::Mod),
        ("mul", OpCode::Mul),
        ("over", OpCode::Over),
        ("read", OpCode::Read),
        ("return", OpCode::Return),
        ("stack", OpCode::Stack),
        ("sub", OpCode::Sub),
        ("swap", OpCode::Swap),
        ("true", OpCode::True),
        ("write", OpCode::Write),
    ];

    pub fn from_name(name: &str) -> Option<OpCode> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, op)| *op)
    }

    pub fn is_builtin(name: &str) -> bool {
        Self::from_name(name).is_some()
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod
        )
    }

    /// Canonical spelling used in listings and error messages.
    pub fn name(self) -> &'static str {
        match self {
            OpCode::Add => "+",
            OpCode::Sub => "-",
            OpCode::Mul => "*",
            OpCode::Div => "/",
            OpCode::Mod => "%",
            OpCode::Less => "<",
            OpCode::Equal => "==",
            OpCode::Greater => ">",
            OpCode::Dup => "dup",
            OpCode::Drop => "drop",
            OpCode::Swap => "swap",
            OpCode::Over => "over",
            OpCode::True => "true",
            OpCode::False => "false",
            OpCode::Write => "write",
            OpCode::Dot => ".",
            OpCode::Read => "read",
            OpCode::Jmp => "jmp",
            OpCode::Call => "call",
            OpCode::Return => "return",
            OpCode::At => "@",
            OpCode::Exit => "exit",
            OpCode::If => "if",
            OpCode::Stack => "stack",
            OpCode::CastInt => "cast_int",
            OpCode::CastStr => "cast_str",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Push(Value),
    Op(OpCode),
    /// A word that is neither built-in nor defined. Faults when dispatched.
    Unknown(String),
}

impl Instruction {
    pub fn from_token(token: Token) -> Instruction {
        match token {
            Token::Integer(n) => Instruction::Push(Value::Integer(n)),
            Token::String(raw) => Instruction::Push(Value::String(unquote(&raw).to_string())),
            Token::Word(word) => match OpCode::from_name(&word) {
                Some(op) => Instruction::Op(op),
                None => Instruction::Unknown(word),
            },
        }
    }
}

fn unquote(raw: &str) -> &str {
    raw.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(raw)
}

impl From<i64> for Instruction {
    fn from(value: i64) -> Self {
        Instruction::Push(Value::Integer(value))
    }
}

impl From<OpCode> for Instruction {
    fn from(value: OpCode) -> Self {
        Instruction::Op(value)
    }
}

/// Reads an entry in source form: a double-quoted string or a bare word.
impl From<&str> for Instruction {
    fn from(value: &str) -> Self {
        if value.len() >= 2 && value.starts_with('"') && value.ends_with('"') {
            Instruction::from_token(Token::String(value.to_string()))
        } else {
            Instruction::from_token(Token::Word(value.to_string()))
        }
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::Push(Value::String(s)) => write!(f, "\"{}\"", s),
            Instruction::Push(value) => write!(f, "{}", value),
            Instruction::Op(op) => write!(f, "{}", op),
            Instruction::Unknown(word) => write!(f, "{}", word),
        }
    }
}

/// Start address of a linked word, kept for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub address: usize,
}

/// A fully resolved, flat instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    code: Vec<Instruction>,
    labels: Vec<Label>,
}

impl Program {
    pub fn new(code: Vec<Instruction>) -> Self {
        Self {
            code,
            labels: Vec::new(),
        }
    }

    pub(crate) fn with_labels(code: Vec<Instruction>, labels: Vec<Label>) -> Self {
        Self { code, labels }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn get(&self, address: usize) -> Option<&Instruction> {
        self.code.get(address)
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.code
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Whether some address literal or label points at `address`.
    pub fn is_jump_target(&self, address: usize) -> bool {
        self.labels.iter().any(|l| l.address == address)
            || self
                .code
                .iter()
                .any(|i| matches!(i, Instruction::Push(Value::Address(a)) if *a == address))
    }

    /// Whether the value at `index` is consumed as an address: it is popped
    /// directly by `jmp`/`call`, or is one of the two clauses of an `if`.
    pub fn feeds_address(&self, index: usize) -> bool {
        matches!(
            self.code.get(index + 1),
            Some(Instruction::Op(OpCode::Jmp | OpCode::Call | OpCode::If))
        ) || matches!(self.code.get(index + 2), Some(Instruction::Op(OpCode::If)))
    }

    /// Highest integer literal used as an address. These are written by hand
    /// against the unfolded layout, so nothing below them may move.
    pub fn highest_literal_target(&self) -> Option<usize> {
        self.code
            .iter()
            .enumerate()
            .filter(|(index, _)| self.feeds_address(*index))
            .filter_map(|(_, instruction)| match instruction {
                Instruction::Push(Value::Integer(n)) => usize::try_from(*n).ok(),
                _ => None,
            })
            .max()
    }

    /// Replaces `len` instructions starting at `start` with `replacement`,
    /// shifting every address that pointed past the window.
    pub(crate) fn collapse(&self, start: usize, len: usize, replacement: Instruction) -> Program {
        let end = start + len;
        let shift = len - 1;
        let relocate = |address: usize| if address >= end { address - shift } else { address };

        let code = self.code[..start]
            .iter()
            .cloned()
            .chain(std::iter::once(replacement))
            .chain(self.code[end..].iter().cloned())
            .map(|instruction| match instruction {
                Instruction::Push(Value::Address(a)) => Instruction::Push(Value::Address(relocate(a))),
                other => other,
            })
            .collect();
        let labels = self
            .labels
            .iter()
            .map(|l| Label {
                name: l.name.clone(),
                address: relocate(l.address),
            })
            .collect();

        Program { code, labels }
    }

    pub fn disassemble(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let names: FxHashMap<usize, &str> = self
            .labels
            .iter()
            .map(|l| (l.address, l.name.as_str()))
            .collect();
        let width = self.code.len().to_string().len();

        let mut previous: Option<&Instruction> = None;
        for (offset, instruction) in self.code.iter().enumerate() {
            if let Some(name) = names.get(&offset) {
                writeln!(out, "\n{}:", name)?;
            }

            let target = match (instruction, previous) {
                (Instruction::Op(OpCode::Call), Some(Instruction::Push(Value::Address(a)))) => {
                    names.get(a)
                }
                _ => None,
            };
            match target {
                Some(name) => writeln!(out, "  {:0width$} {} ({})", offset, instruction, name)?,
                None => writeln!(out, "  {:0width$} {}", offset, instruction)?,
            }
            previous = Some(instruction);
        }
        out.flush()
    }
}

impl std::ops::Index<usize> for Program {
    type Output = Instruction;

    fn index(&self, index: usize) -> &Self::Output {
        &self.code[index]
    }
}
