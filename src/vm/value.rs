use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Boolean(bool),
    String(String),
    /// Instruction index produced by linking a word reference.
    Address(usize),
}

impl Value {
    /// `false`, `""` and `0` are false; everything else is true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Boolean(b) => *b,
            Value::String(s) => !s.is_empty(),
            Value::Integer(n) => *n != 0,
            Value::Address(_) => true,
        }
    }

    /// Integer view used by arithmetic; addresses count as integers.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            Value::Address(a) => i64::try_from(*a).ok(),
            _ => None,
        }
    }

    /// Address view used by `jmp` and `call`, checked against `len`.
    pub fn as_address(&self, len: usize) -> Option<usize> {
        let address = match self {
            Value::Address(a) => *a,
            Value::Integer(n) => usize::try_from(*n).ok()?,
            _ => return None,
        };
        (address < len).then_some(address)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Boolean(_) => "boolean",
            Value::String(_) => "string",
            Value::Address(_) => "address",
        }
    }

    /// Equality as seen by `==`: integers and addresses compare by number,
    /// other values only equal values of the same type.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self.as_integer(), other.as_integer()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::String(s) => write!(f, "{}", s),
            Value::Address(a) => write!(f, "{}", a),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}
