use std::fmt::Display;

pub struct Stack<T> {
    storage: Vec<T>,
}

impl<T> Stack<T> {
    pub fn new() -> Self {
        Stack {
            storage: Vec::new(),
        }
    }

    pub fn push(&mut self, value: T) {
        self.storage.push(value);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.storage.pop()
    }

    /// Element `distance` places below the top.
    pub fn peek(&self, distance: usize) -> Option<&T> {
        let index = self.storage.len().checked_sub(distance + 1)?;
        self.storage.get(index)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.storage
    }
}

impl<T: Display> Display for Stack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for value in self.storage.iter() {
            write!(f, "[ {} ]", value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_and_pop() {
        let mut stack = Stack::new();
        stack.push(1);
        stack.push(2);
        assert_eq!(stack.peek(0), Some(&2));
        assert_eq!(stack.peek(1), Some(&1));
        assert_eq!(stack.peek(2), None);
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.len(), 0);
    }
}
