use crate::{exception::FrameError, value::Value};

/// Bounded operand stack of a frame.
///
/// Capacity is fixed at creation from the code object's maximum stack size.
/// Exceeding it, or popping past the bottom, is a contract violation rather than
/// an application error.
#[derive(Debug, Clone)]
pub struct ValueStack {
    slots: Vec<Value>,
    capacity: usize,
}

impl ValueStack {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
        }
    }

    #[inline]
    #[must_use]
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Live slots, bottom first.
    #[must_use]
    pub fn as_slice(&self) -> &[Value] {
        &self.slots
    }

    #[inline]
    pub fn push(&mut self, value: Value) -> Result<(), FrameError> {
        if self.slots.len() >= self.capacity {
            return Err(FrameError::StackOverflow {
                capacity: self.capacity,
            });
        }
        self.slots.push(value);
        Ok(())
    }

    #[inline]
    pub fn pop(&mut self) -> Result<Value, FrameError> {
        self.slots.pop().ok_or(FrameError::StackUnderflow)
    }

    /// The value `n` slots below the top; `peek(0)` is the top.
    pub fn peek(&self, n: usize) -> Result<&Value, FrameError> {
        let index = self.index_from_top(n)?;
        Ok(&self.slots[index])
    }

    /// Overwrites the value `n` slots below the top.
    pub fn set_top(&mut self, n: usize, value: Value) -> Result<(), FrameError> {
        let index = self.index_from_top(n)?;
        self.slots[index] = value;
        Ok(())
    }

    /// Pops `n` values, returned in stack order (bottom first).
    pub fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, FrameError> {
        let start = self.slots.len().checked_sub(n).ok_or(FrameError::StackUnderflow)?;
        Ok(self.slots.split_off(start))
    }

    /// The top `n` values in stack order, without popping.
    pub fn peek_n(&self, n: usize) -> Result<&[Value], FrameError> {
        let start = self.slots.len().checked_sub(n).ok_or(FrameError::StackUnderflow)?;
        Ok(&self.slots[start..])
    }

    /// Discards the top `n` values.
    pub fn drop_n(&mut self, n: usize) -> Result<(), FrameError> {
        let start = self.slots.len().checked_sub(n).ok_or(FrameError::StackUnderflow)?;
        self.slots.truncate(start);
        Ok(())
    }

    /// Duplicates the top `n` values, preserving their order.
    pub fn dup_n(&mut self, n: usize) -> Result<(), FrameError> {
        let copies = self.peek_n(n)?.to_vec();
        for value in copies {
            self.push(value)?;
        }
        Ok(())
    }

    /// Pushes `values` so that the first element ends up on top.
    pub fn push_rev(&mut self, values: Vec<Value>) -> Result<(), FrameError> {
        for value in values.into_iter().rev() {
            self.push(value)?;
        }
        Ok(())
    }

    /// Drops values until the stack is no deeper than `depth`.
    pub fn truncate_to(&mut self, depth: usize) {
        self.slots.truncate(depth);
    }

    /// Copy of the live slots, bottom first.
    #[must_use]
    pub fn save(&self) -> Vec<Value> {
        self.slots.clone()
    }

    /// Replaces the whole stack with `slots`.
    ///
    /// Every slot must be present and the result must fit the capacity.
    pub fn restore(&mut self, slots: Vec<Option<Value>>) -> Result<(), FrameError> {
        if slots.len() > self.capacity {
            return Err(FrameError::StackOverflow {
                capacity: self.capacity,
            });
        }
        let restored = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| slot.ok_or(FrameError::MissingStackSlot { index }))
            .collect::<Result<Vec<_>, _>>()?;
        self.slots = restored;
        Ok(())
    }

    fn index_from_top(&self, n: usize) -> Result<usize, FrameError> {
        self.slots
            .len()
            .checked_sub(n + 1)
            .ok_or(FrameError::StackUnderflow)
    }
}
