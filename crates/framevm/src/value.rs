//! Runtime values.
//!
//! Immutable data is held inline or behind `Rc`; mutable state that can be
//! aliased lives behind [`Shared`] so it can be serialized without losing
//! identity.

use std::{fmt, rc::Rc, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoEnumIterator, IntoStaticStr};

use crate::{
    bytecode::Code,
    exception::{ExcType, ExceptionValue},
    frame::Unroller,
    generator::GeneratorRef,
    shared::Shared,
};

/// A runtime value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    Tuple(Rc<[Value]>),
    /// An exception class, as bound in builtins and matched by handlers.
    ExcType(ExcType),
    /// An exception instance.
    Exception(Box<ExceptionValue>),
    Function(Rc<Function>),
    Builtin(Builtin),
    Generator(GeneratorRef),
    Iterator(IterRef),
    Cell(Cell),
    Code(Arc<Code>),
    /// Suspended unwind pushed for `finally` and `except` handlers, consumed by `EndFinally`.
    Unroller(Box<Unroller>),
}

impl Value {
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Tuple(_) => "tuple",
            Self::ExcType(_) => "type",
            Self::Exception(exc) => exc.exc_type().into(),
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::Generator(_) => "generator",
            Self::Iterator(_) => "iterator",
            Self::Cell(_) => "cell",
            Self::Code(_) => "code",
            Self::Unroller(_) => "unroller",
        }
    }

    /// Identity comparison, as used by `is`.
    #[must_use]
    pub fn is(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => Rc::ptr_eq(a, b),
            (Self::Tuple(a), Self::Tuple(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => Rc::ptr_eq(a, b),
            (Self::Generator(a), Self::Generator(b)) => a.ptr_eq(b),
            (Self::Iterator(a), Self::Iterator(b)) => a.0.ptr_eq(&b.0),
            (Self::Cell(a), Self::Cell(b)) => a.0.ptr_eq(&b.0),
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b),
            (Self::Int(a), Self::Int(b)) => a == b,
            _ => false,
        }
    }
}

/// Structural equality for data, identity for functions, generators, iterators and cells.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Int(a), Self::Float(b)) | (Self::Float(b), Self::Int(a)) => (*a as f64) == *b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Tuple(a), Self::Tuple(b)) => a == b,
            (Self::ExcType(a), Self::ExcType(b)) => a == b,
            (Self::Exception(a), Self::Exception(b)) => a == b,
            (Self::Builtin(a), Self::Builtin(b)) => a == b,
            (Self::Code(a), Self::Code(b)) => Arc::ptr_eq(a, b) || a == b,
            (Self::Unroller(a), Self::Unroller(b)) => a == b,
            _ => self.is(other),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.into())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Tuple(items.into())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) if v.fract() == 0.0 && v.is_finite() => write!(f, "{v:.1}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::ExcType(t) => write!(f, "<class '{t}'>"),
            Self::Exception(exc) => match exc.message() {
                Some(msg) => write!(f, "{}('{msg}')", exc.exc_type()),
                None => write!(f, "{}()", exc.exc_type()),
            },
            Self::Function(func) => write!(f, "<function {}>", func.name()),
            Self::Builtin(b) => write!(f, "<built-in function {b}>"),
            Self::Generator(g) => write!(f, "<generator object {}>", g.name()),
            Self::Iterator(_) => f.write_str("<iterator>"),
            Self::Cell(_) => f.write_str("<cell>"),
            Self::Code(code) => write!(f, "<code object {}>", code.name()),
            Self::Unroller(u) => write!(f, "<unroller {}>", u.kind_name()),
        }
    }
}

/// A user function: code plus the environment it was created in.
#[derive(Debug, Serialize, Deserialize)]
pub struct Function {
    code: Arc<Code>,
    globals: Namespace,
    defaults: Vec<Value>,
    closure: Vec<Cell>,
}

impl Function {
    #[must_use]
    pub fn new(code: Arc<Code>, globals: Namespace, defaults: Vec<Value>, closure: Vec<Cell>) -> Self {
        Self {
            code,
            globals,
            defaults,
            closure,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.code.name()
    }

    #[must_use]
    pub fn code(&self) -> &Arc<Code> {
        &self.code
    }

    #[must_use]
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    #[must_use]
    pub fn defaults(&self) -> &[Value] {
        &self.defaults
    }

    #[must_use]
    pub fn closure(&self) -> &[Cell] {
        &self.closure
    }
}

/// Native functions available in the default builtins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, IntoStaticStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
pub enum Builtin {
    Len,
    Range,
}

impl Builtin {
    const ALL: [Self; 2] = [Self::Len, Self::Range];
}

/// A shared, insertion-ordered name to value mapping.
///
/// Used for globals, builtins and dict-backed locals.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(Shared<IndexMap<String, Value>>);

impl Namespace {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh namespace holding every builtin function and exception class.
    #[must_use]
    pub fn with_builtins() -> Self {
        let ns = Self::new();
        for builtin in Builtin::ALL {
            let name: &'static str = builtin.into();
            ns.set(name, Value::Builtin(builtin));
        }
        for exc_type in ExcType::iter() {
            let name: &'static str = exc_type.into();
            ns.set(name, Value::ExcType(exc_type));
        }
        ns
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.borrow().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().insert(name.into(), value);
    }

    /// Removes `name`, returning whether it was bound.
    pub fn remove(&self, name: &str) -> bool {
        self.0.borrow_mut().shift_remove(name).is_some()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.borrow().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.0.borrow().keys().cloned().collect()
    }

    /// Whether both handles refer to the same mapping.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl PartialEq for Namespace {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0.borrow() == *other.0.borrow()
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Namespace").field(&self.keys()).finish()
    }
}

/// A closure cell: a shared, possibly empty variable slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cell(Shared<Option<Value>>);

impl Cell {
    #[must_use]
    pub fn new(value: Option<Value>) -> Self {
        Self(Shared::new(value))
    }

    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.0.borrow().clone()
    }

    pub fn set(&self, value: Option<Value>) {
        *self.0.borrow_mut() = value;
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.get() == other.get()
    }
}

/// State of a built-in iterator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IterState {
    Items { items: Rc<[Value]>, index: usize },
    Chars { text: Rc<str>, index: usize },
    Range { next: i64, stop: i64, step: i64 },
}

impl Default for IterState {
    fn default() -> Self {
        Self::Items {
            items: Rc::from(Vec::new()),
            index: 0,
        }
    }
}

impl IterState {
    fn advance(&mut self) -> Option<Value> {
        match self {
            Self::Items { items, index } => {
                let item = items.get(*index)?.clone();
                *index += 1;
                Some(item)
            }
            Self::Chars { text, index } => {
                let ch = text[*index..].chars().next()?;
                *index += ch.len_utf8();
                Some(Value::Str(ch.to_string().into()))
            }
            Self::Range { next, stop, step } => {
                let done = if *step > 0 { *next >= *stop } else { *next <= *stop };
                if done {
                    return None;
                }
                let item = *next;
                *next = next.saturating_add(*step);
                Some(Value::Int(item))
            }
        }
    }
}

/// A built-in iterator over a tuple, string or range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IterRef(Shared<IterState>);

impl IterRef {
    #[must_use]
    pub fn new(state: IterState) -> Self {
        Self(Shared::new(state))
    }

    /// Returns the next item, or `None` once exhausted.
    #[must_use]
    pub fn next_item(&self) -> Option<Value> {
        self.0.borrow_mut().advance()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_namespaces_and_cells_are_fresh_allocations() {
        let first = Namespace::default();
        let second = Namespace::default();
        first.set("x", Value::Int(1));

        assert!(!first.ptr_eq(&second));
        assert!(second.is_empty());

        let cell = Cell::default();
        assert_eq!(cell.get(), None);
        assert!(!cell.ptr_eq(&Cell::default()));
    }
}
