//! Operations of the built-in object space.
//!
//! Every function here either produces a value or an application error; none
//! of them touch frames.

use std::{cmp::Ordering, rc::Rc};

use crate::{
    bytecode::Comparison,
    exception::{ExcType, ExceptionValue, OperationError},
    value::{Builtin, IterRef, IterState, Value},
};

type OpResult<T> = Result<T, OperationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Mod,
    FloorDiv,
}

impl BinaryOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Mod => "%",
            Self::FloorDiv => "//",
        }
    }
}

pub(crate) fn is_true(value: &Value) -> bool {
    match value {
        Value::None => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::Str(s) => !s.is_empty(),
        Value::Tuple(items) => !items.is_empty(),
        _ => true,
    }
}

fn as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Float(f) => Some(*f),
        other => as_int(other).map(|i| i as f64),
    }
}

fn overflow() -> OperationError {
    OperationError::new(ExcType::OverflowError, "integer overflow")
}

pub(crate) fn unary_positive(value: &Value) -> OpResult<Value> {
    match value {
        Value::Float(f) => Ok(Value::Float(*f)),
        other => as_int(other)
            .map(Value::Int)
            .ok_or_else(|| OperationError::type_error(format!("bad operand type for unary +: '{}'", other.type_name()))),
    }
}

pub(crate) fn unary_negative(value: &Value) -> OpResult<Value> {
    match value {
        Value::Float(f) => Ok(Value::Float(-*f)),
        other => match as_int(other) {
            Some(i) => i.checked_neg().map(Value::Int).ok_or_else(overflow),
            None => Err(OperationError::type_error(format!(
                "bad operand type for unary -: '{}'",
                other.type_name()
            ))),
        },
    }
}

pub(crate) fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> OpResult<Value> {
    if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
        return int_binary(op, a, b);
    }
    let has_float = matches!(lhs, Value::Float(_)) || matches!(rhs, Value::Float(_));
    if has_float && let (Some(a), Some(b)) = (as_float(lhs), as_float(rhs))
    {
        return float_binary(op, a, b);
    }
    match (op, lhs, rhs) {
        (BinaryOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(format!("{a}{b}").into())),
        (BinaryOp::Add, Value::Tuple(a), Value::Tuple(b)) => Ok(Value::Tuple(a.iter().chain(b.iter()).cloned().collect())),
        (BinaryOp::Mul, Value::Str(s), n) | (BinaryOp::Mul, n, Value::Str(s)) if as_int(n).is_some() => {
            let count = repeat_count(s.len(), as_int(n).unwrap_or_default())?;
            Ok(Value::Str(s.repeat(count).into()))
        }
        (BinaryOp::Mul, Value::Tuple(items), n) | (BinaryOp::Mul, n, Value::Tuple(items)) if as_int(n).is_some() => {
            let count = repeat_count(items.len(), as_int(n).unwrap_or_default())?;
            let repeated: Vec<Value> = std::iter::repeat_n(items.iter(), count).flatten().cloned().collect();
            Ok(Value::Tuple(repeated.into()))
        }
        _ => Err(OperationError::type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

/// Longest string (in bytes) or tuple a repetition may produce.
const MAX_REPEAT_LEN: usize = 1 << 28;

/// Repetition count for a sequence of `len` items, zero when nothing would be produced.
fn repeat_count(len: usize, times: i64) -> OpResult<usize> {
    let times = usize::try_from(times).unwrap_or(0);
    match len.checked_mul(times) {
        Some(0) => Ok(0),
        Some(total) if total <= MAX_REPEAT_LEN => Ok(times),
        _ => Err(OperationError::new(ExcType::OverflowError, "repeated sequence is too long")),
    }
}

fn int_binary(op: BinaryOp, a: i64, b: i64) -> OpResult<Value> {
    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Mod | BinaryOp::FloorDiv if b == 0 => {
            return Err(OperationError::new(
                ExcType::ZeroDivisionError,
                "integer division or modulo by zero",
            ));
        }
        BinaryOp::Mod => a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r }),
        BinaryOp::FloorDiv => a.checked_div(b).map(|q| {
            if (a % b != 0) && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }),
    };
    result.map(Value::Int).ok_or_else(overflow)
}

fn float_binary(op: BinaryOp, a: f64, b: f64) -> OpResult<Value> {
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Mod | BinaryOp::FloorDiv if b == 0.0 => {
            let what = if op == BinaryOp::Mod { "float modulo" } else { "float divmod()" };
            return Err(OperationError::new(ExcType::ZeroDivisionError, what));
        }
        BinaryOp::Mod => {
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) { r + b } else { r }
        }
        BinaryOp::FloorDiv => (a / b).floor(),
    };
    Ok(Value::Float(result))
}

pub(crate) fn compare(op: Comparison, lhs: &Value, rhs: &Value) -> OpResult<Value> {
    let result = match op {
        Comparison::Eq => lhs == rhs,
        Comparison::Ne => lhs != rhs,
        Comparison::Is => lhs.is(rhs),
        Comparison::IsNot => !lhs.is(rhs),
        Comparison::In => contains(rhs, lhs)?,
        Comparison::NotIn => !contains(rhs, lhs)?,
        Comparison::ExceptionMatch => exception_match(lhs, rhs)?,
        Comparison::Lt | Comparison::Le | Comparison::Gt | Comparison::Ge => {
            let ordering = order(lhs, rhs).ok_or_else(|| {
                OperationError::type_error(format!(
                    "'{op}' not supported between instances of '{}' and '{}'",
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            match op {
                Comparison::Lt => ordering == Ordering::Less,
                Comparison::Le => ordering != Ordering::Greater,
                Comparison::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }
        }
    };
    Ok(Value::Bool(result))
}

fn order(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_int(lhs), as_int(rhs)) {
        return Some(a.cmp(&b));
    }
    match (lhs, rhs) {
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        (Value::Tuple(a), Value::Tuple(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                if x != y {
                    return order(x, y);
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => as_float(lhs)?.partial_cmp(&as_float(rhs)?),
    }
}

fn contains(container: &Value, item: &Value) -> OpResult<bool> {
    match container {
        Value::Tuple(items) => Ok(items.iter().any(|x| x == item)),
        Value::Str(text) => match item {
            Value::Str(needle) => Ok(text.contains(&**needle)),
            other => Err(OperationError::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        other => Err(OperationError::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// Whether the raised exception (class or instance) `raised` is caught by
/// `handler`, an exception class or a tuple of them.
pub(crate) fn exception_match(raised: &Value, handler: &Value) -> OpResult<bool> {
    let raised = match raised {
        Value::ExcType(t) => *t,
        Value::Exception(exc) => exc.exc_type(),
        _ => return Ok(false),
    };
    match handler {
        Value::ExcType(t) => Ok(raised.is_subclass_of(*t)),
        Value::Tuple(items) => {
            for item in items.iter() {
                if exception_match(&Value::ExcType(raised), item)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        other => Err(OperationError::type_error(format!(
            "catching '{}' is not allowed, only exception classes",
            other.type_name()
        ))),
    }
}

/// Converts a raised value into the error it stands for.
pub(crate) fn make_exception(value: Value, arg: Option<Value>) -> OpResult<OperationError> {
    match (value, arg) {
        (Value::Exception(exc), None) => Ok(OperationError::from_exception(*exc)),
        (Value::ExcType(t), None) => Ok(OperationError::bare(t)),
        (Value::ExcType(t), Some(arg)) => Ok(instantiate(t, &[arg])),
        (other, _) => Err(OperationError::type_error(format!(
            "exceptions must derive from BaseException, not '{}'",
            other.type_name()
        ))),
    }
}

/// Calls an exception class.
pub(crate) fn instantiate(exc_type: ExcType, args: &[Value]) -> OperationError {
    let message = args.first().map(|arg| match arg {
        Value::Str(s) => s.to_string(),
        other => other.to_string(),
    });
    OperationError::from_exception(ExceptionValue::new(exc_type, message))
}

pub(crate) fn get_iter(value: Value) -> OpResult<Value> {
    match value {
        Value::Tuple(items) => Ok(Value::Iterator(IterRef::new(IterState::Items { items, index: 0 }))),
        Value::Str(text) => Ok(Value::Iterator(IterRef::new(IterState::Chars { text, index: 0 }))),
        value @ (Value::Iterator(_) | Value::Generator(_)) => Ok(value),
        other => Err(OperationError::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

pub(crate) fn unpack(value: &Value, count: usize) -> OpResult<Vec<Value>> {
    let items: Vec<Value> = match value {
        Value::Tuple(items) => items.to_vec(),
        Value::Str(text) => text.chars().map(|c| Value::Str(c.to_string().into())).collect(),
        other => {
            return Err(OperationError::type_error(format!(
                "cannot unpack non-iterable {} object",
                other.type_name()
            )));
        }
    };
    match items.len().cmp(&count) {
        Ordering::Equal => Ok(items),
        Ordering::Less => Err(OperationError::new(
            ExcType::ValueError,
            format!("not enough values to unpack (expected {count}, got {})", items.len()),
        )),
        Ordering::Greater => Err(OperationError::new(
            ExcType::ValueError,
            format!("too many values to unpack (expected {count})"),
        )),
    }
}

pub(crate) fn subscript(container: &Value, index: &Value) -> OpResult<Value> {
    let Some(index) = as_int(index) else {
        return Err(OperationError::type_error(format!(
            "indices must be integers, not {}",
            index.type_name()
        )));
    };
    let resolve = |len: usize| {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let i = if index < 0 { index + len } else { index };
        usize::try_from(i).ok().filter(|&i| i64::try_from(i).is_ok_and(|i| i < len))
    };
    match container {
        Value::Tuple(items) => resolve(items.len())
            .map(|i| items[i].clone())
            .ok_or_else(|| OperationError::new(ExcType::IndexError, "tuple index out of range")),
        Value::Str(text) => {
            let chars: Vec<char> = text.chars().collect();
            resolve(chars.len())
                .map(|i| Value::Str(chars[i].to_string().into()))
                .ok_or_else(|| OperationError::new(ExcType::IndexError, "string index out of range"))
        }
        other => Err(OperationError::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn call_builtin(builtin: Builtin, args: &[Value]) -> OpResult<Value> {
    match builtin {
        Builtin::Len => {
            let [arg] = args else {
                return Err(OperationError::type_error(format!(
                    "len() takes exactly one argument ({} given)",
                    args.len()
                )));
            };
            let len = match arg {
                Value::Str(s) => s.chars().count(),
                Value::Tuple(items) => items.len(),
                other => {
                    return Err(OperationError::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    )));
                }
            };
            Ok(Value::Int(i64::try_from(len).map_err(|_| overflow())?))
        }
        Builtin::Range => {
            let ints = args
                .iter()
                .map(|arg| {
                    as_int(arg).ok_or_else(|| {
                        OperationError::type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            arg.type_name()
                        ))
                    })
                })
                .collect::<OpResult<Vec<_>>>()?;
            let (next, stop, step) = match ints[..] {
                [stop] => (0, stop, 1),
                [start, stop] => (start, stop, 1),
                [start, stop, step] => (start, stop, step),
                _ => {
                    return Err(OperationError::type_error(format!(
                        "range expected 1 to 3 arguments, got {}",
                        args.len()
                    )));
                }
            };
            if step == 0 {
                return Err(OperationError::new(ExcType::ValueError, "range() arg 3 must not be zero"));
            }
            Ok(Value::Iterator(IterRef::new(IterState::Range { next, stop, step })))
        }
    }
}

/// Builds a tuple value from `items`.
pub(crate) fn tuple(items: Vec<Value>) -> Value {
    Value::Tuple(Rc::from(items))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn floor_division_and_modulo_round_toward_negative_infinity() {
        assert_eq!(int_binary(BinaryOp::FloorDiv, -7, 2).unwrap(), Value::Int(-4));
        assert_eq!(int_binary(BinaryOp::Mod, -7, 2).unwrap(), Value::Int(1));
        assert_eq!(int_binary(BinaryOp::Mod, 7, -2).unwrap(), Value::Int(-1));
        assert_eq!(int_binary(BinaryOp::FloorDiv, 7, 2).unwrap(), Value::Int(3));
    }

    #[test]
    fn oversized_repetition_is_an_overflow_error() {
        let err = binary(BinaryOp::Mul, &Value::from("ab"), &Value::Int(i64::MAX)).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::OverflowError);
        let tuple = Value::Tuple(vec![Value::None; 3].into());
        let err = binary(BinaryOp::Mul, &Value::Int(1 << 40), &tuple).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::OverflowError);

        let empty = Value::Tuple(Vec::<Value>::new().into());
        assert_eq!(binary(BinaryOp::Mul, &empty, &Value::Int(i64::MAX)).unwrap(), empty);
        assert_eq!(binary(BinaryOp::Mul, &Value::from("ab"), &Value::Int(-2)).unwrap(), Value::from(""));
        assert_eq!(binary(BinaryOp::Mul, &Value::Int(2), &Value::from("ab")).unwrap(), Value::from("abab"));
    }

    #[test]
    fn integer_overflow_is_an_application_error() {
        let err = binary(BinaryOp::Add, &Value::Int(i64::MAX), &Value::Int(1)).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::OverflowError);
        let err = int_binary(BinaryOp::Mod, 1, 0).unwrap_err();
        assert_eq!(err.exc_type(), ExcType::ZeroDivisionError);
    }

    #[test]
    fn mixed_operands() {
        assert_eq!(binary(BinaryOp::Add, &Value::Int(1), &Value::Float(0.5)).unwrap(), Value::Float(1.5));
        assert_eq!(binary(BinaryOp::Add, &"ab".into(), &"cd".into()).unwrap(), Value::from("abcd"));
        let err = binary(BinaryOp::Sub, &"a".into(), &Value::Int(1)).unwrap_err();
        assert_eq!(err.message(), Some("unsupported operand type(s) for -: 'str' and 'int'"));
    }

    #[test]
    fn exception_match_follows_hierarchy() {
        let raised = Value::ExcType(ExcType::ZeroDivisionError);
        assert!(exception_match(&raised, &Value::ExcType(ExcType::ArithmeticError)).unwrap());
        assert!(!exception_match(&raised, &Value::ExcType(ExcType::LookupError)).unwrap());
        let handlers = tuple(vec![Value::ExcType(ExcType::KeyError), Value::ExcType(ExcType::Exception)]);
        assert!(exception_match(&raised, &handlers).unwrap());
    }

    #[test]
    fn tuples_compare_lexicographically() {
        let a = tuple(vec![Value::Int(1), Value::Int(2)]);
        let b = tuple(vec![Value::Int(1), Value::Int(3)]);
        assert_eq!(compare(Comparison::Lt, &a, &b).unwrap(), Value::Bool(true));
        assert_eq!(compare(Comparison::In, &Value::Int(2), &a).unwrap(), Value::Bool(true));
    }

    #[test]
    fn negative_subscripts_count_from_the_end() {
        let t = tuple(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(subscript(&t, &Value::Int(-1)).unwrap(), Value::Int(3));
        assert_eq!(
            subscript(&t, &Value::Int(3)).unwrap_err().exc_type(),
            ExcType::IndexError
        );
    }
}
