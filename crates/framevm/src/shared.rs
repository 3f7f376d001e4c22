//! Shared mutable values and their serialization.
//!
//! Namespaces, cells, iterators and generators are reference counted and may
//! alias each other or form cycles (a function stored in the globals it closes
//! over, a generator held by one of its own locals). They serialize as
//! `(id, Option<contents>)`: the first occurrence of a value within a session
//! carries its contents, every later occurrence only its id. Deserialization
//! registers a placeholder before reading the contents, so back references
//! resolve to the same allocation.

use std::{
    any::Any,
    cell::{Ref, RefCell, RefMut},
    collections::hash_map::Entry,
    fmt,
    marker::PhantomData,
    rc::Rc,
};

use ahash::AHashMap;
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{self, IgnoredAny, SeqAccess, Visitor},
    ser::{self, SerializeTuple},
};

/// A reference-counted, interior-mutable value.
pub struct Shared<T>(Rc<RefCell<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Self(Rc::new(RefCell::new(value)))
    }

    /// # Panics
    ///
    /// Panics if the value is currently mutably borrowed.
    pub fn borrow(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    /// # Panics
    ///
    /// Panics if the value is currently borrowed.
    pub fn borrow_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn addr(&self) -> usize {
        Rc::as_ptr(&self.0).cast::<()>() as usize
    }
}

impl<T: Default> Default for Shared<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> Clone for Shared<T> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<T> fmt::Debug for Shared<T> {
    // contents may refer back to this value, so only the identity is printed
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shared({:#x})", self.addr())
    }
}

#[derive(Default)]
struct Session {
    /// Serialization: allocation address to id.
    ids: AHashMap<usize, u32>,
    /// Deserialization: id to allocation.
    items: AHashMap<u32, Rc<dyn Any>>,
}

thread_local! {
    static SESSION: RefCell<Option<Session>> = const { RefCell::new(None) };
}

struct SessionGuard {
    owner: bool,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.owner {
            SESSION.with(|session| session.borrow_mut().take());
        }
    }
}

/// Runs `f` inside a shared value session, opening one if none is active.
///
/// Everything serialized (or deserialized) inside one session shares a single
/// identity table, so aliasing between sibling values survives a round trip.
/// Wrap calls into other serde formats with it when encoding several values
/// that may alias.
pub fn with_session<R>(f: impl FnOnce() -> R) -> R {
    let owner = SESSION.with(|session| {
        let mut session = session.borrow_mut();
        if session.is_none() {
            *session = Some(Session::default());
            true
        } else {
            false
        }
    });
    let _guard = SessionGuard { owner };
    f()
}

impl<T: Serialize> Serialize for Shared<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        with_session(|| {
            let addr = self.addr();
            let (id, first) = SESSION.with(|session| {
                let mut session = session.borrow_mut();
                let session = session.get_or_insert_with(Session::default);
                let next = u32::try_from(session.ids.len()).unwrap_or(u32::MAX);
                match session.ids.entry(addr) {
                    Entry::Occupied(entry) => (*entry.get(), false),
                    Entry::Vacant(entry) => {
                        entry.insert(next);
                        (next, true)
                    }
                }
            });

            let mut tuple = serializer.serialize_tuple(2)?;
            tuple.serialize_element(&id)?;
            if first {
                let contents = self
                    .0
                    .try_borrow()
                    .map_err(|_| ser::Error::custom("shared value is mutably borrowed"))?;
                tuple.serialize_element(&Some(&*contents))?;
            } else {
                tuple.serialize_element(&None::<&T>)?;
            }
            tuple.end()
        })
    }
}

impl<'de, T> Deserialize<'de> for Shared<T>
where
    T: Deserialize<'de> + Default + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        with_session(|| deserializer.deserialize_tuple(2, SharedVisitor(PhantomData)))
    }
}

struct SharedVisitor<T>(PhantomData<T>);

impl<'de, T> Visitor<'de> for SharedVisitor<T>
where
    T: Deserialize<'de> + Default + 'static,
{
    type Value = Shared<T>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a shared value as (id, contents)")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let id: u32 = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(0, &self))?;
        let known = SESSION.with(|session| {
            session
                .borrow()
                .as_ref()
                .and_then(|session| session.items.get(&id).cloned())
        });

        if let Some(item) = known {
            let _: Option<Option<IgnoredAny>> = seq.next_element()?;
            let cell = item
                .downcast::<RefCell<T>>()
                .map_err(|_| de::Error::custom(format!("shared value {id} has a different type")))?;
            return Ok(Shared(cell));
        }

        let shared = Shared::new(T::default());
        let item: Rc<dyn Any> = Rc::clone(&shared.0) as Rc<dyn Any>;
        SESSION.with(|session| {
            if let Some(session) = session.borrow_mut().as_mut() {
                session.items.insert(id, item);
            }
        });
        let contents: Option<T> = seq.next_element()?.ok_or_else(|| de::Error::invalid_length(1, &self))?;
        match contents {
            Some(contents) => {
                *shared.0.borrow_mut() = contents;
                Ok(shared)
            }
            None => Err(de::Error::custom(format!("reference to unknown shared value {id}"))),
        }
    }
}
