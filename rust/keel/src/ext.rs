//! Gap-filling accessors for [`Option`] and [`Result`].
//!
//! The crate treats the standard sum types as its error/optional vocabulary
//! and `?` as its propagation operator. These traits only add the accessors
//! stable Rust is missing; everything else (`is_some`, `unwrap_or_else`,
//! `map_or_else`, `and_then`, `filter`, `take`, `replace`, ...) is already
//! covered by std.

/// Additional accessors for [`Option`].
pub trait OptionExt<T> {
    /// Returns `true` if the option holds a value equal to `x`.
    fn contains<U>(&self, x: &U) -> bool
    where
        U: PartialEq<T>;

    /// Returns `true` if the option holds a value satisfying `predicate`.
    fn exists<P>(&self, predicate: P) -> bool
    where
        P: FnOnce(&T) -> bool;

    /// Panics with `msg` if the option is a `Some`.
    fn expect_none(self, msg: &str);

    /// Panics if the option is a `Some`.
    fn unwrap_none(self);
}

impl<T> OptionExt<T> for Option<T> {
    fn contains<U>(&self, x: &U) -> bool
    where
        U: PartialEq<T>,
    {
        match self {
            Some(value) => x == value,
            None => false,
        }
    }

    fn exists<P>(&self, predicate: P) -> bool
    where
        P: FnOnce(&T) -> bool,
    {
        match self {
            Some(value) => predicate(value),
            None => false,
        }
    }

    fn expect_none(self, msg: &str) {
        if self.is_some() {
            panic!("{}", msg);
        }
    }

    fn unwrap_none(self) {
        if self.is_some() {
            panic!("called `unwrap_none` on a `Some` value");
        }
    }
}

/// Additional accessors for [`Result`].
pub trait ResultExt<T, E> {
    /// Returns `true` if the result is an `Ok` holding a value equal to `x`.
    fn contains<U>(&self, x: &U) -> bool
    where
        U: PartialEq<T>;

    /// Returns `true` if the result is an `Err` holding an error equal to `e`.
    fn contains_err<F>(&self, e: &F) -> bool
    where
        F: PartialEq<E>;

    /// Returns `true` if the result is an `Ok` holding a value satisfying
    /// `predicate`.
    fn exists<P>(&self, predicate: P) -> bool
    where
        P: FnOnce(&T) -> bool;
}

impl<T, E> ResultExt<T, E> for Result<T, E> {
    fn contains<U>(&self, x: &U) -> bool
    where
        U: PartialEq<T>,
    {
        match self {
            Ok(value) => x == value,
            Err(_) => false,
        }
    }

    fn contains_err<F>(&self, e: &F) -> bool
    where
        F: PartialEq<E>,
    {
        match self {
            Ok(_) => false,
            Err(error) => e == error,
        }
    }

    fn exists<P>(&self, predicate: P) -> bool
    where
        P: FnOnce(&T) -> bool,
    {
        match self {
            Ok(value) => predicate(value),
            Err(_) => false,
        }
    }
}
