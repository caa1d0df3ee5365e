//! Typed deep traversal over unit specifications
//!
//! [`Scan`] visits every string leaf reachable from a value and replaces it
//! with the result of a substitution function. The set of containers is
//! closed: strings, optional values, sequences, string-keyed maps, JSON
//! documents, and records that implement the trait by scanning their fields.
//!
//! Traversal stops at the first error; leaves already visited keep their new
//! value, but callers treat any error as fatal for the whole unit.

use crate::error::Result;
use std::collections::BTreeMap;

/// Substitution function applied to each string leaf
pub type Substitute<'a> = dyn FnMut(&str) -> Result<String> + 'a;

/// A value whose string leaves can be rewritten in place
pub trait Scan {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()>;
}

impl Scan for String {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        let replaced = f(self)?;
        if replaced != *self {
            *self = replaced;
        }
        Ok(())
    }
}

impl<T: Scan> Scan for Option<T> {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        match self {
            Some(inner) => inner.scan(f),
            None => Ok(()),
        }
    }
}

impl<T: Scan> Scan for Vec<T> {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        for item in self.iter_mut() {
            item.scan(f)?;
        }
        Ok(())
    }
}

impl<T: Scan> Scan for BTreeMap<String, T> {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        for value in self.values_mut() {
            value.scan(f)?;
        }
        Ok(())
    }
}

impl Scan for serde_json::Map<String, serde_json::Value> {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        for value in self.values_mut() {
            value.scan(f)?;
        }
        Ok(())
    }
}

impl Scan for serde_json::Value {
    fn scan(&mut self, f: &mut Substitute<'_>) -> Result<()> {
        use serde_json::Value;

        match self {
            Value::String(s) => s.scan(f),
            Value::Array(items) => items.scan(f),
            Value::Object(map) => map.scan(f),
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }
}

/// Scan a value with a closure, without naming the trait object type
pub fn scan_with<T, F>(value: &mut T, mut f: F) -> Result<()>
where
    T: Scan + ?Sized,
    F: FnMut(&str) -> Result<String>,
{
    value.scan(&mut f)
}
