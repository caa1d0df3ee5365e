//! Deferred cross-unit references
//!
//! A unit refers to another unit's output with `${output:<stack>.<unit>.<output>}`.
//! During prepare the [`inject`] pass swaps each reference for a marker,
//! `<hash>.<stack.unit.output>.<hash>`, and registers it in the project's
//! [`MarkerTable`]. The hash is derived from the logical reference only, so
//! the same reference always produces the same marker.
//!
//! During build a [`Resolver`] swaps markers for either the literal output
//! value (target already applied in this run) or the target backend's
//! remote-state expression. [`humanize`] turns markers back into the
//! reference syntax for change detection.

use crate::backend::BackendRegistry;
use crate::error::{Error, Result};
use crate::unit::UnitKey;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

/// Stack alias meaning "the stack of the referencing unit"
pub const THIS_STACK: &str = "this";

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{output:([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\}")
        .unwrap_or_else(|e| unreachable!("reference pattern: {e}"))
});

static MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([0-9a-f]{32})\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\.([A-Za-z0-9_-]+)\.([0-9a-f]{32})")
        .unwrap_or_else(|e| unreachable!("marker pattern: {e}"))
});

const REFERENCE_PREFIX: &str = "${output:";

/// Logical reference to one output of one unit
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutputRef {
    pub stack: String,
    pub unit: String,
    pub output: String,
}

impl OutputRef {
    pub fn new(stack: impl Into<String>, unit: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            unit: unit.into(),
            output: output.into(),
        }
    }

    /// Key of the unit producing this output
    pub fn unit_key(&self) -> UnitKey {
        UnitKey::new(&self.stack, &self.unit)
    }

    /// Content hash: first 32 hex digits of the BLAKE3 digest of the path
    pub fn hash(&self) -> String {
        let digest = blake3::hash(self.to_string().as_bytes());
        digest.to_hex()[..32].to_string()
    }

    /// Marker text embedded in unit specifications
    pub fn marker(&self) -> String {
        let hash = self.hash();
        format!("{hash}.{self}.{hash}")
    }

    /// Original reference syntax
    pub fn reference(&self) -> String {
        format!("{REFERENCE_PREFIX}{self}}}")
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.stack, self.unit, self.output)
    }
}

/// Project-wide table of registered markers, keyed by hash
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MarkerTable {
    entries: BTreeMap<String, OutputRef>,
}

impl MarkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reference and return its marker.
    ///
    /// Registration is write-once: an existing entry is never re-hashed.
    pub fn register(&mut self, target: &OutputRef) -> Result<String> {
        let hash = target.hash();
        match self.entries.get(&hash) {
            Some(existing) if existing != target => Err(Error::internal(format!(
                "marker hash collision between {existing} and {target}"
            ))),
            Some(_) => Ok(target.marker()),
            None => {
                log::trace!("Registered marker {hash} for {target}");
                self.entries.insert(hash, target.clone());
                Ok(target.marker())
            }
        }
    }

    pub fn get(&self, hash: &str) -> Option<&OutputRef> {
        self.entries.get(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputRef)> {
        self.entries.iter()
    }

    /// Copy entries from another table, keeping existing ones
    pub fn merge(&mut self, other: &MarkerTable) {
        for (hash, target) in &other.entries {
            self.entries.entry(hash.clone()).or_insert_with(|| target.clone());
        }
    }
}

/// Outputs of units applied (or read) during this run
pub type OutputStore = BTreeMap<UnitKey, BTreeMap<String, Value>>;

/// Replace every output reference in `s` with its marker.
///
/// `own_stack` resolves the `this` alias. Every reference found is appended
/// to `found` so the caller can add implicit dependencies.
pub fn inject(
    s: &str,
    own_stack: &str,
    table: &mut MarkerTable,
    found: &mut Vec<OutputRef>,
) -> Result<String> {
    if !s.contains(REFERENCE_PREFIX) {
        return Ok(s.to_string());
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for caps in REFERENCE.captures_iter(s) {
        let whole = caps.get(0).ok_or_else(|| Error::internal("empty reference match"))?;
        let stack = match &caps[1] {
            THIS_STACK => own_stack,
            other => other,
        };
        let target = OutputRef::new(stack, &caps[2], &caps[3]);
        out.push_str(&s[last..whole.start()]);
        out.push_str(&table.register(&target)?);
        found.push(target);
        last = whole.end();
    }
    out.push_str(&s[last..]);

    if out.contains(REFERENCE_PREFIX) {
        return Err(Error::config(format!(
            "invalid output reference in '{s}', expected ${{output:<stack>.<unit>.<output>}}"
        )));
    }
    Ok(out)
}

/// Replace every marker in `s` with the original reference syntax
pub fn humanize(s: &str) -> String {
    MARKER
        .replace_all(s, |caps: &regex::Captures<'_>| {
            let target = OutputRef::new(&caps[2], &caps[3], &caps[4]);
            if caps[1] == caps[5] && caps[1] == target.hash() {
                target.reference()
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Resolves markers against current knowledge of the run
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    markers: &'a MarkerTable,
    outputs: &'a OutputStore,
    backends: &'a BackendRegistry,
    stack_backends: &'a BTreeMap<String, String>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        markers: &'a MarkerTable,
        outputs: &'a OutputStore,
        backends: &'a BackendRegistry,
        stack_backends: &'a BTreeMap<String, String>,
    ) -> Self {
        Self {
            markers,
            outputs,
            backends,
            stack_backends,
        }
    }

    /// Replace every marker in `s`.
    ///
    /// Targets resolved through remote state are added to `remote`.
    pub fn resolve(&self, s: &str, remote: &mut BTreeSet<UnitKey>) -> Result<String> {
        let mut out = String::with_capacity(s.len());
        let mut last = 0;
        for caps in MARKER.captures_iter(s) {
            let whole = caps.get(0).ok_or_else(|| Error::internal("empty marker match"))?;
            let hash = &caps[1];
            if hash != &caps[5] {
                continue;
            }
            let target = self.markers.get(hash).ok_or_else(|| {
                Error::internal(format!("marker {} is not registered", whole.as_str()))
            })?;

            out.push_str(&s[last..whole.start()]);
            out.push_str(&self.replacement(target, remote)?);
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(out)
    }

    /// Backend of the given stack
    pub fn stack_backend(&self, stack: &str) -> Result<&'a dyn crate::backend::Backend> {
        let name = self
            .stack_backends
            .get(stack)
            .ok_or_else(|| Error::config(format!("unknown stack '{stack}'")))?;
        self.backends.get(name)
    }

    fn replacement(&self, target: &OutputRef, remote: &mut BTreeSet<UnitKey>) -> Result<String> {
        if let Some(outputs) = self.outputs.get(&target.unit_key()) {
            let value = outputs.get(&target.output).ok_or_else(|| {
                Error::config(format!(
                    "unit '{}' has no output '{}'",
                    target.unit_key(),
                    target.output
                ))
            })?;
            return Ok(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        }

        let backend = self.stack_backend(&target.stack).map_err(|e| {
            Error::config(format!("output {target}: {e}"))
        })?;
        remote.insert(target.unit_key());
        Ok(backend.remote_state_ref(target))
    }
}
