//! Type-erased values flowing between rules.
use std::any::{Any, TypeId};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use kiln_castore::fingerprint::{Fingerprint, FingerprintHasher};
use kiln_castore::B3Digest;

use crate::error::{Failure, FailureKind};

/// Identifies the Rust type of a rule input, output or parameter.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The type name without its module path.
    pub fn short_name(&self) -> &'static str {
        // generic arguments may contain paths themselves, only strip the head.
        let head = self.name.split('<').next().unwrap_or(self.name);
        match head.rfind("::") {
            Some(pos) => &self.name[pos + 2..],
            None => self.name,
        }
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl std::hash::Hash for TypeKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state)
    }
}

impl PartialOrd for TypeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TypeKey {
    // by name first, so sets of type keys print in a stable order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.name
            .cmp(other.name)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Anything that can be a rule input, output or parameter.
///
/// Values are compared by their [Fingerprint], so it must cover everything
/// that makes two values different.
pub trait RuleValue: Any + Fingerprint + fmt::Debug + Send + Sync {}

impl<T: Any + Fingerprint + fmt::Debug + Send + Sync> RuleValue for T {}

trait Erased: fmt::Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + fmt::Debug + Send + Sync> Erased for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A reference-counted, type-erased [RuleValue], along with its [TypeKey]
/// and fingerprint. Cloning is cheap.
#[derive(Clone)]
pub struct Value {
    type_key: TypeKey,
    fingerprint: B3Digest,
    /// Store content the value points to.
    references: Arc<[B3Digest]>,
    inner: Arc<dyn Erased>,
}

impl Value {
    pub fn new<T: RuleValue>(value: T) -> Self {
        let type_key = TypeKey::of::<T>();
        let mut hasher = FingerprintHasher::new();
        hasher.record(type_key.name()).field(&value);

        Self {
            type_key,
            fingerprint: hasher.finish(),
            references: hasher.references().into(),
            inner: Arc::new(value),
        }
    }

    pub fn type_key(&self) -> TypeKey {
        self.type_key
    }

    /// Covers both the type and the content of the value.
    pub fn fingerprint(&self) -> &B3Digest {
        &self.fingerprint
    }

    /// Digests of the blobs and directories this value refers to, which
    /// must stay in the store for as long as the value is memoized.
    pub fn references(&self) -> &[B3Digest] {
        &self.references
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        // deref first, Arc<dyn Erased> is itself Erased.
        (*self.inner).as_any().downcast_ref::<T>()
    }

    /// Returns a copy of the value as a `T`, or a [FailureKind::TypeMismatch].
    pub fn get<T: Clone + 'static>(&self) -> Result<T, Failure> {
        self.downcast_ref::<T>().cloned().ok_or_else(|| {
            Failure::new(FailureKind::TypeMismatch(format!(
                "expected {}, got {}",
                TypeKey::of::<T>(),
                self.type_key
            )))
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.type_key == other.type_key && self.fingerprint == other.fingerprint
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl Fingerprint for Value {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        self.fingerprint.fingerprint_into(hasher);
        for digest in self.references.iter() {
            hasher.reference(digest);
        }
    }
}

/// The parameters of a request, at most one [Value] per [TypeKey].
/// Kept sorted by type, so equal sets compare and hash equal.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Params(Vec<Value>);

impl Params {
    /// Later values replace earlier ones of the same type.
    pub fn new<I: IntoIterator<Item = Value>>(values: I) -> Self {
        let mut params = Params::default();
        for value in values {
            params.put(value);
        }
        params
    }

    /// Inserts `value`, replacing any value of the same type.
    pub fn put(&mut self, value: Value) {
        match self
            .0
            .binary_search_by(|v| v.type_key().cmp(&value.type_key()))
        {
            Ok(pos) => self.0[pos] = value,
            Err(pos) => self.0.insert(pos, value),
        }
    }

    pub fn with(&self, value: Value) -> Self {
        let mut params = self.clone();
        params.put(value);
        params
    }

    pub fn get(&self, type_key: TypeKey) -> Option<&Value> {
        self.0
            .binary_search_by(|v| v.type_key().cmp(&type_key))
            .ok()
            .map(|pos| &self.0[pos])
    }

    /// Keeps only the values whose type is in `types`.
    pub fn restrict(&self, types: &BTreeSet<TypeKey>) -> Self {
        Params(
            self.0
                .iter()
                .filter(|v| types.contains(&v.type_key()))
                .cloned()
                .collect(),
        )
    }

    pub fn type_keys(&self) -> BTreeSet<TypeKey> {
        self.0.iter().map(Value::type_key).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}", value)?;
        }
        Ok(())
    }
}

impl Fingerprint for Params {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        self.0.fingerprint_into(hasher)
    }
}
