//! Deterministic, content-derived fingerprints of values.
//!
//! A fingerprint is a [B3Digest] over a canonical encoding of a value. The
//! encoding is type-tagged and length-prefixed, so two values only share a
//! fingerprint if they have equal content. Unordered collections are encoded
//! by sorting the fingerprints of their elements, which makes the result
//! independent of insertion order and hasher seeds.
//!
//! While hashing, the [FingerprintHasher] also collects the store content a
//! value points to (every [Digest] and [DirectoryDigest] in it), so whoever
//! keeps the value around can keep that content alive.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::{B3Digest, Digest, DirectoryDigest};

/// A hasher for building fingerprints from multiple components.
pub struct FingerprintHasher {
    hasher: blake3::Hasher,
    references: Vec<B3Digest>,
}

impl Default for FingerprintHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self {
            hasher: blake3::Hasher::new(),
            references: vec![],
        }
    }

    /// Records that the value being hashed refers to store content.
    /// Doesn't affect the fingerprint.
    pub fn reference(&mut self, digest: &B3Digest) -> &mut Self {
        if !self.references.contains(digest) {
            self.references.push(digest.clone());
        }
        self
    }

    /// Store content referred to by everything hashed so far.
    pub fn references(&self) -> &[B3Digest] {
        &self.references
    }

    /// Hashes `v` on its own, keeping its references.
    fn nested<T: Fingerprint + ?Sized>(&mut self, v: &T) -> B3Digest {
        let mut nested = FingerprintHasher::new();
        v.fingerprint_into(&mut nested);
        for digest in &nested.references {
            self.reference(digest);
        }
        nested.finish()
    }

    /// Writes a single tag byte, distinguishing the kind of the next component.
    pub fn tag(&mut self, tag: u8) -> &mut Self {
        self.hasher.update(&[tag]);
        self
    }

    /// Starts a named record, so values of different structs with the same
    /// field contents don't collide.
    pub fn record(&mut self, name: &str) -> &mut Self {
        self.tag(tags::RECORD).bytes(name.as_bytes())
    }

    /// Writes a length-prefixed byte string.
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        self.hasher.update(&(data.len() as u64).to_le_bytes());
        self.hasher.update(data);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.hasher.update(&v.to_le_bytes());
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.hasher.update(&v.to_le_bytes());
        self
    }

    /// Feeds another value into this fingerprint.
    pub fn field<T: Fingerprint + ?Sized>(&mut self, v: &T) -> &mut Self {
        v.fingerprint_into(self);
        self
    }

    pub fn finish(&self) -> B3Digest {
        self.hasher.finalize().into()
    }
}

/// Values that can be fingerprinted.
///
/// Implementations must write everything that makes two values different,
/// and nothing that doesn't (addresses, insertion order, timestamps).
pub trait Fingerprint {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher);

    fn fingerprint(&self) -> B3Digest {
        let mut hasher = FingerprintHasher::new();
        self.fingerprint_into(&mut hasher);
        hasher.finish()
    }
}

mod tags {
    pub const UNIT: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const UINT: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const STR: u8 = 0x04;
    pub const BYTES: u8 = 0x05;
    pub const NONE: u8 = 0x06;
    pub const SOME: u8 = 0x07;
    pub const SEQ: u8 = 0x08;
    pub const MAP: u8 = 0x09;
    pub const SET: u8 = 0x0a;
    pub const TUPLE: u8 = 0x0b;
    pub const PATH: u8 = 0x0c;
    pub const RECORD: u8 = 0x0d;
    pub const DIGEST: u8 = 0x10;
    pub const DIRECTORY_DIGEST: u8 = 0x11;
    pub const B3: u8 = 0x12;
}

impl Fingerprint for () {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.tag(tags::UNIT);
    }
}

impl Fingerprint for bool {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.tag(tags::BOOL).u64(*self as u64);
    }
}

macro_rules! fingerprint_uint {
    ($($t:ty),*) => {
        $(impl Fingerprint for $t {
            fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
                hasher.tag(tags::UINT).u64(*self as u64);
            }
        })*
    };
}

macro_rules! fingerprint_int {
    ($($t:ty),*) => {
        $(impl Fingerprint for $t {
            fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
                hasher.tag(tags::INT).i64(*self as i64);
            }
        })*
    };
}

fingerprint_uint!(u8, u16, u32, u64, usize);
fingerprint_int!(i8, i16, i32, i64, isize);

impl Fingerprint for str {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.tag(tags::STR).bytes(self.as_bytes());
    }
}

impl Fingerprint for String {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        self.as_str().fingerprint_into(hasher)
    }
}

/// Byte buffers are hashed as one blob, not as a sequence of integers.
impl Fingerprint for bytes::Bytes {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.tag(tags::BYTES).bytes(self);
    }
}

impl Fingerprint for Path {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        use std::os::unix::ffi::OsStrExt;
        hasher.tag(tags::PATH).bytes(self.as_os_str().as_bytes());
    }
}

impl Fingerprint for PathBuf {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        self.as_path().fingerprint_into(hasher)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for &T {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        (**self).fingerprint_into(hasher)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for Box<T> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        (**self).fingerprint_into(hasher)
    }
}

impl<T: Fingerprint + ?Sized> Fingerprint for std::sync::Arc<T> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        (**self).fingerprint_into(hasher)
    }
}

impl<T: Fingerprint> Fingerprint for Option<T> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        match self {
            None => {
                hasher.tag(tags::NONE);
            }
            Some(v) => {
                hasher.tag(tags::SOME).field(v);
            }
        }
    }
}

impl<T: Fingerprint> Fingerprint for [T] {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.tag(tags::SEQ).u64(self.len() as u64);
        for v in self {
            hasher.field(v);
        }
    }
}

impl<T: Fingerprint> Fingerprint for Vec<T> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        self.as_slice().fingerprint_into(hasher)
    }
}

/// Writes a set of already computed element fingerprints in sorted order.
fn write_unordered(hasher: &mut FingerprintHasher, tag: u8, mut elems: Vec<B3Digest>) {
    elems.sort();
    hasher.tag(tag).u64(elems.len() as u64);
    for e in elems {
        hasher.bytes(e.as_slice());
    }
}

impl<K: Fingerprint, V: Fingerprint> Fingerprint for BTreeMap<K, V> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        let elems = self.iter().map(|pair| hasher.nested(&pair)).collect();
        write_unordered(hasher, tags::MAP, elems)
    }
}

impl<K: Fingerprint, V: Fingerprint, S> Fingerprint for HashMap<K, V, S> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        let elems = self.iter().map(|pair| hasher.nested(&pair)).collect();
        write_unordered(hasher, tags::MAP, elems)
    }
}

impl<T: Fingerprint> Fingerprint for BTreeSet<T> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        let elems = self.iter().map(|v| hasher.nested(v)).collect();
        write_unordered(hasher, tags::SET, elems)
    }
}

impl<T: Fingerprint, S> Fingerprint for HashSet<T, S> {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        let elems = self.iter().map(|v| hasher.nested(v)).collect();
        write_unordered(hasher, tags::SET, elems)
    }
}

macro_rules! fingerprint_tuple {
    ($len:expr => $($name:ident),+) => {
        impl<$($name: Fingerprint),+> Fingerprint for ($($name,)+) {
            #[allow(non_snake_case)]
            fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
                let ($($name,)+) = self;
                hasher.tag(tags::TUPLE).u64($len);
                $(hasher.field($name);)+
            }
        }
    };
}

fingerprint_tuple!(1 => A);
fingerprint_tuple!(2 => A, B);
fingerprint_tuple!(3 => A, B, C);
fingerprint_tuple!(4 => A, B, C, D);

impl Fingerprint for B3Digest {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher.tag(tags::B3).bytes(self.as_slice());
    }
}

/// Raw files are fingerprinted by their content digest.
impl Fingerprint for Digest {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher
            .tag(tags::DIGEST)
            .bytes(self.hash.as_slice())
            .u64(self.size)
            .reference(&self.hash);
    }
}

/// Directory digests already cover names, executable bits and symlink targets.
impl Fingerprint for DirectoryDigest {
    fn fingerprint_into(&self, hasher: &mut FingerprintHasher) {
        hasher
            .tag(tags::DIRECTORY_DIGEST)
            .bytes(self.hash().as_slice())
            .u64(self.size())
            .reference(self.hash());
    }
}
