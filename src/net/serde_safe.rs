//! Safe deserialization with bounded collections.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedVec<T, const N: usize>(pub Vec<T>);

impl<T, const N: usize> BoundedVec<T, N> {
    pub fn new(v: Vec<T>) -> Option<Self> {
        if v.len() <= N {
            Some(Self(v))
        } else {
            None
        }
    }

    /// Internal use only — caller must ensure len <= N
    #[inline]
    pub fn new_unchecked(v: Vec<T>) -> Self {
        debug_assert!(v.len() <= N);
        Self(v)
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T, const N: usize> Default for BoundedVec<T, N> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T, const N: usize> From<BoundedVec<T, N>> for Vec<T> {
    fn from(bv: BoundedVec<T, N>) -> Self {
        bv.0
    }
}

impl<T, const N: usize> std::ops::Deref for BoundedVec<T, N> {
    type Target = Vec<T>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'a, T, const N: usize> IntoIterator for &'a BoundedVec<T, N> {
    type Item = &'a T;
    type IntoIter = std::slice::Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl<T, const N: usize> IntoIterator for BoundedVec<T, N> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<T: Serialize, const N: usize> Serialize for BoundedVec<T, N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>, const N: usize> Deserialize<'de> for BoundedVec<T, N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundedVecVisitor<T, const N: usize>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>, const N: usize> de::Visitor<'de> for BoundedVecVisitor<T, N> {
            type Value = BoundedVec<T, N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a sequence with at most {} elements", N)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let size_hint = seq.size_hint().unwrap_or(0);
                if size_hint > N {
                    return Err(de::Error::invalid_length(size_hint, &self));
                }

                let mut vec = Vec::with_capacity(size_hint.min(N));
                while let Some(elem) = seq.next_element()? {
                    if vec.len() >= N {
                        return Err(de::Error::invalid_length(vec.len() + 1, &self));
                    }
                    vec.push(elem);
                }
                Ok(BoundedVec(vec))
            }
        }

        deserializer.deserialize_seq(BoundedVecVisitor(PhantomData))
    }
}

/// Bounded bytes (Vec<u8>) wrapper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedBytes<const N: usize>(pub Vec<u8>);

impl<const N: usize> BoundedBytes<N> {
    pub fn new(v: Vec<u8>) -> Option<Self> {
        if v.len() <= N {
            Some(Self(v))
        } else {
            None
        }
    }

    #[inline]
    pub fn new_unchecked(v: Vec<u8>) -> Self {
        debug_assert!(v.len() <= N);
        Self(v)
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl<const N: usize> std::ops::Deref for BoundedBytes<N> {
    type Target = Vec<u8>;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<const N: usize> Serialize for BoundedBytes<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedBytes<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BoundedBytesVisitor<const N: usize>;

        impl<'de, const N: usize> de::Visitor<'de> for BoundedBytesVisitor<N> {
            type Value = BoundedBytes<N>;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                write!(formatter, "a byte sequence with at most {} bytes", N)
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                if v.len() > N {
                    return Err(de::Error::invalid_length(v.len(), &self));
                }
                Ok(BoundedBytes(v.to_vec()))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let size_hint = seq.size_hint().unwrap_or(0);
                if size_hint > N {
                    return Err(de::Error::invalid_length(size_hint, &self));
                }

                let mut vec = Vec::with_capacity(size_hint.min(N));
                while let Some(byte) = seq.next_element()? {
                    if vec.len() >= N {
                        return Err(de::Error::invalid_length(vec.len() + 1, &self));
                    }
                    vec.push(byte);
                }
                Ok(BoundedBytes(vec))
            }
        }

        deserializer.deserialize_bytes(BoundedBytesVisitor)
    }
}

/// Bounded string wrapper (byte length limit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedString<const N: usize>(pub String);

impl<const N: usize> BoundedString<N> {
    pub fn new(s: String) -> Option<Self> {
        if s.len() <= N {
            Some(Self(s))
        } else {
            None
        }
    }

    /// Truncate at a char boundary to fit the bound.
    pub fn truncated(s: &str) -> Self {
        if s.len() <= N {
            return Self(s.to_string());
        }
        let mut end = N;
        while end > 0 && !s.is_char_boundary(end) {
            end -= 1;
        }
        Self(s[..end].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl<const N: usize> Serialize for BoundedString<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de, const N: usize> Deserialize<'de> for BoundedString<N> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() > N {
            return Err(de::Error::custom(format!(
                "string of {} bytes exceeds bound of {}",
                s.len(),
                N
            )));
        }
        Ok(Self(s))
    }
}

/// Deserialize from postcard bytes.
pub fn from_bytes<'de, T: Deserialize<'de>>(data: &'de [u8]) -> Result<T, postcard::Error> {
    postcard::from_bytes(data)
}

/// Serialize to postcard bytes.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, postcard::Error> {
    postcard::to_allocvec(value)
}
