use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// A CBOR array with at least one element.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "Vec<T>", into = "Vec<T>")]
pub struct NonEmptyVec<T: Clone>(Vec<T>);

#[derive(Debug, thiserror::Error)]
#[error("expected a non-empty array")]
pub struct Empty;

impl<T: Clone> NonEmptyVec<T> {
    pub fn new(first: T) -> Self {
        Self(vec![first])
    }

    /// `None` when `items` is empty.
    pub fn maybe_new(items: Vec<T>) -> Option<Self> {
        (!items.is_empty()).then_some(Self(items))
    }

    pub fn into_inner(self) -> Vec<T> {
        self.0
    }
}

impl<T: Clone> TryFrom<Vec<T>> for NonEmptyVec<T> {
    type Error = Empty;

    fn try_from(items: Vec<T>) -> Result<Self, Empty> {
        Self::maybe_new(items).ok_or(Empty)
    }
}

impl<T: Clone> From<NonEmptyVec<T>> for Vec<T> {
    fn from(items: NonEmptyVec<T>) -> Vec<T> {
        items.0
    }
}

impl<T: Clone> Deref for NonEmptyVec<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::NonEmptyVec;
    use crate::cbor;

    #[test]
    fn empty_array_is_rejected() {
        let bytes = cbor::to_vec(&Vec::<u8>::new()).unwrap();
        assert!(cbor::from_slice::<NonEmptyVec<u8>>(&bytes).is_err());
        assert!(NonEmptyVec::<u8>::maybe_new(vec![]).is_none());

        let bytes = cbor::to_vec(&vec![1u8, 2]).unwrap();
        let decoded: NonEmptyVec<u8> = cbor::from_slice(&bytes).unwrap();
        assert_eq!(decoded.into_inner(), vec![1, 2]);
    }
}
