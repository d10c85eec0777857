//! Item envelope carried through every stage.

/// A payload tagged with its submission index.
///
/// The index is fixed at construction. Stages replace the payload through
/// [`Item::map`] / [`Item::try_map`], which consume the item, so a payload has
/// exactly one owner at any point in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item<T> {
    index: u64,
    payload: T,
}

impl<T> Item<T> {
    pub fn new(index: u64, payload: T) -> Self {
        Self { index, payload }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn into_parts(self) -> (u64, T) {
        (self.index, self.payload)
    }

    /// Replace the payload, keeping the index.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Item<U> {
        Item {
            index: self.index,
            payload: f(self.payload),
        }
    }

    /// Fallible [`Item::map`]. The closure also sees the index.
    pub fn try_map<U, E>(self, f: impl FnOnce(u64, T) -> Result<U, E>) -> Result<Item<U>, E> {
        let index = self.index;
        Ok(Item {
            index,
            payload: f(index, self.payload)?,
        })
    }
}
