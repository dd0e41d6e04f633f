//! Append-only asset stores addressed by typed handles.
//!
//! A handle is the positional index of an asset within its store. Stores never
//! remove entries, so a handle stays valid for the lifetime of the store.

mod asset_store;

pub use asset_store::AssetStore;

use dashmap::DashMap;
use parking_lot::RwLock;
use snafu::Snafu;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::trace;

#[derive(Debug, Snafu)]
#[snafu(context(suffix(Err)))]
pub enum AssetError {
    #[snafu(display("No {kind} named {name:?} was registered"))]
    UnknownAsset { kind: &'static str, name: String },
    #[snafu(display("{kind} handle {index} is out of range ({len} stored)"))]
    InvalidHandle {
        kind: &'static str,
        index: u32,
        len: usize,
    },
}

/// Implemented by every asset kind that can live in a [`Store`].
pub trait StoreType: Debug + Send + Sync + 'static {
    const KIND: &'static str;

    /// The content address of this asset.
    fn name(&self) -> &str;
}

pub struct H<T> {
    id: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> H<T> {
    pub const fn new(id: u32) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub const fn index(&self) -> usize {
        self.id as usize
    }
}

impl<T> Clone for H<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for H<T> {}

impl<T> PartialEq for H<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for H<T> {}

impl<T> Hash for H<T> {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.id.hash(state);
    }
}

impl<T: StoreType> Debug for H<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "H<{}>({})", T::KIND, self.id)
    }
}

pub struct Store<T: StoreType> {
    items: RwLock<Vec<Arc<T>>>,
    names: DashMap<String, H<T>>,
}

impl<T: StoreType> Default for Store<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T: StoreType> Store<T> {
    pub fn empty() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            names: DashMap::new(),
        }
    }

    /// Adds an asset. Assets are content addressed by name, so adding a second
    /// asset with a known name returns the handle of the first one.
    pub fn add(&self, item: T) -> H<T> {
        let name = item.name().to_string();
        if let Some(existing) = self.names.get(&name) {
            trace!("{} {name:?} already stored as {:?}", T::KIND, *existing);
            return *existing;
        }

        let mut items = self.items.write();
        let handle = H::new(items.len() as u32);
        items.push(Arc::new(item));
        self.names.insert(name, handle);
        handle
    }

    pub fn try_get(&self, handle: H<T>) -> Option<Arc<T>> {
        self.items.read().get(handle.index()).cloned()
    }

    pub fn get(&self, handle: H<T>) -> Result<Arc<T>, AssetError> {
        let items = self.items.read();
        items.get(handle.index()).cloned().ok_or_else(|| {
            AssetError::InvalidHandle {
                kind: T::KIND,
                index: handle.id(),
                len: items.len(),
            }
        })
    }

    /// Looks an asset up by its content address.
    pub fn resolve(&self, name: &str) -> Result<H<T>, AssetError> {
        self.names
            .get(name)
            .map(|h| *h)
            .ok_or_else(|| AssetError::UnknownAsset {
                kind: T::KIND,
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored assets in handle order.
    pub fn snapshot(&self) -> Vec<(H<T>, Arc<T>)> {
        self.items
            .read()
            .iter()
            .enumerate()
            .map(|(i, item)| (H::new(i as u32), item.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Named(&'static str);

    impl StoreType for Named {
        const KIND: &'static str = "Named";

        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn handles_are_positional() {
        let store = Store::empty();
        let a = store.add(Named("a"));
        let b = store.add(Named("b"));

        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(store.get(b).unwrap().0, "b");
    }

    #[test]
    fn same_name_deduplicates() {
        let store = Store::empty();
        let first = store.add(Named("mesh"));
        let second = store.add(Named("mesh"));

        assert_eq!(first, second);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn unknown_names_fail_to_resolve() {
        let store: Store<Named> = Store::empty();
        store.add(Named("known"));

        assert!(store.resolve("known").is_ok());
        let err = store.resolve("missing").unwrap_err();
        assert!(matches!(err, AssetError::UnknownAsset { kind: "Named", .. }));
    }

    #[test]
    fn out_of_range_handle_is_an_error() {
        let store: Store<Named> = Store::empty();
        assert!(store.get(H::new(3)).is_err());
        assert!(store.try_get(H::new(3)).is_none());
    }
}
