//! Batching units: deduplicating, caching facades over one data source.

use std::{
    any::type_name,
    cell::RefCell,
    collections::HashMap,
    fmt::{self, Debug, Formatter},
    hash::Hash,
    mem,
    num::NonZeroUsize,
    ops::Deref,
    rc::Rc,
};

use tracing::{debug_span, trace, warn};

use crate::{
    data::{KeySet, KeyedEntry, OnDuplicate},
    deferred::Deferred,
    error::{Error, Result},
    executor::{Drain, Executor, WeakExecutor},
};

/// The fetch logic behind a batching unit.
///
/// A loader is built from its `Args`, and each executor holds at most one
/// loader per `(type, args)` pair; [`for_args`] returns that instance.
/// Keys are queued with [`LoaderRef::load`], and once a value is forced the
/// executor calls [`perform`] with every distinct key queued so far.
///
/// ```
/// use batchsync::{Batch, Executor, Loader, Result};
///
/// struct Square;
///
/// impl Loader for Square {
///     type Args = ();
///     type Key = u64;
///     type Value = u64;
///
///     fn new(_args: ()) -> Self {
///         Square
///     }
///
///     fn perform(&self, batch: &Batch<'_, Self>) -> Result<()> {
///         batch.fulfill_with(|key| key * key)
///     }
/// }
///
/// let executor = Executor::new();
/// let _scope = executor.enter();
///
/// let squares = Square::for_args(()).unwrap();
/// let three = squares.load(3);
/// let four = squares.load(4);
///
/// assert_eq!(four.sync().unwrap(), 16);
/// assert_eq!(three.value(), Some(9));
/// ```
///
/// [`for_args`]: Loader::for_args
/// [`perform`]: Loader::perform
pub trait Loader: Sized + 'static {
    /// Constructor arguments. Also the loader's identity inside an executor.
    type Args: Hash + Eq + Clone + 'static;
    type Key: Hash + Eq + Clone + Debug + 'static;
    type Value: Clone + 'static;

    fn new(args: Self::Args) -> Self;

    /// Fetch every key in `batch.keys()` and settle each one with
    /// [`Batch::fulfill`] or [`Batch::reject`] before returning.
    ///
    /// Keys left pending when this returns are rejected with
    /// [`Error::UnfulfilledKey`]. Returning an error does not reject
    /// anything by itself; the error becomes the cause of those rejections.
    fn perform(&self, batch: &Batch<'_, Self>) -> Result<()>;

    /// Upper bound on the number of keys handed to one `perform`. Keys past
    /// the limit stay queued for a later batch.
    fn max_batch_size(&self) -> Option<NonZeroUsize> {
        None
    }

    /// The loader for `args` in the current executor.
    fn for_args(args: Self::Args) -> Result<LoaderRef<Self>> {
        Executor::current()
            .map(|executor| executor.loader::<Self>(args))
            .ok_or(Error::NoExecutor)
    }
}

struct LoaderState<Key, Value> {
    // Every key ever loaded; never evicted.
    cache: HashMap<Key, Deferred<Value>>,

    // Loaded but not yet handed to perform.
    queue: Vec<Key>,

    // True while this loader sits in the executor's ready queue.
    scheduled: bool,
}

struct LoaderCell<L: Loader> {
    loader: L,
    state: RefCell<LoaderState<L::Key, L::Value>>,
    executor: WeakExecutor,
}

impl<L: Loader> LoaderCell<L> {
    fn cached(&self, key: &L::Key) -> Option<Deferred<L::Value>> {
        self.state.borrow().cache.get(key).cloned()
    }

    fn schedule(cell: &Rc<Self>) {
        match cell.executor.upgrade() {
            Some(executor) => executor.enqueue(Rc::clone(cell) as Rc<dyn Drain>),
            None => warn!(
                loader = type_name::<L>(),
                "loader outlived its executor; queued keys will never be fetched"
            ),
        }
    }
}

impl<L: Loader> Drain for LoaderCell<L> {
    fn drain(self: Rc<Self>) {
        let keys = {
            let mut state = self.state.borrow_mut();
            let take = match self.loader.max_batch_size() {
                Some(max) => max.get().min(state.queue.len()),
                None => state.queue.len(),
            };

            let keys: Vec<L::Key> = if take == state.queue.len() {
                mem::take(&mut state.queue)
            } else {
                state.queue.drain(..take).collect()
            };

            state.scheduled = !state.queue.is_empty();
            keys
        };

        // Leftovers from a size-capped batch go to the back of the queue.
        if self.state.borrow().scheduled {
            LoaderCell::schedule(&self);
        }

        if keys.is_empty() {
            return;
        }

        let batch = Batch {
            cell: &*self,
            keys: KeySet::from_unique(keys),
        };

        let span = debug_span!("perform", loader = type_name::<L>(), keys = batch.keys.len());
        let _enter = span.enter();

        let cause = match self.loader.perform(&batch) {
            Ok(()) => None,
            Err(err) => {
                warn!(error = %err, "perform failed");
                Some(Box::new(err))
            }
        };

        let unsettled: Vec<(L::Key, Deferred<L::Value>)> = batch
            .keys
            .keys()
            .filter_map(|key| Some((key.clone(), self.cached(key)?)))
            .filter(|(_, deferred)| deferred.is_pending())
            .collect();

        if !unsettled.is_empty() {
            warn!(
                unsettled = unsettled.len(),
                "perform returned without settling every key"
            );
        }

        for (key, deferred) in unsettled {
            deferred.settle(Err(Error::UnfulfilledKey {
                loader: type_name::<L>(),
                key: format!("{:?}", key),
                cause: cause.clone(),
            }));
        }
    }

    fn cancel(&self) {
        // Dropping the cache also drops the continuations it holds, which
        // may themselves hold handles to this loader.
        let cache = {
            let mut state = self.state.borrow_mut();
            state.queue.clear();
            state.scheduled = false;
            mem::take(&mut state.cache)
        };

        for (key, deferred) in cache {
            deferred.settle(Err(Error::Cancelled {
                loader: type_name::<L>(),
                key: format!("{:?}", key),
            }));
        }
    }

    fn loader_name(&self) -> &'static str {
        type_name::<L>()
    }
}

/// A handle to a loader instance living in an executor.
///
/// Obtained from [`Loader::for_args`] or [`Executor::loader`]. Handles to
/// the same instance compare equal with [`ptr_eq`][LoaderRef::ptr_eq], and
/// dereference to the loader itself.
pub struct LoaderRef<L: Loader> {
    cell: Rc<LoaderCell<L>>,
}

impl<L: Loader> Clone for LoaderRef<L> {
    fn clone(&self) -> Self {
        Self {
            cell: Rc::clone(&self.cell),
        }
    }
}

impl<L: Loader> Debug for LoaderRef<L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = self.cell.state.borrow();
        f.debug_struct("LoaderRef")
            .field("loader", &type_name::<L>())
            .field("cached", &state.cache.len())
            .field("queued", &state.queue)
            .finish()
    }
}

impl<L: Loader> Deref for LoaderRef<L> {
    type Target = L;

    fn deref(&self) -> &L {
        &self.cell.loader
    }
}

impl<L: Loader> LoaderRef<L> {
    pub(crate) fn new(loader: L, executor: WeakExecutor) -> Self {
        Self {
            cell: Rc::new(LoaderCell {
                loader,
                state: RefCell::new(LoaderState {
                    cache: HashMap::new(),
                    queue: Vec::new(),
                    scheduled: false,
                }),
                executor,
            }),
        }
    }

    pub(crate) fn as_drain(&self) -> Rc<dyn Drain> {
        Rc::clone(&self.cell) as Rc<dyn Drain>
    }

    /// Request a single key.
    ///
    /// Nothing is fetched yet. The first load of a key queues it and returns
    /// a new pending value; later loads of the same key return that same
    /// value.
    pub fn load(&self, key: L::Key) -> Deferred<L::Value> {
        let mut state = self.cell.state.borrow_mut();
        if let Some(existing) = state.cache.get(&key) {
            return existing.clone();
        }

        trace!(loader = type_name::<L>(), key = ?key, "queueing key");

        let deferred = Deferred::pending();
        state.cache.insert(key.clone(), deferred.clone());
        state.queue.push(key);

        let schedule = !mem::replace(&mut state.scheduled, true);
        drop(state);

        if schedule {
            LoaderCell::schedule(&self.cell);
        }

        deferred
    }

    /// Request several keys at once. The values come back in the order of
    /// `keys`, duplicates included.
    pub fn load_many(&self, keys: impl IntoIterator<Item = L::Key>) -> Deferred<Vec<L::Value>> {
        Deferred::all(keys.into_iter().map(|key| self.load(key)))
    }

    /// Seed the cache with a known value so `key` is never fetched. Has no
    /// effect, and returns false, if `key` was already loaded or primed.
    pub fn prime(&self, key: L::Key, value: L::Value) -> bool {
        let mut state = self.cell.state.borrow_mut();
        if state.cache.contains_key(&key) {
            return false;
        }

        state.cache.insert(key, Deferred::fulfilled(value));
        true
    }

    /// True if `key` has been loaded or primed.
    pub fn is_cached(&self, key: &L::Key) -> bool {
        self.cell.state.borrow().cache.contains_key(key)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.cell, &other.cell)
    }
}

/// The keys of one grouped fetch, and the means to settle them.
///
/// Handed to [`Loader::perform`].
pub struct Batch<'a, L: Loader> {
    cell: &'a LoaderCell<L>,
    keys: KeySet<L::Key>,
}

impl<L: Loader> Debug for Batch<'_, L> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Batch")
            .field("loader", &type_name::<L>())
            .field("keys", &self.keys)
            .finish()
    }
}

impl<'a, L: Loader> Batch<'a, L> {
    /// The distinct keys to fetch.
    pub fn keys(&self) -> &KeySet<L::Key> {
        &self.keys
    }

    pub fn loader(&self) -> &'a L {
        &self.cell.loader
    }

    pub fn fulfill(&self, key: &L::Key, value: L::Value) -> Result<()> {
        self.settle(key, Ok(value))
    }

    pub fn reject(&self, key: &L::Key, err: Error) -> Result<()> {
        self.settle(key, Err(err))
    }

    /// True if `key` has already been fulfilled or rejected.
    pub fn is_settled(&self, key: &L::Key) -> bool {
        self.cell
            .cached(key)
            .map_or(false, |deferred| !deferred.is_pending())
    }

    fn settle(&self, key: &L::Key, result: Result<L::Value>) -> Result<()> {
        let deferred = self.cell.cached(key).ok_or_else(|| Error::UnknownKey {
            loader: type_name::<L>(),
            key: format!("{:?}", key),
        })?;

        // `settle` runs continuations; no loader state is borrowed here.
        if deferred.settle(result) {
            Ok(())
        } else {
            Err(Error::AlreadySettled {
                loader: type_name::<L>(),
                key: format!("{:?}", key),
            })
        }
    }

    /// Fulfill every key in the batch with a value computed from the key.
    pub fn fulfill_with(&self, mut get_value: impl FnMut(&L::Key) -> L::Value) -> Result<()> {
        self.keys
            .keys()
            .try_for_each(|key| self.fulfill(key, get_value(key)))
    }

    /// Settle every key in the batch from a fallible lookup: `Ok` fulfills
    /// the key, `Err` rejects just that key.
    pub fn try_fulfill_with(
        &self,
        mut get_value: impl FnMut(&L::Key) -> Result<L::Value>,
    ) -> Result<()> {
        self.keys
            .keys()
            .try_for_each(|key| self.settle(key, get_value(key)))
    }

    /// Fulfill keys from fetched entries that know their own key.
    ///
    /// Entries for keys outside this batch are an [`Error::UnknownKey`].
    /// Returns the keys that no entry answered, in load order, so the caller
    /// can fulfill them with a default or reject them.
    pub fn fulfill_from_iter<I>(&self, on_duplicate: OnDuplicate, entries: I) -> Result<Vec<L::Key>>
    where
        I: IntoIterator<Item = L::Value>,
        L::Value: KeyedEntry<L::Key>,
    {
        for entry in entries {
            let key = entry.get_key().clone();
            if !self.keys.contains(&key) {
                return Err(Error::UnknownKey {
                    loader: type_name::<L>(),
                    key: format!("{:?}", key),
                });
            }

            if self.is_settled(&key) {
                match on_duplicate {
                    OnDuplicate::Ignore => continue,
                    OnDuplicate::Error => {
                        return Err(Error::DuplicateEntry {
                            loader: type_name::<L>(),
                            key: format!("{:?}", key),
                        })
                    }
                }
            }

            self.fulfill(&key, entry)?;
        }

        Ok(self
            .keys
            .keys()
            .filter(|key| !self.is_settled(key))
            .cloned()
            .collect())
    }
}
