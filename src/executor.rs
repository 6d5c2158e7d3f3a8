//! The request-scoped coordinator that drains queued loaders.

use std::{
    any::{type_name, Any, TypeId},
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    fmt::{self, Debug, Formatter},
    mem,
    rc::{Rc, Weak},
};

use tracing::{debug, warn};

use crate::{
    deferred::Deferred,
    error::{Error, Result},
    loader::{Loader, LoaderRef},
};

thread_local! {
    static CURRENT: RefCell<Option<Executor>> = RefCell::new(None);
}

/// A loader with keys waiting for a grouped fetch. Implemented by the
/// loader cells so the executor can keep loaders of different types in a
/// single queue.
pub(crate) trait Drain {
    /// Hand the queued keys to `perform`. The executor has already set the
    /// loading flag.
    fn drain(self: Rc<Self>);

    /// Forget every cached and queued key, rejecting the ones still
    /// pending with [`Error::Cancelled`]. The loader stays usable.
    fn cancel(&self);

    fn loader_name(&self) -> &'static str;
}

struct Inner {
    // TypeId of a loader type -> HashMap<L::Args, LoaderRef<L>>
    loaders: RefCell<HashMap<TypeId, Box<dyn Any>>>,

    // Every loader built by this executor, in creation order.
    registered: RefCell<Vec<Rc<dyn Drain>>>,

    // Loaders with queued keys, drained first-registered-first.
    ready: RefCell<VecDeque<Rc<dyn Drain>>>,

    loading: Cell<bool>,
}

/// Request-scoped state shared by every loader and deferred value in one
/// request.
///
/// An executor owns the loaders of its request (at most one per loader type
/// and constructor arguments) and the queue of loaders that have keys
/// waiting to be fetched. [`Deferred::sync`] uses the *current* executor,
/// which is a per-thread handle set with [`Executor::enter`] or
/// [`Executor::set_current`].
///
/// `Executor` is a cheap handle; clones refer to the same executor. It is
/// deliberately `!Send`: requests running concurrently must each create
/// their own.
#[derive(Clone)]
pub struct Executor {
    inner: Rc<Inner>,
}

impl Debug for Executor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("loader_types", &self.inner.loaders.borrow().len())
            .field("ready", &self.inner.ready.borrow().len())
            .field("loading", &self.inner.loading.get())
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Executor {}

impl Executor {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(Inner {
                loaders: RefCell::new(HashMap::new()),
                registered: RefCell::new(Vec::new()),
                ready: RefCell::new(VecDeque::new()),
                loading: Cell::new(false),
            }),
        }
    }

    /// The executor assigned to this thread, if any.
    pub fn current() -> Option<Executor> {
        CURRENT.with(|current| current.borrow().clone())
    }

    /// Assign (or, with `None`, clear) the current executor. Returns the
    /// previously assigned one.
    pub fn set_current(executor: Option<Executor>) -> Option<Executor> {
        CURRENT.with(|current| current.replace(executor))
    }

    /// Make this the current executor until the returned scope is dropped.
    ///
    /// Dropping the scope restores whatever executor was current before and
    /// clears this executor's loaders, so a request is torn down even if it
    /// exits early.
    pub fn enter(&self) -> ExecutorScope {
        debug!("entering executor");
        ExecutorScope {
            previous: Executor::set_current(Some(self.clone())),
            executor: self.clone(),
        }
    }

    /// True while a loader's `perform` is running on this executor.
    pub fn loading(&self) -> bool {
        self.inner.loading.get()
    }

    /// The loading flag of the current executor; false if there is none.
    pub fn is_loading() -> bool {
        Executor::current().map_or(false, |executor| executor.loading())
    }

    /// Drain one queued loader of the current executor.
    ///
    /// Fails with [`Error::NoExecutor`] when no executor is current and with
    /// [`Error::NoPendingBatch`] when nothing is queued.
    pub fn end_batch() -> Result<()> {
        let executor = Executor::current().ok_or(Error::NoExecutor)?;
        if executor.tick() {
            Ok(())
        } else {
            Err(Error::NoPendingBatch)
        }
    }

    /// Drain the first queued loader. Returns false if no loader had
    /// queued keys.
    pub fn tick(&self) -> bool {
        // The queue borrow must end before the loader runs; perform and its
        // continuations enqueue more loaders.
        let next = self.inner.ready.borrow_mut().pop_front();

        match next {
            None => false,
            Some(loader) => {
                self.resolve(loader);
                true
            }
        }
    }

    fn resolve(&self, loader: Rc<dyn Drain>) {
        debug!(loader = loader.loader_name(), "ending batch");
        let _loading = LoadingFlag::set(&self.inner.loading, true);
        loader.drain();
    }

    /// Drain batches until `target` settles.
    ///
    /// If no loader has queued keys while `target` is still pending, this
    /// fails with [`Error::BrokenPromise`]. The target itself stays pending;
    /// a perform further up the stack may still settle it.
    pub fn wait<T: Clone + 'static>(&self, target: &Deferred<T>) -> Result<T> {
        loop {
            if let Some(outcome) = target.outcome() {
                return outcome;
            }

            if !self.tick() {
                warn!(
                    value_type = type_name::<T>(),
                    "deferred value is still pending but no loader has queued keys"
                );

                return Err(Error::BrokenPromise {
                    type_name: type_name::<Deferred<T>>(),
                });
            }
        }
    }

    /// The loader of type `L` built from `args`, created on first use.
    /// Structurally equal `args` always yield the same loader.
    pub fn loader<L: Loader>(&self, args: L::Args) -> LoaderRef<L> {
        if let Some(existing) = self.find_loader::<L>(&args) {
            return existing;
        }

        // Build outside of the map borrow: constructors may ask for loaders
        // of their own.
        let created = LoaderRef::new(L::new(args.clone()), self.downgrade());

        let mut loaders = self.inner.loaders.borrow_mut();
        let by_args = loaders
            .entry(TypeId::of::<L>())
            .or_insert_with(|| Box::new(HashMap::<L::Args, LoaderRef<L>>::new()) as Box<dyn Any>)
            .downcast_mut::<HashMap<L::Args, LoaderRef<L>>>()
            .expect("loader map entry holds loaders of its own type");

        // A constructor may have registered the same loader in the meantime.
        if let Some(existing) = by_args.get(&args) {
            return existing.clone();
        }

        by_args.insert(args, created.clone());
        self.inner.registered.borrow_mut().push(created.as_drain());
        created
    }

    fn find_loader<L: Loader>(&self, args: &L::Args) -> Option<LoaderRef<L>> {
        self.inner
            .loaders
            .borrow()
            .get(&TypeId::of::<L>())?
            .downcast_ref::<HashMap<L::Args, LoaderRef<L>>>()?
            .get(args)
            .cloned()
    }

    /// Number of loaders currently waiting to be drained.
    pub fn queued_loaders(&self) -> usize {
        self.inner.ready.borrow().len()
    }

    pub(crate) fn enqueue(&self, loader: Rc<dyn Drain>) {
        self.inner.ready.borrow_mut().push_back(loader);
    }

    /// Drop every loader and queued batch.
    ///
    /// Values still waiting on a fetch are rejected with
    /// [`Error::Cancelled`]. `LoaderRef`s that outlive the clear keep
    /// working: new loads on them are queued on this executor again.
    pub fn clear(&self) {
        let loaders = mem::take(&mut *self.inner.loaders.borrow_mut());
        let registered = mem::take(&mut *self.inner.registered.borrow_mut());
        let ready = mem::take(&mut *self.inner.ready.borrow_mut());

        if !ready.is_empty() {
            warn!(
                queued = ready.len(),
                "clearing executor with loaders still queued"
            );
        }

        drop(ready);
        drop(loaders);

        // No executor state is borrowed here; cancelling runs continuations.
        for loader in registered {
            loader.cancel();
        }
    }

    pub(crate) fn downgrade(&self) -> WeakExecutor {
        WeakExecutor(Rc::downgrade(&self.inner))
    }

    /// Run continuations of a settling value. The loading flag is cleared
    /// while they run, so loads issued from a continuation are not mistaken
    /// for loads issued by a `perform`.
    pub(crate) fn run_continuations(continuations: impl FnOnce()) {
        match Executor::current() {
            Some(executor) => {
                let _loading = LoadingFlag::set(&executor.inner.loading, false);
                continuations();
            }
            None => continuations(),
        }
    }
}

/// A loader's handle back to its executor. Loaders live inside the
/// executor, so they only hold it weakly.
#[derive(Debug, Clone)]
pub(crate) struct WeakExecutor(Weak<Inner>);

impl WeakExecutor {
    pub(crate) fn upgrade(&self) -> Option<Executor> {
        self.0.upgrade().map(|inner| Executor { inner })
    }
}

/// Sets the loading flag, restoring the previous value when dropped.
struct LoadingFlag<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> LoadingFlag<'a> {
    fn set(flag: &'a Cell<bool>, value: bool) -> Self {
        Self {
            flag,
            previous: flag.replace(value),
        }
    }
}

impl Drop for LoadingFlag<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// Returned by [`Executor::enter`]. While alive, its executor is current.
#[must_use = "the executor stops being current as soon as the scope is dropped"]
#[derive(Debug)]
pub struct ExecutorScope {
    executor: Executor,
    previous: Option<Executor>,
}

impl ExecutorScope {
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl Drop for ExecutorScope {
    fn drop(&mut self) {
        debug!("leaving executor");
        Executor::set_current(self.previous.take());
        self.executor.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loading_flag_restores_previous_value() {
        let flag = Cell::new(false);
        {
            let _outer = LoadingFlag::set(&flag, true);
            {
                let _inner = LoadingFlag::set(&flag, false);
                assert!(!flag.get());
            }
            assert!(flag.get());
        }
        assert!(!flag.get());
    }

    #[test]
    fn scope_restores_previous_executor() {
        let outer = Executor::new();
        let inner = Executor::new();

        let _outer_scope = outer.enter();
        {
            let _inner_scope = inner.enter();
            assert_eq!(Executor::current(), Some(inner.clone()));
        }
        assert_eq!(Executor::current(), Some(outer.clone()));
    }

    #[test]
    fn weak_handle_dies_with_executor() {
        let executor = Executor::new();
        let weak = executor.downgrade();
        assert_eq!(weak.upgrade(), Some(executor.clone()));

        drop(executor);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn tick_on_idle_executor() {
        let executor = Executor::new();
        assert!(!executor.tick());
        assert!(!executor.loading());
    }
}
