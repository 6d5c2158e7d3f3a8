//! Batchsync is a request-scoped, synchronous take on the
//! [dataloader pattern](https://github.com/graphql/dataloader). Independent
//! pieces of resolution code each ask for a single item by key; the keys
//! requested against one data source during a pass of computation are
//! coalesced into a single grouped fetch, and every distinct
//! (loader, key) pair is fetched at most once per request. The common use
//! case is resolving a GraphQL query without the N+1 problem, but it works
//! anywhere a lot of small, independently written functions need data keyed
//! by values they only learn at run time.
//!
//! ## Overview
//!
//! There are three moving parts:
//!
//! - A [`Loader`] is the fetch logic for one data source. Its
//!   [`perform`][Loader::perform] receives every queued key at once and must
//!   settle each of them.
//! - A [`Deferred`] is a value that may not be known yet. [`LoaderRef::load`]
//!   returns one immediately, without fetching anything. Continuations
//!   chained with [`then`][Deferred::then] transform the eventual value, and
//!   [`sync`][Deferred::sync] forces it.
//! - An [`Executor`] holds the state of one request: its loaders, and the
//!   queue of loaders with keys waiting to be fetched. Forcing a value
//!   drains that queue, one grouped fetch at a time, until the value
//!   settles.
//!
//! Suppose a store can look up many users in one round trip:
//!
//! ```
//! use std::collections::HashMap;
//!
//! use batchsync::{Batch, Deferred, Executor, Loader, Result};
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct User {
//!     id: u32,
//!     name: String,
//!     manager: Option<u32>,
//! }
//!
//! fn fetch_users(ids: impl Iterator<Item = u32>) -> HashMap<u32, User> {
//!     ids.map(|id| {
//!         let user = User {
//!             id,
//!             name: format!("user-{}", id),
//!             manager: if id > 1 { Some(id / 2) } else { None },
//!         };
//!         (id, user)
//!     })
//!     .collect()
//! }
//!
//! struct UserLoader;
//!
//! impl Loader for UserLoader {
//!     type Args = ();
//!     type Key = u32;
//!     type Value = Option<User>;
//!
//!     fn new(_args: ()) -> Self {
//!         UserLoader
//!     }
//!
//!     fn perform(&self, batch: &Batch<'_, Self>) -> Result<()> {
//!         let mut users = fetch_users(batch.keys().keys().copied());
//!         batch.fulfill_with(|id| users.remove(id))
//!     }
//! }
//!
//! // One executor per request.
//! let executor = Executor::new();
//! let _scope = executor.enter();
//!
//! let users = UserLoader::for_args(()).unwrap();
//!
//! // Each of these could come from a different resolver. Nothing has been
//! // fetched yet.
//! let manager_name: Deferred<Option<String>> = users.load(6).and_then(|user| {
//!     let manager = user.and_then(|user| user.manager);
//!     match manager {
//!         Some(id) => UserLoader::for_args(())
//!             .unwrap()
//!             .load(id)
//!             .then(|manager| Ok(manager.map(|manager| manager.name))),
//!         None => Deferred::fulfilled(None),
//!     }
//! });
//! let other = users.load(7);
//!
//! // Users 6 and 7 are fetched together; user 3 in a second batch.
//! assert_eq!(manager_name.sync().unwrap().as_deref(), Some("user-3"));
//! assert_eq!(other.value().flatten().map(|user| user.id), Some(7));
//! ```
//!
//! ## Design notes
//!
//! ### Single-threaded by construction
//!
//! Everything in a request lives on one thread: deferred values, loaders and
//! the executor are `Rc`-based and `!Send`. There are no locks, because there
//! is nothing to race with; concurrent requests each create their own
//! executor. The *current* executor is a per-thread handle, assigned with
//! [`Executor::enter`], which restores the previous one and tears the
//! request down when its scope is dropped.
//!
//! ### Foreground, synchronous driving
//!
//! No fetch is scheduled in the background. [`Deferred::sync`] drives the
//! work directly: while its value is pending it asks the executor to drain
//! the first queued loader, which runs that loader's `perform`, which
//! settles values, which runs their continuations, which may queue more
//! keys. Chains of dependent batches (load a parent, then load its children)
//! therefore resolve in one `sync` call without the caller managing
//! iteration. Loaders are drained in the order they were queued.
//!
//! `Deferred` also implements [`Future`][std::future::Future], driving one
//! batch per poll, for hosts whose own execution model is poll-based.
//!
//! ### Settlement is checked, not trusted
//!
//! A `perform` that returns without settling a key would leave that key
//! pending forever. Instead, such keys are rejected with
//! [`Error::UnfulfilledKey`], and a `sync` whose value can no longer be
//! settled by any queued work fails with [`Error::BrokenPromise`] rather
//! than spinning. That failure belongs to the `sync` call, not the value:
//! the value stays pending, and the loader that owns it can still fulfill
//! it later.
//!
//! Clearing an executor, which dropping its scope does, rejects every value
//! still waiting on a fetch with [`Error::Cancelled`].
//!
//! ### The loading flag
//!
//! [`Executor::loading`] is true while a `perform` runs, so loaders can tell
//! whether they are being called from inside another batch. The flag does
//! *not* cover continuations, even those that run synchronously inside a
//! `perform` because it called `fulfill` or `reject`. They run with the flag
//! cleared, and the previous value comes back once they return:
//!
//! ```
//! use std::{cell::Cell, rc::Rc};
//!
//! use batchsync::{Batch, Executor, Loader, Result};
//!
//! struct Echo;
//!
//! impl Loader for Echo {
//!     type Args = ();
//!     type Key = u8;
//!     type Value = u8;
//!
//!     fn new(_args: ()) -> Self {
//!         Echo
//!     }
//!
//!     fn perform(&self, batch: &Batch<'_, Self>) -> Result<()> {
//!         assert!(Executor::is_loading());
//!         batch.fulfill_with(|key| *key)?;
//!         assert!(Executor::is_loading());
//!         Ok(())
//!     }
//! }
//!
//! let _scope = Executor::new().enter();
//! let seen = Rc::new(Cell::new(None));
//! let sink = Rc::clone(&seen);
//!
//! Echo::for_args(())
//!     .unwrap()
//!     .load(1)
//!     .then(move |_| {
//!         sink.set(Some(Executor::is_loading()));
//!         Ok(())
//!     })
//!     .sync()
//!     .unwrap();
//!
//! assert_eq!(seen.get(), Some(false));
//! ```
//!
//! A load issued from a continuation is therefore treated as an ordinary
//! resolver load. Hosts that need to know whether a continuation was
//! triggered from inside a batch must track that themselves.

mod data;
mod deferred;
mod error;
mod executor;
mod loader;

pub use data::{KeySet, KeyedEntry, OnDuplicate};
pub use deferred::Deferred;
pub use error::{Error, Result};
pub use executor::{Executor, ExecutorScope};
pub use loader::{Batch, Loader, LoaderRef};
