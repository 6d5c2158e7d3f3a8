//! A settle-once value with synchronous continuations.

use std::{
    any::type_name,
    cell::{Cell, RefCell},
    fmt::{self, Debug, Formatter},
    future::Future,
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use crate::{
    error::{Error, Result},
    executor::Executor,
};

type Continuation<T> = Box<dyn FnOnce(Result<T>)>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Fulfilled(T),
    Rejected(Error),
}

/// A value that may not be known yet.
///
/// A `Deferred` starts out pending and is settled exactly once, either
/// fulfilled with a value or rejected with an [`Error`]. Continuations
/// registered with [`then`] and friends run synchronously, in registration
/// order, at the moment the value settles; registering one on an already
/// settled value runs it immediately.
///
/// `Deferred` is a cheap handle: cloning it yields another handle onto the
/// same value. Values are cloned out to each continuation, which is why most
/// methods require `T: Clone`.
///
/// Values are normally created by [`LoaderRef::load`] and forced with
/// [`sync`], which drives the current [`Executor`] until the value settles.
///
/// [`then`]: Deferred::then
/// [`sync`]: Deferred::sync
/// [`LoaderRef::load`]: crate::LoaderRef::load
pub struct Deferred<T> {
    state: Rc<RefCell<State<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<T: Debug> Debug for Deferred<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &*self.state.borrow() {
            State::Pending(continuations) => f
                .debug_struct("Deferred::Pending")
                .field("continuations", &continuations.len())
                .finish(),
            State::Fulfilled(value) => f.debug_tuple("Deferred::Fulfilled").field(value).finish(),
            State::Rejected(err) => f.debug_tuple("Deferred::Rejected").field(err).finish(),
        }
    }
}

impl<T: Clone + 'static> Deferred<T> {
    pub(crate) fn pending() -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Pending(Vec::new()))),
        }
    }

    /// An already fulfilled value.
    pub fn fulfilled(value: T) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Fulfilled(value))),
        }
    }

    /// An already rejected value.
    pub fn rejected(err: Error) -> Self {
        Self {
            state: Rc::new(RefCell::new(State::Rejected(err))),
        }
    }

    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Self::fulfilled(value),
            Err(err) => Self::rejected(err),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::Pending(..))
    }

    /// The fulfilled value, if there is one yet.
    pub fn value(&self) -> Option<T> {
        match &*self.state.borrow() {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection error, if the value was rejected.
    pub fn error(&self) -> Option<Error> {
        match &*self.state.borrow() {
            State::Rejected(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub(crate) fn outcome(&self) -> Option<Result<T>> {
        match &*self.state.borrow() {
            State::Pending(..) => None,
            State::Fulfilled(value) => Some(Ok(value.clone())),
            State::Rejected(err) => Some(Err(err.clone())),
        }
    }

    /// Settle this value and run its continuations. Returns false, without
    /// doing anything, if it was already settled.
    pub(crate) fn settle(&self, result: Result<T>) -> bool {
        let continuations = {
            let mut state = self.state.borrow_mut();
            let continuations = match &mut *state {
                State::Pending(continuations) => mem::take(continuations),
                _ => return false,
            };

            *state = match &result {
                Ok(value) => State::Fulfilled(value.clone()),
                Err(err) => State::Rejected(err.clone()),
            };
            continuations
        };

        if !continuations.is_empty() {
            Executor::run_continuations(move || {
                continuations
                    .into_iter()
                    .for_each(|continuation| continuation(result.clone()))
            });
        }

        true
    }

    /// Register a raw continuation. The state borrow is released before the
    /// continuation runs, so it is free to register more continuations or
    /// settle other values.
    fn subscribe(&self, continuation: impl FnOnce(Result<T>) + 'static) {
        let mut state = self.state.borrow_mut();
        let outcome = match &mut *state {
            State::Pending(continuations) => {
                continuations.push(Box::new(continuation));
                return;
            }
            State::Fulfilled(value) => Ok(value.clone()),
            State::Rejected(err) => Err(err.clone()),
        };
        drop(state);

        Executor::run_continuations(move || continuation(outcome));
    }

    /// Transform the fulfilled value. The returned value is rejected if this
    /// one is rejected, or if `on_fulfilled` returns an error.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U> + 'static,
    {
        self.then_or_else(on_fulfilled, Err)
    }

    /// Like [`then`][Deferred::then], with a handler for rejection as well.
    /// `on_rejected` may recover by returning `Ok`.
    pub fn then_or_else<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U> + 'static,
        R: FnOnce(Error) -> Result<U> + 'static,
    {
        let next = Deferred::pending();
        let target = next.clone();

        self.subscribe(move |outcome| {
            let result = match outcome {
                Ok(value) => on_fulfilled(value),
                Err(err) => on_rejected(err),
            };
            target.settle(result);
        });

        next
    }

    /// Chain a continuation that produces another deferred value, typically
    /// by loading something keyed on this value. The returned value settles
    /// when the inner one does.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Deferred<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U> + 'static,
    {
        let next = Deferred::pending();
        let target = next.clone();

        self.subscribe(move |outcome| match outcome {
            Ok(value) => on_fulfilled(value).subscribe(move |inner| {
                target.settle(inner);
            }),
            Err(err) => {
                target.settle(Err(err));
            }
        });

        next
    }

    /// Recover from a rejection. Fulfilled values pass through.
    pub fn or_else<R>(&self, on_rejected: R) -> Deferred<T>
    where
        R: FnOnce(Error) -> Result<T> + 'static,
    {
        self.then_or_else(Ok, on_rejected)
    }

    /// Join several values into one.
    ///
    /// Fulfills with every value, in input order, once all inputs are
    /// fulfilled. Rejects with the first rejection observed; inputs settling
    /// after that are ignored. An empty input fulfills immediately.
    pub fn all(values: impl IntoIterator<Item = Deferred<T>>) -> Deferred<Vec<T>> {
        let values: Vec<Deferred<T>> = values.into_iter().collect();
        if values.is_empty() {
            return Deferred::fulfilled(Vec::new());
        }

        let joined = Deferred::pending();
        let slots: Rc<RefCell<Vec<Option<T>>>> = Rc::new(RefCell::new(vec![None; values.len()]));
        let remaining = Rc::new(Cell::new(values.len()));

        for (index, value) in values.iter().enumerate() {
            let joined = joined.clone();
            let slots = Rc::clone(&slots);
            let remaining = Rc::clone(&remaining);

            value.subscribe(move |outcome| match outcome {
                Ok(value) => {
                    slots.borrow_mut()[index] = Some(value);
                    remaining.set(remaining.get() - 1);

                    if remaining.get() == 0 {
                        let values = mem::take(&mut *slots.borrow_mut());
                        joined.settle(Ok(values.into_iter().flatten().collect()));
                    }
                }
                Err(err) => {
                    joined.settle(Err(err));
                }
            });
        }

        joined
    }

    /// Force this value.
    ///
    /// A settled value is returned (or its error raised) immediately.
    /// Otherwise the current executor drains queued batches one at a time
    /// until this value settles. Fails with [`Error::NoExecutor`] if there is
    /// no current executor, and with [`Error::BrokenPromise`] if the executor
    /// runs out of work while this value is still pending.
    pub fn sync(&self) -> Result<T> {
        if let Some(outcome) = self.outcome() {
            return outcome;
        }

        Executor::current().ok_or(Error::NoExecutor)?.wait(self)
    }
}

/// Polling a pending `Deferred` drives at most one batch on the current
/// executor, then wakes the polling task so it can drive the next one.
impl<T: Clone + 'static> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.outcome() {
            return Poll::Ready(outcome);
        }

        let executor = match Executor::current() {
            Some(executor) => executor,
            None => return Poll::Ready(Err(Error::NoExecutor)),
        };

        if !executor.tick() {
            return Poll::Ready(Err(Error::BrokenPromise {
                type_name: type_name::<Self>(),
            }));
        }

        match self.outcome() {
            Some(outcome) => Poll::Ready(outcome),
            None => {
                ctx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }
}
