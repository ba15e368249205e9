//! Compute-once cells for expensive, side-effecting pipeline stages
//!
//! A [`Memo`] starts out `NotStarted`. The first caller of
//! [`Memo::get_or_init`] moves it to `InFlight` while holding a short
//! synchronous lock, so exactly one initializer runs even when several
//! tasks race on first access. Everyone else awaits the same shared
//! future, and the outcome (value or error) is kept forever: failures are
//! never retried.

use crate::error::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::{Mutex, PoisonError};

enum State<T> {
    NotStarted,
    InFlight(Shared<BoxFuture<'static, Result<T>>>),
    Done(Result<T>),
}

pub struct Memo<T> {
    state: Mutex<State<T>>,
}

impl<T> Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::NotStarted),
        }
    }

    /// A cell whose value is already known (e.g. literal in the configuration)
    pub fn ready(value: T) -> Self {
        Self {
            state: Mutex::new(State::Done(Ok(value))),
        }
    }

    pub fn from_option(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::ready(v),
            None => Self::new(),
        }
    }

    /// Return the memoized result, running `init` if nobody has started it yet
    pub async fn get_or_init<F, Fut>(&self, init: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let shared = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match &*state {
                State::Done(result) => return result.clone(),
                State::InFlight(fut) => fut.clone(),
                State::NotStarted => {
                    let fut = init().boxed().shared();
                    *state = State::InFlight(fut.clone());
                    fut
                }
            }
        };

        let result = shared.await;

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(*state, State::InFlight(_)) {
            *state = State::Done(result.clone());
        }
        result
    }

    /// The value, if the cell completed successfully
    pub fn peek(&self) -> Option<T> {
        match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::Done(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::Done(_)
        )
    }

    pub fn is_started(&self) -> bool {
        !matches!(
            *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            State::NotStarted
        )
    }
}

impl<T> Default for Memo<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock().unwrap_or_else(PoisonError::into_inner) {
            State::NotStarted => "NotStarted",
            State::InFlight(_) => "InFlight",
            State::Done(Ok(_)) => "Done(Ok)",
            State::Done(Err(_)) => "Done(Err)",
        };
        f.debug_tuple("Memo").field(&state).finish()
    }
}
