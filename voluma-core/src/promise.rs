//! Single-use channel carrying one frame's texture from the video-decode
//! stage to the content-decode stage.
//!
//! A promise transitions out of `Open` exactly once, to either fulfilled or
//! aborted. The content-decode stage blocks in [`TextureFramePromise::wait`]
//! until that happens; seek and shutdown paths abort open promises so that
//! the wait never hangs.

use std::sync::{Arc, Condvar, Mutex};

use tracing::error;

use crate::av1::Av1Picture;

/// The texture delivered for one frame.
#[derive(Debug)]
pub enum TexturePayload {
    /// A decoded AV1 picture (I420).
    Picture(Av1Picture),
    /// Zstd-decompressed raw RGB data.
    Rgb(Vec<u8>),
    /// The frame has no texture (its compressed texture size is zero).
    Empty,
}

/// Observable promise state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseStatus {
    Open,
    Fulfilled,
    Aborted,
}

enum State {
    Open,
    Fulfilled(TexturePayload),
    /// The payload was handed out by `wait`.
    Consumed,
    Aborted,
}

struct Inner {
    state: Mutex<State>,
    transitioned: Condvar,
}

/// Cloneable handle to the single-use texture channel.
#[derive(Clone)]
pub struct TextureFramePromise {
    inner: Arc<Inner>,
}

impl TextureFramePromise {
    /// Creates an open promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Open),
                transitioned: Condvar::new(),
            }),
        }
    }

    /// Creates an already-fulfilled promise, for the case where the texture
    /// arrived before the content-decode stage asked for it.
    pub fn fulfilled(payload: TexturePayload) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::Fulfilled(payload)),
                transitioned: Condvar::new(),
            }),
        }
    }

    /// Fulfills the promise. Fulfilling a promise that already left the open
    /// state is a contract violation; the payload is dropped.
    pub fn fulfill(&self, payload: TexturePayload) {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, State::Open) {
            error!("fulfill() called on a texture promise that is not open");
            return;
        }
        *state = State::Fulfilled(payload);
        drop(state);
        self.inner.transitioned.notify_all();
    }

    /// Aborts the promise, waking any waiter with `None`.
    pub fn abort(&self) {
        let mut state = self.inner.state.lock().unwrap();
        if !matches!(*state, State::Open) {
            error!("abort() called on a texture promise that is not open");
            return;
        }
        *state = State::Aborted;
        drop(state);
        self.inner.transitioned.notify_all();
    }

    /// Blocks until the promise leaves the open state. Returns the payload,
    /// or `None` if the promise was aborted.
    pub fn wait(&self) -> Option<TexturePayload> {
        let mut state = self.inner.state.lock().unwrap();
        while matches!(*state, State::Open) {
            state = self.inner.transitioned.wait(state).unwrap();
        }

        match std::mem::replace(&mut *state, State::Consumed) {
            State::Fulfilled(payload) => Some(payload),
            State::Aborted => {
                *state = State::Aborted;
                None
            }
            State::Consumed => {
                error!("wait() called on a texture promise that was already consumed");
                None
            }
            State::Open => unreachable!("the wait loop only exits on a transition"),
        }
    }

    /// The promise's current status, without blocking.
    pub fn status(&self) -> PromiseStatus {
        match &*self.inner.state.lock().unwrap() {
            State::Open => PromiseStatus::Open,
            State::Fulfilled(_) | State::Consumed => PromiseStatus::Fulfilled,
            State::Aborted => PromiseStatus::Aborted,
        }
    }
}

impl Default for TextureFramePromise {
    fn default() -> Self {
        Self::new()
    }
}
