//! calloop backend for fence readiness.
//!
//! Each watch is a level-triggered [`Generic`] source on a duplicate of the
//! plane's DMA-BUF descriptor. The loop data implements
//! [`TransactionHandler`] so the source callback can reach the engine.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{Interest, LoopHandle, Mode, PostAction, RegistrationToken};
use weft_buffer_manager::PlaneFence;

use super::{FenceReactor, FenceWatch, PlaneKey};
use crate::error::TransactionError;
use crate::transaction::engine::TransactionEngine;

/// Implemented by the event loop's shared data.
pub trait TransactionHandler: Sized + 'static {
    fn transaction_engine(&mut self) -> &mut TransactionEngine<CalloopReactor<Self>>;
}

pub struct CalloopReactor<D: 'static> {
    handle: LoopHandle<'static, D>,
}

impl<D: 'static> CalloopReactor<D> {
    pub fn new(handle: LoopHandle<'static, D>) -> Self {
        Self { handle }
    }

    pub fn handle(&self) -> &LoopHandle<'static, D> {
        &self.handle
    }
}

impl<D: TransactionHandler> FenceReactor for CalloopReactor<D> {
    type Watch = CalloopWatch<D>;

    fn watch(&mut self, key: PlaneKey, fence: &dyn PlaneFence) -> Result<CalloopWatch<D>, TransactionError> {
        let fd = fence
            .as_fd()
            .ok_or_else(|| TransactionError::Reactor(format!("{key} has no pollable fence")))?
            .try_clone_to_owned()?;

        let state = Rc::new(WatchState::default());
        let callback_state = state.clone();
        let source = Generic::new(fd, Interest::READ, Mode::Level);
        let token = self
            .handle
            .insert_source(source, move |_readiness, _fd, data: &mut D| {
                callback_state.dispatching.set(true);
                data.transaction_engine().plane_ready(key);
                callback_state.dispatching.set(false);
                Ok(callback_state.post_action())
            })
            .map_err(|err| TransactionError::EventLoop(err.error))?;

        if let Err(err) = self.handle.disable(&token) {
            self.handle.remove(token);
            return Err(err.into());
        }
        tracing::trace!("Watching {} ({:?})", key, token);

        Ok(CalloopWatch {
            handle: self.handle.clone(),
            token,
            state,
        })
    }
}

/// Shared between a watch and its source callback.
///
/// calloop cannot re-register a source from inside that source's own
/// callback, so while it runs, changes are recorded here and handed back to
/// the loop as the callback's [`PostAction`].
#[derive(Debug, Default)]
struct WatchState {
    armed: Cell<bool>,
    dispatching: Cell<bool>,
    removed: Cell<bool>,
}

impl WatchState {
    fn post_action(&self) -> PostAction {
        if self.removed.get() {
            PostAction::Remove
        } else if self.armed.get() {
            PostAction::Continue
        } else {
            PostAction::Disable
        }
    }
}

pub struct CalloopWatch<D: 'static> {
    handle: LoopHandle<'static, D>,
    token: RegistrationToken,
    state: Rc<WatchState>,
}

impl<D: 'static> FenceWatch for CalloopWatch<D> {
    fn set_enabled(&mut self, enabled: bool) {
        if self.state.armed.replace(enabled) == enabled || self.state.dispatching.get() {
            return;
        }
        let result = if enabled {
            self.handle.enable(&self.token)
        } else {
            self.handle.disable(&self.token)
        };
        if let Err(err) = result {
            tracing::warn!("Failed to switch fence watch {:?}: {}", self.token, err);
        }
    }
}

impl<D: 'static> Drop for CalloopWatch<D> {
    fn drop(&mut self) {
        if self.state.dispatching.get() {
            self.state.removed.set(true);
        } else {
            self.handle.remove(self.token);
        }
    }
}

/// Periodically logs transactions that have been pending for too long.
pub fn install_stall_watchdog<D: TransactionHandler>(
    handle: &LoopHandle<'static, D>,
    interval: Duration,
) -> Result<RegistrationToken, TransactionError> {
    handle
        .insert_source(Timer::from_duration(interval), move |_deadline, _, data: &mut D| {
            data.transaction_engine().report_stalls(Instant::now());
            TimeoutAction::ToDuration(interval)
        })
        .map_err(|err| TransactionError::EventLoop(err.error))
}
