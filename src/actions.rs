use std::sync::{Mutex, PoisonError};

use crate::page::Page;

pub(crate) struct PostponedAction {
    pub(crate) page: Page,
    pub(crate) run: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct BufferState {
    in_call: bool,
    queue: Vec<PostponedAction>,
}

#[derive(Default)]
pub(crate) struct ActionBuffer {
    state: Mutex<BufferState>,
}

impl ActionBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).in_call = true;
    }

    pub(crate) fn take_finished(&self) -> Vec<PostponedAction> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_call = false;
        std::mem::take(&mut state.queue)
    }

    pub(crate) fn push(&self, action: PostponedAction) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.in_call {
            return false;
        }
        state.queue.push(action);
        true
    }

    pub(crate) fn clear(&self) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).queue.clear();
    }
}
