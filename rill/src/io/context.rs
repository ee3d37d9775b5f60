//! Thread-local access to the poller-thread state.
//!
//! Every handle mutation (close, interest changes, back-pressure resume)
//! is marshaled onto the dispatcher thread by posting to its internal queue;
//! the posted task then reaches the live state through `with_core_mut`. No
//! other thread ever touches a `Core`.

use crate::io::core::Core;
use std::cell::RefCell;

thread_local! {
    static CORE: RefCell<Option<Core>> = const { RefCell::new(None) };
}

#[track_caller]
pub(crate) fn install_core(core: Core) {
    CORE.with(|cell| {
        let mut slot = cell.borrow_mut();
        assert!(
            slot.is_none(),
            "a dispatcher is already running on this thread"
        );
        *slot = Some(core);
    });
}

pub(crate) fn take_core() -> Option<Core> {
    CORE.with(|cell| cell.borrow_mut().take())
}

#[track_caller]
pub(crate) fn with_core_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Core) -> R,
{
    CORE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let core = slot
            .as_mut()
            .expect("not on a dispatcher thread (no core installed)");
        f(core)
    })
}

