//! Stack traces for handler panics.
//!
//! By the time `catch_unwind` returns, the panicking frames are gone. A
//! process-wide panic hook records the location and a backtrace at the panic
//! site instead, but only while the current thread is polling a handler
//! chain wrapped by [`traced`]. Other panics pass straight to the previous
//! hook.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic;
use std::sync::Once;
use std::task::Poll;

/// Where a handler panicked.
#[derive(Debug)]
pub(crate) struct PanicTrace {
    pub(crate) location: Option<String>,
    pub(crate) backtrace: Backtrace,
}

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
    static LAST: RefCell<Option<PanicTrace>> = const { RefCell::new(None) };
}

/// Installs the recording hook once per process, chained to the previous one.
pub(crate) fn install() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if ARMED.with(Cell::get) {
                let trace = PanicTrace {
                    location: info.location().map(|l| l.to_string()),
                    backtrace: Backtrace::force_capture(),
                };
                LAST.with(|slot| *slot.borrow_mut() = Some(trace));
            }
            previous(info);
        }));
    });
}

/// Takes the trace recorded by the last armed panic on this thread.
pub(crate) fn take() -> Option<PanicTrace> {
    LAST.with(|slot| slot.borrow_mut().take())
}

struct Armed;

impl Armed {
    fn set() -> Self {
        ARMED.with(|armed| armed.set(true));
        Armed
    }
}

impl Drop for Armed {
    fn drop(&mut self) {
        ARMED.with(|armed| armed.set(false));
    }
}

/// Arms the hook for every poll of `fut`.
///
/// Arming is per poll, so it follows the task across worker threads.
pub(crate) fn traced<F: Future>(fut: F) -> impl Future<Output = F::Output> {
    let mut fut = Box::pin(fut);
    std::future::poll_fn(move |cx| -> Poll<F::Output> {
        let _armed = Armed::set();
        fut.as_mut().poll(cx)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;

    #[inline(never)]
    fn failing_step() {
        panic!("step failed");
    }

    #[tokio::test]
    async fn test_records_panic_site() {
        install();
        let _ = take();

        let res = AssertUnwindSafe(traced(async { failing_step() }))
            .catch_unwind()
            .await;
        assert!(res.is_err());

        let trace = take().expect("trace recorded");
        assert!(trace.location.unwrap().contains("panic_trace.rs"));
        assert!(trace.backtrace.to_string().contains("failing_step"));
        assert!(take().is_none());
    }

    #[test]
    fn test_unarmed_panic_is_not_recorded() {
        install();
        let _ = take();

        let res = panic::catch_unwind(|| failing_step());
        assert!(res.is_err());
        assert!(take().is_none());
    }
}
