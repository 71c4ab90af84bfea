use std::{
    any::Any,
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    rc::Rc,
};

use parse_display::Display;
use tracing::error;

/// Identifies where a captured failure originated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Display)]
pub enum ErrorCode {
    #[display("scheduler flush")]
    Scheduler,
    #[display("effect run")]
    Effect,
}

/// A failure captured from user code run under [`call_with_error_handling`].
pub struct CapturedError {
    pub code: ErrorCode,
    /// Name of the owner the failing job was attached to, if any.
    pub owner: Option<Rc<str>>,
    payload: Box<dyn Any + Send>,
}

impl CapturedError {
    /// The panic message, when the payload was a string.
    pub fn message(&self) -> Option<&str> {
        self.payload
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| self.payload.downcast_ref::<String>().map(String::as_str))
    }
}

impl std::fmt::Debug for CapturedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedError")
            .field("code", &self.code)
            .field("owner", &self.owner)
            .field("message", &self.message())
            .finish()
    }
}

type ErrorHandler = Box<dyn FnMut(&CapturedError)>;

struct ErrorHook {
    handler: Option<ErrorHandler>,
    rethrow: bool,
}

thread_local! {
    static HOOK: RefCell<ErrorHook> = RefCell::new(ErrorHook {
        handler: None,
        rethrow: false,
    });
}

/// Install the host error hook. Replaces any previously installed hook.
pub fn set_error_handler(handler: impl FnMut(&CapturedError) + 'static) {
    HOOK.with(|h| h.borrow_mut().handler = Some(Box::new(handler)));
}

/// Remove the host error hook, restoring the default log sink.
pub fn clear_error_handler() {
    HOOK.with(|h| h.borrow_mut().handler = None);
}

/// When enabled, panics captured during a drain are re-raised once the drain
/// finalizer has completed. Disabled by default: failures are routed to the
/// hook (or logged) and the drain continues.
pub fn rethrow_unhandled(enabled: bool) {
    HOOK.with(|h| h.borrow_mut().rethrow = enabled);
}

/// Run `f`, isolating a panic so the caller can continue.
///
/// The captured failure is routed to the installed hook, or logged when no
/// hook is installed. Returns the payload only when re-raising was requested
/// via [`rethrow_unhandled`]; the caller decides when to resume it.
pub fn call_with_error_handling(
    f: impl FnOnce(),
    owner: Option<Rc<str>>,
    code: ErrorCode,
) -> Option<Box<dyn Any + Send>> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => None,
        Err(payload) => {
            let err = CapturedError {
                code,
                owner,
                payload,
            };
            // The hook is taken out for the duration of the call so a hook
            // that itself fails cannot be re-entered through this path.
            let mut handler = HOOK.with(|h| h.borrow_mut().handler.take());
            match &mut handler {
                Some(handler) => handler(&err),
                None => error!(
                    code = %err.code,
                    owner = err.owner.as_deref().unwrap_or("<anonymous>"),
                    message = err.message().unwrap_or("<non-string panic payload>"),
                    "error in scheduled task",
                ),
            }
            HOOK.with(|h| {
                let mut h = h.borrow_mut();
                if h.handler.is_none() {
                    h.handler = handler;
                }
            });
            let CapturedError { payload, .. } = err;
            if HOOK.with(|h| h.borrow().rethrow) {
                Some(payload)
            } else {
                None
            }
        }
    }
}
