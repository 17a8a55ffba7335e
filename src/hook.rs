//! Process-wide trace/error hook, the runtime's only ambient logging
//! concern — there is no `log`/`tracing` dependency to wire up, matching
//! the plain message-kind callback the rest of the system uses.

use std::fmt;
use std::sync::OnceLock;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Kind {
    Trace,
    Error,
}

pub type Hook = fn(Kind, &str);

static HOOK: OnceLock<Hook> = OnceLock::new();

fn default_hook(kind: Kind, message: &str) {
    match kind {
        Kind::Trace => eprintln!("[trace] {}", message),
        Kind::Error => eprintln!("[error] {}", message),
    }
}

/// Installs the process-wide hook. Can only be called once; later calls
/// are ignored, matching the source system's assign-once global.
pub fn set_hook(hook: Hook) {
    let _ = HOOK.set(hook);
}

fn hook() -> Hook {
    *HOOK.get_or_init(|| default_hook)
}

pub(crate) fn trace(args: fmt::Arguments<'_>) {
    hook()(Kind::Trace, &args.to_string());
}

pub(crate) fn error(args: fmt::Arguments<'_>) {
    hook()(Kind::Error, &args.to_string());
}

macro_rules! trace {
    ($($arg:tt)*) => {
        $crate::hook::trace(format_args!($($arg)*))
    };
}

macro_rules! error {
    ($($arg:tt)*) => {
        $crate::hook::error(format_args!($($arg)*))
    };
}

pub(crate) use error;
pub(crate) use trace;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_hook(_kind: Kind, _message: &str) {
        CALLS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn default_hook_does_not_panic() {
        default_hook(Kind::Trace, "hello");
        default_hook(Kind::Error, "world");
    }

    #[test]
    fn trace_and_error_macros_invoke_the_hook() {
        // exercised indirectly: a fresh process-wide OnceLock means we
        // can't deterministically assert which hook is installed here
        // without racing other tests, so just check the call compiles
        // and does not panic.
        trace!("value = {}", 42);
        error!("oops: {}", "bad");
        let _ = counting_hook;
    }
}
