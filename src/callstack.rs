//! Call stack capture at panic sites.
//!
//! Unwinding destroys the frames that led to a panic before any
//! `catch_unwind` returns, so the stack has to be taken from inside the
//! panic hook. [`catch_panic`] marks the current thread as guarded and the
//! hook installed by [`install_hook`] stores the stack of a guarded panic in
//! a thread-local slot for the guard to pick up.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Once,
};

/// Maximum number of frames kept in a [`Callstack`].
pub const MAX_FRAMES: usize = 20;

const UNKNOWN_FUNCTION: &str = "<unknown>";

/// Leading frames belonging to the unwinder, the capture itself and the
/// standard library panic machinery. They are skipped until the first foreign
/// frame.
const MACHINERY_PREFIXES: &[&str] = &[
    "backtrace::",
    concat!(module_path!(), "::Callstack::capture"),
    concat!(module_path!(), "::install_hook"),
    concat!(module_path!(), "::catch_panic"),
    "std::panicking::",
    "std::panic::",
    "std::sys::",
    "std::sys_common::",
    "std::rt::",
    "core::panicking::",
    "core::panic::",
    "rust_begin_unwind",
    "__rustc::",
];

thread_local! {
    static GUARD_DEPTH: Cell<usize> = const { Cell::new(0) };
    static PANIC_SITE: RefCell<Option<Callstack>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// A single resolved stack frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: String,
    pub line: u32,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.function, self.line)
    }
}

/// Ordered frames, innermost first, rendered one `function: line` per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Callstack {
    frames: Vec<Frame>,
}

impl Callstack {
    /// Captures the stack of the caller, at most [`MAX_FRAMES`] deep.
    #[inline(never)]
    pub fn capture() -> Self {
        Self::capture_bounded(MAX_FRAMES)
    }

    fn capture_bounded(limit: usize) -> Self {
        let mut frames = Vec::with_capacity(limit);
        let mut skipping = true;

        backtrace::trace(|frame| {
            backtrace::resolve_frame(frame, |symbol| {
                if frames.len() >= limit {
                    return;
                }
                let function = symbol
                    .name()
                    .map(|name| format!("{name:#}"))
                    .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
                if skipping && is_machinery(&function) {
                    return;
                }
                skipping = false;
                frames.push(Frame {
                    function,
                    line: symbol.lineno().unwrap_or(0),
                });
            });
            frames.len() < limit
        });

        Callstack { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Display for Callstack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}

fn is_machinery(function: &str) -> bool {
    function == UNKNOWN_FUNCTION
        || MACHINERY_PREFIXES.iter().any(|p| function.starts_with(p))
        || is_boxed_fn_call(function)
}

/// The shim calling the boxed panic hook, e.g.
/// `<alloc::boxed::Box<dyn for<'a, 'b> core::ops::function::Fn<..>> as core::ops::function::Fn<..>>::call`.
fn is_boxed_fn_call(function: &str) -> bool {
    function.starts_with("<alloc::boxed::Box<") && function.contains(" as core::ops::function::Fn")
}

/// A panic caught by [`catch_panic`].
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub message: String,
    pub callstack: Callstack,
}

impl PanicReport {
    fn new(payload: Box<dyn Any + Send>, callstack: Callstack) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Box<dyn Any>".to_string()
        };

        PanicReport { message, callstack }
    }
}

/// Installs the process-wide panic hook recording panic sites of guarded
/// threads. The previously installed hook keeps running after it.
///
/// Idempotent.
pub fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if GUARD_DEPTH.with(Cell::get) > 0 {
                let callstack = Callstack::capture();
                PANIC_SITE.with(|site| *site.borrow_mut() = Some(callstack));
            }
            previous(info);
        }));
    });
}

/// Runs `f`, catching a panic raised inside it.
///
/// The returned report carries the stack of the panic site if the hook from
/// [`install_hook`] ran, otherwise the stack at this call.
pub fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, PanicReport> {
    // A panic caught by a nested `catch_unwind` leaves its stack behind.
    PANIC_SITE.with(|site| site.borrow_mut().take());

    GUARD_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    GUARD_DEPTH.with(|depth| depth.set(depth.get() - 1));

    let panic_site = PANIC_SITE.with(|site| site.borrow_mut().take());
    match result {
        Ok(value) => Ok(value),
        Err(payload) => {
            let callstack = match panic_site {
                Some(callstack) => callstack,
                None => Callstack::capture(),
            };
            Err(PanicReport::new(payload, callstack))
        }
    }
}
