//! Thread-local active span context.
//!
//! Attaching a span makes it the current span for the calling thread and
//! returns a [`ContextGuard`]. Dropping the guard restores whatever span was
//! active before, or none. Guards are `!Send`: the attach and the detach
//! always happen on the same thread.

use crate::span::Span;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::rc::Rc;

pub(crate) type SharedSpan = Rc<RefCell<Span>>;

thread_local! {
    static ACTIVE_SPANS: RefCell<ContextStack> = RefCell::new(ContextStack::default());
}

/// Stack of attached spans. Slots are cleared rather than removed when a
/// guard is dropped out of order, so positions held by other guards stay valid.
#[derive(Default)]
struct ContextStack {
    stack: Vec<Option<SharedSpan>>,
}

impl ContextStack {
    fn push(&mut self, span: SharedSpan) -> usize {
        self.stack.push(Some(span));
        self.stack.len()
    }

    fn pop_pos(&mut self, pos: usize) {
        if pos == 0 || pos > self.stack.len() {
            return;
        }
        if pos == self.stack.len() {
            self.stack.pop();
            while matches!(self.stack.last(), Some(None)) {
                self.stack.pop();
            }
        } else {
            self.stack[pos - 1] = None;
        }
    }

    fn current(&self) -> Option<&SharedSpan> {
        self.stack.iter().rev().find_map(Option::as_ref)
    }

    fn depth(&self) -> usize {
        self.stack.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Restores the previously active span when dropped.
#[must_use = "dropping the guard immediately detaches the span"]
pub struct ContextGuard {
    pos: usize,
    // Thread-local bookkeeping, so the guard must stay on this thread
    _marker: PhantomData<*const ()>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let pos = self.pos;
        // try_with: the thread-local may already be gone during thread teardown
        let _ = ACTIVE_SPANS.try_with(|stack| stack.borrow_mut().pop_pos(pos));
    }
}

/// Makes `span` the active span for this thread.
pub(crate) fn attach(span: SharedSpan) -> ContextGuard {
    let pos = ACTIVE_SPANS.with(|stack| stack.borrow_mut().push(span));
    ContextGuard {
        pos,
        _marker: PhantomData,
    }
}

/// Runs `f` against the active span, if any.
///
/// This is how handler code annotates the span the tracer opened for it.
///
/// ```ignore
/// apm_agent::context::with_active_span(|span| span.set_attribute("user.id", 42_i64));
/// ```
pub fn with_active_span<R>(f: impl FnOnce(&mut Span) -> R) -> Option<R> {
    let span = ACTIVE_SPANS.with(|stack| stack.borrow().current().cloned())?;
    let mut span = span.borrow_mut();
    Some(f(&mut span))
}

/// Name of the active span, if any.
pub fn active_span_name() -> Option<String> {
    with_active_span(|span| span.name().to_string())
}

/// Number of spans currently attached on this thread.
pub fn active_depth() -> usize {
    ACTIVE_SPANS.with(|stack| stack.borrow().depth())
}
