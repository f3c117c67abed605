//! Execution-context-local trace state.
//!
//! Each execution context (one OS thread) owns its current [`Trace`] and a
//! stack of active spans, topmost innermost. Scoped operations restore the
//! previous state on every exit path, including unwinding, via drop guards.
//! Concurrent contexts never observe each other's state.
//!
//! Note: the closure passed to [`with_current_span`] holds the context
//! borrow; calling back into this module from inside it will panic.

use crate::ids::{SpanId, TraceId};
use crate::trace::span::Span;
use crate::trace::Trace;
use std::cell::RefCell;

thread_local! {
    static CURRENT_CONTEXT: RefCell<ScopedContext> = RefCell::new(ScopedContext::default());
}

/// Per-context trace state: the current trace and the active span stack.
#[derive(Debug, Default)]
pub struct ScopedContext {
    current_trace: Option<Trace>,
    span_stack: Vec<Span>,
}

/// The current trace, if any.
pub fn current_trace() -> Option<Trace> {
    CURRENT_CONTEXT.with(|cx| cx.borrow().current_trace.clone())
}

/// The current trace id, if any.
pub fn current_trace_id() -> Option<TraceId> {
    CURRENT_CONTEXT.with(|cx| cx.borrow().current_trace.as_ref().map(|t| t.trace_id))
}

/// Replace the current trace without touching the span stack.
pub fn set_current_trace(trace: Trace) {
    CURRENT_CONTEXT.with(|cx| cx.borrow_mut().current_trace = Some(trace));
}

/// The innermost active span's id, if any.
pub fn current_span_id() -> Option<SpanId> {
    CURRENT_CONTEXT.with(|cx| cx.borrow().span_stack.last().map(|s| s.span_id()))
}

/// Apply `f` to the innermost active span.
pub fn with_current_span<T>(f: impl FnOnce(&mut Span) -> T) -> Option<T> {
    CURRENT_CONTEXT.with(|cx| cx.borrow_mut().span_stack.last_mut().map(f))
}

/// Push a span onto the active stack.
pub fn push_span(span: Span) {
    CURRENT_CONTEXT.with(|cx| cx.borrow_mut().span_stack.push(span));
}

/// Pop the innermost span off the active stack.
pub fn pop_span() -> Option<Span> {
    CURRENT_CONTEXT.with(|cx| cx.borrow_mut().span_stack.pop())
}

/// Run `f` with `span` as the innermost active span.
///
/// The span is popped on every exit path. On normal return it is handed
/// back alongside the closure's result; if `f` unwinds, the pop still
/// happens (discarding the span) and the panic resumes.
pub fn with_span<T>(span: Span, f: impl FnOnce() -> T) -> (Option<Span>, T) {
    push_span(span);
    let mut guard = PopGuard { armed: true };
    let value = f();
    guard.armed = false;
    (pop_span(), value)
}

/// Run `f` under `trace` with an empty span stack, restoring the previous
/// trace and stack afterwards, also when `f` unwinds.
pub fn with_trace<T>(trace: Trace, f: impl FnOnce() -> T) -> T {
    let saved = CURRENT_CONTEXT.with(|cx| {
        let mut cx = cx.borrow_mut();
        let prev_trace = cx.current_trace.replace(trace);
        let prev_stack = std::mem::take(&mut cx.span_stack);
        (prev_trace, prev_stack)
    });
    let _guard = RestoreGuard { saved: Some(saved) };
    f()
}

/// Drop the current trace and all active spans.
pub fn clear() {
    CURRENT_CONTEXT.with(|cx| {
        let mut cx = cx.borrow_mut();
        cx.current_trace = None;
        cx.span_stack.clear();
    });
}

struct PopGuard {
    armed: bool,
}

impl Drop for PopGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = pop_span();
        }
    }
}

struct RestoreGuard {
    saved: Option<(Option<Trace>, Vec<Span>)>,
}

impl Drop for RestoreGuard {
    fn drop(&mut self) {
        if let Some((trace, stack)) = self.saved.take() {
            CURRENT_CONTEXT.with(|cx| {
                let mut cx = cx.borrow_mut();
                cx.current_trace = trace;
                cx.span_stack = stack;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::span::SpanCategory;

    fn make_span(name: &str) -> Span {
        Span::start(
            name,
            SpanCategory::Internal,
            TraceId::random(),
            None,
            Vec::new(),
        )
    }

    #[test]
    fn push_pop_follow_stack_order() {
        clear();
        let a = make_span("a");
        let b = make_span("b");
        let a_id = a.span_id();
        let b_id = b.span_id();

        push_span(a);
        assert_eq!(current_span_id(), Some(a_id));
        push_span(b);
        assert_eq!(current_span_id(), Some(b_id));
        assert_eq!(pop_span().map(|s| s.span_id()), Some(b_id));
        assert_eq!(current_span_id(), Some(a_id));
        clear();
    }

    #[test]
    fn with_span_restores_previous_current() {
        clear();
        let outer = make_span("outer");
        let outer_id = outer.span_id();
        push_span(outer);

        let inner = make_span("inner");
        let inner_id = inner.span_id();
        let (popped, _) = with_span(inner, || {
            assert_eq!(current_span_id(), Some(inner_id));
        });
        assert_eq!(popped.map(|s| s.span_id()), Some(inner_id));
        assert_eq!(current_span_id(), Some(outer_id));
        clear();
    }

    #[test]
    fn with_span_restores_on_panic() {
        clear();
        let outer = make_span("outer");
        let outer_id = outer.span_id();
        push_span(outer);

        let result = std::panic::catch_unwind(|| {
            with_span(make_span("inner"), || panic!("boom"));
        });
        assert!(result.is_err());
        assert_eq!(current_span_id(), Some(outer_id));
        clear();
    }

    #[test]
    fn with_trace_swaps_trace_and_stack() {
        clear();
        let original = Trace::with_sample_rate(None, Some(true), 1.0);
        set_current_trace(original.clone());
        push_span(make_span("outer"));

        let scoped = Trace::with_sample_rate(None, Some(false), 1.0);
        with_trace(scoped.clone(), || {
            assert_eq!(current_trace(), Some(scoped.clone()));
            assert_eq!(current_span_id(), None);
            push_span(make_span("inner"));
        });

        assert_eq!(current_trace(), Some(original));
        assert!(current_span_id().is_some());
        clear();
    }

    #[test]
    fn with_trace_restores_on_panic() {
        clear();
        let original = Trace::with_sample_rate(None, Some(true), 1.0);
        set_current_trace(original.clone());

        let scoped = Trace::with_sample_rate(None, Some(true), 1.0);
        let result = std::panic::catch_unwind(|| {
            with_trace(scoped, || panic!("boom"));
        });
        assert!(result.is_err());
        assert_eq!(current_trace(), Some(original));
        clear();
    }

    #[test]
    fn contexts_are_isolated_between_threads() {
        clear();
        set_current_trace(Trace::with_sample_rate(None, Some(true), 1.0));
        let handle = std::thread::spawn(|| current_trace().is_none());
        assert!(handle.join().unwrap());
        clear();
    }

    #[test]
    fn with_current_span_mutates_top_of_stack() {
        clear();
        push_span(make_span("top"));
        with_current_span(|span| span.add_attribute("touched", true));
        let span = pop_span().unwrap();
        assert_eq!(span.attributes().len(), 1);
        clear();
    }
}
