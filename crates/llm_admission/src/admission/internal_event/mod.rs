//! Metrics and log events emitted by the admission controller.

mod admission;

pub use admission::*;

/// An observation that records itself to the `metrics` facade and logs.
pub trait InternalEvent: Sized {
    fn emit(self);
}

pub fn emit(event: impl InternalEvent) {
    event.emit();
}
