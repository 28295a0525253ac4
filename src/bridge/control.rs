//! Protect, ensure, rescue and tagged throw/catch over [`Flow`] results.
//!
//! Every non-local exit is an `Err(Unwind)` returned up the call chain.
//! Nothing here unwinds the native stack; panics are only ever seen at the
//! native surface, where they become fatal.

use std::cell::RefCell;

use tracing::debug;

use super::{BridgeError, Context, FatalError, Flow, Handle, Status, Unwind};
use crate::runtime::{StandardClass, Value};

thread_local! {
    /// Tags of the `catch` frames active on this thread, innermost last.
    static CATCH_TAGS: RefCell<Vec<Value>> = const { RefCell::new(Vec::new()) };
}

struct CatchFrame;

impl CatchFrame {
    fn enter(tag: Value) -> Self {
        CATCH_TAGS.with(|tags| tags.borrow_mut().push(tag));
        Self
    }
}

impl Drop for CatchFrame {
    fn drop(&mut self) {
        CATCH_TAGS.with(|tags| tags.borrow_mut().pop());
    }
}

/// Runs the cleanup of an `ensure` exactly once: explicitly on return, or from
/// `drop` while a panic unwinds through the body.
struct CleanupGuard<'c, 'b, G>
where
    G: FnOnce(&Context<'b>, Handle) -> Flow<Handle>,
{
    cx: &'c Context<'b>,
    cleanup: Option<(G, Handle)>,
}

impl<'b, G> CleanupGuard<'_, 'b, G>
where
    G: FnOnce(&Context<'b>, Handle) -> Flow<Handle>,
{
    fn run(&mut self) -> Flow<Handle> {
        match self.cleanup.take() {
            Some((cleanup, arg)) => cleanup(self.cx, arg),
            None => Ok(Handle::NIL),
        }
    }
}

impl<'b, G> Drop for CleanupGuard<'_, 'b, G>
where
    G: FnOnce(&Context<'b>, Handle) -> Flow<Handle>,
{
    fn drop(&mut self) {
        if self.cleanup.is_some() {
            debug!("running ensure cleanup during unwind");
            let _ = self.run();
        }
    }
}

impl<'b> Context<'b> {
    /// Runs `body(arg)` and stops any exception or throw it produces.
    ///
    /// On a non-local exit the exit is stored in the current-error slot and
    /// its status is returned alongside nil. Fatal exits are never captured.
    pub fn protect<F>(&self, body: F, arg: Handle) -> (Handle, Status)
    where
        F: FnOnce(&Self, Handle) -> Flow<Handle>,
    {
        match body(self, arg) {
            Ok(result) => (result, Status::NONE),
            Err(Unwind::Fatal(err)) => self.bridge().fatal(err),
            Err(unwind) => {
                let status = unwind.status();
                debug!(status = status.0, "protect captured non-local exit");
                self.set_captured(Some(unwind));
                (Handle::NIL, status)
            }
        }
    }

    /// Resumes the exit previously captured by [`Self::protect`].
    ///
    /// `status` must be the status `protect` reported for it; anything else
    /// is fatal.
    pub fn jump_tag<T>(&self, status: Status) -> Flow<T> {
        match self.captured() {
            Some(unwind) if !status.is_ok() && unwind.status() == status => Err(unwind),
            _ => Err(Unwind::Fatal(FatalError::ShouldNotReturn("jump_tag"))),
        }
    }

    /// Runs `body(body_arg)`, then `cleanup(cleanup_arg)` exactly once on
    /// every way out.
    ///
    /// An exit from `body` keeps propagating after the cleanup, unless the
    /// cleanup exits itself, in which case the cleanup's exit wins.
    pub fn ensure<F, G>(&self, body: F, body_arg: Handle, cleanup: G, cleanup_arg: Handle) -> Flow<Handle>
    where
        F: FnOnce(&Self, Handle) -> Flow<Handle>,
        G: FnOnce(&Self, Handle) -> Flow<Handle>,
    {
        let mut guard = CleanupGuard {
            cx: self,
            cleanup: Some((cleanup, cleanup_arg)),
        };
        let outcome = body(self, body_arg);

        let hold = match &outcome {
            Err(unwind) => Some(self.hold_in_flight(unwind)),
            Ok(_) => None,
        };
        let cleaned = guard.run();
        if let Some(hold) = hold {
            self.release_in_flight(hold);
        }

        match cleaned {
            Err(replacement) => Err(replacement),
            Ok(_) => outcome,
        }
    }

    /// Runs `body(body_arg)`; a `StandardError` it raises is handed to
    /// `handler(handler_arg, exception)`, whose result is returned instead.
    pub fn rescue<F, H>(&self, body: F, body_arg: Handle, handler: H, handler_arg: Handle) -> Flow<Handle>
    where
        F: FnOnce(&Self, Handle) -> Flow<Handle>,
        H: FnOnce(&Self, Handle, Handle) -> Flow<Handle>,
    {
        let standard = self.standard_class(StandardClass::StandardError);
        self.rescue2(body, body_arg, handler, handler_arg, &[standard])
    }

    /// [`Self::rescue`] restricted to exceptions that are `kind_of?` one of
    /// `classes`. Other exits propagate unchanged.
    pub fn rescue2<F, H>(
        &self,
        body: F,
        body_arg: Handle,
        handler: H,
        handler_arg: Handle,
        classes: &[Handle],
    ) -> Flow<Handle>
    where
        F: FnOnce(&Self, Handle) -> Flow<Handle>,
        H: FnOnce(&Self, Handle, Handle) -> Flow<Handle>,
    {
        let exception = match body(self, body_arg) {
            Err(Unwind::Raise(exception)) => exception,
            other => return other,
        };

        for class in classes {
            let class = self.value(*class)?;
            if !self.runtime().is_class(class) {
                return Err(self.fail(BridgeError::Type(
                    "class or module required for rescue clause".into(),
                )));
            }
            if self.runtime().kind_of(exception, class) {
                let previous = self.captured();
                self.set_captured(Some(Unwind::Raise(exception)));
                let handled = handler(self, handler_arg, self.wrap(exception));
                self.set_captured(previous);
                return handled;
            }
        }
        Err(Unwind::Raise(exception))
    }

    /// Runs `body(body_arg)` as the target of `throw`s tagged `tag`, returning
    /// the thrown value when one arrives.
    pub fn catch<F>(&self, tag: Handle, body: F, body_arg: Handle) -> Flow<Handle>
    where
        F: FnOnce(&Self, Handle) -> Flow<Handle>,
    {
        let tag = self.value(tag)?;
        let outcome = {
            let _frame = CatchFrame::enter(tag);
            body(self, body_arg)
        };
        match outcome {
            Err(Unwind::Throw { tag: thrown, value }) if thrown == tag => Ok(self.wrap(value)),
            other => other,
        }
    }

    /// [`Self::catch`] with a tag interned from `tag`.
    pub fn catch_str<F>(&self, tag: &str, body: F, body_arg: Handle) -> Flow<Handle>
    where
        F: FnOnce(&Self, Handle) -> Flow<Handle>,
    {
        self.catch(self.intern(tag), body, body_arg)
    }

    /// Leaves for the innermost enclosing `catch` of `tag`. Without one the
    /// exit is fatal.
    pub fn throw<T>(&self, tag: Handle, value: Handle) -> Flow<T> {
        let tag_value = self.value(tag)?;
        let value = self.value(value)?;
        let caught = CATCH_TAGS.with(|tags| tags.borrow().contains(&tag_value));
        if !caught {
            return Err(Unwind::Fatal(FatalError::UncaughtThrow(
                self.runtime().describe(tag_value),
            )));
        }
        Err(Unwind::Throw {
            tag: tag_value,
            value,
        })
    }

    pub fn throw_str<T>(&self, tag: &str, value: Handle) -> Flow<T> {
        self.throw(self.intern(tag), value)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::bridge::Bridge;
    use crate::config::BridgeConfig;
    use crate::runtime::{ManagedHeap, ManagedRuntime};

    #[test]
    fn held_exits_are_released_independently() {
        let heap = Arc::new(ManagedHeap::new());
        let bridge = Bridge::new(heap.clone(), BridgeConfig::default());
        let class = heap.standard_class(StandardClass::RuntimeError);
        let first = heap.new_exception(class, "first");
        let second = heap.new_exception(class, "second");
        let live = |value: Value| heap.is_live(value.object_id().unwrap());

        bridge
            .with_lock(|cx| {
                let first_hold = cx.hold_in_flight(&Unwind::Raise(first));
                let second_hold = cx.hold_in_flight(&Unwind::Raise(second));

                // Released out of order, as when two threads' cleanups interleave.
                cx.release_in_flight(first_hold);
                cx.gc();
                assert!(live(second));
                assert!(!live(first));

                cx.release_in_flight(second_hold);
                cx.gc();
                assert!(!live(second));
                Ok(())
            })
            .unwrap();
    }
}
