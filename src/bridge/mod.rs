//! The native/managed interop bridge.
//!
//! A [`Bridge`] owns the handle table and the execution lock for one managed
//! runtime. Everything that touches managed values goes through a
//! [`Context`], which only exists inside [`Bridge::with_lock`].

pub mod control;
pub mod error;
pub mod handle;
pub mod integer;
pub mod kwargs;
pub mod lock;
mod table;

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use num_bigint::BigInt;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::config::BridgeConfig;
use crate::runtime::{CollectStats, ManagedRuntime, StandardClass, Value};

pub use error::{BridgeError, FatalError, Flow, Status, Unwind};
pub use handle::{Handle, HandleKind};
pub use lock::UnblockFn;

use lock::ExecutionLock;
use table::{FrameId, HandleTable};

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

thread_local! {
    /// Native frames entered on this thread, innermost last, tagged with the
    /// address of the bridge that owns them.
    static ACTIVE_FRAMES: RefCell<Vec<(usize, FrameId)>> = const { RefCell::new(Vec::new()) };

    /// Exit raised by native code and not yet collected, tagged with the
    /// address of the bridge it was raised against.
    static PARKED: RefCell<Option<(usize, Unwind)>> = const { RefCell::new(None) };

    /// Set while a panic raised by [`Bridge::fatal`] unwinds.
    static FATAL_UNWINDING: Cell<bool> = const { Cell::new(false) };
}

struct BridgeState {
    table: HandleTable,
    /// The exit most recently captured by `protect` (the "current error").
    captured: Option<Unwind>,
    /// Values of exits suspended while `ensure` cleanups run, per hold.
    in_flight: AHashMap<u64, Vec<Value>>,
    next_hold: u64,
}

pub struct Bridge {
    runtime: Arc<dyn ManagedRuntime>,
    config: BridgeConfig,
    lock: ExecutionLock,
    state: Mutex<BridgeState>,
    next_frame: AtomicU64,
}

impl Bridge {
    pub fn new(runtime: Arc<dyn ManagedRuntime>, config: BridgeConfig) -> Self {
        let table = HandleTable::with_capacity(config.handle_capacity);
        Self {
            runtime,
            config,
            lock: ExecutionLock::default(),
            state: Mutex::new(BridgeState {
                table,
                captured: None,
                in_flight: AHashMap::new(),
                next_hold: 0,
            }),
            next_frame: AtomicU64::new(1),
        }
    }

    /// Installs the process-wide bridge used by the native surface. There is
    /// exactly one per process; a second call fails.
    pub fn install(
        runtime: Arc<dyn ManagedRuntime>,
        config: BridgeConfig,
    ) -> Result<&'static Self, BridgeError> {
        let mut created = false;
        let bridge = BRIDGE.get_or_init(|| {
            created = true;
            Self::new(runtime, config)
        });
        if !created {
            return Err(BridgeError::AlreadyInstalled);
        }
        info!(
            handle_capacity = bridge.config.handle_capacity,
            gc_stress = bridge.config.gc_stress,
            "bridge installed"
        );
        Ok(bridge)
    }

    pub fn global() -> Option<&'static Self> {
        BRIDGE.get()
    }

    pub fn runtime(&self) -> &dyn ManagedRuntime {
        self.runtime.as_ref()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    fn address(&self) -> usize {
        std::ptr::from_ref(self) as usize
    }

    /// Enters a native call frame: takes the execution lock (reentrantly) and
    /// runs `f` with a context bound to the new frame.
    ///
    /// Handles wrapped inside the frame stay pinned until it exits; a nested
    /// frame hands its pins to the enclosing one. A fatal exit reaching the
    /// outermost frame ends the process.
    ///
    /// An exit native code parked during the frame and that no callback
    /// boundary collected becomes the frame's result.
    pub fn with_lock<T>(&self, f: impl FnOnce(&Context<'_>) -> Flow<T>) -> Flow<T> {
        let depth = self.lock.acquire();
        let frame = self.next_frame.fetch_add(1, Ordering::Relaxed);
        let parent = ACTIVE_FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            let parent = frames
                .iter()
                .rev()
                .find(|(owner, _)| *owner == self.address())
                .map(|(_, frame)| *frame);
            frames.push((self.address(), frame));
            parent
        });
        self.state.lock().table.open_frame(frame);
        trace!(frame, depth, "native frame entered");

        let guard = FrameGuard {
            bridge: self,
            frame,
            parent,
        };
        let result = match (f(&Context::new(self, frame)), self.take_parked()) {
            (Ok(_), Some(parked)) => Err(parked),
            (result, Some(parked)) => {
                debug!(status = parked.status().0, "parked exit superseded by frame result");
                result
            }
            (result, None) => result,
        };
        drop(guard);

        match result {
            Err(Unwind::Fatal(err)) if depth == 1 => self.fatal(err),
            other => other,
        }
    }

    /// Reports an unrecoverable condition and ends the process, or panics
    /// when `abort_on_fatal` is off.
    pub fn fatal(&self, err: FatalError) -> ! {
        error!(error = %err, "fatal bridge error");
        if self.config.abort_on_fatal {
            std::process::abort();
        }
        FATAL_UNWINDING.with(|flag| flag.set(true));
        panic!("fatal: {err}");
    }

    /// Whether the panic currently unwinding on this thread was raised by
    /// [`Self::fatal`].
    pub(crate) fn fatal_unwinding() -> bool {
        FATAL_UNWINDING.with(Cell::get)
    }

    pub(crate) fn clear_fatal_unwinding() {
        FATAL_UNWINDING.with(|flag| flag.set(false));
    }

    /// Leaves `unwind` for the enclosing callback boundary or frame to collect.
    /// A newer exit replaces an uncollected one.
    pub(crate) fn park(&self, unwind: Unwind) {
        PARKED.with(|parked| *parked.borrow_mut() = Some((self.address(), unwind)));
    }

    /// Takes the exit parked against this bridge on this thread, if any.
    pub(crate) fn take_parked(&self) -> Option<Unwind> {
        PARKED.with(|parked| {
            let mut parked = parked.borrow_mut();
            let ours = matches!(parked.as_ref(), Some((owner, _)) if *owner == self.address());
            if ours {
                parked.take().map(|(_, unwind)| unwind)
            } else {
                None
            }
        })
    }

    pub(crate) fn parked_status(&self) -> Status {
        PARKED.with(|parked| match parked.borrow().as_ref() {
            Some((owner, unwind)) if *owner == self.address() => unwind.status(),
            _ => Status::NONE,
        })
    }

    fn collect_garbage(&self) -> CollectStats {
        let mut state = self.state.lock();
        let mut roots = state.table.roots();
        let suspended = state
            .captured
            .iter()
            .flat_map(Unwind::values)
            .chain(state.in_flight.values().flatten().copied());
        roots.extend(suspended.filter_map(Value::object_id));

        let stats = self.runtime.collect(&roots);
        let runtime = &self.runtime;
        let swept = state.table.sweep(|object| runtime.is_live(object));
        debug!(
            roots = stats.roots,
            survivors = stats.survivors,
            swept,
            live_handles = state.table.len(),
            "collection finished"
        );
        stats
    }
}

struct FrameGuard<'b> {
    bridge: &'b Bridge,
    frame: FrameId,
    parent: Option<FrameId>,
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        ACTIVE_FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();
            if let Some(pos) = frames.iter().rposition(|(_, f)| *f == self.frame) {
                frames.remove(pos);
            }
        });
        self.bridge
            .state
            .lock()
            .table
            .close_frame(self.frame, self.parent);
        if self.bridge.config.gc_stress {
            self.bridge.collect_garbage();
        }
        trace!(frame = self.frame, "native frame exited");
        self.bridge.lock.release();
    }
}

/// Proof that the current thread holds the execution lock, tied to one
/// native frame. Neither `Send` nor `Sync`.
pub struct Context<'b> {
    bridge: &'b Bridge,
    frame: FrameId,
    _not_send: PhantomData<*const ()>,
}

impl<'b> Context<'b> {
    fn new(bridge: &'b Bridge, frame: FrameId) -> Self {
        Self {
            bridge,
            frame,
            _not_send: PhantomData,
        }
    }

    /// The context of the innermost frame `bridge` has open on this thread.
    pub(crate) fn current(bridge: &'b Bridge) -> Option<Self> {
        if !bridge.lock.held_by_current() {
            return None;
        }
        let frame = ACTIVE_FRAMES.with(|frames| {
            frames
                .borrow()
                .iter()
                .rev()
                .find(|(owner, _)| *owner == bridge.address())
                .map(|(_, frame)| *frame)
        })?;
        Some(Self::new(bridge, frame))
    }

    pub fn bridge(&self) -> &'b Bridge {
        self.bridge
    }

    pub fn runtime(&self) -> &'b dyn ManagedRuntime {
        self.bridge.runtime.as_ref()
    }

    /// Hands `value` to native code. Immediates are encoded in place; objects
    /// get a table slot pinned to this frame.
    pub fn wrap(&self, value: Value) -> Handle {
        if let Some(handle) = Handle::immediate(value) {
            return handle;
        }
        let object = match value {
            Value::Object(object) => object,
            // A fixnum outside the 63-bit range becomes a heap integer.
            Value::Fixnum(n) => match self.runtime().new_integer(&BigInt::from(n)) {
                Value::Object(object) => object,
                other => return Handle::immediate(other).unwrap_or(Handle::NIL),
            },
            _ => return Handle::NIL,
        };
        self.bridge.state.lock().table.insert(object, self.frame)
    }

    pub fn unwrap(&self, handle: Handle) -> Result<Value, BridgeError> {
        match handle.kind() {
            HandleKind::Fixnum(n) => Ok(Value::Fixnum(n)),
            HandleKind::Special(value) => Ok(value),
            HandleKind::Symbol(id) => match self.runtime().symbol_name(id) {
                Some(_) => Ok(Value::Symbol(id)),
                None => Err(BridgeError::InvalidHandle(handle)),
            },
            HandleKind::Reference { .. } => {
                let object = self.bridge.state.lock().table.get(handle);
                match object {
                    Some(object) if self.runtime().is_live(object) => Ok(Value::Object(object)),
                    _ => Err(BridgeError::InvalidHandle(handle)),
                }
            }
            HandleKind::Invalid => Err(BridgeError::InvalidHandle(handle)),
        }
    }

    /// [`Self::unwrap`], raising `TypeError` on failure.
    pub fn value(&self, handle: Handle) -> Flow<Value> {
        self.check(self.unwrap(handle))
    }

    pub fn intern(&self, name: &str) -> Handle {
        Handle::symbol(self.runtime().intern(name))
    }

    pub fn symbol_name(&self, handle: Handle) -> Flow<String> {
        match self.value(handle)? {
            Value::Symbol(id) => self.check(
                self.runtime()
                    .symbol_name(id)
                    .ok_or(BridgeError::InvalidHandle(handle)),
            ),
            other => Err(self.fail(BridgeError::Type(format!(
                "{} is not a symbol",
                self.runtime().describe(other)
            )))),
        }
    }

    pub fn test(&self, handle: Handle) -> bool {
        handle.test()
    }

    pub fn new_string(&self, text: &str) -> Handle {
        self.wrap(self.runtime().new_string(text))
    }

    pub fn standard_class(&self, class: StandardClass) -> Handle {
        self.wrap(self.runtime().standard_class(class))
    }

    pub fn describe(&self, handle: Handle) -> String {
        match self.unwrap(handle) {
            Ok(value) => self.runtime().describe(value),
            Err(_) => format!("{handle:?}"),
        }
    }

    pub fn exception_message(&self, exception: Handle) -> Option<String> {
        let value = self.unwrap(exception).ok()?;
        self.runtime().exception_message(value)
    }

    /// `exception.kind_of?(class)` over handles.
    pub fn kind_of(&self, exception: Handle, class: Handle) -> Flow<bool> {
        let exception = self.value(exception)?;
        let class = self.value(class)?;
        Ok(self.runtime().kind_of(exception, class))
    }

    /// Runs a collection rooted at every pinned handle, then frees the table
    /// slots of whatever did not survive.
    pub fn gc(&self) -> CollectStats {
        self.bridge.collect_garbage()
    }

    /// Keeps `handle`'s object alive through the next collection only.
    pub fn gc_mark(&self, handle: Handle) -> Flow<()> {
        if handle.is_immediate() {
            return Ok(());
        }
        if self.bridge.state.lock().table.mark(handle) {
            Ok(())
        } else {
            Err(self.fail(BridgeError::InvalidHandle(handle)))
        }
    }

    /// Keeps `handle`'s object alive for the life of the process.
    pub fn register_mark_object(&self, handle: Handle) -> Flow<()> {
        if handle.is_immediate() {
            return Ok(());
        }
        if self.bridge.state.lock().table.register(handle) {
            Ok(())
        } else {
            Err(self.fail(BridgeError::InvalidHandle(handle)))
        }
    }

    /// Treats the handle stored at `address` as a root at every collection.
    ///
    /// # Safety
    ///
    /// `address` must remain valid for reads until passed to
    /// [`Self::unregister_address`].
    pub unsafe fn register_address(&self, address: *const u64) {
        // SAFETY: forwarded from the caller.
        unsafe { self.bridge.state.lock().table.register_address(address) };
    }

    pub fn unregister_address(&self, address: *const u64) -> bool {
        self.bridge.state.lock().table.unregister_address(address)
    }

    /// Builds the managed exception for `err`, pinned to this frame.
    pub fn fail(&self, err: BridgeError) -> Unwind {
        let class = self.runtime().standard_class(err.exception_class());
        let exception = self.runtime().new_exception(class, &err.to_string());
        self.wrap(exception);
        debug!(error = %err, "bridge error raised as exception");
        Unwind::Raise(exception)
    }

    pub fn check<T>(&self, result: Result<T, BridgeError>) -> Flow<T> {
        result.map_err(|err| self.fail(err))
    }

    /// Starts propagating `exception`.
    pub fn raise<T>(&self, exception: Handle) -> Flow<T> {
        let value = self.value(exception)?;
        let base = self.runtime().standard_class(StandardClass::Exception);
        if !self.runtime().kind_of(value, base) {
            return Err(self.fail(BridgeError::Type("exception object expected".into())));
        }
        Err(Unwind::Raise(value))
    }

    /// Raises a new instance of `class` with `message`.
    pub fn raise_new<T>(&self, class: Handle, message: &str) -> Flow<T> {
        let class = self.value(class)?;
        if !self.runtime().is_class(class) {
            return Err(self.fail(BridgeError::Type("exception class expected".into())));
        }
        let exception = self.runtime().new_exception(class, message);
        self.wrap(exception);
        Err(Unwind::Raise(exception))
    }

    pub fn raise_standard<T>(&self, class: StandardClass, message: &str) -> Flow<T> {
        self.raise_new(self.standard_class(class), message)
    }

    /// The exception in the current-error slot, or nil.
    pub fn errinfo(&self) -> Handle {
        let captured = self.bridge.state.lock().captured.clone();
        match captured {
            Some(Unwind::Raise(exception)) => self.wrap(exception),
            _ => Handle::NIL,
        }
    }

    /// Replaces the current-error slot; nil clears it.
    pub fn set_errinfo(&self, exception: Handle) -> Flow<()> {
        let value = self.value(exception)?;
        if value.is_nil() {
            self.bridge.state.lock().captured = None;
            return Ok(());
        }
        let base = self.runtime().standard_class(StandardClass::Exception);
        if !self.runtime().kind_of(value, base) {
            return Err(self.fail(BridgeError::Type(
                "assigning non-exception to $!".into(),
            )));
        }
        self.bridge.state.lock().captured = Some(Unwind::Raise(value));
        Ok(())
    }

    pub(crate) fn captured(&self) -> Option<Unwind> {
        self.bridge.state.lock().captured.clone()
    }

    pub(crate) fn set_captured(&self, unwind: Option<Unwind>) {
        self.bridge.state.lock().captured = unwind;
    }

    /// Keeps the values of `unwind` rooted until the returned hold is passed
    /// to [`Self::release_in_flight`].
    pub(crate) fn hold_in_flight(&self, unwind: &Unwind) -> u64 {
        let mut state = self.bridge.state.lock();
        let hold = state.next_hold;
        state.next_hold += 1;
        state.in_flight.insert(hold, unwind.values());
        hold
    }

    pub(crate) fn release_in_flight(&self, hold: u64) {
        self.bridge.state.lock().in_flight.remove(&hold);
    }
}

impl Bridge {
    /// Occupied handle table slots.
    pub fn live_handles(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn lock_held(&self) -> bool {
        self.lock.held_by_current()
    }
}
