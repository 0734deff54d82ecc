//! Scriptable input sources, for tests and for driving a guest without a compositor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    InputError, InputProvider, Keyboard, KeyboardCallbacks, Pointer, PointerCallbacks, Touch,
    TouchCallbacks,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// An input source whose events are raised by calling its methods.
///
/// Events are only delivered while the source is started and has callbacks.
pub struct MemSource<C> {
    id: String,
    callbacks: Mutex<Option<C>>,
    running: AtomicBool,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

pub type MemKeyboard = MemSource<KeyboardCallbacks>;
pub type MemPointer = MemSource<PointerCallbacks>;
pub type MemTouch = MemSource<TouchCallbacks>;

impl<C> MemSource<C> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            callbacks: Mutex::new(None),
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn has_callbacks(&self) -> bool {
        lock(&self.callbacks).is_some()
    }

    fn install(&self, callbacks: C) {
        *lock(&self.callbacks) = Some(callbacks);
    }

    fn start_source(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    fn stop_source(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Run `f` against the callbacks. Returns whether the event was delivered.
    fn raise(&self, f: impl FnOnce(&C)) -> bool {
        let callbacks = lock(&self.callbacks);
        match &*callbacks {
            Some(cb) if self.is_running() => {
                f(cb);
                true
            }
            _ => false,
        }
    }
}

impl Keyboard for MemKeyboard {
    fn set_callbacks(&self, callbacks: KeyboardCallbacks) {
        self.install(callbacks);
    }

    fn clear_callbacks(&self) {
        lock(&self.callbacks).take();
    }

    fn start(&self) {
        self.start_source();
    }

    fn stop(&self) {
        self.stop_source();
    }
}

impl MemKeyboard {
    pub fn key(&self, keycode: u32, pressed: bool) -> bool {
        self.raise(|cb| (cb.key)(keycode, pressed))
    }
}

impl Pointer for MemPointer {
    fn set_callbacks(&self, callbacks: PointerCallbacks) {
        self.install(callbacks);
    }

    fn clear_callbacks(&self) {
        lock(&self.callbacks).take();
    }

    fn start(&self) {
        self.start_source();
    }

    fn stop(&self) {
        self.stop_source();
    }
}

impl MemPointer {
    pub fn move_relative(&self, x: i32, y: i32, z: i32) -> bool {
        self.raise(|cb| (cb.move_relative)(x, y, z))
    }

    pub fn move_absolute(&self, x: i32, y: i32, z: i32) -> bool {
        self.raise(|cb| (cb.move_absolute)(x, y, z))
    }

    pub fn button(&self, button: u32, pressed: bool) -> bool {
        self.raise(|cb| (cb.button)(button, pressed))
    }
}

impl Touch for MemTouch {
    fn set_callbacks(&self, callbacks: TouchCallbacks) {
        self.install(callbacks);
    }

    fn clear_callbacks(&self) {
        lock(&self.callbacks).take();
    }

    fn start(&self) {
        self.start_source();
    }

    fn stop(&self) {
        self.stop_source();
    }
}

impl MemTouch {
    pub fn down(&self, contact: i32, x: i32, y: i32) -> bool {
        self.raise(|cb| (cb.down)(contact, x, y))
    }

    pub fn up(&self, contact: i32) -> bool {
        self.raise(|cb| (cb.up)(contact))
    }

    pub fn motion(&self, contact: i32, x: i32, y: i32) -> bool {
        self.raise(|cb| (cb.motion)(contact, x, y))
    }

    pub fn frame(&self) -> bool {
        self.raise(|cb| (cb.frame)())
    }
}

/// [`InputProvider`] over registered [`MemSource`]s.
#[derive(Default)]
pub struct MemInputProvider {
    keyboards: Mutex<HashMap<String, Arc<MemKeyboard>>>,
    pointers: Mutex<HashMap<String, Arc<MemPointer>>>,
    touches: Mutex<HashMap<String, Arc<MemTouch>>>,
}

impl MemInputProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_keyboard(&self, id: &str) -> Arc<MemKeyboard> {
        let source = Arc::new(MemKeyboard::new(id));
        lock(&self.keyboards).insert(id.to_owned(), source.clone());
        source
    }

    pub fn add_pointer(&self, id: &str) -> Arc<MemPointer> {
        let source = Arc::new(MemPointer::new(id));
        lock(&self.pointers).insert(id.to_owned(), source.clone());
        source
    }

    pub fn add_touch(&self, id: &str) -> Arc<MemTouch> {
        let source = Arc::new(MemTouch::new(id));
        lock(&self.touches).insert(id.to_owned(), source.clone());
        source
    }
}

fn unknown(kind: &'static str, id: &str) -> InputError {
    InputError::UnknownDevice {
        kind,
        id: id.to_owned(),
    }
}

impl InputProvider for MemInputProvider {
    fn keyboard(&self, id: &str) -> Result<Arc<dyn Keyboard>, InputError> {
        let source: Arc<dyn Keyboard> =
            lock(&self.keyboards).get(id).cloned().ok_or_else(|| unknown("keyboard", id))?;
        Ok(source)
    }

    fn pointer(&self, id: &str) -> Result<Arc<dyn Pointer>, InputError> {
        let source: Arc<dyn Pointer> =
            lock(&self.pointers).get(id).cloned().ok_or_else(|| unknown("pointer", id))?;
        Ok(source)
    }

    fn touch(&self, id: &str) -> Result<Arc<dyn Touch>, InputError> {
        let source: Arc<dyn Touch> =
            lock(&self.touches).get(id).cloned().ok_or_else(|| unknown("touch", id))?;
        Ok(source)
    }
}
