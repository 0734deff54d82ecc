//! Host input sources the pump listens to.
//!
//! Each source is optional and independent. A source is given one callback set, then started;
//! it must not call back after `stop` returns.

use std::fmt;
use std::sync::Arc;

use crate::InputError;

pub type KeyFn = Box<dyn Fn(u32, bool) + Send + Sync>;
pub type MoveFn = Box<dyn Fn(i32, i32, i32) + Send + Sync>;
pub type TouchPointFn = Box<dyn Fn(i32, i32, i32) + Send + Sync>;
pub type TouchUpFn = Box<dyn Fn(i32) + Send + Sync>;
pub type FrameFn = Box<dyn Fn() + Send + Sync>;

pub struct KeyboardCallbacks {
    /// `(keycode, pressed)`
    pub key: KeyFn,
}

pub struct PointerCallbacks {
    /// `(rel_x, rel_y, rel_z)`
    pub move_relative: MoveFn,
    /// `(abs_x, abs_y, rel_z)`
    pub move_absolute: MoveFn,
    /// `(button, pressed)`
    pub button: KeyFn,
}

pub struct TouchCallbacks {
    /// `(contact, abs_x, abs_y)`
    pub down: TouchPointFn,
    pub up: TouchUpFn,
    /// `(contact, abs_x, abs_y)`
    pub motion: TouchPointFn,
    /// End of one multi-touch batch.
    pub frame: FrameFn,
}

pub trait Keyboard: Send + Sync {
    fn set_callbacks(&self, callbacks: KeyboardCallbacks);
    /// Drop the installed callbacks; nothing is delivered until new ones are set.
    fn clear_callbacks(&self);
    fn start(&self);
    fn stop(&self);
}

pub trait Pointer: Send + Sync {
    fn set_callbacks(&self, callbacks: PointerCallbacks);
    /// Drop the installed callbacks; nothing is delivered until new ones are set.
    fn clear_callbacks(&self);
    fn start(&self);
    fn stop(&self);
}

pub trait Touch: Send + Sync {
    fn set_callbacks(&self, callbacks: TouchCallbacks);
    /// Drop the installed callbacks; nothing is delivered until new ones are set.
    fn clear_callbacks(&self);
    fn start(&self);
    fn stop(&self);
}

/// The sources wired to one guest input device.
#[derive(Clone, Default)]
pub struct InputCapabilities {
    pub keyboard: Option<Arc<dyn Keyboard>>,
    pub pointer: Option<Arc<dyn Pointer>>,
    pub touch: Option<Arc<dyn Touch>>,
}

impl InputCapabilities {
    pub fn is_empty(&self) -> bool {
        self.keyboard.is_none() && self.pointer.is_none() && self.touch.is_none()
    }

    /// Stop every present source and take its callbacks back.
    pub fn stop_all(&self) {
        if let Some(keyboard) = &self.keyboard {
            keyboard.stop();
            keyboard.clear_callbacks();
        }
        if let Some(pointer) = &self.pointer {
            pointer.stop();
            pointer.clear_callbacks();
        }
        if let Some(touch) = &self.touch {
            touch.stop();
            touch.clear_callbacks();
        }
    }
}

impl fmt::Debug for InputCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputCapabilities")
            .field("keyboard", &self.keyboard.is_some())
            .field("pointer", &self.pointer.is_some())
            .field("touch", &self.touch.is_some())
            .finish()
    }
}

/// Opens host input sources by the ids a frontend asks for.
pub trait InputProvider: Send + Sync {
    fn keyboard(&self, id: &str) -> Result<Arc<dyn Keyboard>, InputError>;
    fn pointer(&self, id: &str) -> Result<Arc<dyn Pointer>, InputError>;
    fn touch(&self, id: &str) -> Result<Arc<dyn Touch>, InputError>;

    /// Open the sources whose id is non-empty. An empty id means the device is not wanted.
    fn open(&self, keyboard: &str, pointer: &str, touch: &str) -> Result<InputCapabilities, InputError> {
        Ok(InputCapabilities {
            keyboard: (!keyboard.is_empty()).then(|| self.keyboard(keyboard)).transpose()?,
            pointer: (!pointer.is_empty()).then(|| self.pointer(pointer)).transpose()?,
            touch: (!touch.is_empty()).then(|| self.touch(touch)).transpose()?,
        })
    }
}
