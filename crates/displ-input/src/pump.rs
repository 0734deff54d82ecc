use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, Receiver, SendTimeoutError, Sender, TrySendError};
use displ_grant::DomId;
use displ_protocol::kbdif::{InputEvent, MultiTouchEvent};
use displ_ring::EventRing;
use tracing::{debug, trace, warn};

use crate::{
    InputCapabilities, KeyboardCallbacks, PointerCallbacks, PumpError, TouchCallbacks,
};

/// Default depth of the queue between source callbacks and the ring worker.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

const BLOCK_POLL: Duration = Duration::from_millis(1);

/// What to do with an event when the guest has not made room for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the event and count it.
    #[default]
    Drop,
    /// Wait up to `timeout` for the guest to consume, then drop. Stopping the pump ends the wait.
    Block { timeout: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpConfig {
    pub overflow: OverflowPolicy,
    pub queue_depth: usize,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::default(),
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Event counts of one pump.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpStats {
    /// Events written to the ring.
    pub published: u64,
    /// Events that never reached the ring, for any reason.
    pub dropped: u64,
    /// Of the dropped events, those refused because the ring was full.
    pub ring_full: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    ring_full: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PumpStats {
        PumpStats {
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            ring_full: self.ring_full.load(Ordering::Relaxed),
        }
    }

    fn drop_one(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// The single producer of one event ring, applying the overflow policy.
pub struct EventPublisher {
    ring: EventRing,
    policy: OverflowPolicy,
    stopping: Arc<AtomicBool>,
}

impl EventPublisher {
    pub fn new(ring: EventRing, policy: OverflowPolicy) -> Self {
        Self {
            ring,
            policy,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn ring(&self) -> &EventRing {
        &self.ring
    }

    /// Encode and publish one event.
    ///
    /// A full ring yields [`PumpError::RingFull`], immediately or after the blocking timeout;
    /// the producer index is never advanced past the guest's consumer index plus capacity.
    pub fn publish(&mut self, event: &InputEvent) -> Result<(), PumpError> {
        let record = event.to_le_bytes();
        let OverflowPolicy::Block { timeout } = self.policy else {
            return Ok(self.ring.push(&record)?);
        };

        let deadline = Instant::now() + timeout;
        loop {
            match self.ring.push(&record).map_err(PumpError::from) {
                Err(PumpError::RingFull { capacity }) => {
                    if self.stopping.load(Ordering::Acquire) {
                        return Err(PumpError::Stopped);
                    }
                    if Instant::now() >= deadline {
                        return Err(PumpError::RingFull { capacity });
                    }
                    thread::sleep(BLOCK_POLL);
                }
                other => return other,
            }
        }
    }
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher")
            .field("ring", &self.ring)
            .field("policy", &self.policy)
            .finish()
    }
}

/// Why an event did not enter the queue: `true` if it was full, `false` if the worker is gone.
struct QueueFull(bool);

/// Producer half handed to source callbacks.
#[derive(Clone)]
struct EventSender {
    domid: DomId,
    tx: Sender<InputEvent>,
    overflow: OverflowPolicy,
    counters: Arc<Counters>,
}

impl EventSender {
    fn send(&self, event: InputEvent) {
        let queued = match self.overflow {
            OverflowPolicy::Drop => match self.tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(QueueFull(true)),
                Err(TrySendError::Disconnected(_)) => Err(QueueFull(false)),
            },
            OverflowPolicy::Block { timeout } => match self.tx.send_timeout(event, timeout) {
                Ok(()) => Ok(()),
                Err(SendTimeoutError::Timeout(_)) => Err(QueueFull(true)),
                Err(SendTimeoutError::Disconnected(_)) => Err(QueueFull(false)),
            },
        };
        match queued {
            Ok(()) => {}
            Err(QueueFull(true)) => {
                self.counters.drop_one();
                warn!(domid = self.domid, ?event, "input queue full; event dropped");
            }
            Err(QueueFull(false)) => {
                trace!(domid = self.domid, ?event, "input pump stopped; event discarded");
            }
        }
    }

    fn contact(&self, id: i32) -> Option<u8> {
        match u8::try_from(id) {
            Ok(contact) => Some(contact),
            Err(_) => {
                self.counters.drop_one();
                warn!(domid = self.domid, contact = id, "touch contact id out of range; event dropped");
                None
            }
        }
    }

    fn touch(&self, id: i32, event: MultiTouchEvent) {
        if let Some(contact_id) = self.contact(id) {
            self.send(InputEvent::MultiTouch { contact_id, event });
        }
    }

    fn keyboard_callbacks(&self) -> KeyboardCallbacks {
        let key = self.clone();
        KeyboardCallbacks {
            key: Box::new(move |keycode, pressed| key.send(InputEvent::Key { keycode, pressed })),
        }
    }

    fn pointer_callbacks(&self) -> PointerCallbacks {
        let (rel, abs, button) = (self.clone(), self.clone(), self.clone());
        PointerCallbacks {
            move_relative: Box::new(move |rel_x, rel_y, rel_z| {
                rel.send(InputEvent::Motion { rel_x, rel_y, rel_z })
            }),
            move_absolute: Box::new(move |abs_x, abs_y, rel_z| {
                abs.send(InputEvent::Position { abs_x, abs_y, rel_z })
            }),
            // kbdif has no button record; buttons travel as key events with BTN_* codes.
            button: Box::new(move |keycode, pressed| {
                button.send(InputEvent::Key { keycode, pressed })
            }),
        }
    }

    fn touch_callbacks(&self) -> TouchCallbacks {
        let (down, up, motion, frame) = (self.clone(), self.clone(), self.clone(), self.clone());
        TouchCallbacks {
            down: Box::new(move |id, abs_x, abs_y| {
                down.touch(id, MultiTouchEvent::Down { abs_x, abs_y })
            }),
            up: Box::new(move |id| up.touch(id, MultiTouchEvent::Up)),
            motion: Box::new(move |id, abs_x, abs_y| {
                motion.touch(id, MultiTouchEvent::Motion { abs_x, abs_y })
            }),
            frame: Box::new(move || {
                frame.send(InputEvent::MultiTouch {
                    contact_id: 0,
                    event: MultiTouchEvent::Frame,
                })
            }),
        }
    }
}

/// Publishes host input events into one guest ring.
///
/// Source callbacks enqueue into a bounded channel; a worker thread owns the [`EventRing`] and
/// is its only producer. Stopping (explicitly or on drop) stops every source first, then
/// flushes what is queued without waiting on the guest, then releases the ring.
pub struct RingEventPump {
    domid: DomId,
    capabilities: InputCapabilities,
    counters: Arc<Counters>,
    stopping: Arc<AtomicBool>,
    stop_tx: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl RingEventPump {
    /// Start the worker, then register with and start each present source.
    pub fn start(
        domid: DomId,
        ring: EventRing,
        capabilities: InputCapabilities,
        config: PumpConfig,
    ) -> Result<Self, PumpError> {
        let counters = Arc::new(Counters::default());
        let (tx, rx) = bounded(config.queue_depth.max(1));
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let mut publisher = EventPublisher::new(ring, config.overflow);
        let stopping = publisher.stopping.clone();

        let worker = {
            let counters = counters.clone();
            thread::Builder::new()
                .name(format!("input-pump-{domid}"))
                .spawn(move || run(domid, &mut publisher, &rx, &stop_rx, &counters))
                .map_err(PumpError::Spawn)?
        };

        let sender = EventSender {
            domid,
            tx,
            overflow: config.overflow,
            counters: counters.clone(),
        };
        if let Some(keyboard) = &capabilities.keyboard {
            keyboard.set_callbacks(sender.keyboard_callbacks());
            keyboard.start();
        }
        if let Some(pointer) = &capabilities.pointer {
            pointer.set_callbacks(sender.pointer_callbacks());
            pointer.start();
        }
        if let Some(touch) = &capabilities.touch {
            touch.set_callbacks(sender.touch_callbacks());
            touch.start();
        }
        debug!(domid, capabilities = ?capabilities, "input pump started");

        Ok(Self {
            domid,
            capabilities,
            counters,
            stopping,
            stop_tx: Some(stop_tx),
            worker: Some(worker),
        })
    }

    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn capabilities(&self) -> &InputCapabilities {
        &self.capabilities
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    /// Stop the pump and return its final counts.
    pub fn stop(mut self) -> PumpStats {
        self.shutdown();
        self.stats()
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.capabilities.stop_all();
        self.stopping.store(true, Ordering::Release);
        drop(self.stop_tx.take());
        if worker.join().is_err() {
            warn!(domid = self.domid, "input pump worker panicked");
        }
        let stats = self.stats();
        debug!(
            domid = self.domid,
            published = stats.published,
            dropped = stats.dropped,
            "input pump stopped"
        );
    }
}

impl Drop for RingEventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for RingEventPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingEventPump")
            .field("domid", &self.domid)
            .field("capabilities", &self.capabilities)
            .field("running", &self.worker.is_some())
            .finish()
    }
}

fn run(
    domid: DomId,
    publisher: &mut EventPublisher,
    events: &Receiver<InputEvent>,
    stop: &Receiver<()>,
    counters: &Counters,
) {
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => publish_one(domid, publisher, &event, counters),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    // Sources are stopped by now; flush what they queued.
    for event in events.try_iter() {
        publish_one(domid, publisher, &event, counters);
    }
}

fn publish_one(domid: DomId, publisher: &mut EventPublisher, event: &InputEvent, counters: &Counters) {
    match publisher.publish(event) {
        Ok(()) => {
            counters.published.fetch_add(1, Ordering::Relaxed);
        }
        Err(PumpError::RingFull { capacity }) => {
            counters.ring_full.fetch_add(1, Ordering::Relaxed);
            counters.drop_one();
            warn!(domid, capacity, ?event, "event ring full; event dropped");
        }
        Err(err) => {
            counters.drop_one();
            warn!(domid, error = %err, ?event, "event not published");
        }
    }
}
