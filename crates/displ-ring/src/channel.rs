use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use displ_grant::DomId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("cannot bind event channel {remote_port} of domain {domid}")]
    Bind { domid: DomId, remote_port: u32 },

    #[error("event channel {0} is closed")]
    Closed(u32),
}

/// An interdomain event channel bound to a frontend port.
pub trait EventChannel: Send + Sync {
    /// Local port number.
    fn port(&self) -> u32;

    /// Raise an event on the remote end.
    fn notify(&self) -> Result<(), ChannelError>;
}

/// Binds the remote ports advertised by frontends.
pub trait EventChannelFactory: Send + Sync {
    fn bind(&self, domid: DomId, remote_port: u32) -> Result<Arc<dyn EventChannel>, ChannelError>;
}

/// Event channel that only counts notifications.
#[derive(Debug, Default)]
pub struct CountingEventChannel {
    port: u32,
    notified: AtomicUsize,
}

impl CountingEventChannel {
    pub fn new(port: u32) -> Self {
        Self {
            port,
            notified: AtomicUsize::new(0),
        }
    }

    pub fn notifications(&self) -> usize {
        self.notified.load(Ordering::SeqCst)
    }
}

impl EventChannel for CountingEventChannel {
    fn port(&self) -> u32 {
        self.port
    }

    fn notify(&self) -> Result<(), ChannelError> {
        self.notified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`CountingEventChannel`]s and remembers them by remote port.
#[derive(Debug, Default)]
pub struct CountingChannelFactory {
    next_port: AtomicU32,
    bound: Mutex<Vec<(DomId, u32, Arc<CountingEventChannel>)>>,
    refuse: Mutex<Vec<u32>>,
}

impl CountingChannelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make later binds of `remote_port` fail.
    pub fn refuse(&self, remote_port: u32) {
        match self.refuse.lock() {
            Ok(mut g) => g.push(remote_port),
            Err(p) => p.into_inner().push(remote_port),
        }
    }

    /// The most recent channel bound to `remote_port`.
    pub fn channel(&self, remote_port: u32) -> Option<Arc<CountingEventChannel>> {
        let bound = match self.bound.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        };
        bound
            .iter()
            .rev()
            .find(|(_, port, _)| *port == remote_port)
            .map(|(_, _, ch)| ch.clone())
    }
}

impl EventChannelFactory for CountingChannelFactory {
    fn bind(&self, domid: DomId, remote_port: u32) -> Result<Arc<dyn EventChannel>, ChannelError> {
        let refused = match self.refuse.lock() {
            Ok(g) => g.contains(&remote_port),
            Err(p) => p.into_inner().contains(&remote_port),
        };
        if refused {
            return Err(ChannelError::Bind { domid, remote_port });
        }
        let local = self.next_port.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = Arc::new(CountingEventChannel::new(local));
        match self.bound.lock() {
            Ok(mut g) => g.push((domid, remote_port, channel.clone())),
            Err(p) => p.into_inner().push((domid, remote_port, channel.clone())),
        }
        Ok(channel)
    }
}
