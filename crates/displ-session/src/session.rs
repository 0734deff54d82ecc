use std::fmt;
use std::sync::Arc;

use displ_grant::DomId;
use displ_protocol::xenbus::{XenbusState, STATE_KEY};
use tracing::{debug, info, warn};

use crate::{ControlPlaneStore, Result, SessionError};

/// Where one frontend/backend device pair lives in the control-plane store.
pub struct SessionContext {
    device: String,
    backend_domid: DomId,
    domid: DomId,
    dev_id: u32,
    frontend_path: String,
    backend_path: String,
    store: Arc<dyn ControlPlaneStore>,
}

impl SessionContext {
    /// Paths follow the usual layout: `/local/domain/<fe>/device/<device>/<id>` for the
    /// frontend and `/local/domain/<be>/backend/<device>/<fe>/<id>` for the backend.
    pub fn new(
        store: Arc<dyn ControlPlaneStore>,
        device: &str,
        backend_domid: DomId,
        domid: DomId,
        dev_id: u32,
    ) -> Self {
        Self {
            device: device.to_owned(),
            backend_domid,
            domid,
            dev_id,
            frontend_path: format!("/local/domain/{domid}/device/{device}/{dev_id}"),
            backend_path: format!("/local/domain/{backend_domid}/backend/{device}/{domid}/{dev_id}"),
            store,
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn backend_domid(&self) -> DomId {
        self.backend_domid
    }

    /// The frontend's domain.
    pub fn domid(&self) -> DomId {
        self.domid
    }

    pub fn dev_id(&self) -> u32 {
        self.dev_id
    }

    pub fn frontend_path(&self) -> &str {
        &self.frontend_path
    }

    pub fn backend_path(&self) -> &str {
        &self.backend_path
    }

    pub fn store(&self) -> &dyn ControlPlaneStore {
        self.store.as_ref()
    }

    /// `<frontend path>/<key>`; `key` may itself contain `/`.
    pub fn frontend_key(&self, key: &str) -> String {
        format!("{}/{key}", self.frontend_path)
    }

    pub fn read_optional(&self, key: &str) -> Result<Option<String>> {
        Ok(self.store.read(&self.frontend_key(key))?)
    }

    pub fn read_string(&self, key: &str) -> Result<String> {
        self.read_optional(key)?
            .ok_or_else(|| SessionError::MissingKey(self.frontend_key(key)))
    }

    pub fn read_uint(&self, key: &str) -> Result<u32> {
        let value = self.read_string(key)?;
        value.trim().parse().map_err(|_| SessionError::InvalidValue {
            path: self.frontend_key(key),
            value,
        })
    }

    /// Names below the frontend path, like connector indices.
    pub fn frontend_children(&self) -> Result<Vec<String>> {
        Ok(self.store.list(&self.frontend_path)?)
    }

    pub fn write_backend(&self, key: &str, value: &str) -> Result<()> {
        Ok(self.store.write(&format!("{}/{key}", self.backend_path), value)?)
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("device", &self.device)
            .field("domid", &self.domid)
            .field("dev_id", &self.dev_id)
            .finish_non_exhaustive()
    }
}

/// Device-specific half of a session.
pub trait FrontendHandler: Send {
    /// Publish backend features. Runs once, before the backend announces `InitWait`.
    fn init(&mut self, _ctx: &SessionContext) -> Result<()> {
        Ok(())
    }

    /// Read the frontend's ring details and bring the device up. On error, whatever was
    /// acquired is released before returning.
    fn bind(&mut self, ctx: &SessionContext) -> Result<()>;

    /// Handle a notification from the frontend.
    fn service(&mut self, _ctx: &SessionContext) -> Result<()> {
        Ok(())
    }

    /// Release everything `bind` acquired. Called at most once per successful bind.
    fn teardown(&mut self, ctx: &SessionContext);
}

/// The backend end of one frontend connection.
///
/// Frontend state changes drive the backend state:
///
/// | frontend                    | backend                                       |
/// |-----------------------------|-----------------------------------------------|
/// | `Initialised`, `Connected`  | bind, then `Connected` (`Closing` if bind fails) |
/// | `Closing`                   | teardown, then `Closing`                      |
/// | `Closed`, `Unknown`         | teardown, then `Closed`                       |
/// | `Initialising` after `Closed` | `InitWait`, ready to bind again             |
pub struct FrontendSession<H: FrontendHandler> {
    ctx: SessionContext,
    handler: H,
    state: XenbusState,
    bound: bool,
}

impl<H: FrontendHandler> FrontendSession<H> {
    pub fn new(ctx: SessionContext, mut handler: H) -> Result<Self> {
        handler.init(&ctx)?;
        let mut session = Self {
            ctx,
            handler,
            state: XenbusState::Initialising,
            bound: false,
        };
        session.set_state(XenbusState::InitWait)?;
        Ok(session)
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn backend_state(&self) -> XenbusState {
        self.state
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Read the frontend's state from the store and react to it. A missing state key is
    /// treated as `Unknown` (the frontend went away).
    pub fn poll(&mut self) -> Result<XenbusState> {
        let frontend = match self.ctx.read_optional(STATE_KEY)? {
            None => XenbusState::Unknown,
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .ok()
                .and_then(|v| XenbusState::from_u32(v).ok())
                .ok_or_else(|| SessionError::InvalidValue {
                    path: self.ctx.frontend_key(STATE_KEY),
                    value: raw.clone(),
                })?,
        };
        self.on_frontend_state(frontend)
    }

    /// React to a frontend state change. Returns the resulting backend state.
    pub fn on_frontend_state(&mut self, frontend: XenbusState) -> Result<XenbusState> {
        debug!(
            domid = self.ctx.domid,
            device = %self.ctx.device,
            %frontend,
            backend = %self.state,
            "frontend state changed"
        );
        match frontend {
            XenbusState::Initialised | XenbusState::Connected => {
                if self.state == XenbusState::InitWait {
                    self.bind()?;
                }
            }
            XenbusState::Closing => {
                self.unbind();
                self.set_state(XenbusState::Closing)?;
            }
            XenbusState::Closed | XenbusState::Unknown => {
                self.unbind();
                self.set_state(XenbusState::Closed)?;
            }
            XenbusState::Initialising | XenbusState::InitWait => {
                if self.state == XenbusState::Closed {
                    self.set_state(XenbusState::InitWait)?;
                }
            }
            XenbusState::Reconfiguring | XenbusState::Reconfigured => {}
        }
        Ok(self.state)
    }

    /// Forward a frontend notification to the handler. A handler error closes the session.
    pub fn service(&mut self) -> Result<()> {
        if !self.bound {
            return Ok(());
        }
        if let Err(err) = self.handler.service(&self.ctx) {
            warn!(domid = self.ctx.domid, device = %self.ctx.device, error = %err, "frontend misbehaved; closing");
            self.unbind();
            self.set_state(XenbusState::Closing)?;
            return Err(err);
        }
        Ok(())
    }

    fn bind(&mut self) -> Result<()> {
        match self.handler.bind(&self.ctx) {
            Ok(()) => {
                self.bound = true;
                self.set_state(XenbusState::Connected)
            }
            Err(err) => {
                warn!(domid = self.ctx.domid, device = %self.ctx.device, error = %err, "bind failed");
                self.set_state(XenbusState::Closing)?;
                Err(err)
            }
        }
    }

    fn unbind(&mut self) {
        if self.bound {
            self.bound = false;
            self.handler.teardown(&self.ctx);
        }
    }

    fn set_state(&mut self, state: XenbusState) -> Result<()> {
        if self.state == state {
            return Ok(());
        }
        self.ctx
            .write_backend(STATE_KEY, &state.as_u32().to_string())?;
        info!(
            domid = self.ctx.domid,
            device = %self.ctx.device,
            from = %self.state,
            to = %state,
            "backend state"
        );
        self.state = state;
        Ok(())
    }
}

impl<H: FrontendHandler> Drop for FrontendSession<H> {
    fn drop(&mut self) {
        self.unbind();
    }
}

impl<H: FrontendHandler> fmt::Debug for FrontendSession<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrontendSession")
            .field("ctx", &self.ctx)
            .field("state", &self.state)
            .field("bound", &self.bound)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        binds: usize,
        teardowns: usize,
        fail_bind: bool,
    }

    impl FrontendHandler for Recorder {
        fn bind(&mut self, _ctx: &SessionContext) -> Result<()> {
            if self.fail_bind {
                return Err(SessionError::MissingKey("ring".into()));
            }
            self.binds += 1;
            Ok(())
        }

        fn teardown(&mut self, _ctx: &SessionContext) {
            self.teardowns += 1;
        }
    }

    fn session(handler: Recorder) -> (Arc<MemStore>, FrontendSession<Recorder>) {
        let store = Arc::new(MemStore::new());
        let ctx = SessionContext::new(store.clone(), "vkbd", 0, 7, 0);
        (store, FrontendSession::new(ctx, handler).unwrap())
    }

    #[test]
    fn starts_in_init_wait() {
        let (store, session) = session(Recorder::default());
        assert_eq!(session.backend_state(), XenbusState::InitWait);
        assert_eq!(store.get("/local/domain/0/backend/vkbd/7/0/state").as_deref(), Some("2"));
    }

    #[test]
    fn connect_close_reconnect() {
        use XenbusState::*;
        let (_store, mut session) = session(Recorder::default());

        assert_eq!(session.on_frontend_state(Initialised).unwrap(), Connected);
        assert_eq!(session.on_frontend_state(Connected).unwrap(), Connected);
        assert_eq!(session.handler().binds, 1);

        assert_eq!(session.on_frontend_state(Closing).unwrap(), Closing);
        assert_eq!(session.handler().teardowns, 1);
        assert_eq!(session.on_frontend_state(Closed).unwrap(), Closed);
        assert_eq!(session.handler().teardowns, 1);

        assert_eq!(session.on_frontend_state(Initialising).unwrap(), InitWait);
        assert_eq!(session.on_frontend_state(Initialised).unwrap(), Connected);
        assert_eq!(session.handler().binds, 2);
    }

    #[test]
    fn failed_bind_closes() {
        let (_store, mut session) = session(Recorder {
            fail_bind: true,
            ..Recorder::default()
        });
        assert!(matches!(
            session.on_frontend_state(XenbusState::Initialised),
            Err(SessionError::MissingKey(_))
        ));
        assert_eq!(session.backend_state(), XenbusState::Closing);
        assert!(!session.is_bound());
        assert_eq!(session.handler().teardowns, 0);
        assert_eq!(session.on_frontend_state(XenbusState::Connected).unwrap(), XenbusState::Closing);
    }

    #[test]
    fn poll_reads_frontend_state() {
        let (store, mut session) = session(Recorder::default());
        store
            .write("/local/domain/7/device/vkbd/0/state", "3")
            .unwrap();
        assert_eq!(session.poll().unwrap(), XenbusState::Connected);
        store.remove("/local/domain/7/device/vkbd/0").unwrap();
        assert_eq!(session.poll().unwrap(), XenbusState::Closed);

        store
            .write("/local/domain/7/device/vkbd/0/state", "banana")
            .unwrap();
        assert!(matches!(session.poll(), Err(SessionError::InvalidValue { .. })));
    }

    #[test]
    fn drop_tears_down() {
        struct Watch(Arc<AtomicUsize>);

        impl FrontendHandler for Watch {
            fn bind(&mut self, _ctx: &SessionContext) -> Result<()> {
                Ok(())
            }

            fn teardown(&mut self, _ctx: &SessionContext) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let teardowns = Arc::new(AtomicUsize::new(0));
        let mut session = FrontendSession::new(
            SessionContext::new(Arc::new(MemStore::new()), "vkbd", 0, 8, 0),
            Watch(teardowns.clone()),
        )
        .unwrap();
        session.on_frontend_state(XenbusState::Connected).unwrap();
        assert!(session.is_bound());
        drop(session);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
