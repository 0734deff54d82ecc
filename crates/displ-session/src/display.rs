use std::fmt;
use std::sync::Arc;

use displ_buffers::{
    BufferError, BufferRegistry, CookiePolicy, DisplayBufferRequest, DisplayMode, DisplaySink,
    FrameBufferRequest,
};
use displ_gpu::ZeroCopyImporter;
use displ_grant::{GrantError, GrantMapping, GrantRef, GrantTable};
use displ_protocol::displif::{
    self, errno, DisplayRequest, DisplayResponse, PageFlipEvent, RequestBody,
};
use displ_ring::{EventChannelFactory, EventRing, EventRingLayout, RequestRing};
use tracing::{debug, info, warn};

use crate::{BackendConfig, FrontendHandler, Result, SessionContext, SessionError};

/// Response status for a request that failed with `err`: a negated errno.
pub fn request_status(err: &BufferError) -> i32 {
    let errno = match err {
        BufferError::NotFound { .. } | BufferError::UnknownDisplayBuffer { .. } => errno::ENOENT,
        BufferError::DuplicateCookie(_) => errno::EEXIST,
        BufferError::InvalidGeometry { .. } => errno::EINVAL,
        BufferError::Grant(GrantError::InvalidDirectory { .. } | GrantError::Empty) => errno::EINVAL,
        BufferError::Grant(_) => errno::EFAULT,
        BufferError::Import(_) | BufferError::Sink(_) => errno::EIO,
    };
    -errno
}

/// Event page of one connector and the id of its next page-flip event.
struct FlipEvents {
    ring: EventRing,
    next_id: u16,
}

impl FlipEvents {
    fn publish(&mut self, fb_cookie: u64) {
        let event = PageFlipEvent {
            id: self.next_id,
            fb_cookie,
        };
        self.next_id = self.next_id.wrapping_add(1);
        if let Err(err) = self.ring.push(&event.to_le_bytes()) {
            warn!(fb_cookie, error = %err, "page-flip event dropped");
        }
    }
}

struct Connector {
    index: u32,
    requests: RequestRing,
    events: FlipEvents,
}

/// Virtual display (vdispl) frontend: one request ring and one event page per connector, all
/// sharing the frontend's buffers.
pub struct DisplayFrontend {
    grants: Arc<dyn GrantTable>,
    channels: Arc<dyn EventChannelFactory>,
    sink: Arc<dyn DisplaySink>,
    importer: Option<ZeroCopyImporter>,
    cookie_policy: CookiePolicy,
    map_cpu: bool,
    registry: Option<BufferRegistry>,
    connectors: Vec<Connector>,
}

impl DisplayFrontend {
    pub fn new(
        grants: Arc<dyn GrantTable>,
        channels: Arc<dyn EventChannelFactory>,
        sink: Arc<dyn DisplaySink>,
    ) -> Self {
        Self {
            grants,
            channels,
            sink,
            importer: None,
            cookie_policy: CookiePolicy::default(),
            map_cpu: false,
            registry: None,
            connectors: Vec::new(),
        }
    }

    /// A frontend with the policies of `config`. `importer` is only used when zero-copy is
    /// enabled.
    pub fn from_config(
        grants: Arc<dyn GrantTable>,
        channels: Arc<dyn EventChannelFactory>,
        sink: Arc<dyn DisplaySink>,
        importer: Option<ZeroCopyImporter>,
        config: &BackendConfig,
    ) -> Self {
        let mut frontend = Self::new(grants, channels, sink)
            .with_cookie_policy(config.cookie_policy)
            .with_cpu_mapping(config.map_cpu);
        if config.zero_copy {
            frontend.importer = importer;
        }
        frontend
    }

    pub fn with_importer(mut self, importer: ZeroCopyImporter) -> Self {
        self.importer = Some(importer);
        self
    }

    pub fn with_cookie_policy(mut self, policy: CookiePolicy) -> Self {
        self.cookie_policy = policy;
        self
    }

    pub fn with_cpu_mapping(mut self, map_cpu: bool) -> Self {
        self.map_cpu = map_cpu;
        self
    }

    pub fn is_zero_copy(&self) -> bool {
        self.importer.is_some()
    }

    /// Buffers of the connected frontend.
    pub fn registry(&self) -> Option<&BufferRegistry> {
        self.registry.as_ref()
    }

    pub fn connector_count(&self) -> usize {
        self.connectors.len()
    }

    fn bind_connector(&self, ctx: &SessionContext, index: u32) -> Result<Connector> {
        let key = |field: &str| format!("{index}/{field}");
        let req_gref = GrantRef(ctx.read_uint(&key(displif::field::REQ_RING_REF))?);
        let req_port = ctx.read_uint(&key(displif::field::REQ_CHANNEL))?;
        let evt_gref = GrantRef(ctx.read_uint(&key(displif::field::EVT_RING_REF))?);
        let evt_port = ctx.read_uint(&key(displif::field::EVT_CHANNEL))?;

        let domid = ctx.domid();
        let req_page = GrantMapping::map(self.grants.clone(), domid, vec![req_gref])?;
        let req_channel = self.channels.bind(domid, req_port)?;
        let requests = RequestRing::new(req_page, displif::XENDISPL_REQ_SIZE, req_channel)?;

        let evt_page = GrantMapping::map(self.grants.clone(), domid, vec![evt_gref])?;
        let evt_channel = self.channels.bind(domid, evt_port)?;
        let ring = EventRing::new(evt_page, EventRingLayout::DISPLIF_EVT, evt_channel)?;

        debug!(domid, connector = index, %req_gref, req_port, %evt_gref, evt_port, "connector bound");
        Ok(Connector {
            index,
            requests,
            events: FlipEvents { ring, next_id: 0 },
        })
    }
}

impl FrontendHandler for DisplayFrontend {
    fn init(&mut self, ctx: &SessionContext) -> Result<()> {
        ctx.write_backend(displif::field::BE_ALLOC, "0")
    }

    fn bind(&mut self, ctx: &SessionContext) -> Result<()> {
        let mut indices: Vec<u32> = ctx
            .frontend_children()?
            .iter()
            .filter_map(|name| name.parse().ok())
            .collect();
        indices.sort_unstable();
        if indices.is_empty() {
            return Err(SessionError::NoConnectors(ctx.frontend_path().to_owned()));
        }

        let connectors = indices
            .into_iter()
            .map(|index| self.bind_connector(ctx, index))
            .collect::<Result<Vec<_>>>()?;

        let mut registry = BufferRegistry::new(ctx.domid(), self.grants.clone(), self.sink.clone())
            .with_cookie_policy(self.cookie_policy)
            .with_cpu_mapping(self.map_cpu);
        if let Some(importer) = &self.importer {
            registry = registry.with_importer(importer.clone());
        }

        info!(
            domid = ctx.domid(),
            connectors = connectors.len(),
            zero_copy = registry.is_zero_copy(),
            "display frontend connected"
        );
        self.connectors = connectors;
        self.registry = Some(registry);
        Ok(())
    }

    fn service(&mut self, ctx: &SessionContext) -> Result<()> {
        let Some(registry) = &self.registry else {
            return Ok(());
        };
        for connector in &mut self.connectors {
            let Connector {
                index,
                requests,
                events,
            } = connector;
            let handled = requests.service(|bytes| handle_request(registry, events, bytes).to_le_bytes().to_vec())?;
            if handled > 0 {
                debug!(domid = ctx.domid(), connector = *index, handled, "requests serviced");
            }
        }
        Ok(())
    }

    fn teardown(&mut self, ctx: &SessionContext) {
        self.connectors.clear();
        if let Some(registry) = self.registry.take() {
            registry.clear();
        }
        debug!(domid = ctx.domid(), "display frontend disconnected");
    }
}

impl fmt::Debug for DisplayFrontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayFrontend")
            .field("zero_copy", &self.is_zero_copy())
            .field("cookie_policy", &self.cookie_policy)
            .field("connectors", &self.connectors.len())
            .finish_non_exhaustive()
    }
}

fn handle_request(registry: &BufferRegistry, events: &mut FlipEvents, bytes: &[u8]) -> DisplayResponse {
    let request = match DisplayRequest::decode(bytes) {
        Ok(request) => request,
        Err(err) => {
            let (id, operation) = DisplayRequest::header(bytes).unwrap_or((0, 0));
            warn!(domid = registry.domid(), id, operation, error = %err, "undecodable request");
            return DisplayResponse {
                id,
                operation,
                status: -errno::EOPNOTSUPP,
            };
        }
    };

    let operation = request.body.operation();
    let status = match execute(registry, events, &request.body) {
        Ok(()) => 0,
        Err(status) => status,
    };
    if status != 0 {
        debug!(domid = registry.domid(), id = request.id, operation, status, "request failed");
    }
    DisplayResponse {
        id: request.id,
        operation,
        status,
    }
}

fn execute(registry: &BufferRegistry, events: &mut FlipEvents, body: &RequestBody) -> std::result::Result<(), i32> {
    let status = |err: BufferError| {
        warn!(domid = registry.domid(), error = %err, "display request refused");
        request_status(&err)
    };
    match *body {
        RequestBody::DbufCreate(req) => {
            if req.flags & displif::XENDISPL_DBUF_FLG_REQ_ALLOC != 0 {
                return Err(-errno::EOPNOTSUPP);
            }
            if req.data_ofs != 0 {
                return Err(-errno::EINVAL);
            }
            registry
                .create_display_buffer(&DisplayBufferRequest {
                    cookie: req.dbuf_cookie,
                    directory: GrantRef(req.gref_directory),
                    size: req.buffer_sz,
                    width: req.width,
                    height: req.height,
                    bpp: req.bpp,
                })
                .map_err(status)?;
        }
        RequestBody::DbufDestroy(req) => {
            registry.destroy_display_buffer(req.cookie);
        }
        RequestBody::FbAttach(req) => {
            registry
                .create_frame_buffer(&FrameBufferRequest {
                    db_cookie: req.dbuf_cookie,
                    fb_cookie: req.fb_cookie,
                    width: req.width,
                    height: req.height,
                    pixel_format: req.pixel_format,
                })
                .map_err(status)?;
        }
        RequestBody::FbDetach(req) => {
            registry.destroy_frame_buffer(req.cookie);
        }
        RequestBody::SetConfig(req) => {
            let mode = DisplayMode {
                x: req.x,
                y: req.y,
                width: req.width,
                height: req.height,
                bpp: req.bpp,
            };
            registry.set_config(req.fb_cookie, mode).map_err(status)?;
        }
        RequestBody::PageFlip(req) => {
            registry.present(req.cookie).map_err(status)?;
            events.publish(req.cookie);
        }
    }
    Ok(())
}
