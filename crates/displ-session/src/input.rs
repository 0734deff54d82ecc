use std::fmt;
use std::sync::Arc;

use displ_grant::{GrantMapping, GrantRef, GrantTable};
use displ_input::{InputProvider, PumpConfig, PumpStats, RingEventPump};
use displ_protocol::kbdif;
use displ_ring::{EventChannelFactory, EventRing, EventRingLayout};
use tracing::{debug, info};

use crate::{parse_identity, FrontendHandler, Result, SessionContext};

/// Virtual keyboard (vkbd) frontend: one shared input page fed by the host sources named in
/// the frontend's `id`.
pub struct InputFrontend {
    grants: Arc<dyn GrantTable>,
    channels: Arc<dyn EventChannelFactory>,
    provider: Arc<dyn InputProvider>,
    config: PumpConfig,
    pump: Option<RingEventPump>,
    last_stats: Option<PumpStats>,
}

impl InputFrontend {
    pub fn new(
        grants: Arc<dyn GrantTable>,
        channels: Arc<dyn EventChannelFactory>,
        provider: Arc<dyn InputProvider>,
        config: PumpConfig,
    ) -> Self {
        Self {
            grants,
            channels,
            provider,
            config,
            pump: None,
            last_stats: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.pump.is_some()
    }

    /// Counts of the running pump, or of the last one if the frontend has disconnected.
    pub fn stats(&self) -> Option<PumpStats> {
        match &self.pump {
            Some(pump) => Some(pump.stats()),
            None => self.last_stats,
        }
    }
}

impl FrontendHandler for InputFrontend {
    fn init(&mut self, ctx: &SessionContext) -> Result<()> {
        ctx.write_backend(kbdif::field::FEAT_ABS_POINTER, "1")
    }

    fn bind(&mut self, ctx: &SessionContext) -> Result<()> {
        let port = ctx.read_uint(kbdif::field::EVT_CHANNEL)?;
        let gref = GrantRef(ctx.read_uint(kbdif::field::RING_GREF)?);
        let identity = parse_identity(&ctx.read_string(kbdif::field::ID)?)?;
        debug!(domid = ctx.domid(), port, %gref, ?identity, "binding input frontend");

        let capabilities =
            self.provider
                .open(&identity.keyboard, &identity.pointer, &identity.touch)?;
        let page = GrantMapping::map(self.grants.clone(), ctx.domid(), vec![gref])?;
        let channel = self.channels.bind(ctx.domid(), port)?;
        let ring = EventRing::new(page, EventRingLayout::KBDIF_IN, channel)?;
        let pump = RingEventPump::start(ctx.domid(), ring, capabilities, self.config)?;
        info!(domid = ctx.domid(), capabilities = ?pump.capabilities(), "input frontend connected");
        self.pump = Some(pump);
        Ok(())
    }

    fn teardown(&mut self, ctx: &SessionContext) {
        if let Some(pump) = self.pump.take() {
            let stats = pump.stop();
            debug!(
                domid = ctx.domid(),
                published = stats.published,
                dropped = stats.dropped,
                ring_full = stats.ring_full,
                "input frontend disconnected"
            );
            self.last_stats = Some(stats);
        }
    }
}

impl fmt::Debug for InputFrontend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputFrontend")
            .field("config", &self.config)
            .field("pump", &self.pump)
            .finish_non_exhaustive()
    }
}
