use std::sync::Arc;

use super::{Registrations, Shim, ShimContext};
use crate::capability::{Capability, CapabilityRegistry};
use crate::intent::IntentKind;

/// Outbound-connection interception via transparent redirection to the
/// daemon. Evaluates independently of the other shims, so a missing
/// command primitive never weakens network rules.
pub struct NetworkShim {
    ctx: ShimContext,
    capabilities: Arc<CapabilityRegistry>,
    registrations: Registrations,
}

impl NetworkShim {
    pub fn new(ctx: ShimContext, capabilities: Arc<CapabilityRegistry>) -> Self {
        Self {
            ctx,
            capabilities,
            registrations: Registrations::default(),
        }
    }
}

impl Shim for NetworkShim {
    fn kind(&self) -> IntentKind {
        IntentKind::NetConnect
    }

    fn capability(&self) -> Capability {
        Capability::NetIntercept
    }

    fn context(&self) -> &ShimContext {
        &self.ctx
    }

    fn registrations(&self) -> &Registrations {
        &self.registrations
    }

    fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }
}
