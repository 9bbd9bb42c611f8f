use std::net::Ipv4Addr;

/// The teardown log of host configuration mutations.
///
/// Every route or gateway change applied to the host gets a matching entry
/// here, and `close` undoes them in insertion order. Failures are logged and
/// never abort the sequence, so a partially applied setup still unwinds as
/// far as it can.
#[derive(Default)]
pub struct Reverser {
    route_deletions: Vec<RouteEntry>,
    reset_gateway: Option<Ipv4Addr>,
}

struct RouteEntry {
    dest: Ipv4Addr,
    via: Ipv4Addr,
    dev: String,
}

impl Reverser {
    /// Record a route for deletion at teardown.
    pub fn add_route_entry(&mut self, dest: Ipv4Addr, via: Ipv4Addr, dev: &str) {
        self.route_deletions.push(RouteEntry {
            dest,
            via,
            dev: dev.to_string(),
        });
    }

    /// Remember the gateway to restore once the tunnel interface is gone.
    /// Only relevant on platforms where the default route was moved onto the
    /// tunnel itself.
    pub fn reset_gateway_osx(&mut self, old_gw: Ipv4Addr) {
        self.reset_gateway = Some(old_gw);
    }

    /// Undo every recorded mutation. The caller has already closed the TUN
    /// device; consuming `self` makes a second teardown impossible.
    pub async fn close(self) {
        for route in &self.route_deletions {
            match super::del_route(route.dest, route.via, &route.dev).await {
                Ok(()) => {
                    log::info!(
                        "deleted route to {} via {} on {}",
                        route.dest,
                        route.via,
                        route.dev
                    );
                }
                Err(e) => {
                    log::error!(
                        "route delete {} ({} on {}) failed: {e}",
                        route.dest,
                        route.via,
                        route.dev
                    );
                }
            }
        }

        if let Some(gw) = self.reset_gateway {
            if let Err(e) = super::add_default_route(gw).await {
                log::error!("failed to restore default gateway {gw}: {e}");
            }
        }
    }
}
