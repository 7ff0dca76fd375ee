//! NET/ROM neighbor and route tables.
//!
//! Routes come from two places: NODES broadcasts (classic NET/ROM quality
//! math) and passive inference over third-party digipeated traffic. Route
//! selection applies hysteresis so marginal quality flapping does not churn
//! the preferred next hop.

use crate::freshness;
use paclink_proto::address::Address;
use paclink_proto::classify::Classification;
use paclink_proto::netrom::NodesBroadcast;
use std::collections::HashMap;
use tracing::debug;

/// Where routes are learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
    /// Broadcasts only; inference disabled.
    Classic,
    /// Inference only; broadcasts ignored.
    Inference,
    /// Both, with routes tagged by source.
    Hybrid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborSource {
    Classic,
    Inferred,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Learned from a NODES broadcast.
    Broadcast,
    /// Synthesized from direct traffic with a neighbor.
    Classic,
    /// Learned by watching third-party traffic.
    Inferred,
}

/// A directly reachable station.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub callsign: Address,
    pub quality: u8,
    pub last_seen_ms: i64,
    pub obsolescence_count: u32,
    pub source: NeighborSource,
}

/// One way to reach a destination.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub destination: Address,
    /// The neighbor that advertised or carried the packet.
    pub origin: Address,
    pub quality: u8,
    pub path: Vec<Address>,
    pub last_updated_ms: i64,
    pub source: RouteSource,
}

/// Router tuning.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub mode: RouterMode,
    pub max_routes_per_destination: usize,
    pub minimum_route_quality: u8,
    /// EWMA weight (out of 256) for neighbor quality updates. Small on
    /// purpose: integer truncation then keeps converged quality off 255.
    pub neighbor_alpha: u32,
    /// Starting quality of inferred routes.
    pub inferred_base_quality: u8,
    /// Ceiling for inferred route quality.
    pub inferred_quality_cap: u8,
    /// Half-life of passive-inference evidence, milliseconds.
    pub evidence_half_life_ms: i64,
    /// Path quality assumed for a broadcast origin we have no neighbor
    /// entry for.
    pub default_broadcast_path_quality: u8,
    /// Quality advantage (fraction) a challenger needs to displace the
    /// preferred route.
    pub hysteresis_margin: f64,
    /// Minimum dwell between preferred-route switches, milliseconds.
    pub hysteresis_hold_ms: i64,
    pub route_ttl_ms: i64,
    pub neighbor_ttl_ms: i64,
    pub freshness_plateau_ms: i64,
    /// Window within which incoming+outgoing traffic counts as mutual.
    pub mutual_window_ms: i64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            mode: RouterMode::Hybrid,
            max_routes_per_destination: 3,
            minimum_route_quality: 10,
            neighbor_alpha: 2,
            inferred_base_quality: 64,
            inferred_quality_cap: 192,
            evidence_half_life_ms: 45_000,
            default_broadcast_path_quality: 192,
            hysteresis_margin: 0.12,
            hysteresis_hold_ms: 120_000,
            route_ttl_ms: 1_800_000,
            neighbor_ttl_ms: 1_800_000,
            freshness_plateau_ms: 300_000,
            mutual_window_ms: 300_000,
        }
    }
}

#[derive(Debug, Clone)]
struct Preferred {
    origin: Address,
    last_switch_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct Evidence {
    weight: f64,
    last_ms: i64,
}

/// The NET/ROM router.
#[derive(Debug)]
pub struct NetRomRouter {
    config: RouterConfig,
    local: Address,
    neighbors: HashMap<Address, Neighbor>,
    routes: HashMap<(Address, Address), Route>,
    preferred: HashMap<Address, Preferred>,
    evidence: HashMap<(Address, Address), Evidence>,
    last_outgoing_ms: HashMap<Address, i64>,
}

impl NetRomRouter {
    pub fn new(local: Address, config: RouterConfig) -> Self {
        Self {
            config,
            local,
            neighbors: HashMap::new(),
            routes: HashMap::new(),
            preferred: HashMap::new(),
            evidence: HashMap::new(),
            last_outgoing_ms: HashMap::new(),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn set_mode(&mut self, mode: RouterMode) {
        self.config.mode = mode;
    }

    pub fn local(&self) -> &Address {
        &self.local
    }

    /// Notes a transmission to `to` so return traffic counts as mutual.
    pub fn note_outgoing(&mut self, to: &Address, now_ms: i64) {
        self.last_outgoing_ms.insert(to.clone(), now_ms);
    }

    /// Feeds one directly received frame: `from` sent traffic whose
    /// destination is the local station.
    ///
    /// Beacons and routing broadcasts are infrastructure; they never create
    /// a neighbor.
    pub fn observe_direct(
        &mut self,
        from: &Address,
        classification: Classification,
        now_ms: i64,
    ) {
        if *from == self.local {
            return;
        }
        let creates = matches!(
            classification,
            Classification::DataProgress
                | Classification::AckOnly
                | Classification::SessionControl
        );
        if !creates {
            // Infrastructure traffic refreshes an existing neighbor but
            // neither creates one nor counts as delivery evidence.
            if let Some(entry) = self.neighbors.get_mut(from) {
                entry.last_seen_ms = now_ms;
            }
            return;
        }

        let alpha = self.config.neighbor_alpha;
        let mutual = self
            .last_outgoing_ms
            .get(from)
            .is_some_and(|&t| now_ms - t <= self.config.mutual_window_ms);

        let entry = self.neighbors.entry(from.clone()).or_insert_with(|| Neighbor {
            callsign: from.clone(),
            quality: 0,
            last_seen_ms: now_ms,
            obsolescence_count: 0,
            source: NeighborSource::Classic,
        });
        entry.quality = bump_quality(entry.quality, 255, alpha);
        if mutual {
            // Two-way traffic is stronger evidence of a usable link.
            entry.quality = bump_quality(entry.quality, 255, alpha * 8);
        }
        entry.last_seen_ms = now_ms;
        entry.obsolescence_count = 0;
        if entry.source == NeighborSource::Inferred {
            entry.source = NeighborSource::Classic;
        }

        // In hybrid operation direct traffic also yields a trivial route to
        // the neighbor itself. Classic mode takes routes from broadcasts
        // only, inference mode from overheard traffic only.
        if self.config.mode == RouterMode::Hybrid {
            let quality = entry.quality;
            self.upsert_route(Route {
                destination: from.clone(),
                origin: from.clone(),
                quality,
                path: vec![from.clone()],
                last_updated_ms: now_ms,
                source: RouteSource::Classic,
            });
        }
    }

    /// Ingests a NODES broadcast (classic and hybrid modes).
    pub fn ingest_broadcast(&mut self, broadcast: &NodesBroadcast, now_ms: i64) {
        if self.config.mode == RouterMode::Inference {
            return;
        }
        let path_quality = self
            .neighbors
            .get(&broadcast.origin)
            .map(|n| n.quality)
            .unwrap_or(self.config.default_broadcast_path_quality)
            as u32;

        for entry in &broadcast.entries {
            // Loop rejection: never store a route to ourselves.
            if entry.destination == self.local {
                continue;
            }
            let stored = (((entry.quality as u32) * path_quality) + 128) / 256;
            let stored = stored.min(255) as u8;
            if stored < self.config.minimum_route_quality {
                continue;
            }
            self.upsert_route(Route {
                destination: entry.destination.clone(),
                origin: broadcast.origin.clone(),
                quality: stored,
                path: vec![broadcast.origin.clone()],
                last_updated_ms: now_ms,
                source: RouteSource::Broadcast,
            });
        }
    }

    /// Feeds an overheard third-party frame `source → dest via path`
    /// (inference and hybrid modes).
    pub fn observe_third_party(
        &mut self,
        source: &Address,
        dest: &Address,
        via: &[Address],
        now_ms: i64,
    ) {
        if matches!(self.config.mode, RouterMode::Classic) {
            return;
        }
        if via.is_empty() {
            return;
        }
        // Traffic through or from us teaches us nothing new.
        if *source == self.local || *dest == self.local || via.contains(&self.local) {
            return;
        }
        let next_hop = via[0].clone();
        if next_hop == *source {
            return;
        }

        // Inferred neighbor: the digipeater is audible from here.
        self.neighbors
            .entry(next_hop.clone())
            .or_insert_with(|| Neighbor {
                callsign: next_hop.clone(),
                quality: self.config.inferred_base_quality,
                last_seen_ms: now_ms,
                obsolescence_count: 0,
                source: NeighborSource::Inferred,
            })
            .last_seen_ms = now_ms;

        // Evidence with exponential decay.
        let half_life = self.config.evidence_half_life_ms;
        let evidence = self
            .evidence
            .entry((source.clone(), next_hop.clone()))
            .or_insert(Evidence {
                weight: 0.0,
                last_ms: now_ms,
            });
        let decay = if half_life > 0 {
            0.5_f64.powf((now_ms - evidence.last_ms).max(0) as f64 / half_life as f64)
        } else {
            0.0
        };
        evidence.weight = evidence.weight * decay + 1.0;
        evidence.last_ms = now_ms;
        let weight = evidence.weight;

        let quality = (self.config.inferred_base_quality as f64
            + (weight - 1.0) * 16.0)
            .min(self.config.inferred_quality_cap as f64) as u8;

        // Path is the digipeater chain reversed, terminating in the source.
        let mut path: Vec<Address> = via.iter().rev().cloned().collect();
        path.push(source.clone());

        debug!(dest = %source, origin = %next_hop, quality, "inferred route");
        self.upsert_route(Route {
            destination: source.clone(),
            origin: next_hop,
            quality,
            path,
            last_updated_ms: now_ms,
            source: RouteSource::Inferred,
        });
    }

    fn upsert_route(&mut self, route: Route) {
        let key = (route.destination.clone(), route.origin.clone());
        self.routes.insert(key, route.clone());
        self.trim_destination(&route.destination);
    }

    /// Keeps only the best `max_routes_per_destination` entries above the
    /// quality floor for one destination.
    fn trim_destination(&mut self, destination: &Address) {
        let mut entries: Vec<(Address, u8)> = self
            .routes
            .iter()
            .filter(|((d, _), _)| d == destination)
            .map(|((_, o), r)| (o.clone(), r.quality))
            .collect();
        if entries.len() <= self.config.max_routes_per_destination {
            return;
        }
        entries.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        for (origin, _) in entries.drain(self.config.max_routes_per_destination..) {
            self.routes.remove(&(destination.clone(), origin));
        }
    }

    pub fn neighbors(&self) -> Vec<Neighbor> {
        let mut out: Vec<Neighbor> = self.neighbors.values().cloned().collect();
        out.sort_by(|a, b| {
            b.quality
                .cmp(&a.quality)
                .then_with(|| a.callsign.cmp(&b.callsign))
        });
        out
    }

    pub fn neighbor(&self, callsign: &Address) -> Option<&Neighbor> {
        self.neighbors.get(callsign)
    }

    pub fn routes(&self) -> Vec<Route> {
        let mut out: Vec<Route> = self.routes.values().cloned().collect();
        out.sort_by(|a, b| {
            a.destination
                .cmp(&b.destination)
                .then_with(|| b.quality.cmp(&a.quality))
                .then_with(|| a.origin.cmp(&b.origin))
        });
        out
    }

    pub fn routes_to(&self, destination: &Address) -> Vec<Route> {
        let mut out: Vec<Route> = self
            .routes
            .values()
            .filter(|r| r.destination == *destination)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.quality.cmp(&a.quality).then_with(|| a.origin.cmp(&b.origin)));
        out
    }

    /// Picks the route to use right now, applying hysteresis: the preferred
    /// route is kept unless a challenger beats it by the configured margin
    /// and the hold time has passed. Expired routes are never returned.
    pub fn best_route_to(&mut self, destination: &Address, now_ms: i64) -> Option<Route> {
        let live: Vec<Route> = self
            .routes_to(destination)
            .into_iter()
            .filter(|r| now_ms - r.last_updated_ms <= self.config.route_ttl_ms)
            .collect();
        let challenger = live.first().cloned()?;

        match self.preferred.get(destination) {
            Some(pref) => {
                if let Some(current) = live.iter().find(|r| r.origin == pref.origin) {
                    if challenger.origin == current.origin {
                        return Some(challenger);
                    }
                    let margin_ok = (challenger.quality as f64)
                        >= (current.quality as f64) * (1.0 + self.config.hysteresis_margin);
                    let held_ok = now_ms - pref.last_switch_ms >= self.config.hysteresis_hold_ms;
                    if margin_ok && held_ok {
                        self.preferred.insert(
                            destination.clone(),
                            Preferred {
                                origin: challenger.origin.clone(),
                                last_switch_ms: now_ms,
                            },
                        );
                        Some(challenger)
                    } else {
                        Some(current.clone())
                    }
                } else {
                    // The preferred route vanished or expired; adopt the
                    // challenger without ceremony.
                    self.preferred.insert(
                        destination.clone(),
                        Preferred {
                            origin: challenger.origin.clone(),
                            last_switch_ms: now_ms,
                        },
                    );
                    Some(challenger)
                }
            }
            None => {
                self.preferred.insert(
                    destination.clone(),
                    Preferred {
                        origin: challenger.origin.clone(),
                        last_switch_ms: now_ms,
                    },
                );
                Some(challenger)
            }
        }
    }

    /// Display freshness of a neighbor, 1.0 → 0.0.
    pub fn neighbor_freshness(&self, neighbor: &Neighbor, now_ms: i64) -> f64 {
        freshness(
            now_ms - neighbor.last_seen_ms,
            self.config.freshness_plateau_ms,
            self.config.neighbor_ttl_ms,
        )
    }

    /// Display freshness of a route, 1.0 → 0.0.
    pub fn route_freshness(&self, route: &Route, now_ms: i64) -> f64 {
        freshness(
            now_ms - route.last_updated_ms,
            self.config.freshness_plateau_ms,
            self.config.route_ttl_ms,
        )
    }

    /// Restores persisted state.
    pub fn restore(&mut self, neighbors: Vec<Neighbor>, routes: Vec<Route>) {
        for n in neighbors {
            self.neighbors.insert(n.callsign.clone(), n);
        }
        for r in routes {
            self.routes
                .insert((r.destination.clone(), r.origin.clone()), r);
        }
    }
}

/// `new = (alpha * observed + (256 - alpha) * current) / 256`, rounded.
/// With a small alpha the rounding makes the sequence stall short of the
/// observed value, so repeated perfect observations converge high but never
/// peg 255.
fn bump_quality(current: u8, observed: u8, alpha: u32) -> u8 {
    let alpha = alpha.min(256);
    (((alpha * observed as u32) + (256 - alpha) * current as u32 + 128) / 256).min(255) as u8
}
