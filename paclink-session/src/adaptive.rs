//! Adaptive transmission: maps measured link quality onto session
//! configuration, globally and per route.
//!
//! A route key is `(destination, path signature)`. Each tracked field can
//! be pinned manually; otherwise it follows the adaptive value. Sessions
//! snapshot the computed config at creation and are never mutated by later
//! samples.

use crate::config::SessionConfig;
use paclink_proto::address::Address;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::debug;

/// Adaptive defaults restored by `clear_all_learned`.
pub const ADAPTIVE_DEFAULT_WINDOW: u8 = 2;
pub const ADAPTIVE_DEFAULT_PACLEN: u16 = 128;
pub const ADAPTIVE_DEFAULT_RETRIES: u32 = 10;

/// High-loss regime threshold.
const LOSS_HIGH: f64 = 0.3;
/// Clean-link thresholds.
const LOSS_LOW: f64 = 0.1;
const ETX_LOW: f64 = 1.5;

/// Key of a per-route adaptive entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteAdaptiveKey {
    pub destination: Address,
    /// Comma-joined via list; empty for direct.
    pub path_signature: String,
}

impl RouteAdaptiveKey {
    pub fn new(destination: Address, path_signature: &str) -> Self {
        Self {
            destination,
            path_signature: path_signature.to_string(),
        }
    }
}

/// One measurement of a link.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkQualitySample {
    /// Fraction of frames lost, 0..=1.
    pub loss_rate: f64,
    /// Expected transmissions per delivery.
    pub etx: f64,
    /// Smoothed round-trip time.
    pub srtt: Duration,
}

/// Whether a field follows samples or a manual pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdaptiveMode {
    Auto,
    Manual,
}

/// One adaptively tuned field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveField<T: Copy> {
    pub mode: AdaptiveMode,
    pub current_adaptive: T,
    pub manual_value: T,
}

impl<T: Copy> AdaptiveField<T> {
    fn auto(value: T) -> Self {
        Self {
            mode: AdaptiveMode::Auto,
            current_adaptive: value,
            manual_value: value,
        }
    }

    pub fn value(&self) -> T {
        match self.mode {
            AdaptiveMode::Auto => self.current_adaptive,
            AdaptiveMode::Manual => self.manual_value,
        }
    }

    pub fn set_manual(&mut self, value: T) {
        self.mode = AdaptiveMode::Manual;
        self.manual_value = value;
    }

    pub fn set_auto(&mut self) {
        self.mode = AdaptiveMode::Auto;
    }
}

/// The adaptively tracked subset of a session config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveEntry {
    pub window_size: AdaptiveField<u8>,
    pub paclen: AdaptiveField<u16>,
    pub max_retries: AdaptiveField<u32>,
    pub rto_min: AdaptiveField<Duration>,
    pub rto_max: AdaptiveField<Duration>,
}

impl Default for AdaptiveEntry {
    fn default() -> Self {
        Self {
            window_size: AdaptiveField::auto(ADAPTIVE_DEFAULT_WINDOW),
            paclen: AdaptiveField::auto(ADAPTIVE_DEFAULT_PACLEN),
            max_retries: AdaptiveField::auto(ADAPTIVE_DEFAULT_RETRIES),
            rto_min: AdaptiveField::auto(Duration::from_secs(1)),
            rto_max: AdaptiveField::auto(Duration::from_secs(60)),
        }
    }
}

impl AdaptiveEntry {
    /// Applies one sample to the adaptive values (manual pins unaffected).
    fn apply(&mut self, sample: &LinkQualitySample) {
        let w = &mut self.window_size.current_adaptive;
        let p = &mut self.paclen.current_adaptive;
        if sample.loss_rate >= LOSS_HIGH {
            *w = 1;
            *p = 64;
            let r = &mut self.max_retries.current_adaptive;
            *r = (*r).max(10);
            let rto = &mut self.rto_min.current_adaptive;
            *rto = (*rto).max(Duration::from_secs(1));
        } else if sample.loss_rate <= LOSS_LOW && sample.etx <= ETX_LOW {
            *w = (*w + 1).min(7);
            *p = (*p + 32).min(128);
        } else {
            // Blend halfway toward the neutral point.
            *w = ((*w as u16 + 2 + 1) / 2).clamp(1, 7) as u8;
            *p = (*p + 128) / 2;
        }
    }

    fn write_into(&self, config: &mut SessionConfig) {
        config.window_size = self.window_size.value().clamp(1, 7);
        config.paclen = self.paclen.value();
        config.max_retries = self.max_retries.value();
        config.rto_min = self.rto_min.value();
        config.rto_max = self.rto_max.value();
    }
}

/// Global + per-route adaptive state.
#[derive(Debug)]
pub struct AdaptiveConfigStore {
    enabled: bool,
    base: SessionConfig,
    global: AdaptiveEntry,
    routes: HashMap<RouteAdaptiveKey, AdaptiveEntry>,
    /// Destinations pinned to the default config.
    use_default_for: HashSet<Address>,
}

impl Default for AdaptiveConfigStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl AdaptiveConfigStore {
    pub fn new(base: SessionConfig) -> Self {
        Self {
            enabled: true,
            base,
            global: AdaptiveEntry::default(),
            routes: HashMap::new(),
            use_default_for: HashSet::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn global_entry(&self) -> &AdaptiveEntry {
        &self.global
    }

    pub fn route_entry(&self, key: &RouteAdaptiveKey) -> Option<&AdaptiveEntry> {
        self.routes.get(key)
    }

    /// Pin a destination to the default config.
    pub fn use_default_for(&mut self, destination: Address) {
        self.use_default_for.insert(destination);
    }

    pub fn clear_default_override(&mut self, destination: &Address) {
        self.use_default_for.remove(destination);
    }

    /// Ingests a link-quality sample for one route or, with `route` absent,
    /// for the global default. Ignored while adaptive transmission is off.
    pub fn apply_sample(&mut self, sample: LinkQualitySample, route: Option<RouteAdaptiveKey>) {
        if !self.enabled {
            return;
        }
        match route {
            Some(key) => {
                debug!(dest = %key.destination, path = %key.path_signature,
                       loss = sample.loss_rate, etx = sample.etx, "route sample");
                self.routes.entry(key).or_default().apply(&sample);
            }
            None => self.global.apply(&sample),
        }
    }

    /// Computes the session config for a destination and path at session
    /// creation time.
    ///
    /// Precedence: disabled or overridden destinations get the defaults; an
    /// exact `(destination, path)` entry wins; otherwise all entries for the
    /// destination merge conservatively (min window, min paclen, max
    /// retries, max rto_min, min rto_max); with no route entries the global
    /// adaptive entry applies.
    pub fn session_config_for(&self, destination: &Address, path_signature: &str) -> SessionConfig {
        let mut config = self.base;
        if !self.enabled || self.use_default_for.contains(destination) {
            return config;
        }

        let exact = RouteAdaptiveKey::new(destination.clone(), path_signature);
        if let Some(entry) = self.routes.get(&exact) {
            entry.write_into(&mut config);
            return config;
        }

        let matching: Vec<&AdaptiveEntry> = self
            .routes
            .iter()
            .filter(|(key, _)| key.destination == *destination)
            .map(|(_, entry)| entry)
            .collect();

        if matching.is_empty() {
            self.global.write_into(&mut config);
            return config;
        }

        let mut merged = *matching[0];
        for entry in &matching[1..] {
            merged.window_size.current_adaptive = merged
                .window_size
                .value()
                .min(entry.window_size.value());
            merged.paclen.current_adaptive = merged.paclen.value().min(entry.paclen.value());
            merged.max_retries.current_adaptive =
                merged.max_retries.value().max(entry.max_retries.value());
            merged.rto_min.current_adaptive = merged.rto_min.value().max(entry.rto_min.value());
            merged.rto_max.current_adaptive = merged.rto_max.value().min(entry.rto_max.value());
            merged.window_size.mode = AdaptiveMode::Auto;
            merged.paclen.mode = AdaptiveMode::Auto;
            merged.max_retries.mode = AdaptiveMode::Auto;
            merged.rto_min.mode = AdaptiveMode::Auto;
            merged.rto_max.mode = AdaptiveMode::Auto;
        }
        merged.write_into(&mut config);
        config
    }

    /// Resets all learned state: global back to defaults, per-route cache
    /// and override set emptied.
    pub fn clear_all_learned(&mut self) {
        self.global = AdaptiveEntry::default();
        self.routes.clear();
        self.use_default_for.clear();
    }
}
