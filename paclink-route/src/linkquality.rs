//! Per-link delivery estimation.
//!
//! Every directed link `(from, to)` carries an EWMA forward-delivery ratio
//! fed by classified observations, an optional reverse ratio fed only by
//! real acknowledgment evidence, a duplicate counter, and an adaptive
//! time-to-live derived from the observed inter-arrival rhythm. Stale links
//! tombstone (quality 0, statistics kept) before being removed entirely.

use paclink_proto::address::Address;
use paclink_proto::classify::Classification;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// A directed link.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LinkKey {
    pub from: Address,
    pub to: Address,
}

impl LinkKey {
    pub fn new(from: Address, to: Address) -> Self {
        Self { from, to }
    }
}

/// Estimator tuning.
#[derive(Debug, Clone, Copy)]
pub struct LinkQualityConfig {
    /// EWMA half-life for the forward ratio, milliseconds.
    pub forward_half_life_ms: i64,
    /// EWMA half-life for the reverse ratio, milliseconds.
    pub reverse_half_life_ms: i64,
    /// Base sliding window; also the TTL floor, milliseconds.
    pub base_ttl_ms: i64,
    /// TTL ceiling, milliseconds.
    pub max_ttl_ms: i64,
    /// Multiplier applied to the smoothed inter-arrival.
    pub ttl_multiplier: f64,
    /// EWMA weight for inter-arrival smoothing.
    pub interarrival_alpha: f64,
    /// Forward ratio a link starts from at its first observation.
    pub initial_delivery_ratio: f64,
    /// How many arrival timestamps to keep per link.
    pub arrival_ring: usize,
}

impl Default for LinkQualityConfig {
    fn default() -> Self {
        Self {
            forward_half_life_ms: 300_000,
            reverse_half_life_ms: 300_000,
            base_ttl_ms: 900_000,
            max_ttl_ms: 7_200_000,
            ttl_multiplier: 6.0,
            interarrival_alpha: 0.3,
            initial_delivery_ratio: 0.5,
            arrival_ring: 16,
        }
    }
}

/// Public view of one link's statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStat {
    pub from: Address,
    pub to: Address,
    pub quality: u8,
    pub last_updated_ms: i64,
    pub df_estimate: Option<f64>,
    pub dr_estimate: Option<f64>,
    pub duplicate_count: u64,
    pub observation_count: u64,
    pub ewma_quality: u8,
}

#[derive(Debug, Clone)]
struct LinkEntry {
    df: f64,
    dr: Option<f64>,
    quality: u8,
    ewma_quality: f64,
    duplicate_count: u64,
    observation_count: u64,
    last_updated_ms: i64,
    arrivals: VecDeque<i64>,
    ema_interarrival_ms: Option<f64>,
    tombstoned_at_ms: Option<i64>,
}

impl LinkEntry {
    fn stat(&self, key: &LinkKey) -> LinkStat {
        LinkStat {
            from: key.from.clone(),
            to: key.to.clone(),
            quality: self.quality,
            last_updated_ms: self.last_updated_ms,
            df_estimate: Some(self.df),
            dr_estimate: self.dr,
            duplicate_count: self.duplicate_count,
            observation_count: self.observation_count,
            ewma_quality: self.ewma_quality.round().clamp(0.0, 255.0) as u8,
        }
    }
}

/// The per-link delivery estimator.
#[derive(Debug)]
pub struct LinkQualityEstimator {
    config: LinkQualityConfig,
    links: HashMap<LinkKey, LinkEntry>,
}

fn ewma_alpha(delta_ms: i64, half_life_ms: i64) -> f64 {
    if delta_ms <= 0 || half_life_ms <= 0 {
        return 0.0;
    }
    1.0 - 0.5_f64.powf(delta_ms as f64 / half_life_ms as f64)
}

fn fresh_entry(config: &LinkQualityConfig, now_ms: i64) -> LinkEntry {
    LinkEntry {
        df: config.initial_delivery_ratio,
        dr: None,
        quality: (255.0 * config.initial_delivery_ratio).round() as u8,
        ewma_quality: 255.0 * config.initial_delivery_ratio,
        duplicate_count: 0,
        observation_count: 0,
        last_updated_ms: now_ms,
        arrivals: VecDeque::new(),
        ema_interarrival_ms: None,
        tombstoned_at_ms: None,
    }
}

impl LinkQualityEstimator {
    pub fn new(config: LinkQualityConfig) -> Self {
        Self {
            config,
            links: HashMap::new(),
        }
    }

    pub fn config(&self) -> &LinkQualityConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Records one observed packet on `key`.
    pub fn observe(
        &mut self,
        key: LinkKey,
        classification: Classification,
        is_duplicate: bool,
        now_ms: i64,
    ) {
        let config = self.config;
        let entry = self
            .links
            .entry(key)
            .or_insert_with(|| fresh_entry(&config, now_ms));

        let delta = now_ms - entry.last_updated_ms;
        let alpha = ewma_alpha(delta, config.forward_half_life_ms);
        let target = if is_duplicate {
            0.0
        } else {
            classification.forward_weight()
        };
        entry.df = alpha * target + (1.0 - alpha) * entry.df;

        let quality = 255.0 * entry.df * entry.dr.unwrap_or(1.0);
        entry.quality = quality.round().clamp(0.0, 255.0) as u8;
        entry.ewma_quality = alpha * quality + (1.0 - alpha) * entry.ewma_quality;

        entry.observation_count += 1;
        if is_duplicate {
            entry.duplicate_count += 1;
        }

        // Inter-arrival rhythm for the adaptive TTL.
        if let Some(&last) = entry.arrivals.back() {
            let gap = (now_ms - last).max(0) as f64;
            entry.ema_interarrival_ms = Some(match entry.ema_interarrival_ms {
                Some(ema) => config.interarrival_alpha * gap + (1.0 - config.interarrival_alpha) * ema,
                None => gap,
            });
        }
        entry.arrivals.push_back(now_ms);
        while entry.arrivals.len() > config.arrival_ring {
            entry.arrivals.pop_front();
        }

        entry.last_updated_ms = now_ms;
        if entry.tombstoned_at_ms.take().is_some() {
            debug!("link revived from tombstone");
        }
    }

    /// Records reverse-path evidence: an explicit acknowledgment (or its
    /// absence) observed by the session layer. The reverse estimate only
    /// ever comes from calls here; it is never synthesized. An outbound
    /// link whose only evidence is acknowledgments gets an entry of its
    /// own, since the local station cannot overhear its own forward
    /// deliveries.
    pub fn record_reverse_evidence(&mut self, key: LinkKey, delivered: bool, now_ms: i64) {
        let config = self.config;
        let entry = self
            .links
            .entry(key)
            .or_insert_with(|| fresh_entry(&config, now_ms));
        let delta = now_ms - entry.last_updated_ms;
        let alpha = ewma_alpha(delta.max(1), config.reverse_half_life_ms);
        let target = if delivered { 1.0 } else { 0.0 };
        entry.dr = Some(match entry.dr {
            Some(dr) => alpha * target + (1.0 - alpha) * dr,
            None => target,
        });
        let quality = 255.0 * entry.df * entry.dr.unwrap_or(1.0);
        entry.quality = quality.round().clamp(0.0, 255.0) as u8;
        entry.last_updated_ms = now_ms;
        entry.tombstoned_at_ms = None;
    }

    /// The expiry horizon for a link given its observed rhythm: the base
    /// window until three arrivals exist, then the smoothed inter-arrival
    /// times the multiplier, clamped into `base..=max`.
    pub fn effective_ttl_ms(&self, key: &LinkKey) -> i64 {
        let Some(entry) = self.links.get(key) else {
            return self.config.base_ttl_ms;
        };
        self.entry_ttl_ms(entry)
    }

    fn entry_ttl_ms(&self, entry: &LinkEntry) -> i64 {
        if entry.arrivals.len() < 3 {
            return self.config.base_ttl_ms;
        }
        match entry.ema_interarrival_ms {
            Some(ema) => ((self.config.ttl_multiplier * ema) as i64)
                .clamp(self.config.base_ttl_ms, self.config.max_ttl_ms),
            None => self.config.base_ttl_ms,
        }
    }

    pub fn get(&self, key: &LinkKey) -> Option<LinkStat> {
        self.links.get(key).map(|e| e.stat(key))
    }

    pub fn stats(&self) -> Vec<LinkStat> {
        let mut out: Vec<LinkStat> = self.links.iter().map(|(k, e)| e.stat(k)).collect();
        out.sort_by(|a, b| {
            (a.from.clone(), a.to.clone()).cmp(&(b.from.clone(), b.to.clone()))
        });
        out
    }

    /// Loss/ETX view of a link for the adaptive configuration layer.
    pub fn loss_and_etx(&self, key: &LinkKey) -> Option<(f64, f64)> {
        let entry = self.links.get(key)?;
        let df = entry.df.clamp(0.001, 1.0);
        let dr = entry.dr.unwrap_or(1.0).clamp(0.001, 1.0);
        Some((1.0 - entry.df, 1.0 / (df * dr)))
    }

    /// Two-phase expiry sweep. Links whose last observation is older than
    /// their TTL tombstone (quality 0, evidence kept); tombstones older than
    /// another TTL are removed. Returns the number of removed links.
    pub fn sweep(&mut self, now_ms: i64) -> usize {
        let mut to_remove = Vec::new();
        let ttls: Vec<(LinkKey, i64)> = self
            .links
            .iter()
            .map(|(k, e)| (k.clone(), self.entry_ttl_ms(e)))
            .collect();
        for (key, ttl) in ttls {
            let Some(entry) = self.links.get_mut(&key) else {
                continue;
            };
            match entry.tombstoned_at_ms {
                None => {
                    if now_ms - entry.last_updated_ms > ttl {
                        entry.quality = 0;
                        entry.tombstoned_at_ms = Some(now_ms);
                    }
                }
                Some(t) => {
                    if now_ms - t > ttl {
                        to_remove.push(key);
                    }
                }
            }
        }
        let removed = to_remove.len();
        for key in to_remove {
            self.links.remove(&key);
        }
        removed
    }

    /// Rehydrates a link from persisted evidence.
    pub fn restore(&mut self, stat: &LinkStat) {
        let entry = LinkEntry {
            df: stat.df_estimate.unwrap_or(self.config.initial_delivery_ratio),
            dr: stat.dr_estimate,
            quality: stat.quality,
            ewma_quality: stat.ewma_quality as f64,
            duplicate_count: stat.duplicate_count,
            observation_count: stat.observation_count,
            last_updated_ms: stat.last_updated_ms,
            arrivals: VecDeque::new(),
            ema_interarrival_ms: None,
            tombstoned_at_ms: None,
        };
        self.links
            .insert(LinkKey::new(stat.from.clone(), stat.to.clone()), entry);
    }
}
