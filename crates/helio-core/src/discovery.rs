//! Discovery domain types: scan ranges, progress, events, and final stats.
//!
//! A discovery scan walks a host-octet range of a /24 network in ordered
//! phases (liveness probe, then panel identification) and streams one
//! [`DiscoveryEvent::Result`] per address as its classification settles,
//! terminated by exactly one [`DiscoveryEvent::Complete`].

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Highest scannable host octet. `.255` is the subnet broadcast address.
pub const MAX_HOST_OCTET: u8 = 254;

// ============================================================================
// Scan Range
// ============================================================================

/// A validated host-octet range over a /24 network prefix.
///
/// Construct via [`ScanRange::new`], which rejects malformed prefixes and
/// out-of-range or inverted octet bounds before any engine work begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRange {
    base_prefix: String,
    start_octet: u8,
    end_octet: u8,
}

impl ScanRange {
    /// Validates and builds a scan range.
    ///
    /// # Errors
    ///
    /// - `ValidationError::InvalidPrefix` if `base_prefix` is not three
    ///   dotted octets (e.g. `"192.168.1"`)
    /// - `ValidationError::OctetOutOfRange` if either bound exceeds 254
    /// - `ValidationError::InvertedRange` if `start > end`
    pub fn new(
        base_prefix: impl Into<String>,
        start_octet: u8,
        end_octet: u8,
    ) -> Result<Self, ValidationError> {
        let base_prefix = base_prefix.into();

        // Appending ".0" to a valid three-octet prefix must yield a parseable
        // IPv4 address; anything else (too few octets, junk, octet > 255) fails.
        if format!("{base_prefix}.0").parse::<Ipv4Addr>().is_err() {
            return Err(ValidationError::InvalidPrefix {
                prefix: base_prefix,
            });
        }

        for octet in [start_octet, end_octet] {
            if octet > MAX_HOST_OCTET {
                return Err(ValidationError::OctetOutOfRange {
                    octet,
                    max: MAX_HOST_OCTET,
                });
            }
        }

        if start_octet > end_octet {
            return Err(ValidationError::InvertedRange {
                start: start_octet,
                end: end_octet,
            });
        }

        Ok(Self {
            base_prefix,
            start_octet,
            end_octet,
        })
    }

    /// Returns the network prefix (e.g. `"192.168.1"`).
    pub fn base_prefix(&self) -> &str {
        &self.base_prefix
    }

    /// Returns the inclusive host-octet bounds.
    pub fn octets(&self) -> (u8, u8) {
        (self.start_octet, self.end_octet)
    }

    /// Number of addresses covered by this range.
    pub fn total_ips(&self) -> u32 {
        u32::from(self.end_octet) - u32::from(self.start_octet) + 1
    }

    /// Expands the range into concrete addresses, in ascending order.
    pub fn addresses(&self) -> Vec<Ipv4Addr> {
        let base = format!("{}.0", self.base_prefix)
            .parse::<Ipv4Addr>()
            .unwrap_or(Ipv4Addr::UNSPECIFIED)
            .octets();

        (self.start_octet..=self.end_octet)
            .map(|host| Ipv4Addr::new(base[0], base[1], base[2], host))
            .collect()
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Current phase of the discovery scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryPhase {
    /// No scan is running.
    Idle,
    /// Probing every address in the range for liveness.
    Liveness,
    /// Attempting panel identification on responsive addresses.
    Identify,
}

impl DiscoveryPhase {
    /// Stable label used in events and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryPhase::Idle => "idle",
            DiscoveryPhase::Liveness => "liveness",
            DiscoveryPhase::Identify => "identify",
        }
    }
}

impl std::fmt::Display for DiscoveryPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal classification of one scanned address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressClassification {
    /// A shade panel answered the identification handshake.
    Panel,
    /// Something responded, but it is not a panel.
    NotPanel,
    /// The address never answered within the probe timeout.
    NoResponse,
    /// The probe or identification failed unexpectedly.
    Error,
}

/// Metadata for a discovered panel, as reported by its identification banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelSummary {
    /// Address the panel answered on.
    pub address: Ipv4Addr,
    /// Hardware model string.
    pub model: String,
    /// Firmware revision, when the banner carries one.
    pub firmware: Option<String>,
}

// ============================================================================
// Progress
// ============================================================================

/// Live snapshot of the (singleton) discovery scan.
///
/// Mutated only by the scan task that owns the run; everyone else sees
/// cloned snapshots. The outcome counters always sum to `scanned_count`,
/// and `scanned_count` never exceeds `total_ips`: an address is counted
/// exactly once, when its terminal classification settles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryProgress {
    /// Whether a scan task currently owns this record.
    pub is_running: bool,
    /// Phase the scan is currently in (`Idle` when not running).
    pub phase: DiscoveryPhase,
    /// Number of addresses in the scanned range.
    pub total_ips: u32,
    /// Addresses whose terminal classification is known.
    pub scanned_count: u32,
    /// Addresses classified as panels.
    pub panels_found: u32,
    /// Addresses that responded but are not panels.
    pub not_panels: u32,
    /// Addresses that never answered.
    pub no_response: u32,
    /// Addresses whose probe failed unexpectedly.
    pub errors: u32,
    /// Panels found so far, in discovery order.
    pub partial_results: Vec<PanelSummary>,
    /// When the scan started, if one has run.
    pub start_time: Option<DateTime<Utc>>,
}

impl DiscoveryProgress {
    /// An idle snapshot: nothing running, nothing scanned.
    pub fn idle() -> Self {
        Self {
            is_running: false,
            phase: DiscoveryPhase::Idle,
            total_ips: 0,
            scanned_count: 0,
            panels_found: 0,
            not_panels: 0,
            no_response: 0,
            errors: 0,
            partial_results: Vec::new(),
            start_time: None,
        }
    }

    /// A fresh running snapshot for a scan over `total_ips` addresses.
    ///
    /// Discards any previous scan's state, per the one-scan-at-a-time rule.
    pub fn begin(total_ips: u32) -> Self {
        Self {
            is_running: true,
            phase: DiscoveryPhase::Liveness,
            total_ips,
            start_time: Some(Utc::now()),
            ..Self::idle()
        }
    }

    /// Records the terminal classification of one address.
    ///
    /// Increments `scanned_count` and exactly one outcome counter, keeping
    /// the counter-sum invariant by construction. Panel results carry their
    /// summary into `partial_results`.
    pub fn record_outcome(
        &mut self,
        classification: AddressClassification,
        panel: Option<PanelSummary>,
    ) {
        self.scanned_count += 1;
        match classification {
            AddressClassification::Panel => {
                self.panels_found += 1;
                if let Some(summary) = panel {
                    self.partial_results.push(summary);
                }
            }
            AddressClassification::NotPanel => self.not_panels += 1,
            AddressClassification::NoResponse => self.no_response += 1,
            AddressClassification::Error => self.errors += 1,
        }
        debug_assert!(self.scanned_count <= self.total_ips);
        debug_assert_eq!(
            self.panels_found + self.not_panels + self.no_response + self.errors,
            self.scanned_count,
        );
    }

    /// Moves the scan into `phase`.
    pub fn enter_phase(&mut self, phase: DiscoveryPhase) {
        self.phase = phase;
    }

    /// Marks the scan finished. Counters are retained for inspection until
    /// the next scan discards them.
    pub fn finish(&mut self) {
        self.is_running = false;
        self.phase = DiscoveryPhase::Idle;
    }
}

impl Default for DiscoveryProgress {
    fn default() -> Self {
        Self::idle()
    }
}

// ============================================================================
// Events and Stats
// ============================================================================

/// Per-phase wall-clock timing, reported in the terminal stats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTiming {
    /// Which phase ran.
    pub phase: DiscoveryPhase,
    /// How long it took, in milliseconds.
    pub duration_ms: u64,
}

/// Final aggregated statistics for a completed (or aborted) scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryStats {
    /// Number of addresses in the scanned range.
    pub total_ips: u32,
    /// Addresses classified as panels.
    pub panels_found: u32,
    /// Addresses that responded but are not panels.
    pub non_panels: u32,
    /// Addresses that never answered.
    pub no_response: u32,
    /// Addresses whose probe failed unexpectedly.
    pub errors: u32,
    /// Phases that ran, in order, with their durations.
    pub phases: Vec<PhaseTiming>,
    /// Total scan duration in milliseconds.
    pub total_duration_ms: u64,
}

/// One item of the event stream produced by a discovery scan.
///
/// Consumers must handle every variant; the stream is always terminated by
/// exactly one `Complete`, even when the scan is cancelled or the engine
/// hits an internal fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DiscoveryEvent {
    /// One address reached its terminal classification.
    Result {
        /// The probed address.
        address: Ipv4Addr,
        /// How the address was classified.
        classification: AddressClassification,
        /// Panel metadata, for `Panel` classifications.
        panel: Option<PanelSummary>,
    },

    /// The scan crossed a phase boundary.
    PhaseChange {
        /// Phase now starting.
        phase: DiscoveryPhase,
        /// Addresses with a terminal classification so far.
        scanned_count: u32,
        /// Panels found so far.
        panels_found: u32,
    },

    /// The scan terminated. Always the last event of a stream.
    Complete {
        /// Final aggregated statistics.
        stats: DiscoveryStats,
    },
}
