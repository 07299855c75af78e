use anyhow::Result;
use quanta::Instant;
use serde::Serialize;
use std::time::Duration;

/// Capability flags of a radio interface or radio link.
///
/// Parsed from names in the config file (`"tx"`, `"data"`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const DISABLED: Capabilities = Capabilities(0x01);
    pub const CAN_TX: Capabilities = Capabilities(0x02);
    pub const CAN_RX: Capabilities = Capabilities(0x04);
    pub const CAN_USE_FOR_DATA: Capabilities = Capabilities(0x08);
    pub const CAN_USE_FOR_VIDEO: Capabilities = Capabilities(0x10);
    pub const RELAY: Capabilities = Capabilities(0x20);

    const NAMES: [(&'static str, Capabilities); 6] = [
        ("disabled", Capabilities::DISABLED),
        ("tx", Capabilities::CAN_TX),
        ("rx", Capabilities::CAN_RX),
        ("data", Capabilities::CAN_USE_FOR_DATA),
        ("video", Capabilities::CAN_USE_FOR_VIDEO),
        ("relay", Capabilities::RELAY),
    ];

    pub const fn empty() -> Self {
        Capabilities(0)
    }

    /// Full-duplex data and video capable, the default for a new entry.
    pub const fn all_traffic() -> Self {
        Capabilities(0x02 | 0x04 | 0x08 | 0x10)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Capabilities) -> Self {
        Capabilities(self.0 | other.0)
    }

    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<Self, String> {
        let mut caps = Capabilities::empty();
        for name in names {
            let name = name.as_ref().trim().to_ascii_lowercase();
            let flag = Self::NAMES
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, f)| *f)
                .ok_or_else(|| format!("unknown capability '{name}'"))?;
            caps = caps.union(flag);
        }
        Ok(caps)
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, f)| self.contains(*f))
            .map(|(n, _)| *n)
            .collect()
    }
}

impl std::ops::BitOr for Capabilities {
    type Output = Capabilities;

    fn bitor(self, rhs: Capabilities) -> Capabilities {
        self.union(rhs)
    }
}

/// Physical kind of a radio interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceKind {
    /// Monitor-mode WiFi card, data rate chosen per packet.
    Wifi,
    /// Low-rate serial radio with a fixed air rate.
    Serial { air_rate_bps: u32 },
}

impl InterfaceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceKind::Wifi => "wifi",
            InterfaceKind::Serial { .. } => "serial",
        }
    }
}

/// Static description of one radio interface.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: InterfaceKind,
    pub capabilities: Capabilities,
    /// Positive rank wins over RX quality; 0 means unranked.
    pub preferred_tx: u32,
    /// Radio link this interface is assigned to.
    pub link: Option<usize>,
}

impl InterfaceConfig {
    pub fn wifi(name: &str, link: usize) -> Self {
        InterfaceConfig {
            name: name.to_string(),
            kind: InterfaceKind::Wifi,
            capabilities: Capabilities::all_traffic(),
            preferred_tx: 0,
            link: Some(link),
        }
    }
}

/// Write side of a physical radio.
///
/// Implemented by [`crate::net::transport::UdpRadio`] and by recording
/// radios in tests.
pub trait RadioTx: Send {
    /// Send one serialized packet at `datarate`. Returns bytes written.
    fn send(&self, packet: &[u8], datarate: i32) -> Result<usize>;
    fn name(&self) -> &str;
}

/// Telemetry of one interface.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InterfaceMetrics {
    pub name: String,
    pub kind: &'static str,
    pub link: Option<usize>,
    pub rx_quality: u8,
    pub tx_load_bps: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub last_datarate: i32,
}

// ─── TX Load ────────────────────────────────────────────────────────────────

const LOAD_WINDOW: Duration = Duration::from_secs(1);

/// Bytes sent over a rolling one-second bucket.
#[derive(Debug, Default)]
struct TxLoad {
    window_start: Option<Instant>,
    bytes: u64,
    last_bps: u64,
}

impl TxLoad {
    fn record(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.bytes += bytes as u64;
    }

    fn roll(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            self.window_start = Some(now);
            return;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= LOAD_WINDOW {
            self.last_bps = self.bytes * 8 * 1000 / elapsed.as_millis().max(1) as u64;
            self.bytes = 0;
            self.window_start = Some(now);
        }
    }

    /// Larger of the last full bucket and the running one.
    fn bps(&self, now: Instant) -> u64 {
        let running = self.window_start.map_or(0, |start| {
            let ms = now.saturating_duration_since(start).as_millis().max(1) as u64;
            self.bytes * 8 * 1000 / ms.max(LOAD_WINDOW.as_millis() as u64)
        });
        self.last_bps.max(running)
    }
}

// ─── Radio Interface ────────────────────────────────────────────────────────

/// One physical radio with its live state.
pub struct RadioInterface {
    config: InterfaceConfig,
    tx: Option<Box<dyn RadioTx>>,
    rx_quality: u8,
    load: TxLoad,
    metrics: InterfaceMetrics,
}

impl RadioInterface {
    pub fn new(config: InterfaceConfig, tx: Option<Box<dyn RadioTx>>) -> Self {
        let metrics = InterfaceMetrics {
            name: config.name.clone(),
            kind: config.kind.as_str(),
            link: config.link,
            ..Default::default()
        };
        RadioInterface {
            config,
            tx,
            rx_quality: 0,
            load: TxLoad::default(),
            metrics,
        }
    }

    pub fn config(&self) -> &InterfaceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn opened_for_write(&self) -> bool {
        self.tx.is_some()
    }

    /// Relative RX quality, 0-100.
    pub fn rx_quality(&self) -> u8 {
        self.rx_quality
    }

    pub fn set_rx_quality(&mut self, quality: u8) {
        self.rx_quality = quality.min(100);
        self.metrics.rx_quality = self.rx_quality;
    }

    /// Whether uplink data for `link` may go out on this interface.
    pub fn eligible_for(&self, link: usize) -> bool {
        let caps = self.config.capabilities;
        !caps.contains(Capabilities::DISABLED)
            && caps.contains(Capabilities::CAN_TX)
            && caps.contains(Capabilities::CAN_USE_FOR_DATA)
            && self.opened_for_write()
            && self.config.link == Some(link)
    }

    /// Serial radios at or above 80 % of their air rate take no more uplink.
    pub fn overloaded(&self, now: Instant) -> bool {
        match self.config.kind {
            InterfaceKind::Serial { air_rate_bps } => {
                self.load.bps(now) * 10 >= air_rate_bps as u64 * 8
            }
            InterfaceKind::Wifi => false,
        }
    }

    pub fn send(&mut self, packet: &[u8], datarate: i32, now: Instant) -> Result<usize> {
        let Some(tx) = self.tx.as_ref() else {
            anyhow::bail!("interface {} is not open for write", self.config.name);
        };
        match tx.send(packet, datarate) {
            Ok(n) => {
                self.load.record(n, now);
                self.metrics.packets_sent += 1;
                self.metrics.bytes_sent += n as u64;
                self.metrics.last_datarate = datarate;
                Ok(n)
            }
            Err(e) => {
                self.metrics.send_errors += 1;
                Err(e)
            }
        }
    }

    pub fn metrics(&self, now: Instant) -> InterfaceMetrics {
        let mut m = self.metrics.clone();
        m.tx_load_bps = self.load.bps(now);
        m
    }
}
