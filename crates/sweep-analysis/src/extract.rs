//! Simulator log parsing.
//!
//! Records are found by the first `CSV,<KIND>,` marker on a line, so
//! simulator prefixes (timestamps, mote ids) do not matter. Unknown or
//! malformed lines are counted and skipped.

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::Ipv6Addr;
use std::path::Path;
use tracing::debug;

use crate::sidecar::{read_trust_metrics, TrustMetrics};
use crate::SIM_LOG_FILE;

const RECORD_MARKER: &str = "CSV,";
const ROUTING_TIMEOUT_SENTINEL: &str = "ROUTING_WAIT_TIMEOUT";
const ROUTING_WAIT_SENTINEL: &str = "ROUTING_WAIT joined=0 reachable=0";

/// Packet source or sender as it appears in the log. Decimal ids and IPv6
/// addresses (by their interface-id low 16 bits) both map to `Node`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Endpoint {
    Node(u32),
    Other(String),
}

impl Endpoint {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(id) = raw.parse::<u32>() {
                return Some(Endpoint::Node(id));
            }
        }
        if raw.contains(':') {
            if let Ok(addr) = raw.parse::<Ipv6Addr>() {
                return Some(Endpoint::Node(u32::from(addr.segments()[7])));
            }
        }
        Some(Endpoint::Other(raw.to_string()))
    }
}

pub type PacketKey = (Endpoint, u32);

/// Quantities read from one simulator log. Packets are sets so repeated log
/// lines never inflate totals.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogMetrics {
    pub transmitted: BTreeSet<PacketKey>,
    pub received: BTreeSet<PacketKey>,
    pub delays_ms: Vec<f64>,
    pub routing_timeout: bool,
    pub routing_wait: bool,
    pub skipped_lines: usize,
}

impl LogMetrics {
    pub fn tx(&self) -> usize {
        self.transmitted.len()
    }

    pub fn rx(&self) -> usize {
        self.received.len()
    }

    /// Received packets that match a transmitted one.
    pub fn delivered(&self) -> usize {
        self.received.intersection(&self.transmitted).count()
    }

    pub fn lost(&self) -> usize {
        self.tx() - self.delivered()
    }

    /// Percentage; `None` when nothing was transmitted.
    pub fn delivery_ratio(&self) -> Option<f64> {
        if self.transmitted.is_empty() {
            return None;
        }
        Some(self.delivered() as f64 * 100.0 / self.tx() as f64)
    }

    pub fn avg_delay_ms(&self) -> Option<f64> {
        if self.delays_ms.is_empty() {
            return None;
        }
        Some(self.delays_ms.iter().sum::<f64>() / self.delays_ms.len() as f64)
    }

    pub fn routing_not_ready(&self) -> bool {
        self.routing_timeout || self.routing_wait
    }

    fn ingest(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        if let Some(at) = line.find(RECORD_MARKER) {
            let mut fields = line[at + RECORD_MARKER.len()..].split(',');
            let kind = fields.next().unwrap_or_default();
            let fields: Vec<&str> = fields.map(str::trim).collect();
            let parsed = match kind {
                "TX" => self.ingest_tx(&fields),
                "RX" => self.ingest_rx(&fields),
                "DELAY" => self.ingest_delay(&fields),
                _ => true,
            };
            if !parsed {
                self.skipped_lines += 1;
            }
            return;
        }
        if line.contains(ROUTING_TIMEOUT_SENTINEL) {
            self.routing_timeout = true;
        } else if line.contains(ROUTING_WAIT_SENTINEL) {
            self.routing_wait = true;
        }
    }

    // CSV,TX,<node>,<seq>,...
    fn ingest_tx(&mut self, fields: &[&str]) -> bool {
        let Some(key) = packet(fields.first(), fields.get(1)) else {
            return false;
        };
        self.transmitted.insert(key);
        true
    }

    // CSV,RX,node=<n>,<src>,<seq>,...  or  CSV,RX,<src>,<seq>,...
    fn ingest_rx(&mut self, fields: &[&str]) -> bool {
        let key = match fields.iter().position(|f| f.starts_with("node=")) {
            Some(tag) => packet(fields.get(tag + 1), fields.get(tag + 2)),
            None => packet(fields.first(), fields.get(1)),
        };
        let Some(key) = key else {
            return false;
        };
        self.received.insert(key);
        true
    }

    // CSV,DELAY,<value>,...
    fn ingest_delay(&mut self, fields: &[&str]) -> bool {
        match fields.first().and_then(|v| v.parse::<f64>().ok()) {
            Some(v) if v.is_finite() => {
                self.delays_ms.push(v);
                true
            }
            _ => false,
        }
    }
}

fn packet(endpoint: Option<&&str>, seq: Option<&&str>) -> Option<PacketKey> {
    let endpoint = Endpoint::parse(endpoint?)?;
    let seq = seq?.parse::<u32>().ok()?;
    Some((endpoint, seq))
}

/// Reads a log line by line; invalid UTF-8 is replaced rather than fatal.
pub fn parse_log<R: BufRead>(mut reader: R) -> std::io::Result<LogMetrics> {
    let mut metrics = LogMetrics::default();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        metrics.ingest(&String::from_utf8_lossy(&buf));
    }
    Ok(metrics)
}

pub fn parse_log_file(path: &Path) -> Result<LogMetrics> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let metrics =
        parse_log(BufReader::new(file)).with_context(|| format!("reading {}", path.display()))?;
    if metrics.skipped_lines > 0 {
        debug!(
            path = %path.display(),
            skipped = metrics.skipped_lines,
            "skipped malformed log records"
        );
    }
    Ok(metrics)
}

/// Everything extracted for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMetrics {
    pub log: LogMetrics,
    pub trust: TrustMetrics,
}

/// `Ok(None)` when the run has no simulator log.
pub fn extract_run(run_dir: &Path) -> Result<Option<RawMetrics>> {
    let log_path = run_dir.join("logs").join(SIM_LOG_FILE);
    if !log_path.is_file() {
        return Ok(None);
    }
    let log = parse_log_file(&log_path)?;
    let trust = read_trust_metrics(run_dir);
    Ok(Some(RawMetrics { log, trust }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> LogMetrics {
        parse_log(text.as_bytes()).expect("in-memory read")
    }

    #[test]
    fn duplicate_transmissions_do_not_inflate_ratio() {
        let m = parse(
            "CSV,TX,1,1,100,1\n\
             CSV,TX,1,1,100,1\n\
             CSV,TX,1,2,200,1\n\
             CSV,RX,1,1,150,64\n",
        );
        assert_eq!(m.tx(), 2);
        assert_eq!(m.rx(), 1);
        let pdr = m.delivery_ratio().expect("defined");
        assert_eq!(format!("{:.2}", pdr), "50.00");
        assert_eq!(m.lost(), 1);
    }

    #[test]
    fn both_reception_shapes_are_understood() {
        let m = parse(
            "00:01.000\tID:2\tCSV,TX,2,7,10,1\n\
             00:01.500\tID:1\tCSV,RX,node=1,2,7\n\
             00:02.000\tID:3\tCSV,TX,3,1,10,1\n\
             00:02.500\tID:1\tCSV,RX,fd00::203:3:3:3,1,20,64\n",
        );
        assert_eq!(m.rx(), 2);
        assert_eq!(m.delivered(), 2);
        assert_eq!(m.delivery_ratio(), Some(100.0));
    }

    #[test]
    fn ratio_and_delay_are_undefined_without_samples() {
        let m = parse("hello\nCSV,RX,1,1\n");
        assert_eq!(m.tx(), 0);
        assert_eq!(m.delivery_ratio(), None);
        assert_eq!(m.avg_delay_ms(), None);
    }

    #[test]
    fn delays_average_and_bad_values_are_skipped() {
        let m = parse("CSV,DELAY,10\nCSV,DELAY,20,3\nCSV,DELAY,abc\nCSV,TX,x\n");
        assert_eq!(m.avg_delay_ms(), Some(15.0));
        assert_eq!(m.skipped_lines, 2);
    }

    #[test]
    fn sentinels_are_detected_separately() {
        let m = parse("... ROUTING_WAIT_TIMEOUT after 300s\n");
        assert!(m.routing_timeout && !m.routing_wait);
        let m = parse("ROUTING_WAIT joined=0 reachable=0\n");
        assert!(m.routing_wait && !m.routing_timeout);
        assert!(m.routing_not_ready());
        assert!(!parse("ROUTING_WAIT joined=1 reachable=1\n").routing_not_ready());
    }

    #[test]
    fn invalid_utf8_does_not_abort_parsing() {
        let mut bytes = b"CSV,TX,1,1\n\xff\xfe garbage\n".to_vec();
        bytes.extend_from_slice(b"CSV,RX,1,1\n");
        let m = parse_log(bytes.as_slice()).expect("read");
        assert_eq!(m.delivered(), 1);
    }

    #[test]
    fn endpoints_normalise() {
        assert_eq!(Endpoint::parse(" 12 "), Some(Endpoint::Node(12)));
        assert_eq!(
            Endpoint::parse("fd00::20c:c:c:c"),
            Some(Endpoint::Node(0xc))
        );
        assert_eq!(
            Endpoint::parse("mote-a"),
            Some(Endpoint::Other("mote-a".to_string()))
        );
        assert_eq!(Endpoint::parse(""), None);
    }
}
