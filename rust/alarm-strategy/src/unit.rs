//! Unit families used to validate an algorithm's `unit_prefix` against the
//! metric's unit.

/// Units that scale into each other, keyed by the unit ids that belong to them.
struct Family {
    units: &'static [&'static str],
    suffixes: &'static [&'static str],
}

const FAMILIES: &[Family] = &[
    Family {
        units: &[
            "bytes", "decbytes", "kbytes", "deckbytes", "mbytes", "decmbytes", "gbytes",
            "decgbytes",
        ],
        suffixes: &["B", "KB", "MB", "GB", "TB", "PB"],
    },
    Family {
        units: &["bits", "decbits"],
        suffixes: &["b", "Kb", "Mb", "Gb", "Tb", "Pb"],
    },
    Family {
        units: &["Bps", "KBs", "MBs", "GBs"],
        suffixes: &["B/s", "KB/s", "MB/s", "GB/s", "TB/s", "PB/s"],
    },
    Family {
        units: &["bps", "Kbits", "Mbits", "Gbits"],
        suffixes: &["bps", "Kbps", "Mbps", "Gbps", "Tbps", "Pbps"],
    },
    Family {
        units: &["ns", "µs", "us", "ms", "s", "m", "h", "d"],
        suffixes: &["ns", "µs", "ms", "s", "min", "hour", "day"],
    },
    Family {
        units: &["percent", "percentunit"],
        suffixes: &["%"],
    },
];

/// Loaded unit: the suffixes an algorithm threshold may be expressed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricUnit {
    suffixes: Vec<String>,
}

impl MetricUnit {
    pub fn load(unit: &str) -> Self {
        let suffixes = FAMILIES
            .iter()
            .find(|family| family.units.contains(&unit))
            .map(|family| family.suffixes.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        Self { suffixes }
    }

    /// An empty prefix means the raw metric value and is always accepted.
    pub fn accepts(&self, unit_prefix: &str) -> bool {
        unit_prefix.is_empty() || self.suffixes.iter().any(|s| s == unit_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_follow_unit_family() {
        let bytes = MetricUnit::load("kbytes");
        assert!(bytes.accepts("MB"));
        assert!(bytes.accepts(""));
        assert!(!bytes.accepts("ms"));

        let unknown = MetricUnit::load("things");
        assert!(unknown.accepts(""));
        assert!(!unknown.accepts("%"));
    }
}
