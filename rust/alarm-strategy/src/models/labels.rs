//! Closed vocabularies used across strategies. Each enum keeps an `Other`
//! variant so unknown labels survive a load/store round trip untouched.

use std::fmt;

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
        #[serde(from = "String", into = "String")]
        pub enum $name {
            $($variant,)+
            Other(String),
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $text,)+
                    Self::Other(raw) => raw.as_str(),
                }
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                match raw.as_str() {
                    $($text => Self::$variant,)+
                    _ => Self::Other(raw),
                }
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self::from(raw.to_string())
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum!(
    /// Where a query's data comes from.
    DataSourceLabel {
        BkMonitor => "bk_monitor",
        Custom => "custom",
        BkData => "bk_data",
        BkLogSearch => "bk_log_search",
        BkFta => "bk_fta",
        BkApm => "bk_apm",
        Prometheus => "prometheus",
    }
);

string_enum!(
    DataTypeLabel {
        TimeSeries => "time_series",
        Event => "event",
        Log => "log",
        Alert => "alert",
    }
);

string_enum!(
    AlgorithmType {
        Threshold => "Threshold",
        SimpleRingRatio => "SimpleRingRatio",
        AdvancedRingRatio => "AdvancedRingRatio",
        SimpleYearRound => "SimpleYearRound",
        AdvancedYearRound => "AdvancedYearRound",
        PartialNodes => "PartialNodes",
        OsRestart => "OsRestart",
        ProcPort => "ProcPort",
        PingUnreachable => "PingUnreachable",
        IntelligentDetect => "IntelligentDetect",
        TimeSeriesForecasting => "TimeSeriesForecasting",
        AbnormalCluster => "AbnormalCluster",
        HostAnomalyDetection => "HostAnomalyDetection",
    }
);

string_enum!(
    /// Field a target condition filters on.
    TargetField {
        BkTargetIp => "bk_target_ip",
        Ip => "ip",
        HostTopoNode => "host_topo_node",
        ServiceTopoNode => "service_topo_node",
        HostSetTemplate => "host_set_template",
        ServiceSetTemplate => "service_set_template",
        HostServiceTemplate => "host_service_template",
        ServiceServiceTemplate => "service_service_template",
        DynamicGroup => "dynamic_group",
        BkTargetServiceInstanceId => "bk_target_service_instance_id",
    }
);

string_enum!(
    ConditionMethod {
        Eq => "eq",
        Neq => "neq",
    }
);

string_enum!(
    HistoryOperate {
        Create => "create",
        Update => "update",
        Delete => "delete",
    }
);

/// Kind of template a target references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateKind {
    Set,
    Service,
}

impl TemplateKind {
    /// Object id of the topo nodes a template of this kind expands to.
    pub fn node_obj_id(self) -> &'static str {
        match self {
            Self::Set => "set",
            Self::Service => "module",
        }
    }
}

impl TargetField {
    pub fn is_static_ip(&self) -> bool {
        matches!(self, Self::BkTargetIp | Self::Ip)
    }

    pub fn is_topo(&self) -> bool {
        matches!(self, Self::HostTopoNode | Self::ServiceTopoNode)
    }

    pub fn template_kind(&self) -> Option<TemplateKind> {
        match self {
            Self::HostSetTemplate | Self::ServiceSetTemplate => Some(TemplateKind::Set),
            Self::HostServiceTemplate | Self::ServiceServiceTemplate => Some(TemplateKind::Service),
            _ => None,
        }
    }

    /// The topo-node field a template field turns into once expanded.
    pub fn expanded_topo_field(&self) -> Option<TargetField> {
        match self {
            Self::HostSetTemplate | Self::HostServiceTemplate => Some(Self::HostTopoNode),
            Self::ServiceSetTemplate | Self::ServiceServiceTemplate => Some(Self::ServiceTopoNode),
            _ => None,
        }
    }
}

/// Why a strategy was marked invalid. `Healthy` is stored as an empty string.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvalidType {
    #[default]
    Healthy,
    InvalidMetric,
    InvalidBiz,
    InvalidUnit,
    InvalidTarget,
    DeletedRelatedStrategy,
    InvalidRelatedStrategy,
}

impl InvalidType {
    pub const ALL: [InvalidType; 6] = [
        InvalidType::InvalidMetric,
        InvalidType::InvalidBiz,
        InvalidType::InvalidUnit,
        InvalidType::InvalidTarget,
        InvalidType::DeletedRelatedStrategy,
        InvalidType::InvalidRelatedStrategy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "",
            Self::InvalidMetric => "invalid_metric",
            Self::InvalidBiz => "invalid_biz",
            Self::InvalidUnit => "invalid_unit",
            Self::InvalidTarget => "invalid_target",
            Self::DeletedRelatedStrategy => "deleted_related_strategy",
            Self::InvalidRelatedStrategy => "invalid_related_strategy",
        }
    }
}

impl From<String> for InvalidType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "invalid_metric" => Self::InvalidMetric,
            "invalid_biz" => Self::InvalidBiz,
            "invalid_unit" => Self::InvalidUnit,
            "invalid_target" => Self::InvalidTarget,
            "deleted_related_strategy" => Self::DeletedRelatedStrategy,
            "invalid_related_strategy" => Self::InvalidRelatedStrategy,
            _ => Self::Healthy,
        }
    }
}

impl From<InvalidType> for String {
    fn from(value: InvalidType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for InvalidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            other => f.write_str(other.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_labels_round_trip() {
        let label: DataSourceLabel = serde_json::from_str("\"bk_x\"").unwrap();
        assert_eq!(label, DataSourceLabel::Other("bk_x".into()));
        assert_eq!(serde_json::to_string(&label).unwrap(), "\"bk_x\"");

        let label: DataSourceLabel = serde_json::from_str("\"bk_monitor\"").unwrap();
        assert_eq!(label, DataSourceLabel::BkMonitor);
    }

    #[test]
    fn healthy_serializes_empty() {
        assert_eq!(serde_json::to_string(&InvalidType::Healthy).unwrap(), "\"\"");
        let parsed: InvalidType = serde_json::from_str("\"invalid_unit\"").unwrap();
        assert_eq!(parsed, InvalidType::InvalidUnit);
    }

    #[test]
    fn template_fields_expand_to_topo() {
        assert_eq!(
            TargetField::ServiceSetTemplate.expanded_topo_field(),
            Some(TargetField::ServiceTopoNode)
        );
        assert_eq!(
            TargetField::HostServiceTemplate.template_kind().map(|k| k.node_obj_id()),
            Some("module")
        );
        assert!(TargetField::Ip.is_static_ip());
    }
}
