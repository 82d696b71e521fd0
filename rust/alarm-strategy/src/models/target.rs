use super::labels::{ConditionMethod, TargetField};
use super::serde_util::{opt_i64, opt_string};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A CMDB topology node such as `module|5`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopoNode {
    pub bk_obj_id: String,
    pub bk_inst_id: i64,
}

impl TopoNode {
    pub fn new(bk_obj_id: impl Into<String>, bk_inst_id: i64) -> Self {
        Self {
            bk_obj_id: bk_obj_id.into(),
            bk_inst_id,
        }
    }

    /// Topology link string as carried in record dimensions.
    pub fn link(&self) -> String {
        format!("{}|{}", self.bk_obj_id, self.bk_inst_id)
    }

    pub fn parse_link(link: &str) -> Option<Self> {
        let (obj, inst) = link.split_once('|')?;
        Some(Self::new(obj, inst.trim().parse().ok()?))
    }
}

impl fmt::Display for TopoNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.bk_obj_id, self.bk_inst_id)
    }
}

/// Identity of a host: either `(ip, cloud)` or a host id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<i64>,
}

impl HostKey {
    pub fn by_ip(ip: impl Into<String>, cloud_id: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            cloud_id: Some(cloud_id.into()),
            host_id: None,
        }
    }

    pub fn by_id(host_id: i64) -> Self {
        Self {
            host_id: Some(host_id),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ip.is_none() && self.host_id.is_none()
    }

    /// Whether `other` refers to the same host, matching by host id first.
    pub fn matches(&self, other: &HostKey) -> bool {
        if let (Some(a), Some(b)) = (self.host_id, other.host_id) {
            if a == b {
                return true;
            }
        }
        match (&self.ip, &other.ip) {
            (Some(a), Some(b)) if a == b => {
                let cloud_a = self.cloud_id.as_deref().unwrap_or("0");
                let cloud_b = other.cloud_id.as_deref().unwrap_or("0");
                cloud_a == cloud_b
            }
            _ => false,
        }
    }
}

/// One element of a condition's value list. Which fields are set depends on
/// the condition field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetValue {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bk_target_ip: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub bk_target_cloud_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub bk_host_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bk_obj_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_i64",
        skip_serializing_if = "Option::is_none"
    )]
    pub bk_inst_id: Option<i64>,
    #[serde(
        default,
        deserialize_with = "opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub dynamic_group_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(
        default,
        deserialize_with = "opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub bk_cloud_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TargetValue {
    pub fn host(ip: impl Into<String>, cloud_id: impl Into<String>) -> Self {
        Self {
            bk_target_ip: Some(ip.into()),
            bk_target_cloud_id: Some(cloud_id.into()),
            ..Self::default()
        }
    }

    pub fn host_id(host_id: i64) -> Self {
        Self {
            bk_host_id: Some(host_id),
            ..Self::default()
        }
    }

    pub fn node(node: &TopoNode) -> Self {
        Self {
            bk_obj_id: Some(node.bk_obj_id.clone()),
            bk_inst_id: Some(node.bk_inst_id),
            ..Self::default()
        }
    }

    pub fn template(bk_inst_id: i64) -> Self {
        Self {
            bk_inst_id: Some(bk_inst_id),
            ..Self::default()
        }
    }

    pub fn dynamic_group(id: impl Into<String>) -> Self {
        Self {
            dynamic_group_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Rewrites legacy `ip`/`bk_cloud_id` keys to their `bk_target_*` names.
    pub fn normalize_aliases(&mut self) {
        if let Some(ip) = self.ip.take() {
            self.bk_target_ip = Some(ip);
        }
        if let Some(cloud) = self.bk_cloud_id.take() {
            self.bk_target_cloud_id = Some(cloud);
        }
    }

    pub fn topo_node(&self) -> Option<TopoNode> {
        Some(TopoNode::new(self.bk_obj_id.clone()?, self.bk_inst_id?))
    }

    pub fn host_key(&self) -> Option<HostKey> {
        let ip = self
            .bk_target_ip
            .clone()
            .or_else(|| self.ip.clone())
            .filter(|ip| !ip.is_empty());
        let cloud_id = self
            .bk_target_cloud_id
            .clone()
            .or_else(|| self.bk_cloud_id.clone());
        let key = HostKey {
            cloud_id: ip.as_ref().map(|_| cloud_id.unwrap_or_else(|| "0".to_string())),
            ip,
            host_id: self.bk_host_id.filter(|id| *id > 0),
        };
        (!key.is_empty()).then_some(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCondition {
    pub field: TargetField,
    #[serde(default = "default_method")]
    pub method: ConditionMethod,
    #[serde(default)]
    pub value: Vec<TargetValue>,
}

fn default_method() -> ConditionMethod {
    ConditionMethod::Eq
}

impl TargetCondition {
    pub fn new(field: TargetField, method: ConditionMethod, value: Vec<TargetValue>) -> Self {
        Self {
            field,
            method,
            value,
        }
    }

    pub fn is_eq(&self) -> bool {
        self.method == ConditionMethod::Eq
    }
}

/// Target expression: outer list is OR, inner list is AND.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Target(pub Vec<Vec<TargetCondition>>);

impl Target {
    pub fn new(branches: Vec<Vec<TargetCondition>>) -> Self {
        Self(branches)
    }

    pub fn single(condition: TargetCondition) -> Self {
        Self(vec![vec![condition]])
    }

    /// No restriction at all: every instance matches.
    pub fn is_empty(&self) -> bool {
        self.0.first().map_or(true, |branch| branch.is_empty())
    }

    pub fn branches(&self) -> &[Vec<TargetCondition>] {
        &self.0
    }

    /// Leading condition, which decides the target's kind.
    pub fn first(&self) -> Option<&TargetCondition> {
        self.0.first().and_then(|branch| branch.first())
    }

    pub fn first_mut(&mut self) -> Option<&mut TargetCondition> {
        self.0.first_mut().and_then(|branch| branch.first_mut())
    }

    pub fn conditions(&self) -> impl Iterator<Item = &TargetCondition> {
        self.0.iter().flatten()
    }

    pub fn conditions_mut(&mut self) -> impl Iterator<Item = &mut TargetCondition> {
        self.0.iter_mut().flatten()
    }

    pub fn is_static_ip(&self) -> bool {
        self.first().is_some_and(|c| c.field.is_static_ip())
    }

    /// Rewrites legacy field and value aliases in place.
    pub fn normalize_aliases(&mut self) {
        for condition in self.conditions_mut() {
            if condition.field == TargetField::Ip {
                condition.field = TargetField::BkTargetIp;
            }
            for value in &mut condition.value {
                value.normalize_aliases();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn legacy_aliases_are_rewritten() {
        let mut target: Target = serde_json::from_value(json!([[{
            "field": "ip",
            "method": "eq",
            "value": [{"ip": "127.0.0.1", "bk_cloud_id": 0}]
        }]]))
        .unwrap();
        target.normalize_aliases();

        assert_eq!(
            serde_json::to_value(&target).unwrap(),
            json!([[{
                "field": "bk_target_ip",
                "method": "eq",
                "value": [{"bk_target_ip": "127.0.0.1", "bk_target_cloud_id": "0"}]
            }]])
        );
    }

    #[test]
    fn host_key_matching_prefers_host_id() {
        let a = HostKey {
            ip: Some("10.0.0.1".into()),
            cloud_id: Some("0".into()),
            host_id: Some(7),
        };
        assert!(a.matches(&HostKey::by_id(7)));
        assert!(a.matches(&HostKey::by_ip("10.0.0.1", "0")));
        assert!(!a.matches(&HostKey::by_ip("10.0.0.1", "2")));
    }

    #[test]
    fn topo_link_round_trip() {
        let node = TopoNode::new("module", 5);
        assert_eq!(node.link(), "module|5");
        assert_eq!(TopoNode::parse_link("module|5"), Some(node));
        assert_eq!(TopoNode::parse_link("module"), None);
    }

    #[test]
    fn empty_first_branch_means_unrestricted() {
        assert!(Target::default().is_empty());
        assert!(Target::new(vec![vec![]]).is_empty());
    }
}
