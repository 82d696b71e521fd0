/// Cache key layout of the compiled strategy views.
#[derive(Debug, Clone)]
pub struct StrategyKeys {
    prefix: String,
}

impl Default for StrategyKeys {
    fn default() -> Self {
        Self::new("strategy")
    }
}

impl StrategyKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn key(&self, name: &str) -> String {
        format!("{}.{}", self.prefix, name)
    }

    pub fn strategy(&self, strategy_id: i64) -> String {
        self.key(&format!("strategy_{strategy_id}"))
    }

    pub fn strategy_ids(&self) -> String {
        self.key("strategy_ids")
    }

    pub fn bk_biz_ids(&self) -> String {
        self.key("bk_biz_ids")
    }

    pub fn real_time(&self) -> String {
        self.key("real_time_strategy_ids")
    }

    pub fn no_data(&self) -> String {
        self.key("no_data_strategy_ids")
    }

    pub fn gse_alarm(&self) -> String {
        self.key("gse_alarm_strategy_ids")
    }

    pub fn fta_alert(&self) -> String {
        self.key("fta_alert_strategy_ids")
    }

    pub fn strategy_group(&self) -> String {
        self.key("strategy_group")
    }

    pub fn last_updated(&self) -> String {
        self.key("last_updated")
    }
}

/// Hash field of the alert-on-alert index for a parent strategy.
pub fn fta_strategy_field(strategy_id: i64) -> String {
    format!("strategy|{strategy_id}")
}

/// Hash field of the alert-on-alert index for an external alert name.
pub fn fta_alert_field(alert_name: &str) -> String {
    format!("alert|{alert_name}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_live_under_prefix() {
        let keys = StrategyKeys::default();
        assert_eq!(keys.strategy(7), "strategy.strategy_7");
        assert_eq!(keys.strategy_group(), "strategy.strategy_group");
        assert_eq!(fta_strategy_field(3), "strategy|3");
    }
}
