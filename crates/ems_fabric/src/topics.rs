/// Topic grammar under the `ems/{site}` root.
///
/// Inbound (devices to EMS):
/// - `charger/+/telemetry`
/// - `charger/+/session/start` / `stop` / `update`
/// - `bess/status`, `bess/telemetry`
///
/// Outbound (EMS to devices):
/// - `charger/{id}/connector/{n}/power_limit`
/// - `charger/{id}/session/start_command`
/// - `bess/command`
#[derive(Debug, Clone)]
pub struct Topics {
    root: String,
}

/// What an inbound topic addresses, with the charger id recovered from the
/// wildcard segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Telemetry { charger_id: String },
    SessionStart { charger_id: String },
    SessionStop { charger_id: String },
    SessionUpdate { charger_id: String },
    BessStatus,
}

impl Topics {
    pub fn new(site_id: &str) -> Self {
        Topics {
            root: format!("ems/{site_id}"),
        }
    }

    /// Subscription filters for everything the coordinator consumes.
    pub fn subscriptions(&self) -> Vec<String> {
        vec![
            format!("{}/charger/+/telemetry", self.root),
            format!("{}/charger/+/session/start", self.root),
            format!("{}/charger/+/session/stop", self.root),
            format!("{}/charger/+/session/update", self.root),
            format!("{}/bess/status", self.root),
            format!("{}/bess/telemetry", self.root),
        ]
    }

    pub fn power_limit(&self, charger_id: &str, connector_id: u32) -> String {
        format!(
            "{}/charger/{charger_id}/connector/{connector_id}/power_limit",
            self.root
        )
    }

    pub fn session_start_command(&self, charger_id: &str) -> String {
        format!("{}/charger/{charger_id}/session/start_command", self.root)
    }

    pub fn bess_command(&self) -> String {
        format!("{}/bess/command", self.root)
    }

    /// Map a concrete inbound topic back to its kind. Foreign topics give
    /// `None`.
    pub fn classify(&self, topic: &str) -> Option<InboundKind> {
        let rest = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let segments: Vec<&str> = rest.split('/').collect();
        match segments.as_slice() {
            ["charger", charger_id, "telemetry"] => Some(InboundKind::Telemetry {
                charger_id: (*charger_id).to_string(),
            }),
            ["charger", charger_id, "session", action] => {
                let charger_id = (*charger_id).to_string();
                match *action {
                    "start" => Some(InboundKind::SessionStart { charger_id }),
                    "stop" => Some(InboundKind::SessionStop { charger_id }),
                    "update" => Some(InboundKind::SessionUpdate { charger_id }),
                    _ => None,
                }
            }
            ["bess", "status"] | ["bess", "telemetry"] => Some(InboundKind::BessStatus),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscriptions_cover_all_inbound_topics() {
        let topics = Topics::new("SITE_A");
        let subscriptions = topics.subscriptions();
        assert_eq!(subscriptions.len(), 6);
        assert!(subscriptions.contains(&"ems/SITE_A/charger/+/session/update".to_string()));
        assert!(subscriptions.contains(&"ems/SITE_A/bess/status".to_string()));
    }

    #[test]
    fn test_outbound_topics() {
        let topics = Topics::new("SITE_A");
        assert_eq!(
            topics.power_limit("CP001", 2),
            "ems/SITE_A/charger/CP001/connector/2/power_limit"
        );
        assert_eq!(
            topics.session_start_command("CP001"),
            "ems/SITE_A/charger/CP001/session/start_command"
        );
        assert_eq!(topics.bess_command(), "ems/SITE_A/bess/command");
    }

    #[test]
    fn test_classify_inbound_topics() {
        let topics = Topics::new("SITE_A");
        assert_eq!(
            topics.classify("ems/SITE_A/charger/CP001/telemetry"),
            Some(InboundKind::Telemetry {
                charger_id: "CP001".into()
            })
        );
        assert_eq!(
            topics.classify("ems/SITE_A/charger/CP002/session/start"),
            Some(InboundKind::SessionStart {
                charger_id: "CP002".into()
            })
        );
        assert_eq!(
            topics.classify("ems/SITE_A/charger/CP002/session/stop"),
            Some(InboundKind::SessionStop {
                charger_id: "CP002".into()
            })
        );
        assert_eq!(
            topics.classify("ems/SITE_A/bess/telemetry"),
            Some(InboundKind::BessStatus)
        );
    }

    #[test]
    fn test_classify_rejects_foreign_topics() {
        let topics = Topics::new("SITE_A");
        assert_eq!(topics.classify("ems/SITE_B/charger/CP001/telemetry"), None);
        assert_eq!(topics.classify("ems/SITE_A/charger/CP001/status"), None);
        assert_eq!(
            topics.classify("ems/SITE_A/charger/CP001/session/pause"),
            None
        );
        assert_eq!(topics.classify("other/root/entirely"), None);
    }
}
