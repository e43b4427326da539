use tokio::time::Duration;

/// Raft timing knobs. Anything left unset falls back to defaults that suit
/// a LAN cluster.
#[derive(Clone, Default)]
pub struct RaftOptions {
    /// Election deadline range; a fresh deadline is drawn uniformly from
    /// `[min, max)` on every reset.
    pub leader_timeout_min: Option<Duration>,
    pub leader_timeout_max: Option<Duration>,
    /// How often a leader pings an otherwise idle peer. Must be well below
    /// the election deadline range so followers stay quiet.
    pub heartbeat_interval: Option<Duration>,
    /// Per-RPC timeout for outbound RequestVote / AppendEntries.
    pub replicate_timeout: Option<Duration>,
}

pub(super) struct RaftOptionsValidated {
    pub leader_timeout_min: Duration,
    pub leader_timeout_max: Duration,
    pub heartbeat_interval: Duration,
    pub replicate_timeout: Duration,
}

impl RaftOptionsValidated {
    fn validate(&self) -> Result<(), &'static str> {
        if self.heartbeat_interval >= self.leader_timeout_min {
            return Err("heartbeat interval must be less than the minimum election timeout");
        }
        if self.leader_timeout_min >= self.leader_timeout_max {
            return Err("minimum election timeout must be less than the maximum");
        }
        if self.replicate_timeout >= self.leader_timeout_min {
            return Err("replicate timeout must be less than the minimum election timeout");
        }
        Ok(())
    }
}

impl TryFrom<RaftOptions> for RaftOptionsValidated {
    type Error = &'static str;

    fn try_from(options: RaftOptions) -> Result<Self, Self::Error> {
        let values = RaftOptionsValidated {
            leader_timeout_min: options
                .leader_timeout_min
                .unwrap_or(Duration::from_millis(150)),
            leader_timeout_max: options
                .leader_timeout_max
                .unwrap_or(Duration::from_millis(300)),
            heartbeat_interval: options
                .heartbeat_interval
                .unwrap_or(Duration::from_millis(30)),
            replicate_timeout: options
                .replicate_timeout
                .unwrap_or(Duration::from_millis(60)),
        };

        values.validate()?;
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let validated = RaftOptionsValidated::try_from(RaftOptions::default()).unwrap();
        assert!(validated.heartbeat_interval < validated.leader_timeout_min);
        assert!(validated.leader_timeout_min < validated.leader_timeout_max);
    }

    #[test]
    fn rejects_heartbeat_slower_than_election_timeout() {
        let options = RaftOptions {
            heartbeat_interval: Some(Duration::from_millis(200)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }

    #[test]
    fn rejects_inverted_election_range() {
        let options = RaftOptions {
            leader_timeout_min: Some(Duration::from_millis(400)),
            leader_timeout_max: Some(Duration::from_millis(300)),
            ..Default::default()
        };
        assert!(RaftOptionsValidated::try_from(options).is_err());
    }
}
