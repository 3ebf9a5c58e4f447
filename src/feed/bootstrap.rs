/// Instant-feed loader state.
///
/// A feed starts by checking the local store. If it already holds enough
/// recent records the feed completes immediately; otherwise one network
/// request is raced against its timeout and the feed completes with
/// whatever the store holds once either finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    AwaitingNetwork { subscription_id: String },
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapDecision {
    Complete,
    KeepWaiting,
}

#[derive(Debug)]
pub struct BootstrapLoader {
    state: BootstrapState,
    min_records: usize,
}

impl BootstrapLoader {
    pub fn new(min_records: usize) -> Self {
        Self {
            state: BootstrapState::Idle,
            min_records,
        }
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == BootstrapState::Finished
    }

    pub fn is_awaiting(&self, subscription_id: &str) -> bool {
        matches!(&self.state, BootstrapState::AwaitingNetwork { subscription_id: s } if s == subscription_id)
    }

    pub fn subscription_id(&self) -> Option<&str> {
        match &self.state {
            BootstrapState::AwaitingNetwork { subscription_id } => Some(subscription_id.as_str()),
            _ => None,
        }
    }

    /// First local check. `KeepWaiting` means the caller should start the
    /// network request and call [`BootstrapLoader::begin_network`].
    pub fn on_local(&mut self, local_count: usize) -> BootstrapDecision {
        if local_count > self.min_records {
            self.state = BootstrapState::Finished;
            BootstrapDecision::Complete
        } else {
            BootstrapDecision::KeepWaiting
        }
    }

    pub fn begin_network(&mut self, subscription_id: impl Into<String>) {
        self.state = BootstrapState::AwaitingNetwork {
            subscription_id: subscription_id.into(),
        };
    }

    /// New records were imported while waiting.
    pub fn on_progress(&mut self, local_count: usize) -> BootstrapDecision {
        if matches!(self.state, BootstrapState::AwaitingNetwork { .. }) {
            self.on_local(local_count)
        } else {
            BootstrapDecision::KeepWaiting
        }
    }

    /// The network request responded or timed out: finish with whatever is local.
    pub fn on_settled(&mut self) -> BootstrapDecision {
        match self.state {
            BootstrapState::AwaitingNetwork { .. } => {
                self.state = BootstrapState::Finished;
                BootstrapDecision::Complete
            }
            _ => BootstrapDecision::KeepWaiting,
        }
    }

    pub fn reset(&mut self) {
        self.state = BootstrapState::Idle;
    }
}
