use std::time::Duration;

/// Delivery bounds of the simulated network.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelConfig {
    /// Upper bound δ on the delay of a broadcast reaching any one recipient.
    pub broadcast_delay_bound: Duration,
    /// Upper bound on the delay of a unicast datagram.
    pub datagram_delay_bound: Duration,
    /// Seed for delays and clock offsets. Entropy-seeded when `None`.
    pub seed: Option<u64>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            broadcast_delay_bound: Duration::from_secs(1),
            datagram_delay_bound: Duration::from_secs(1),
            seed: None,
        }
    }
}

impl ChannelConfig {
    pub fn new(broadcast_delay_bound: Duration, datagram_delay_bound: Duration) -> Self {
        ChannelConfig {
            broadcast_delay_bound,
            datagram_delay_bound,
            seed: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
