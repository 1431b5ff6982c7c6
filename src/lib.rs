/*
    A simulator for Cristian's synchronous group membership protocol.

    Processors share a channel with bounded delivery delays and own local
    clocks that agree to within a known error. Any processor may start a
    join round; the others answer with their view, and from then on each
    member proves it is alive every check-in period, either by broadcasting
    a present message or by passing an attendance-list token around the ring
    of members. A member that notices a missing peer starts a new join round
    without it, so the surviving members converge on a new common view.
*/

pub mod common;
pub mod membership;
pub mod network;

pub use common::{ChannelError, ConfigError, MessageId, ProcessorId, Timestamp};
pub use membership::{HeartbeatPolicy, Membership, Processor, ProcessorConfig, ProcessorView, Status};
pub use network::{Channel, ChannelConfig};
