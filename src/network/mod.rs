pub mod channel;
pub mod config;

pub use channel::*;
pub use config::*;

/*
    The network is synchronous: there is a known bound δ such that a message
    sent by a correct processor to a correct processor arrives within δ real
    time. Broadcasts and unicast datagrams have their own bounds. Delivery is
    otherwise unordered: two messages in flight may arrive in either order,
    whatever order they were sent in. When we refer to a "broadcast", it
    involves the sender delivering the same message to every other
    registered processor, but not to itself.

    Processors fail by crashing. A crashed processor neither sends nor
    receives, and messages in flight to it are lost.
*/
