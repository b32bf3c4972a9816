// Network module: the peer-transport seam used for partition dispatch
//
// The coordinator depends only on the `PeerTransport` trait. The libp2p
// request-response codec here frames partition envelopes for a swarm-backed
// implementation; `MockPeerTransport` serves tests and local simulation.

pub mod partition_protocol;
pub mod transport;

pub use partition_protocol::{
    new_partition_protocol, PartitionCodec, PartitionEnvelope, PartitionProtocol,
    PartitionProtocolConfig, PartitionReply, PARTITION_PROTOCOL_ID,
};
pub use transport::{
    MockBehavior, MockPeerTransport, PartitionRequest, PartitionResponse, PeerTransport,
};
