/// Network endpoint a FLUTE session is received on, resolved by the enclosing
/// application from a `flute://` target. The core never opens sockets itself,
/// the endpoint only keys session state.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UDPEndpoint {
    /// Optional source address filter (SSM).
    pub source_address: Option<String>,
    /// Multicast group or unicast destination address.
    pub destination_group_address: String,
    /// UDP destination port.
    pub port: u16,
}

impl UDPEndpoint {
    pub fn new(
        source_address: Option<String>,
        destination_group_address: String,
        port: u16,
    ) -> Self {
        UDPEndpoint {
            source_address,
            destination_group_address,
            port,
        }
    }
}
