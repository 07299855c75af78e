//! Radio side of the station: interfaces, data rates, uplink routing and
//! the UDP stand-in for the radio NIC layer.

pub mod datarate;
pub mod interface;
pub mod selector;
pub mod transport;
