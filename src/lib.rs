pub mod codec;
pub mod error;
pub mod logging;
pub mod runtime;
pub mod sd;
pub mod transport;

pub use codec::{SomeIpHeader, SomeIpSerialize, SomeIpDeserialize};
pub use error::{Result, SdError};
pub use runtime::SdRuntime;
pub use runtime::config::SystemConfig;
pub use sd::{ServiceDiscovery, SdEntry, EntryType, SdOption, SdPacket};
pub use transport::{SomeIpTransport, UdpTransport};
