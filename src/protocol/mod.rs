pub mod config;
pub mod correlation;
pub mod engine;
pub mod error;
pub mod frame;
pub mod inbox;
pub mod message;
pub mod serializer;
pub mod transport;

pub(crate) mod dispatcher;
pub(crate) mod reassembly;
pub(crate) mod reliability;

pub use config::ProtocolConfig;
pub use engine::{Engine, SendOptions};
pub use error::{ProtocolError, Result};
pub use inbox::{EngineListener, Inbox, InboxHandler, InboxKey};
pub use message::{Command, Message, MessageType, Payload};
pub use serializer::{JsonSerializer, PayloadSerializer};
pub use transport::{DatagramHandler, DatagramSocket, UdpDatagramSocket};
