//! # sdl-proxy
//!
//! App-side connection core for talking RPC to a vehicle head unit over a
//! byte-stream transport.
//!
//! ## Architecture
//!
//! - **Frame codec** (`protocol`): 8/12-byte headers, fragmentation into
//!   first/consecutive frames, resynchronizing decoder, keyed reassembly
//! - **Sessions** (`session`, `control`): one logical session per service
//!   type, opened and closed with control frames
//! - **Router** (`router`, `writer`): inbound dispatch by service, outbound
//!   messages written contiguously by a dedicated writer task
//! - **RPC** (`rpc`): envelopes, correlation with deadlines, ordered
//!   notification subscribers
//! - **Lifecycle** (`lifecycle`, `connection`): connect, negotiate, register,
//!   ready, teardown and reconnect
//!
//! ## Example
//!
//! ```ignore
//! use sdl_proxy::{AppIdentity, AppHmiType, Connection, RpcEnvelope};
//! use sdl_proxy::rpc::function_id;
//!
//! #[tokio::main]
//! async fn main() -> sdl_proxy::Result<()> {
//!     let connection = Connection::builder(my_transport())
//!         .app(AppIdentity::new("Radio", "8675309").with_app_type(AppHmiType::Media))
//!         .build();
//!
//!     connection.subscribe(function_id::ON_HMI_STATUS, |status: &RpcEnvelope| {
//!         println!("HMI level: {:?}", status.params.get("hmiLevel"));
//!     });
//!
//!     connection.connect().await?;
//!     let response = connection
//!         .request(RpcEnvelope::request(function_id::DIAL_NUMBER).with_param("number", "5551234"))
//!         .await?;
//!     println!("dial: {:?}", response.result_code());
//!
//!     connection.disconnect().await
//! }
//! ```

pub mod config;
pub mod connection;
pub mod control;
pub mod delegate;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod router;
pub mod rpc;
pub mod session;
pub mod transport;
pub mod writer;

pub use config::{AppHmiType, AppIdentity, ConnectionConfig, ReconnectPolicy};
pub use connection::{Connection, ConnectionBuilder};
pub use delegate::{ChannelDelegate, ConnectionDelegate, ConnectionEvent};
pub use error::{FramingError, ProxyError, Result};
pub use lifecycle::LifecycleState;
pub use protocol::ServiceType;
pub use rpc::{MessageKind, ResponseHandle, RpcEnvelope, SubscriptionId};
pub use session::{Session, SessionState};
