mod error;

pub mod gateway;
pub mod telemetry;
pub(crate) mod utils;

pub use error::{AiproxyError, Result};
pub use gateway::{
    AuthContext, Channel, ChannelContext, ChannelStatus, Gateway, GatewayBuilder, GatewayConfig,
    GatewayError, Group, GroupStatus, ProviderAdaptor, RelayRequest, RelayResponse, RelayResult,
    Token, TokenStatus, UpstreamError, Usage,
};
