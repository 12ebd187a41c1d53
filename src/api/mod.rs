//! Client-facing and operational HTTP surface.

pub mod vault_http;

pub use vault_http::{
    create_vault_router, KeyValueRequest, KeyValueResponse, RaftStateResponse, ReplicationStatus,
    VaultApiState,
};
