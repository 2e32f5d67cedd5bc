// src/rpc/mod.rs
//! Request/reply over message-type exchanges, matched by correlation id.

pub mod caller;
pub mod responder;

pub use caller::CallOptions;
pub use responder::RpcBinding;
