//! Batched model inference shared by many actors.

pub mod server;

pub use server::{
    InferenceError, InferenceServer, Method, MethodStats, PendingReply, PendingRequest, Reply,
    Request, ServerConfig,
};

#[cfg(test)]
mod tests;
