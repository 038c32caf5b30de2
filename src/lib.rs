pub mod aggregate;
pub mod block;
pub mod config;
pub mod delta_utils;
pub mod quantity;
pub mod rpc;
