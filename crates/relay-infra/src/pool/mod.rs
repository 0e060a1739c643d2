//! Resource pooling

pub mod resource_pool;

pub use resource_pool::{PoolConfig, PoolStats, Pooled, ResourceFactory, ResourcePool};
