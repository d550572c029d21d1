pub mod database;
pub mod factory;
pub mod in_memory_broker;
pub mod memory_store;
pub mod observability;
pub mod rabbitmq;
pub mod redis_stream;
pub mod resilient_broker;

pub use database::*;
pub use factory::{BrokerFactory, StoreFactory, Stores};
pub use in_memory_broker::{InMemoryBroker, InMemoryBrokerConfig};
pub use memory_store::MemoryStore;
pub use observability::*;
pub use rabbitmq::{RabbitMqBroker, RabbitMqConfig};
pub use redis_stream::{RedisStreamBroker, RedisStreamConfig};
pub use resilient_broker::{ResilientBroker, ResilientBrokerConfig};
