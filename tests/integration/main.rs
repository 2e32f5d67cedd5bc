// Integration tests run against the in-memory broker unless marked #[ignore]
// (those need a running RabbitMQ, see rabbitmq.rs).

mod common;
mod pubsub;
mod rabbitmq;
mod rpc;
