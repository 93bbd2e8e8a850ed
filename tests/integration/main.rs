// Integration tests run the full channel against the in-memory broker.
// lapin_test.rs needs a running RabbitMQ and is ignored by default.

mod channel_test;
mod lapin_test;
mod support;
mod worker_test;
