// Integration tests run against the in-process broker. Tests that need a live
// RabbitMQ are #[ignore]d; run them with `cargo test -- --ignored`.

mod support;

mod connection_test;
mod consumer_test;
mod publisher_test;
