// Integration tests run the whole consumer runtime against the in-memory
// broker, so no RabbitMQ instance is needed.

mod support;

mod dispatch_test;
mod pool_test;
mod recovery_test;
