pub mod async_queue;
pub mod backoff;
pub mod runtime;
