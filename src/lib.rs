//! Polls SQS queues and feeds their messages to serverless function
//! handlers running locally, the way the Lambda SQS event source
//! mapping would: a batch is deleted when the handler succeeds, and
//! left for redelivery when it fails.

pub mod app;
pub mod client;
pub mod conf;
pub mod error;
pub mod event;
pub mod invoke;
pub mod poller;
pub mod sign;
pub mod signal;
pub mod supervisor;

#[cfg(test)]
mod testing;
