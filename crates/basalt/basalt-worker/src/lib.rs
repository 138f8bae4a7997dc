//! `basalt-worker`: the asynchronous drain/coalesce/commit worker.
//!
//! Producers enqueue [`Descriptor`](basalt_cell::Descriptor)s into the
//! worker's MPMC mailbox; the worker thread drains them in batches, groups
//! contiguous targets, and publishes results through the fabric's batched
//! commit path.

mod worker;

pub use worker::AsyncWorker;
