//! ListRust Core - mailing list message pipeline
//!
//! Messages arrive on the `in` queue, are checked by the configured rules
//! and passed through the handler chain. List posts are collected into
//! per-list digest mailboxes, which are rotated into numbered issues and
//! rendered by the digest builder for the `out` queue.

pub mod digest;
pub mod dns;
pub mod handlers;
pub mod message;
pub mod metadata;
pub mod pipeline;
pub mod queue;
pub mod rules;

pub use digest::{DigestBuilder, DigestDispatcher, DigestMailboxes};
pub use dns::{DnsError, DnsRecord, DnsResolver, StaticResolver, TrustDnsResolver};
pub use handlers::{Handler, HandlerChain, HandlerRegistry, PipelineAbort};
pub use message::Message;
pub use metadata::{MessageData, ModerationReason};
pub use pipeline::IncomingProcessor;
pub use queue::{queues, ItemProcessor, QueueItem, QueueStats, RetryPolicy, Runner, Switchboard};
pub use rules::{Rule, RuleEngine, RuleRegistry};
