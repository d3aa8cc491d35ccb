//! Digests
//!
//! Messages accumulate in a per-list mailbox ([`mailbox`]). The dispatcher
//! ([`dispatch`]) decides when the mailbox becomes an issue, advances the
//! list's counters ([`rollover`]) and queues a trigger that the builder
//! ([`builder`]) turns into outgoing digests.

pub mod builder;
pub mod dispatch;
pub mod mailbox;
pub mod rollover;

pub use builder::{build_mime_digest, build_rfc1153_digest, DigestBuilder, DigestIssue};
pub use dispatch::DigestDispatcher;
pub use mailbox::{parse_mmdf, DigestMailboxes, MailboxGuard};
pub use rollover::bump_digest_number_and_volume;
