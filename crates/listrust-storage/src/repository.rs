//! Repository layer for data access

pub mod mailing_lists;

pub use mailing_lists::{DbMailingListRepository, InMemoryMailingListStore, MailingListStore};
