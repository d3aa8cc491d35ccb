//! End-to-end: `in` queue -> rules -> handlers -> digest -> `out` queue

use listrust_common::config::AdministriviaConfig;
use listrust_core::digest::DigestBuilder;
use listrust_core::dns::{DnsRecord, StaticResolver};
use listrust_core::handlers::{ModerateHandler, ToDigestHandler, ToOutgoingHandler};
use listrust_core::rules::{AdministriviaRule, DmarcMitigationRule, OrgDomainCache, SuspiciousHeaderRule};
use listrust_core::{
    queues, DigestDispatcher, DigestMailboxes, HandlerRegistry, IncomingProcessor, Message,
    MessageData, RetryPolicy, RuleRegistry, Runner, Switchboard,
};
use listrust_storage::{InMemoryMailingListStore, LocalStorage, MailingList, MailingListStore};
use pretty_assertions::assert_eq;
use serde_json::Map;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const LIST_ID: &str = "ant.example.com";

struct System {
    lists: Arc<InMemoryMailingListStore>,
    incoming: Arc<Switchboard>,
    digest: Arc<Switchboard>,
    out: Arc<Switchboard>,
    held: Arc<Switchboard>,
    dispatcher: Arc<DigestDispatcher>,
    in_runner: Runner,
    digest_runner: Runner,
    _dir: TempDir,
}

fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn system() -> System {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(LocalStorage::from_path(dir.path()).unwrap());
    let retry = RetryPolicy::default();

    let mut list = MailingList::new(LIST_ID, "ant@example.com");
    list.display_name = "Ant".to_string();
    list.dmarc_mitigate_action = "reject".to_string();
    list.bounce_matching_headers = "X-Spam-Flag: /yes/".to_string();
    let lists = Arc::new(InMemoryMailingListStore::new());
    lists.insert(list).await;

    let incoming = Arc::new(Switchboard::new(queues::IN, storage.clone(), retry));
    let digest = Arc::new(Switchboard::new(queues::DIGEST, storage.clone(), retry));
    let out = Arc::new(Switchboard::new(queues::OUT, storage.clone(), retry));
    let held = Arc::new(Switchboard::new(queues::HELD, storage.clone(), retry));

    let resolver = StaticResolver::new().with_records(
        "_dmarc.example.biz",
        vec![DnsRecord::txt("_dmarc.example.biz", "v=DMARC1; p=reject;")],
    );
    let org_domains = Arc::new(OrgDomainCache::from_rules_text("com\nbiz\n"));

    let mut rules = RuleRegistry::new();
    rules.register(Arc::new(AdministriviaRule::new(AdministriviaConfig::default())));
    rules.register(Arc::new(SuspiciousHeaderRule::new()));
    rules.register(Arc::new(DmarcMitigationRule::new(
        Arc::new(resolver),
        org_domains,
        Duration::from_secs(5),
    )));

    let mailboxes = Arc::new(DigestMailboxes::new(storage.clone()));
    let dispatcher = Arc::new(DigestDispatcher::new(
        lists.clone(),
        mailboxes.clone(),
        digest.clone(),
    ));

    let mut handlers = HandlerRegistry::new();
    handlers.register(Arc::new(ModerateHandler::new(held.clone())));
    handlers.register(Arc::new(ToDigestHandler::new(mailboxes.clone(), dispatcher.clone())));
    handlers.register(Arc::new(ToOutgoingHandler::new(out.clone())));

    let processor = IncomingProcessor::new(
        lists.clone(),
        rules
            .resolve(&names(&["administrivia", "suspicious-header", "dmarc-mitigation"]))
            .unwrap(),
        handlers
            .resolve(&names(&["moderate", "to-digest", "to-outgoing"]))
            .unwrap(),
    );
    let builder = DigestBuilder::new(lists.clone(), mailboxes, out.clone());

    System {
        lists,
        in_runner: Runner::new("in-0", incoming.clone(), Arc::new(processor), Duration::from_millis(10)),
        digest_runner: Runner::new("digest-0", digest.clone(), Arc::new(builder), Duration::from_millis(10)),
        incoming,
        digest,
        out,
        held,
        dispatcher,
        _dir: dir,
    }
}

async fn post(system: &System, raw: &str) {
    let message = Message::from_bytes(raw).unwrap();
    system
        .incoming
        .enqueue(&message, MessageData::for_list(LIST_ID), Map::new())
        .await
        .unwrap();
}

async fn drain(queue: &Switchboard) -> Vec<MessageData> {
    let mut items = Vec::new();
    while let Some(item) = queue.dequeue().await.unwrap() {
        queue.finish(item.id).await.unwrap();
        items.push(item.metadata);
    }
    items
}

#[tokio::test]
async fn test_posts_flow_through_to_digest_and_out() {
    let system = system().await;

    post(
        &system,
        "From: Anne <anne@example.com>\nSubject: Meeting notes\nMessage-ID: <1@example.com>\n\nNotes attached.\n",
    )
    .await;
    post(
        &system,
        "From: bart@example.com\nSubject: Re: Meeting notes\nMessage-ID: <2@example.com>\n\nThanks!\n",
    )
    .await;
    // Administrivia: held
    post(
        &system,
        "From: cris@example.com\nSubject: unsubscribe\nMessage-ID: <3@example.com>\n\n",
    )
    .await;
    // Strict DMARC sender on a list that rejects: dropped
    post(
        &system,
        "From: dave@example.biz\nSubject: Hello\nMessage-ID: <4@example.biz>\n\nhi\n",
    )
    .await;
    // Suspicious header: held
    post(
        &system,
        "From: erin@example.com\nX-Spam-Flag: YES\nSubject: Deal\nMessage-ID: <5@example.com>\n\nbuy\n",
    )
    .await;

    while system.in_runner.run_once().await.unwrap() {}

    let stats = system.incoming.stats().await.unwrap();
    assert_eq!((stats.pending, stats.claimed, stats.shunted), (0, 0, 0));

    let held = drain(&system.held).await;
    assert_eq!(held.len(), 2);
    assert!(held
        .iter()
        .any(|meta| meta.rule_hits() == vec!["administrivia".to_string()]));
    assert!(held
        .iter()
        .any(|meta| meta.rule_hits() == vec!["suspicious-header".to_string()]));

    let delivered = drain(&system.out).await;
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|meta| !meta.is_digest()));

    // Below the size threshold until forced
    assert!(system.digest.dequeue().await.unwrap().is_none());
    assert_eq!(
        system
            .dispatcher
            .maybe_send_digest_now(Some(LIST_ID), true)
            .await
            .unwrap(),
        1
    );

    assert!(system.digest_runner.run_once().await.unwrap());
    assert_eq!(system.digest.stats().await.unwrap().shunted, 0);

    let digests = drain(&system.out).await;
    assert_eq!(digests.len(), 2);
    assert!(digests.iter().all(|meta| meta.is_digest()));

    let list = system.lists.get(LIST_ID).await.unwrap().unwrap();
    assert_eq!((list.volume, list.next_digest_number), (1, 2));
    assert!(list.digest_last_sent_at.is_some());

    // Nothing left to send
    assert_eq!(
        system
            .dispatcher
            .maybe_send_digest_now(None, true)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_digests_are_not_redigested() {
    let system = system().await;

    let digest = Message::from_bytes(
        "From: ant-request@example.com\nSubject: Ant Digest, Vol 1, Issue 1\nMessage-ID: <d@example.com>\n\nTopics\n",
    )
    .unwrap();
    let mut meta = MessageData::for_list(LIST_ID);
    meta.insert("isdigest", true);
    system
        .incoming
        .enqueue(&digest, meta, Map::new())
        .await
        .unwrap();

    assert!(system.in_runner.run_once().await.unwrap());
    assert_eq!(drain(&system.out).await.len(), 1);
    assert_eq!(
        system
            .dispatcher
            .maybe_send_digest_now(Some(LIST_ID), true)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_message_for_unknown_list_is_shunted() {
    let system = system().await;
    let message = Message::from_bytes("From: anne@example.com\nSubject: hi\n\nhi\n").unwrap();
    system
        .incoming
        .enqueue(&message, MessageData::for_list("nope.example.com"), Map::new())
        .await
        .unwrap();

    assert!(system.in_runner.run_once().await.unwrap());
    assert_eq!(system.incoming.stats().await.unwrap().shunted, 1);
}
