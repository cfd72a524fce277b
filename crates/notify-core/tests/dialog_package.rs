//! Dialog event package: subscription records, channel fan-out and pruning

mod common;

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{HookPoint, HookStore, RecordingDialogs};
use notify_core::config::DialogPackageConfig;
use notify_core::packages::dialog::{FanOutReport, CONTENT_TYPE};
use notify_core::store::Batch;
use notify_core::{
    DialogCallState, DialogHandle, DialogPackage, EventPackage, KvStore, MemoryStore, Subscription,
    SubscriptionState,
};

const ALICE: &str = "alice@example.com";
const WATCHED: &str = "watched-aor:alice@example.com";

struct Fixture {
    kv: Arc<MemoryStore>,
    dialogs: Arc<RecordingDialogs>,
    package: Arc<DialogPackage>,
}

fn fixture() -> Fixture {
    let kv = Arc::new(MemoryStore::new());
    let dialogs = RecordingDialogs::new();
    let package = Arc::new(DialogPackage::new(
        kv.clone(),
        dialogs.clone(),
        DialogPackageConfig::default(),
    ));
    Fixture { kv, dialogs, package }
}

fn handle(watcher: &str) -> DialogHandle {
    DialogHandle {
        id: format!("dlg-{}", watcher),
        call_id: format!("call-{}", watcher),
        local_tag: None,
        remote_tag: None,
        transport: Some("tcp".to_string()),
    }
}

async fn watch(f: &Fixture, watcher: &str, expires: u32) -> Subscription {
    let subscription = Subscription::new(format!("{}@example.com", watcher), ALICE, "dialog", expires);
    f.package
        .add_subscription(&handle(watcher), &subscription)
        .await
        .unwrap()
}

fn record_key(watcher: &str) -> String {
    format!("dlg-sub:{}@example.com-{}", watcher, ALICE)
}

#[tokio::test(start_paused = true)]
async fn test_add_subscription_writes_record_and_index() {
    let f = fixture();
    let stored = watch(&f, "bob", 600).await;

    assert!(stored.etag.is_some());
    assert_eq!(stored.call_id.as_deref(), Some("call-bob"));

    let key = record_key("bob");
    let fields = f.kv.hgetall(&key).await.unwrap();
    assert_eq!(fields.get("dialogId").map(String::as_str), Some("dlg-bob"));
    assert_eq!(fields.get("version").map(String::as_str), Some("0"));
    assert_eq!(fields.get("transport").map(String::as_str), Some("tcp"));
    assert_eq!(f.kv.ttl(&key).await.unwrap(), Some(600));
    assert_eq!(f.kv.smembers(WATCHED).await.unwrap(), vec![key]);
}

#[tokio::test(start_paused = true)]
async fn test_remove_subscription_clears_record_and_index() {
    let f = fixture();
    let stored = watch(&f, "bob", 600).await;

    f.package.remove_subscription(&stored).await.unwrap();

    assert!(!f.kv.exists(&record_key("bob")).await.unwrap());
    assert!(f.kv.smembers(WATCHED).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_event_state_renders_snapshot_and_counts_versions() {
    let f = fixture();
    watch(&f, "bob", 600).await;
    f.package
        .handle_channel_message("alice@example.com d1 c1 lt rt recipient confirmed")
        .await
        .unwrap();

    let state = f
        .package
        .get_event_state("bob@example.com", ALICE)
        .await
        .unwrap()
        .expect("subscribed watcher has state");
    assert_eq!(state.content_type, CONTENT_TYPE);
    assert!(state.content.contains("entity=\"alice@example.com\""));
    assert!(state.content.contains("direction=\"recipient\""));
    assert!(state.content.contains("<state>confirmed</state>"));
    // the fan-out NOTIFY above used version 0
    assert!(state.content.contains("version=\"1\""));

    assert!(f
        .package
        .get_event_state("carol@example.com", ALICE)
        .await
        .unwrap()
        .is_none());
    // the miss must not leave a bare counter behind
    assert!(!f.kv.exists(&record_key("carol")).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_terminated_event_notifies_live_watchers_and_prunes_expired() {
    let f = fixture();
    watch(&f, "bob", 600).await;
    watch(&f, "carol", 600).await;
    watch(&f, "dave", 10).await;
    f.package
        .handle_channel_message("alice@example.com d1 c1 undef undef initiator confirmed")
        .await
        .unwrap();
    assert!(f.kv.exists("dlg-info:alice@example.com").await.unwrap());

    tokio::time::sleep(Duration::from_secs(11)).await;

    let report = f
        .package
        .handle_channel_message("alice@example.com d1 c1 undef undef initiator terminated")
        .await
        .unwrap();
    assert_eq!(
        report,
        FanOutReport {
            notified: 2,
            failed: 0,
            pruned: 1
        }
    );

    assert!(!f.kv.exists("dlg-info:alice@example.com").await.unwrap());
    assert!(f.package.get_dialog_info(ALICE).await.unwrap().is_none());

    for watcher in ["bob", "carol"] {
        let notifies = f.dialogs.notifies_on(&format!("dlg-{}", watcher));
        assert_eq!(notifies.len(), 2);
        let last = &notifies[1];
        assert_eq!(last.call_id, format!("call-{}", watcher));
        assert!(matches!(last.subscription_state, SubscriptionState::Active { expires: Some(_) }));
        let body = last.body.as_deref().unwrap();
        assert!(body.contains("<state>terminated</state>"));
        assert!(body.contains("version=\"1\""));
    }
    assert!(f.dialogs.notifies_on("dlg-dave").len() == 1);

    let mut members = f.kv.smembers(WATCHED).await.unwrap();
    members.sort();
    assert_eq!(members, vec![record_key("bob"), record_key("carol")]);
}

#[tokio::test(start_paused = true)]
async fn test_confirmed_event_upserts_snapshot_with_cap() {
    let f = fixture();
    f.package
        .handle_channel_message("alice@example.com d7 c7 lt undef outbound early")
        .await
        .unwrap();
    f.package
        .handle_channel_message("alice@example.com d7 c7 lt rt outbound confirmed")
        .await
        .unwrap();

    let info = f.package.get_dialog_info(ALICE).await.unwrap().unwrap();
    assert_eq!(info.id, "d7");
    assert_eq!(info.state, DialogCallState::Confirmed);
    assert_eq!(info.remote_tag.as_deref(), Some("rt"));
    assert_eq!(f.kv.ttl("dlg-info:alice@example.com").await.unwrap(), Some(10800));
}

#[tokio::test(start_paused = true)]
async fn test_failing_watcher_does_not_block_others() {
    let f = fixture();
    watch(&f, "bob", 600).await;
    watch(&f, "carol", 600).await;
    f.dialogs.fail_notifies_on("dlg-bob");

    let report = f
        .package
        .handle_channel_message("alice@example.com d1 c1 undef undef initiator rejected")
        .await
        .unwrap();

    assert_eq!(report.notified, 1);
    assert_eq!(report.failed, 1);
    let body = f.dialogs.notifies_on("dlg-carol")[0].body.clone().unwrap();
    assert!(body.contains("<state event=\"rejected\">terminated</state>"));
}

#[tokio::test(start_paused = true)]
async fn test_find_subscriptions_prunes_stale_members() {
    let f = fixture();
    watch(&f, "bob", 600).await;
    watch(&f, "carol", 5).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    let found = f.package.find_subscriptions(ALICE).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].subscriber, "bob@example.com");
    assert_eq!(f.kv.smembers(WATCHED).await.unwrap(), vec![record_key("bob")]);
}

#[tokio::test(start_paused = true)]
async fn test_bad_channel_line_is_rejected() {
    let f = fixture();
    assert!(f.package.handle_channel_message("alice@example.com d1").await.is_err());
    assert!(!f.kv.exists("dlg-info:alice@example.com").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_listener_delivers_published_events() {
    let f = fixture();
    watch(&f, "bob", 600).await;
    let listener = f.package.clone().start_listener().await.unwrap();

    assert_eq!(f.kv.publish("dialog", "garbage").await.unwrap(), 1);
    f.kv
        .publish("dialog", "alice@example.com d1 c1 undef undef recipient early")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let notifies = f.dialogs.notifies_on("dlg-bob");
    assert_eq!(notifies.len(), 1);
    assert!(notifies[0].body.as_deref().unwrap().contains("<state>early</state>"));

    listener.abort();
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_keeps_record_refreshed_mid_claim() {
    let kv = HookStore::new();
    let dialogs = RecordingDialogs::new();
    let package = DialogPackage::new(kv.clone(), dialogs.clone(), DialogPackageConfig::default());
    let subscription = Subscription::new("bob@example.com", ALICE, "dialog", 600);
    package.add_subscription(&handle("bob"), &subscription).await.unwrap();

    let key = record_key("bob");
    let fields: Vec<(String, String)> = kv.hgetall(&key).await.unwrap().into_iter().collect();
    // a refresh removes the record after the watcher list is read and
    // rewrites it once the version claim has missed
    kv.on(HookPoint::AfterSmembers, Batch::new().srem(WATCHED, &key).del(&key));
    kv.on(
        HookPoint::AfterHincrbyMissing,
        Batch::new().hset_ex(&key, fields, 600).sadd(WATCHED, &key),
    );

    let report = package
        .handle_channel_message("alice@example.com d1 c1 undef undef initiator confirmed")
        .await
        .unwrap();

    assert_eq!(report, FanOutReport::default());
    assert!(kv.exists(&key).await.unwrap());
    assert_eq!(kv.smembers(WATCHED).await.unwrap(), vec![key]);

    package
        .handle_channel_message("alice@example.com d1 c1 undef undef initiator terminated")
        .await
        .unwrap();
    assert_eq!(dialogs.notifies_on("dlg-bob").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_notify_carries_event_id() {
    let f = fixture();
    let subscription =
        Subscription::new("bob@example.com", ALICE, "dialog", 600).with_id(Some("abc".to_string()));
    f.package.add_subscription(&handle("bob"), &subscription).await.unwrap();

    f.package
        .handle_channel_message("alice@example.com d1 c1 undef undef recipient early")
        .await
        .unwrap();

    let notifies = f.dialogs.notifies_on("dlg-bob");
    assert_eq!(notifies.len(), 1);
    assert_eq!(notifies[0].event, "dialog;id=abc");
}

#[tokio::test(start_paused = true)]
async fn test_fan_out_notify_without_id() {
    let f = fixture();
    watch(&f, "bob", 600).await;
    f.package
        .handle_channel_message("alice@example.com d1 c1 undef undef recipient early")
        .await
        .unwrap();
    assert_eq!(f.dialogs.notifies_on("dlg-bob")[0].event, "dialog");
}
