//! イベントディスパッチャーの購読テスト
//!
//! コンテキスト単位の参照カウント、コールバックの追加・削除、
//! 複数コンテキストでの配信（コンテキストによるフィルタリングなし）など

use anyhow::Result;
use realm_bus::modules::diagnostic_catalog;
use realm_bus::modules::event_emitter::{MONITORING_EVENT, TEST_EVENT};
use realm_bus::{
    create_root, AddressableHandle, Command, ContextDescriptor, ContextId, Event, Listener,
    RootMessageHandler,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Records the `text` of every event it receives.
fn recorder() -> (Listener<Event>, Arc<Mutex<Vec<String>>>) {
    let texts = Arc::new(Mutex::new(Vec::new()));
    let sink = texts.clone();
    let listener = Listener::new(move |_, event: &Event| {
        let text = event.payload["text"].as_str().unwrap_or_default().to_string();
        sink.lock().unwrap().push(text);
    });
    (listener, texts)
}

fn count(texts: &Arc<Mutex<Vec<String>>>) -> usize {
    texts.lock().unwrap().len()
}

fn session(realms: &[u64]) -> (RootMessageHandler, Arc<Mutex<Vec<String>>>) {
    init_logger();
    let root = create_root("session-id-event", diagnostic_catalog());
    for id in realms {
        root.attach_realm(ContextId(*id));
    }
    let (monitor, monitoring) = recorder();
    root.on(MONITORING_EVENT, monitor);
    (root, monitoring)
}

/// Run emitTestEvent in `realm`. The monitoring event is always emitted, and
/// it is delivered before the command resolves.
async fn emit_test_event(
    root: &RootMessageHandler,
    realm: u64,
    monitoring: &Arc<Mutex<Vec<String>>>,
) -> Result<Value> {
    let before = count(monitoring);
    let result = root
        .handle_command(Command::new(
            "eventemitter",
            "emitTestEvent",
            AddressableHandle::realm(realm),
        ))
        .await?;
    assert_eq!(count(monitoring), before + 1);
    Ok(result)
}

/// Ask the realm's module whether it currently emits the test event.
async fn is_subscribed(root: &RootMessageHandler, realm: u64) -> Result<bool> {
    let value = root
        .handle_command(Command::new(
            "eventemitter",
            "isSubscribed",
            AddressableHandle::realm(realm),
        ))
        .await?;
    Ok(value == Value::Bool(true))
}

#[tokio::test]
async fn test_add_remove_event_listener() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let dispatcher = root.events_dispatcher();

    emit_test_event(&root, 1, &monitoring).await?;
    assert!(!is_subscribed(&root, 1).await?);

    let (on_event, events) = recorder();
    dispatcher.subscribe(TEST_EVENT, &descriptor, on_event.clone()).await?;
    assert!(is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 1);

    // Removing a callback that was never added leaves the first one in place
    let (another_callback, _) = recorder();
    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &another_callback).await;
    assert!(is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 2);

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &on_event).await;
    assert!(!is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 2);

    dispatcher.subscribe(TEST_EVENT, &descriptor, on_event.clone()).await?;
    assert!(is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 3);

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &on_event).await;
    assert!(!is_subscribed(&root, 1).await?);

    // Second removal is a no-op
    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &on_event).await;
    assert!(!is_subscribed(&root, 1).await?);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_two_callbacks() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let dispatcher = root.events_dispatcher();

    let (on_event, events) = recorder();
    dispatcher.subscribe(TEST_EVENT, &descriptor, on_event.clone()).await?;

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 1);

    let (other_callback, other_events) = recorder();
    dispatcher.subscribe(TEST_EVENT, &descriptor, other_callback.clone()).await?;
    assert!(is_subscribed(&root, 1).await?);
    assert_eq!(dispatcher.subscription_count(TEST_EVENT, &descriptor).await, 2);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 2);
    assert_eq!(count(&other_events), 1);

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &other_callback).await;
    assert!(is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 3);
    assert_eq!(count(&other_events), 1);

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &on_event).await;
    assert!(!is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 3);
    assert_eq!(count(&other_events), 1);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_two_contexts() -> Result<()> {
    let (root, monitoring) = session(&[1, 2]);
    let descriptor1 = ContextDescriptor::new(1);
    let descriptor2 = ContextDescriptor::new(2);
    let dispatcher = root.events_dispatcher();

    let (on_event1, events1) = recorder();
    dispatcher.subscribe(TEST_EVENT, &descriptor1, on_event1.clone()).await?;
    assert!(is_subscribed(&root, 1).await?);
    assert!(!is_subscribed(&root, 2).await?);

    let (on_event2, events2) = recorder();
    dispatcher.subscribe(TEST_EVENT, &descriptor2, on_event2.clone()).await?;
    assert!(is_subscribed(&root, 1).await?);
    assert!(is_subscribed(&root, 2).await?);

    // Delivery is not filtered by descriptor: both callbacks see both realms
    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!((count(&events1), count(&events2)), (1, 1));
    emit_test_event(&root, 2, &monitoring).await?;
    assert_eq!((count(&events1), count(&events2)), (2, 2));

    dispatcher.unsubscribe(TEST_EVENT, &descriptor1, &on_event1).await;
    assert!(!is_subscribed(&root, 1).await?);
    assert!(is_subscribed(&root, 2).await?);

    // Realm 1 no longer emits
    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!((count(&events1), count(&events2)), (2, 2));

    // Realm 2 still does
    emit_test_event(&root, 2, &monitoring).await?;
    assert_eq!((count(&events1), count(&events2)), (2, 3));

    dispatcher.unsubscribe(TEST_EVENT, &descriptor2, &on_event2).await;
    assert!(!is_subscribed(&root, 1).await?);
    assert!(!is_subscribed(&root, 2).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    emit_test_event(&root, 2, &monitoring).await?;
    assert_eq!((count(&events1), count(&events2)), (2, 3));

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_callback_can_filter_by_origin() -> Result<()> {
    let (root, monitoring) = session(&[1, 2]);
    let descriptor = ContextDescriptor::new(1);
    let dispatcher = root.events_dispatcher();
    dispatcher.subscribe(TEST_EVENT, &ContextDescriptor::new(2), recorder().0).await?;

    let mine = Arc::new(Mutex::new(Vec::new()));
    let sink = mine.clone();
    let wanted = descriptor.destination();
    let filtered = Listener::new(move |_, event: &Event| {
        if event.origin == wanted {
            sink.lock().unwrap().push(event.payload.clone());
        }
    });
    dispatcher.subscribe(TEST_EVENT, &descriptor, filtered).await?;

    emit_test_event(&root, 2, &monitoring).await?;
    emit_test_event(&root, 1, &monitoring).await?;

    assert_eq!(*mine.lock().unwrap(), vec![json!({"text": "event 1 from realm#1"})]);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_is_subscribed_through_dispatcher() -> Result<()> {
    let (root, _monitoring) = session(&[4]);
    let descriptor = ContextDescriptor::new(4);
    let dispatcher = root.events_dispatcher();
    let (listener, _) = recorder();

    assert!(!dispatcher.is_subscribed(TEST_EVENT, &descriptor.destination()).await?);
    assert!(!dispatcher.is_subscribed(TEST_EVENT, &AddressableHandle::Root).await?);

    dispatcher.subscribe(TEST_EVENT, &descriptor, listener.clone()).await?;
    assert!(dispatcher.is_subscribed(TEST_EVENT, &descriptor.destination()).await?);

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &listener).await;
    assert!(!dispatcher.is_subscribed(TEST_EVENT, &descriptor.destination()).await?);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_realm_created_lazily_by_directive() -> Result<()> {
    let (root, monitoring) = session(&[9]);
    assert!(root.router().live_realms().is_empty());

    let (listener, events) = recorder();
    root.events_dispatcher()
        .subscribe(TEST_EVENT, &ContextDescriptor::new(9), listener)
        .await?;
    assert_eq!(root.router().live_realms(), vec![ContextId(9)]);

    emit_test_event(&root, 9, &monitoring).await?;
    assert_eq!(count(&events), 1);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_detached_realm_subscription_can_be_removed() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let (listener, events) = recorder();

    root.events_dispatcher()
        .subscribe(TEST_EVENT, &descriptor, listener.clone())
        .await?;
    emit_test_event(&root, 1, &monitoring).await?;
    assert!(root.detach_realm(ContextId(1)).await);

    // No realm left to disable; still succeeds
    root.events_dispatcher()
        .unsubscribe(TEST_EVENT, &descriptor, &listener)
        .await;
    assert_eq!(root.events_dispatcher().subscription_count(TEST_EVENT, &descriptor).await, 0);
    assert_eq!(root.listener_count(TEST_EVENT), 0);
    assert_eq!(count(&events), 1);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_reattached_realm_accepts_new_subscription() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let dispatcher = root.events_dispatcher();
    let (first, first_events) = recorder();
    let (second, second_events) = recorder();

    dispatcher.subscribe(TEST_EVENT, &descriptor, first.clone()).await?;
    assert!(is_subscribed(&root, 1).await?);

    assert!(root.detach_realm(ContextId(1)).await);
    assert_eq!(dispatcher.subscription_count(TEST_EVENT, &descriptor).await, 0);
    assert_eq!(root.listener_count(TEST_EVENT), 0);

    assert!(root.attach_realm(ContextId(1)));
    assert!(!is_subscribed(&root, 1).await?);

    dispatcher.subscribe(TEST_EVENT, &descriptor, second.clone()).await?;
    assert_eq!(dispatcher.subscription_count(TEST_EVENT, &descriptor).await, 1);
    assert!(is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!((count(&first_events), count(&second_events)), (0, 1));

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &second).await;
    assert!(!is_subscribed(&root, 1).await?);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_subscription_state_survives_realm_crash() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let dispatcher = root.events_dispatcher();
    let (first, first_events) = recorder();
    let (second, second_events) = recorder();

    dispatcher.subscribe(TEST_EVENT, &descriptor, first.clone()).await?;
    let crashed = root
        .handle_command(Command::new("eventemitter", "crash", AddressableHandle::realm(1)))
        .await;
    assert!(crashed.is_err());

    // The restarted realm still emits while the count is positive
    assert_eq!(dispatcher.subscription_count(TEST_EVENT, &descriptor).await, 1);
    assert!(is_subscribed(&root, 1).await?);

    dispatcher.subscribe(TEST_EVENT, &descriptor, second.clone()).await?;
    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!((count(&first_events), count(&second_events)), (1, 1));

    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &first).await;
    assert!(is_subscribed(&root, 1).await?);
    dispatcher.unsubscribe(TEST_EVENT, &descriptor, &second).await;
    assert!(!is_subscribed(&root, 1).await?);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!((count(&first_events), count(&second_events)), (1, 1));

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_unsubscribe_removes_direct_registration_of_same_listener() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let (listener, events) = recorder();

    assert!(root.on(TEST_EVENT, listener.clone()));
    root.events_dispatcher()
        .subscribe(TEST_EVENT, &descriptor, listener.clone())
        .await?;
    // One emitter entry for both
    assert_eq!(root.listener_count(TEST_EVENT), 1);

    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 1);

    root.events_dispatcher()
        .unsubscribe(TEST_EVENT, &descriptor, &listener)
        .await;
    assert_eq!(root.listener_count(TEST_EVENT), 0);

    root.destroy().await;
    Ok(())
}

#[tokio::test]
async fn test_destroy_stops_delivery() -> Result<()> {
    let (root, monitoring) = session(&[1]);
    let descriptor = ContextDescriptor::new(1);
    let (listener, events) = recorder();

    root.events_dispatcher()
        .subscribe(TEST_EVENT, &descriptor, listener)
        .await?;
    emit_test_event(&root, 1, &monitoring).await?;
    assert_eq!(count(&events), 1);

    root.destroy().await;

    assert_eq!(root.listener_count(TEST_EVENT), 0);
    assert_eq!(root.listener_count(MONITORING_EVENT), 0);
    assert!(root
        .handle_command(Command::new("eventemitter", "emitTestEvent", AddressableHandle::realm(1)))
        .await
        .is_err());
    assert_eq!(count(&events), 1);
    assert_eq!(count(&monitoring), 1);
    Ok(())
}
