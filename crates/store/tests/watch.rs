#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use lookout_core::{
    gen_change_event, Attributes, AttrsFn, EventKind, Selector, Selectors, WatchEvent,
};
use lookout_store::{Indexers, Store, StoreError, WatchHandle};

#[derive(Debug, Clone, PartialEq)]
struct Pod {
    name: String,
    app: String,
}

fn pod(name: &str, app: &str) -> Pod {
    Pod { name: name.to_string(), app: app.to_string() }
}

fn attrs_fn() -> AttrsFn<Pod> {
    Arc::new(|p: &Pod| {
        Ok(Attributes {
            labels: [("app", p.app.as_str())].into_iter().collect(),
            fields: [("metadata.name", p.name.as_str())].into_iter().collect(),
        })
    })
}

fn new_store() -> Store<Pod> {
    Store::new(
        Box::new(|p: &Pod| Ok(p.name.clone())),
        Indexers::new(),
        gen_change_event(attrs_fn()),
    )
}

fn added(name: &str, app: &str) -> WatchEvent<Pod> {
    WatchEvent { kind: EventKind::Added, object: pod(name, app) }
}

fn modified(name: &str, app: &str) -> WatchEvent<Pod> {
    WatchEvent { kind: EventKind::Modified, object: pod(name, app) }
}

fn deleted(name: &str, app: &str) -> WatchEvent<Pod> {
    WatchEvent { kind: EventKind::Deleted, object: pod(name, app) }
}

fn label_selectors(app: &str) -> Selectors {
    Selectors::new(None, Selector::from_set([("app", app)]), Selector::everything())
}

async fn expect_events(handle: &mut WatchHandle<Pod>, expected: &[WatchEvent<Pod>]) {
    for want in expected {
        let got = tokio::time::timeout(Duration::from_secs(5), handle.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed early");
        assert_eq!(&got, want);
    }
    // No excess event should be pending.
    if let Ok(Some(extra)) =
        tokio::time::timeout(Duration::from_millis(50), handle.recv()).await
    {
        panic!("unexpected excess event: {extra:?}");
    }
}

async fn expect_closed(handle: &mut WatchHandle<Pod>) -> usize {
    let mut drained = 0;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), handle.recv())
            .await
            .expect("timed out waiting for channel close")
        {
            Some(_) => drained += 1,
            None => return drained,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_streams_live_mutations() {
    let store = new_store();
    let mut w = store.watch(Selectors::everything()).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), modified("pod1", "nginx2")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_reports_deletion_with_final_value() {
    let store = new_store();
    let mut w = store.watch(Selectors::everything()).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.delete("pod1").unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), deleted("pod1", "nginx1")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_merges_history_into_added_events() {
    let store = new_store();
    store.create(pod("pod1", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();
    store.update(pod("pod1", "nginx3")).unwrap();

    let mut w = store.watch(Selectors::everything()).unwrap();

    store.create(pod("pod2", "nginx2")).unwrap();
    store.update(pod("pod2", "nginx3")).unwrap();

    expect_events(
        &mut w,
        &[added("pod1", "nginx3"), added("pod2", "nginx2"), modified("pod2", "nginx3")],
    )
    .await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn snapshot_omits_deleted_entries() {
    let store = new_store();
    store.create(pod("pod1", "nginx1")).unwrap();
    store.create(pod("pod2", "nginx2")).unwrap();
    store.delete("pod2").unwrap();

    let mut w = store.watch(Selectors::everything()).unwrap();

    store.delete("pod1").unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), deleted("pod1", "nginx1")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_watch_reports_departure_as_deleted() {
    let store = new_store();
    let mut w = store.watch(label_selectors("nginx1")).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    // The transition out of the selection carries the pre-transition object.
    expect_events(&mut w, &[added("pod1", "nginx1"), deleted("pod1", "nginx1")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_watch_reports_arrival_as_added() {
    let store = new_store();
    let mut w = store.watch(label_selectors("nginx2")).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    expect_events(&mut w, &[added("pod1", "nginx2")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn label_watch_ignores_foreign_objects() {
    let store = new_store();
    let mut w = store.watch(label_selectors("nginx1")).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.create(pod("pod2", "nginx2")).unwrap();
    store.delete("pod1").unwrap();
    store.delete("pod2").unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), deleted("pod1", "nginx1")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn field_watch_selects_by_name() {
    let store = new_store();
    let selectors = Selectors::new(
        None,
        Selector::everything(),
        Selector::from_set([("metadata.name", "pod1")]),
    );
    let mut w = store.watch(selectors).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.create(pod("pod2", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), modified("pod1", "nginx2")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn key_filtered_watch() {
    let store = new_store();
    store.create(pod("pod1", "nginx1")).unwrap();
    store.create(pod("pod2", "nginx1")).unwrap();

    let selectors =
        Selectors::new(Some("pod2".to_string()), Selector::everything(), Selector::everything());
    let mut w = store.watch(selectors).unwrap();

    store.update(pod("pod1", "nginx2")).unwrap();
    store.update(pod("pod2", "nginx2")).unwrap();

    expect_events(&mut w, &[added("pod2", "nginx1"), modified("pod2", "nginx2")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn equal_update_is_suppressed() {
    let store = new_store();
    let mut w = store.watch(Selectors::everything()).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx1")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), modified("pod1", "nginx2")]).await;
    assert_eq!(store.version(), 3, "the suppressed update still consumed a version");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_arrive_in_mutation_order_without_gaps() {
    let store = new_store();
    let mut w = store.watch(Selectors::everything()).unwrap();

    store.create(pod("pod1", "app-0")).unwrap();
    for i in 1..=50 {
        store.update(pod("pod1", &format!("app-{i}"))).unwrap();
    }

    let mut expected = vec![added("pod1", "app-0")];
    expected.extend((1..=50).map(|i| modified("pod1", &format!("app-{i}"))));
    expect_events(&mut w, &expected).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_watchers_see_independent_streams() {
    let store = new_store();
    let mut all = store.watch(Selectors::everything()).unwrap();
    let mut filtered = store.watch(label_selectors("nginx1")).unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.create(pod("pod2", "nginx2")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    expect_events(
        &mut all,
        &[added("pod1", "nginx1"), added("pod2", "nginx2"), modified("pod1", "nginx2")],
    )
    .await;
    expect_events(&mut filtered, &[added("pod1", "nginx1"), deleted("pod1", "nginx1")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_watcher_is_terminated_not_the_store() {
    let store = new_store();
    // Never read from this handle; its queues fill up and the store must cut
    // it loose rather than stall mutators.
    let mut stuck = store.watch(Selectors::everything()).unwrap();

    for i in 0..400 {
        store.create(pod(&format!("pod{i:03}"), "nginx")).unwrap();
    }

    let drained = expect_closed(&mut stuck).await;
    assert!(drained < 400, "watcher should have been cut off, drained {drained}");

    // The store is unaffected: mutations kept succeeding and fresh watchers
    // get a full snapshot.
    assert_eq!(store.list().unwrap().len(), 400);
    let mut fresh = store.watch(label_selectors("nginx")).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), fresh.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(first, added("pod000", "nginx"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_closes_the_channel_once() {
    let store = new_store();
    let mut w = store.watch(Selectors::everything()).unwrap();
    store.create(pod("pod1", "nginx1")).unwrap();

    w.stop();
    w.stop();
    expect_closed(&mut w).await;

    // The store keeps serving other watchers.
    let mut other = store.watch(Selectors::everything()).unwrap();
    expect_events(&mut other, &[added("pod1", "nginx1")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_stop_terminates_watchers_and_refuses_new_ones() {
    let store = new_store();
    store.create(pod("pod1", "nginx1")).unwrap();
    let mut w = store.watch(Selectors::everything()).unwrap();

    store.stop();

    expect_closed(&mut w).await;
    assert!(matches!(store.watch(Selectors::everything()).unwrap_err(), StoreError::Stopped));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_expr_parses_label_and_field_expressions() {
    let store = new_store();
    let mut w = store.watch_expr(None, "app=nginx1", "").unwrap();

    store.create(pod("pod1", "nginx1")).unwrap();
    store.create(pod("pod2", "nginx2")).unwrap();
    store.update(pod("pod1", "nginx2")).unwrap();

    expect_events(&mut w, &[added("pod1", "nginx1"), deleted("pod1", "nginx1")]).await;

    let mut by_name = store.watch_expr(None, "", "metadata.name=pod2").unwrap();
    expect_events(&mut by_name, &[added("pod2", "nginx2")]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_expr_rejects_bad_expressions() {
    let store = new_store();
    let err = store.watch_expr(None, "app", "").unwrap_err();
    assert!(matches!(err, StoreError::InvalidSelector(_)), "got {err:?}");
    let err = store.watch_expr(None, "", "=pod1").unwrap_err();
    assert!(matches!(err, StoreError::InvalidSelector(_)), "got {err:?}");
    // A failed watch registers nothing; the store keeps working.
    store.create(pod("pod1", "nginx1")).unwrap();
    assert_eq!(store.list().unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn detached_channel_keeps_streaming() {
    let store = new_store();
    let w = store.watch(Selectors::everything()).unwrap();
    let mut rx = w.into_channel();

    store.create(pod("pod1", "nginx1")).unwrap();
    let ev = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed");
    assert_eq!(ev, added("pod1", "nginx1"));

    // The watcher outlives the consumed handle; store stop still closes the
    // detached channel.
    store.stop();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel close")
        {
            Some(_) => continue,
            None => break,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_mutators_one_watcher_gap_free() {
    let store = Arc::new(new_store());
    let mut w = store.watch(Selectors::everything()).unwrap();

    let writer = {
        let store = Arc::clone(&store);
        tokio::task::spawn_blocking(move || {
            for i in 0..60 {
                store.create(pod(&format!("pod{i:02}"), "nginx")).unwrap();
            }
        })
    };
    writer.await.unwrap();

    // Every create must surface exactly once; per-watcher order follows the
    // mutation order.
    let mut seen = Vec::new();
    for _ in 0..60 {
        let ev = tokio::time::timeout(Duration::from_secs(5), w.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        assert_eq!(ev.kind, EventKind::Added);
        seen.push(ev.object.name);
    }
    let expected: Vec<String> = (0..60).map(|i| format!("pod{i:02}")).collect();
    assert_eq!(seen, expected);
}
