//! Single-rank end-to-end tests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use arbor_runtime::{
    FenceRequest, KvsConfig, KvsEvent, KvsHandle, KvsRuntime, LookupRequest,
};
use arbor_store_memory::MemoryStore;
use arbor_treeobj::{TreeObj, TxnOp};
use arbor_types::{ClientId, Cred, KvsError, UserId, COMMIT_SYNC, LOOKUP_TREEOBJ};

async fn start(config: KvsConfig) -> (KvsRuntime, KvsHandle, Arc<MemoryStore>) {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryStore::new());
    let (bus, _) = broadcast::channel(256);
    let runtime = KvsRuntime::start(config, store.clone(), store.clone(), bus, None)
        .await
        .expect("runtime starts");
    let handle = runtime.handle();
    (runtime, handle, store)
}

fn val(data: &[u8]) -> TreeObj {
    TreeObj::val(data.to_vec())
}

#[tokio::test]
async fn roundtrip_single_val() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    let reply = kvs
        .commit("primary", vec![TxnOp::put("key1", val(b"1"))], 0, Cred::owner(0))
        .await
        .unwrap();
    assert_eq!(reply.rootseq, 1, "setroot advances 0 -> 1");

    let got = kvs.lookup(LookupRequest::new("key1")).await.unwrap();
    assert_eq!(got, val(b"1"));

    let info = kvs.getroot("primary", Cred::owner(0)).await.unwrap();
    assert_eq!(info.rootseq, 1);
    assert_eq!(info.rootref, reply.rootref);
}

#[tokio::test]
async fn missing_key_is_not_found() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;
    assert_eq!(
        kvs.lookup(LookupRequest::new("nope")).await.err(),
        Some(KvsError::NotFound)
    );

    // lookup-plus reports errno alongside the snapshot instead
    let plus = kvs.lookup_plus(LookupRequest::new("nope")).await.unwrap();
    assert_eq!(plus.errnum, Some(KvsError::NotFound));
    assert!(plus.val.is_none());
    assert!(plus.rootref.is_some());
}

#[tokio::test]
async fn large_value_promoted_to_valref() {
    let config = KvsConfig { big_val_threshold: 1024, ..KvsConfig::default() };
    let (_rt, kvs, _store) = start(config).await;

    let big = vec![b'a'; 2048];
    kvs.commit("primary", vec![TxnOp::put("big", TreeObj::val(big.clone()))], 0, Cred::owner(0))
        .await
        .unwrap();

    assert_eq!(kvs.lookup(LookupRequest::new("big")).await.unwrap(), TreeObj::val(big));

    let dirent = kvs
        .lookup(LookupRequest { flags: LOOKUP_TREEOBJ, ..LookupRequest::new("big") })
        .await
        .unwrap();
    assert!(dirent.is_valref());
    assert_eq!(dirent.count(), 1);
}

#[tokio::test]
async fn append_semantics() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    kvs.commit("primary", vec![TxnOp::put("val", val(b"abcd"))], 0, Cred::owner(0))
        .await
        .unwrap();
    kvs.commit("primary", vec![TxnOp::append("val", val(b"efgh"))], 0, Cred::owner(0))
        .await
        .unwrap();
    assert_eq!(kvs.lookup(LookupRequest::new("val")).await.unwrap(), val(b"abcdefgh"));
    let dirent = kvs
        .lookup(LookupRequest { flags: LOOKUP_TREEOBJ, ..LookupRequest::new("val") })
        .await
        .unwrap();
    assert!(dirent.is_valref());
    assert_eq!(dirent.count(), 2);

    kvs.commit("primary", vec![TxnOp::append("val", val(b"ijkl"))], 0, Cred::owner(0))
        .await
        .unwrap();
    assert_eq!(kvs.lookup(LookupRequest::new("val")).await.unwrap(), val(b"abcdefghijkl"));

    // append to an absent key behaves as a plain insert
    kvs.commit("primary", vec![TxnOp::append("newval", val(b"foobar"))], 0, Cred::owner(0))
        .await
        .unwrap();
    assert_eq!(kvs.lookup(LookupRequest::new("newval")).await.unwrap(), val(b"foobar"));
}

#[tokio::test]
async fn commit_reloads_evicted_blobs_from_content_store() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    kvs.commit("primary", vec![TxnOp::put("dir.val", val(b"abcd"))], 0, Cred::owner(0))
        .await
        .unwrap();
    // force the walk to fault everything back in from the content store
    kvs.dropcache().await.unwrap();

    kvs.commit("primary", vec![TxnOp::append("dir.val", val(b"efgh"))], 0, Cred::owner(0))
        .await
        .unwrap();
    assert_eq!(
        kvs.lookup(LookupRequest::new("dir.val")).await.unwrap(),
        val(b"abcdefgh")
    );

    kvs.dropcache().await.unwrap();
    assert_eq!(
        kvs.lookup(LookupRequest::new("dir.val")).await.unwrap(),
        val(b"abcdefgh")
    );
}

#[tokio::test]
async fn concurrent_commits_all_visible() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    let a = kvs.commit("primary", vec![TxnOp::put("a", val(b"1"))], 0, Cred::owner(0));
    let b = kvs.commit("primary", vec![TxnOp::put("b", val(b"2"))], 0, Cred::owner(0));
    let c = kvs.commit("primary", vec![TxnOp::put("c", val(b"3"))], 0, Cred::owner(0));
    let (a, b, c) = tokio::join!(a, b, c);
    // application order is the queue's; the latest snapshot holds them all
    let last = [a.unwrap(), b.unwrap(), c.unwrap()]
        .into_iter()
        .max_by_key(|reply| reply.rootseq)
        .unwrap();

    for (key, expect) in [("a", b"1"), ("b", b"2"), ("c", b"3")] {
        let got = kvs
            .lookup(LookupRequest {
                rootdir: Some(last.rootref.clone()),
                ..LookupRequest::new(key)
            })
            .await
            .unwrap();
        assert_eq!(got, val(expect), "key {key}");
    }
}

#[tokio::test]
async fn invalid_commit_surfaces_error_event() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;
    let mut events = kvs.subscribe();

    assert_eq!(
        kvs.commit("primary", vec![TxnOp::put(".", val(b"45"))], 0, Cred::owner(0))
            .await
            .err(),
        Some(KvsError::Invalid)
    );

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event published")
        .unwrap();
    match event {
        KvsEvent::Error { namespace, errnum, .. } => {
            assert_eq!(namespace, "primary");
            assert_eq!(errnum, KvsError::Invalid);
        }
        other => panic!("expected error event, got {other:?}"),
    }
}

#[tokio::test]
async fn setroot_event_carries_names_and_keys() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;
    let mut events = kvs.subscribe();

    kvs.commit("primary", vec![TxnOp::put("x.y", val(b"1"))], 0, Cred::owner(0))
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event published")
        .unwrap();
    match event {
        KvsEvent::Setroot { namespace, rootseq, names, keys, .. } => {
            assert_eq!(namespace, "primary");
            assert_eq!(rootseq, 1);
            assert_eq!(names.len(), 1);
            assert_eq!(keys, vec!["x.y".to_string()]);
        }
        other => panic!("expected setroot event, got {other:?}"),
    }
}

#[tokio::test]
async fn wait_version_fires_exactly_once_at_target() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    let waiter = {
        let kvs = kvs.clone();
        tokio::spawn(async move { kvs.wait_version("primary", 2, Cred::owner(0), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    kvs.commit("primary", vec![TxnOp::put("one", val(b"1"))], 0, Cred::owner(0))
        .await
        .unwrap();
    let second = kvs
        .commit("primary", vec![TxnOp::put("two", val(b"2"))], 0, Cred::owner(0))
        .await
        .unwrap();

    let reply = waiter.await.unwrap().unwrap();
    assert_eq!(reply.rootseq, 2);
    assert_eq!(reply.rootref, second.rootref);

    // an already-reached target responds immediately
    let reply = kvs.wait_version("primary", 1, Cred::owner(0), None).await.unwrap();
    assert_eq!(reply.rootseq, 2);
}

#[tokio::test]
async fn fence_waits_for_all_participants() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    let f1 = kvs.fence(FenceRequest {
        name: "f.1".to_string(),
        nprocs: 2,
        namespace: "primary".to_string(),
        flags: 0,
        ops: vec![TxnOp::put("a", val(b"1"))],
        cred: Cred::owner(0),
        client: None,
    });
    let f2 = {
        let kvs = kvs.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            kvs.fence(FenceRequest {
                name: "f.1".to_string(),
                nprocs: 2,
                namespace: "primary".to_string(),
                flags: 0,
                ops: vec![TxnOp::put("b", val(b"2"))],
                cred: Cred::owner(0),
                client: None,
            })
            .await
        }
    };
    let (r1, r2) = tokio::join!(f1, f2);
    let (r1, r2) = (r1.unwrap(), r2.unwrap());
    assert_eq!(r1.rootseq, r2.rootseq);
    assert_eq!(kvs.lookup(LookupRequest::new("a")).await.unwrap(), val(b"1"));
    assert_eq!(kvs.lookup(LookupRequest::new("b")).await.unwrap(), val(b"2"));
}

#[tokio::test]
async fn fence_rejects_mismatched_parameters() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    let pending = {
        let kvs = kvs.clone();
        tokio::spawn(async move {
            kvs.fence(FenceRequest {
                name: "f.2".to_string(),
                nprocs: 2,
                namespace: "primary".to_string(),
                flags: 0,
                ops: vec![TxnOp::put("a", val(b"1"))],
                cred: Cred::owner(0),
                client: None,
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mismatched = kvs
        .fence(FenceRequest {
            name: "f.2".to_string(),
            nprocs: 3,
            namespace: "primary".to_string(),
            flags: 0,
            ops: vec![TxnOp::put("b", val(b"2"))],
            cred: Cred::owner(0),
            client: None,
        })
        .await;
    assert_eq!(mismatched.err(), Some(KvsError::Invalid));

    // the fence is still completable by a conforming participant
    kvs.fence(FenceRequest {
        name: "f.2".to_string(),
        nprocs: 2,
        namespace: "primary".to_string(),
        flags: 0,
        ops: vec![TxnOp::put("c", val(b"3"))],
        cred: Cred::owner(0),
        client: None,
    })
    .await
    .unwrap();
    pending.await.unwrap().unwrap();
}

#[tokio::test]
async fn namespace_lifecycle() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    kvs.namespace_create("app", None, UserId(1000), 0).await.unwrap();
    assert_eq!(
        kvs.namespace_create("app", None, UserId(1000), 0).await.err(),
        Some(KvsError::Exists)
    );

    let list = kvs.namespace_list().await.unwrap();
    assert!(list.iter().any(|n| n.namespace == "app" && n.owner == UserId(1000)));

    kvs.commit("app", vec![TxnOp::put("k", val(b"v"))], 0, Cred::user(1000))
        .await
        .unwrap();
    let got = kvs
        .lookup(LookupRequest {
            namespace: Some("app".to_string()),
            cred: Cred::user(1000),
            ..LookupRequest::new("k")
        })
        .await
        .unwrap();
    assert_eq!(got, val(b"v"));

    // other users may not touch it
    assert_eq!(
        kvs.lookup(LookupRequest {
            namespace: Some("app".to_string()),
            cred: Cred::user(1001),
            ..LookupRequest::new("k")
        })
        .await
        .err(),
        Some(KvsError::Perm)
    );

    kvs.namespace_remove("app").await.unwrap();
    assert_eq!(
        kvs.lookup(LookupRequest {
            namespace: Some("app".to_string()),
            cred: Cred::user(1000),
            ..LookupRequest::new("k")
        })
        .await
        .err(),
        Some(KvsError::NotSup)
    );

    // removing again (or an unknown namespace) is quiet
    kvs.namespace_remove("app").await.unwrap();
    kvs.namespace_remove("ghost").await.unwrap();
    // the primary namespace is not removable
    assert_eq!(kvs.namespace_remove("primary").await.err(), Some(KvsError::NotSup));
}

#[tokio::test]
async fn guest_commits_limited_to_vals() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;
    kvs.namespace_create("guest", None, UserId(1000), 0).await.unwrap();

    kvs.commit(
        "guest",
        vec![TxnOp::put("ok", val(b"1")), TxnOp::put("d", TreeObj::empty_dir()), TxnOp::unlink("x")],
        0,
        Cred::user(1000),
    )
    .await
    .unwrap();

    assert_eq!(
        kvs.commit(
            "guest",
            vec![TxnOp::put("bad", TreeObj::symlink(None, "ok"))],
            0,
            Cred::user(1000),
        )
        .await
        .err(),
        Some(KvsError::Perm)
    );
}

#[tokio::test]
async fn sync_commit_checkpoints_primary() {
    let (_rt, kvs, store) = start(KvsConfig::default()).await;

    let reply = kvs
        .commit("primary", vec![TxnOp::put("k", val(b"v"))], COMMIT_SYNC, Cred::owner(0))
        .await
        .unwrap();

    let checkpoint = arbor_store_core::CheckpointStore::get(store.as_ref())
        .await
        .unwrap()
        .expect("sync commit wrote a checkpoint");
    assert_eq!(checkpoint.rootref, reply.rootref);
    assert_eq!(checkpoint.rootseq, reply.rootseq);

    // sync is a primary-only affordance
    kvs.namespace_create("other", None, UserId(0), 0).await.unwrap();
    assert_eq!(
        kvs.commit("other", vec![TxnOp::put("k", val(b"v"))], COMMIT_SYNC, Cred::owner(0))
            .await
            .err(),
        Some(KvsError::Invalid)
    );
}

#[tokio::test]
async fn periodic_checkpoint_runs() {
    let config = KvsConfig {
        checkpoint_period: Some(Duration::from_millis(100)),
        ..KvsConfig::default()
    };
    let (_rt, kvs, store) = start(config).await;

    let reply = kvs
        .commit("primary", vec![TxnOp::put("k", val(b"v"))], 0, Cred::owner(0))
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(cp) = arbor_store_core::CheckpointStore::get(store.as_ref()).await.unwrap() {
            assert_eq!(cp.rootref, reply.rootref);
            assert_eq!(cp.rootseq, reply.rootseq);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "checkpoint never ran");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn checkpoint_restores_on_restart() {
    let _ = tracing_subscriber::fmt::try_init();
    let store = Arc::new(MemoryStore::new());
    let (bus, _) = broadcast::channel(256);
    let runtime = KvsRuntime::start(
        KvsConfig::default(),
        store.clone(),
        store.clone(),
        bus.clone(),
        None,
    )
    .await
    .unwrap();
    let kvs = runtime.handle();
    let reply = kvs
        .commit("primary", vec![TxnOp::put("k", val(b"v"))], COMMIT_SYNC, Cred::owner(0))
        .await
        .unwrap();
    runtime.shutdown().await;

    let runtime = KvsRuntime::start(KvsConfig::default(), store.clone(), store, bus, None)
        .await
        .unwrap();
    let kvs = runtime.handle();
    let info = kvs.getroot("primary", Cred::owner(0)).await.unwrap();
    assert_eq!(info.rootseq, reply.rootseq);
    assert_eq!(info.rootref, reply.rootref);
    assert_eq!(kvs.lookup(LookupRequest::new("k")).await.unwrap(), val(b"v"));
}

#[tokio::test]
async fn stats_track_cache_and_namespaces() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;
    kvs.commit("primary", vec![TxnOp::put("k", val(b"v"))], 0, Cred::owner(0))
        .await
        .unwrap();

    let stats = kvs.stats_get().await.unwrap();
    assert!(stats.cache_count > 0);
    let primary = stats.namespaces.get("primary").expect("primary tracked");
    assert_eq!(primary.store_revision, 1);

    kvs.dropcache().await.unwrap();
    kvs.stats_clear().await.unwrap();
    let stats = kvs.stats_get().await.unwrap();
    assert_eq!(stats.faults, 0);
}

#[tokio::test]
async fn disconnect_cancels_version_waiters() {
    let (_rt, kvs, _store) = start(KvsConfig::default()).await;

    let waiter = {
        let kvs = kvs.clone();
        tokio::spawn(async move {
            kvs.wait_version("primary", 5, Cred::owner(0), Some(ClientId(7))).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    kvs.disconnect(ClientId(7)).await;

    // the waiter's reply channel was dropped with the waiter
    assert_eq!(waiter.await.unwrap().err(), Some(KvsError::NoSys));

    // commits still proceed normally
    kvs.commit("primary", vec![TxnOp::put("k", val(b"v"))], 0, Cred::owner(0))
        .await
        .unwrap();
}

#[tokio::test]
async fn shutdown_drains_pending_with_nosys() {
    let (runtime, kvs, _store) = start(KvsConfig::default()).await;
    let waiter = {
        let kvs = kvs.clone();
        tokio::spawn(async move { kvs.wait_version("primary", 5, Cred::owner(0), None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.shutdown().await;
    assert_eq!(waiter.await.unwrap().err(), Some(KvsError::NoSys));
}
