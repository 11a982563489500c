//! Integration tests for the layer store over the `vfs` driver.
//!
//! Covered scenarios:
//! - Registration, chain ids, and content deduplication
//! - Reference counting and cascading release
//! - Restore after restart
//! - Depth limit, name conflicts, and rollback of failed operations
//! - Concurrent registration of identical content
//! - Byte-exact tar streams through tar-split
//! - Read-write layers with init layers

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use std::io::Read;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Barrier};

use common::{AbortingReader, Fixture, append_dir, append_file, entry_names, layer_tar};
use strata_common::config::StoreOptions;
use strata_common::constants::MAX_LAYER_DEPTH;
use strata_common::error::StrataError;
use strata_common::types::{ChainId, Digest, DiffId};
use strata_graphdriver::{ChangeKind, Driver};
use strata_layer::{
    CreateRwLayerOpts, Descriptor, LayerHandle, LayerStore, compute_chain_id, create_chain_id,
};

fn read_all(mut stream: impl Read) -> Vec<u8> {
    let mut out = Vec::new();
    let _ = stream.read_to_end(&mut out).expect("read stream");
    out
}

fn with_hostname() -> CreateRwLayerOpts {
    CreateRwLayerOpts {
        init: Some(Box::new(|root| {
            let etc = root.join("etc");
            std::fs::create_dir_all(&etc).map_err(|e| StrataError::io(&etc, e))?;
            let hostname = etc.join("hostname");
            std::fs::write(&hostname, "box\n").map_err(|e| StrataError::io(&hostname, e))
        })),
        ..CreateRwLayerOpts::default()
    }
}

// ── Registration ─────────────────────────────────────────────────────

#[test]
fn register_derives_diff_and_chain_ids() {
    let fx = Fixture::new();
    let tar = layer_tar(&[("hello.txt", "hello")]);

    let layer = fx.store.register(tar.as_slice(), None).expect("register");

    let diff_id = DiffId::new(Digest::from_bytes(&tar));
    assert_eq!(layer.diff_id(), &diff_id);
    assert_eq!(layer.chain_id(), &ChainId::from(diff_id));
    assert_eq!(layer.diff_size(), 5);
    assert!(layer.parent().is_none());
    assert_eq!(fx.store.reference_count(layer.chain_id()), Some(1));
}

#[test]
fn child_chain_id_folds_parent_and_holds_it() {
    let fx = Fixture::new();
    let base_tar = layer_tar(&[("a", "1")]);
    let top_tar = layer_tar(&[("b", "22")]);

    let base = fx.store.register(base_tar.as_slice(), None).expect("base");
    let top = fx
        .store
        .register(top_tar.as_slice(), Some(base.chain_id()))
        .expect("top");

    let top_diff = DiffId::new(Digest::from_bytes(&top_tar));
    assert_eq!(top.chain_id(), &compute_chain_id(Some(base.chain_id()), &top_diff));
    assert_eq!(
        Some(top.chain_id().clone()),
        create_chain_id(&[base.diff_id().clone(), top_diff])
    );
    assert_eq!(top.parent().map(|p| p.chain_id()), Some(base.chain_id()));
    assert_eq!(top.size(), 3);
    assert_eq!(top.diff_size(), 2);
    assert_eq!(fx.store.reference_count(base.chain_id()), Some(2));
}

#[test]
fn registering_identical_content_twice_skips_the_driver() {
    let fx = Fixture::new();
    let tar = layer_tar(&[("hello.txt", "hello")]);

    let first = fx.store.register(tar.as_slice(), None).expect("first");
    let (creates, applies) = (fx.driver.creates(), fx.driver.applies());
    let second = fx.store.register(tar.as_slice(), None).expect("second");

    assert_eq!(first.chain_id(), second.chain_id());
    assert!(Arc::ptr_eq(first.info(), second.info()));
    assert_eq!(fx.driver.creates(), creates);
    assert_eq!(fx.driver.applies(), applies);
    assert_eq!(fx.store.reference_count(first.chain_id()), Some(2));
    assert_eq!(fx.driver_dirs(), 1);

    assert!(fx.store.release(first).expect("release first").is_empty());
    assert_eq!(fx.store.release(second).expect("release second").len(), 1);
}

#[test]
fn duplicate_on_a_parent_returns_the_parent_hold() {
    let fx = Fixture::new();
    let base = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("base");
    let tar = layer_tar(&[("b", "2")]);

    let first = fx.store.register(tar.as_slice(), Some(base.chain_id())).expect("first");
    let second = fx.store.register(tar.as_slice(), Some(base.chain_id())).expect("second");

    assert_eq!(first.chain_id(), second.chain_id());
    assert_eq!(fx.store.reference_count(base.chain_id()), Some(2));
}

#[test]
fn descriptor_survives_restart() {
    let fx = Fixture::new();
    let descriptor = Descriptor {
        media_type: "application/vnd.oci.image.layer.v1.tar+gzip".into(),
        digest: Digest::from_bytes(b"compressed"),
        size: 42,
        urls: vec!["https://mirror.example/blob".into()],
    };
    let layer = fx
        .store
        .register_with_descriptor(
            layer_tar(&[("f", "x")]).as_slice(),
            None,
            Some(descriptor.clone()),
        )
        .expect("register");
    let chain_id = layer.chain_id().clone();
    assert_eq!(layer.descriptor(), Some(&descriptor));

    let fx = fx.reopen();
    let restored = fx.store.get(&chain_id).expect("get after restart");
    assert_eq!(restored.descriptor(), Some(&descriptor));
}

#[test]
fn unknown_parent_is_not_found() {
    let fx = Fixture::new();
    let missing = ChainId::new(Digest::from_bytes(b"nowhere"));

    let err = fx
        .store
        .register(layer_tar(&[("f", "x")]).as_slice(), Some(&missing))
        .expect_err("unknown parent");

    assert!(err.is_not_found());
    assert_eq!(fx.driver.creates(), 0);
}

#[test]
fn depth_limit_is_enforced_before_any_driver_work() {
    let fx = Fixture::new();
    let tar = layer_tar(&[("f", "x")]);

    let mut top = fx.store.register(tar.as_slice(), None).expect("base");
    for _ in 1..MAX_LAYER_DEPTH {
        top = fx
            .store
            .register(tar.as_slice(), Some(top.chain_id()))
            .expect("register within limit");
    }
    assert_eq!(top.info().depth(), MAX_LAYER_DEPTH);

    let creates = fx.driver.creates();
    let count = fx.store.reference_count(top.chain_id());
    let err = fx
        .store
        .register(tar.as_slice(), Some(top.chain_id()))
        .expect_err("too deep");

    assert!(matches!(err, StrataError::MaxDepthExceeded { max } if max == MAX_LAYER_DEPTH));
    assert_eq!(fx.driver.creates(), creates);
    assert_eq!(fx.store.reference_count(top.chain_id()), count);
}

// ── Release ──────────────────────────────────────────────────────────

#[test]
fn release_cascades_to_unreferenced_parents() {
    let fx = Fixture::new();
    let a = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("a");
    let b = fx
        .store
        .register(layer_tar(&[("b", "2")]).as_slice(), Some(a.chain_id()))
        .expect("b");
    let (a_id, b_id) = (a.chain_id().clone(), b.chain_id().clone());
    let (a_cache, b_cache) = (a.info().cache_id().to_string(), b.info().cache_id().to_string());

    assert!(fx.store.release(a).expect("release a").is_empty());
    assert_eq!(fx.store.reference_count(&a_id), Some(1));
    assert!(fx.driver.exists(&a_cache));

    let removed = fx.store.release(b).expect("release b");
    let ids: Vec<&ChainId> = removed.iter().map(|m| &m.chain_id).collect();
    assert_eq!(ids, vec![&b_id, &a_id]);
    assert_eq!(removed[0].diff_size, 1);
    assert_eq!(removed[0].size, 2);

    assert!(fx.store.get(&a_id).expect_err("a removed").is_not_found());
    assert!(fx.store.get(&b_id).expect_err("b removed").is_not_found());
    assert!(!fx.driver.exists(&a_cache));
    assert!(!fx.driver.exists(&b_cache));
    assert_eq!(fx.metadata_layers(), 0);
}

#[test]
fn handles_from_another_store_are_not_retained() {
    let one = Fixture::new();
    let two = Fixture::new();
    let tar = layer_tar(&[("same", "content")]);

    let mine = one.store.register(tar.as_slice(), None).expect("one");
    let theirs = two.store.register(tar.as_slice(), None).expect("two");
    assert_eq!(mine.chain_id(), theirs.chain_id());

    let chain_id = mine.chain_id().clone();
    let err = one.store.release(theirs).expect_err("foreign handle");
    assert!(matches!(err, StrataError::NotRetained { .. }));
    assert_eq!(one.store.reference_count(&chain_id), Some(1));

    let rw = two
        .store
        .create_rw_layer("c", None, CreateRwLayerOpts::default())
        .expect("rw");
    let err = one.store.release_rw_layer(rw).expect_err("foreign rw handle");
    assert!(matches!(err, StrataError::NotRetained { .. }));
}

#[test]
fn concurrent_gets_lose_no_increments() {
    let fx = Fixture::new();
    let layer = fx
        .store
        .register(layer_tar(&[("f", "x")]).as_slice(), None)
        .expect("register");
    let chain_id = layer.chain_id().clone();

    let handles: Vec<_> = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    (0..50)
                        .map(|_| fx.store.get(&chain_id).expect("get"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().expect("worker"))
            .collect()
    });
    assert_eq!(fx.store.reference_count(&chain_id), Some(401));

    for handle in handles {
        assert!(fx.store.release(handle).expect("release").is_empty());
    }
    assert_eq!(fx.store.reference_count(&chain_id), Some(1));
}

#[test]
fn failed_cascade_leaves_layer_for_retry() {
    let fx = Fixture::new();
    let a = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("a");
    let b = fx
        .store
        .register(layer_tar(&[("b", "2")]).as_slice(), Some(a.chain_id()))
        .expect("b");
    let b_id = b.chain_id().clone();
    let _ = fx.store.release(a).expect("release a");

    fx.driver.fail_remove.store(true, Ordering::SeqCst);
    let err = fx.store.release(b).expect_err("remove fails");
    assert!(matches!(err, StrataError::Backend { .. }));
    assert_eq!(fx.store.reference_count(&b_id), Some(0));

    fx.driver.fail_remove.store(false, Ordering::SeqCst);
    let retry = fx.store.get(&b_id).expect("still registered");
    let removed = fx.store.release(retry).expect("retry release");
    assert_eq!(removed.len(), 2);
    assert!(fx.store.map().expect("map").is_empty());
}

// ── Rollback ─────────────────────────────────────────────────────────

#[test]
fn aborted_stream_leaves_nothing_behind() {
    let fx = Fixture::new();
    let parent = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("parent");
    let tar = layer_tar(&[("big", &"x".repeat(4096))]);

    let reader = AbortingReader {
        data: &tar,
        limit: 1500,
    };
    let err = fx
        .store
        .register(reader, Some(parent.chain_id()))
        .expect_err("aborted");

    assert!(matches!(err, StrataError::Io { .. }));
    assert_eq!(fx.store.reference_count(parent.chain_id()), Some(1));
    assert_eq!(fx.driver_dirs(), 1);
    assert_eq!(fx.metadata_layers(), 1);
}

#[test]
fn failed_apply_removes_staged_layer() {
    let fx = Fixture::new();
    let parent = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("parent");
    let garbage = vec![0x41_u8; 2048];

    let err = fx
        .store
        .register(garbage.as_slice(), Some(parent.chain_id()))
        .expect_err("garbage");

    assert!(matches!(err, StrataError::Backend { operation: "driver apply diff", .. }));
    assert_eq!(fx.driver.creates(), 2);
    assert_eq!(fx.driver.removes(), 1);
    assert_eq!(fx.store.reference_count(parent.chain_id()), Some(1));
    assert_eq!(fx.driver_dirs(), 1);
    assert_eq!(fx.metadata_layers(), 1);
    assert_eq!(
        std::fs::read_dir(fx.root().join("layerdb").join("tmp"))
            .expect("tmp dir")
            .count(),
        0
    );
}

// ── Concurrency ──────────────────────────────────────────────────────

#[test]
fn racing_registrations_converge_on_one_layer() {
    let fx = Fixture::new();
    let parent = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("parent");
    let tar = layer_tar(&[("b", "2")]);
    fx.driver.gate_applies(Arc::new(Barrier::new(2)));

    let (left, right) = std::thread::scope(|s| {
        let register = || {
            fx.store
                .register(tar.as_slice(), Some(parent.chain_id()))
                .expect("register")
        };
        let left = s.spawn(register);
        let right = s.spawn(register);
        (left.join().expect("left"), right.join().expect("right"))
    });

    assert_eq!(left.chain_id(), right.chain_id());
    assert!(Arc::ptr_eq(left.info(), right.info()));
    assert_eq!(fx.driver.applies(), 3);
    assert_eq!(fx.driver.removes(), 1);
    assert_eq!(fx.driver_dirs(), 2);
    assert_eq!(fx.metadata_layers(), 2);
    assert_eq!(fx.store.reference_count(left.chain_id()), Some(2));
    assert_eq!(fx.store.reference_count(parent.chain_id()), Some(2));

    let parent_id = parent.chain_id().clone();
    let _ = fx.store.release(parent).expect("release parent");
    let _ = fx.store.release(left).expect("release left");
    let removed = fx.store.release(right).expect("release right");
    assert_eq!(removed.len(), 2);
    assert_eq!(removed[1].chain_id, parent_id);
    assert_eq!(fx.driver_dirs(), 0);
}

// ── Restore ──────────────────────────────────────────────────────────

#[test]
fn restart_rebuilds_the_same_graph() {
    let fx = Fixture::new();
    let a = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("a");
    let b = fx
        .store
        .register(layer_tar(&[("b", "2")]).as_slice(), Some(a.chain_id()))
        .expect("b");
    let rw = fx
        .store
        .create_rw_layer("web", Some(b.chain_id()), with_hostname())
        .expect("rw");
    let mount_id = rw.info().mount_id().to_string();
    let (a_id, b_id) = (a.chain_id().clone(), b.chain_id().clone());
    let before: Vec<(ChainId, Option<ChainId>, String)> = {
        let mut v: Vec<_> = fx
            .store
            .map()
            .expect("map")
            .into_values()
            .map(|l| {
                (
                    l.chain_id().clone(),
                    l.parent().map(|p| p.chain_id().clone()),
                    l.cache_id().to_string(),
                )
            })
            .collect();
        v.sort();
        v
    };

    let fx = fx.reopen();

    let mut after: Vec<_> = fx
        .store
        .map()
        .expect("map")
        .into_values()
        .map(|l| {
            (
                l.chain_id().clone(),
                l.parent().map(|p| p.chain_id().clone()),
                l.cache_id().to_string(),
            )
        })
        .collect();
    after.sort();
    assert_eq!(before, after);
    assert_eq!(fx.store.reference_count(&a_id), Some(1));
    assert_eq!(fx.store.reference_count(&b_id), Some(1));
    assert_eq!(fx.store.get_mount_id("web").expect("mount id"), mount_id);

    let rw = fx.store.get_rw_layer("web").expect("rw after restart");
    assert_eq!(rw.parent(), Some(&b_id));
    assert_eq!(rw.info().init_id(), Some(format!("{mount_id}-init").as_str()));

    let removed = fx.store.release_rw_layer(rw).expect("release rw");
    assert_eq!(removed.len(), 2);
    assert!(fx.store.map().expect("map").is_empty());
    assert_eq!(fx.driver_dirs(), 0);
}

#[test]
fn restore_skips_layers_with_broken_metadata() {
    let fx = Fixture::new();
    let good = fx
        .store
        .register(layer_tar(&[("good", "1")]).as_slice(), None)
        .expect("good");
    let bad = fx
        .store
        .register(layer_tar(&[("bad", "2")]).as_slice(), None)
        .expect("bad");
    let (good_id, bad_id) = (good.chain_id().clone(), bad.chain_id().clone());
    let bad_cache = bad.info().cache_id().to_string();
    let rw = fx
        .store
        .create_rw_layer("web", Some(&bad_id), with_hostname())
        .expect("rw");
    let mount_id = rw.info().mount_id().to_string();
    let init_id = rw.info().init_id().expect("init id").to_string();
    let bad_dir = fx
        .root()
        .join("layerdb")
        .join("sha256")
        .join(bad_id.digest().hex());
    std::fs::remove_file(bad_dir.join("diff")).expect("corrupt metadata");

    let fx = fx.reopen();

    assert!(fx.store.get(&good_id).is_ok());
    assert!(fx.store.get(&bad_id).expect_err("skipped").is_not_found());
    assert!(fx.store.get_rw_layer("web").expect_err("skipped").is_not_found());

    let mut orphans = fx.store.orphaned_cache_ids();
    orphans.sort();
    let mut expected = vec![bad_cache, mount_id, init_id];
    expected.sort();
    assert_eq!(orphans, expected);
    assert!(orphans.iter().all(|id| fx.driver.exists(id)));
    assert_eq!(fx.driver_dirs(), 4);
}

// ── Tar streams ──────────────────────────────────────────────────────

#[test]
fn tar_stream_reproduces_registered_bytes() {
    let fx = Fixture::new();
    let long_name = format!("deep/{}/file.txt", "d".repeat(120));
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, "etc");
    append_file(&mut builder, "etc/hosts", "127.0.0.1 localhost\n");
    append_dir(&mut builder, "deep");
    append_file(&mut builder, &long_name, "long");
    append_file(&mut builder, "empty", "");
    let tar = builder.into_inner().expect("tar");

    let layer = fx.store.register(tar.as_slice(), None).expect("register");
    let stream = layer.tar_stream().expect("tar stream");

    assert_eq!(read_all(stream), tar);
}

#[test]
fn tar_stream_from_ancestor_contains_only_newer_changes() {
    let fx = Fixture::new();
    let a = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("a");
    let b = fx
        .store
        .register(layer_tar(&[("b", "2")]).as_slice(), Some(a.chain_id()))
        .expect("b");
    let c = fx
        .store
        .register(layer_tar(&[("c", "3")]).as_slice(), Some(b.chain_id()))
        .expect("c");

    let names = entry_names(c.tar_stream_from(a.chain_id()).expect("from a"));
    assert_eq!(names, vec!["b", "c"]);

    let unrelated = ChainId::new(Digest::from_bytes(b"unrelated"));
    let err = c.tar_stream_from(&unrelated).err().expect("not an ancestor");
    assert!(matches!(err, StrataError::NotFound { kind: "ancestor layer", .. }));
    assert!(c.tar_stream_from(c.chain_id()).is_err());
}

// ── Read-write layers ────────────────────────────────────────────────

#[test]
fn init_layer_files_stay_out_of_the_rw_diff() {
    let fx = Fixture::new();
    let base = fx
        .store
        .register(layer_tar(&[("bin", "sh")]).as_slice(), None)
        .expect("base");
    let rw = fx
        .store
        .create_rw_layer("web", Some(base.chain_id()), with_hostname())
        .expect("rw");

    let root = rw.mount("").expect("mount");
    assert!(root.join("etc").join("hostname").is_file());
    assert!(root.join("bin").is_file());
    std::fs::write(root.join("data.txt"), "payload").expect("write");
    rw.unmount().expect("unmount");

    let changes = rw.changes().expect("changes");
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].path, std::path::Path::new("data.txt"));
    assert_eq!(changes[0].kind, ChangeKind::Added);
    assert_eq!(rw.size().expect("size"), 7);
    assert_eq!(entry_names(rw.tar_stream().expect("rw tar")), vec!["data.txt"]);
}

#[test]
fn rw_layer_names_are_unique() {
    let fx = Fixture::new();
    let base = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("base");
    let _rw = fx
        .store
        .create_rw_layer("web", Some(base.chain_id()), CreateRwLayerOpts::default())
        .expect("first");
    let creates = fx.driver.creates();

    let err = fx
        .store
        .create_rw_layer("web", Some(base.chain_id()), CreateRwLayerOpts::default())
        .expect_err("conflict");

    assert!(matches!(err, StrataError::NameConflict { ref name } if name == "web"));
    assert_eq!(fx.driver.creates(), creates);
    assert_eq!(fx.store.reference_count(base.chain_id()), Some(2));
}

#[test]
fn failing_initializer_rolls_back() {
    let fx = Fixture::new();
    let base = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("base");
    let opts = CreateRwLayerOpts {
        init: Some(Box::new(|_| {
            Err(StrataError::Config {
                message: "init refused".into(),
            })
        })),
        ..CreateRwLayerOpts::default()
    };

    let err = fx
        .store
        .create_rw_layer("web", Some(base.chain_id()), opts)
        .expect_err("init fails");

    assert!(matches!(err, StrataError::Config { .. }));
    assert_eq!(fx.store.reference_count(base.chain_id()), Some(1));
    assert_eq!(fx.driver_dirs(), 1);
    assert!(fx.store.get_rw_layer("web").expect_err("absent").is_not_found());
}

#[test]
fn releasing_last_rw_handle_removes_devices() {
    let fx = Fixture::new();
    let base = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("base");
    let rw = fx
        .store
        .create_rw_layer("web", Some(base.chain_id()), with_hostname())
        .expect("rw");
    let mount_id = fx.store.get_mount_id("web").expect("mount id");
    let init_id = format!("{mount_id}-init");
    assert!(fx.driver.exists(&mount_id));
    assert!(fx.driver.exists(&init_id));

    let extra = fx.store.get_rw_layer("web").expect("second handle");
    assert!(fx.store.release_rw_layer(extra).expect("release extra").is_empty());
    assert!(fx.driver.exists(&mount_id));

    let removed = fx
        .store
        .release_handle(LayerHandle::from(rw))
        .expect("release last");
    assert!(removed.is_empty());
    assert!(!fx.driver.exists(&mount_id));
    assert!(!fx.driver.exists(&init_id));
    assert_eq!(fx.store.reference_count(base.chain_id()), Some(1));
    assert!(fx.store.get_mount_id("web").expect_err("gone").is_not_found());

    let fx = fx.reopen();
    assert!(fx.store.get_rw_layer("web").is_err());
}

#[test]
fn failed_rw_release_keeps_mount_for_retry() {
    let fx = Fixture::new();
    let base = fx
        .store
        .register(layer_tar(&[("a", "1")]).as_slice(), None)
        .expect("base");
    let base_id = base.chain_id().clone();
    let rw = fx
        .store
        .create_rw_layer("web", Some(&base_id), with_hostname())
        .expect("rw");
    let mount_id = fx.store.get_mount_id("web").expect("mount id");

    fx.driver.fail_remove.store(true, Ordering::SeqCst);
    let err = fx.store.release_rw_layer(rw).expect_err("remove fails");
    assert!(matches!(err, StrataError::Backend { .. }));
    assert!(fx.driver.exists(&mount_id));
    assert_eq!(fx.store.get_mount_id("web").expect("still recorded"), mount_id);

    // The mount still holds its parent.
    assert_eq!(fx.store.reference_count(&base_id), Some(2));
    assert!(fx.store.release(base).expect("release base").is_empty());
    assert_eq!(fx.store.reference_count(&base_id), Some(1));

    fx.driver.fail_remove.store(false, Ordering::SeqCst);
    let retry = fx.store.get_rw_layer("web").expect("still registered");
    let removed = fx.store.release_rw_layer(retry).expect("retry release");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].chain_id, base_id);
    assert!(!fx.driver.exists(&mount_id));
    assert!(fx.store.map().expect("map").is_empty());
    assert_eq!(fx.driver_dirs(), 0);
}

#[test]
fn rw_layer_without_parent_starts_empty() {
    let fx = Fixture::new();
    let rw = fx
        .store
        .create_rw_layer("scratch", None, CreateRwLayerOpts::default())
        .expect("rw");

    assert!(rw.parent().is_none());
    assert!(rw.changes().expect("changes").is_empty());
    assert!(rw.metadata().expect("metadata").contains_key("Path"));
    assert!(fx.store.release_rw_layer(rw).expect("release").is_empty());
    assert_eq!(fx.driver_dirs(), 0);
}

// ── Store setup ──────────────────────────────────────────────────────

#[test]
fn from_options_opens_the_builtin_driver() {
    common::init_tracing();
    let dir = tempfile::tempdir().expect("tempdir");
    let options = StoreOptions::with_root(dir.path());

    let store = LayerStore::from_options(&options).expect("store");
    assert_eq!(store.driver_name(), "vfs");
    assert!(!store.driver_status().is_empty());

    let layer = store
        .register(layer_tar(&[("f", "x")]).as_slice(), None)
        .expect("register");
    assert!(layer.metadata().expect("metadata").contains_key("Path"));
    store.cleanup().expect("cleanup");
    strata_layer::release_and_log(&store, layer);
    assert!(store.map().expect("map").is_empty());
}
