mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use codecache::{CacheState, CodeCache, ConfigFingerprint, EntryKind};

use common::{Process, container, load_and_store_config, load_config, store_config, temp_cache_dir};

const READERS: usize = 8;

fn populate(path: &std::path::Path, methods: usize) -> Result<Vec<u32>> {
    let process = Process::new(0x1000_0000);
    let cache = CodeCache::open(
        store_config(path),
        ConfigFingerprint::default(),
        process.runtime(),
    );
    cache.store_artifact(&process.memset_stub())?;
    let mut ids = Vec::with_capacity(methods);
    for i in 0..methods {
        let method = process.method(&format!("app.Worker.task{i}()V"), 4, 0);
        ids.push(method.id);
        cache.store_artifact(&method)?;
    }
    cache.close()?;
    Ok(ids)
}

#[test]
fn readers_drain_before_close_unmaps() -> Result<()> {
    let dir = temp_cache_dir();
    let path = container(dir.path(), "app");
    let ids = populate(&path, 16)?;

    let process = Process::new(0x2000_0000);
    let cache = CodeCache::open(
        load_config(&path),
        ConfigFingerprint::default(),
        process.runtime(),
    );
    let loads = AtomicUsize::new(0);

    thread::scope(|scope| {
        for reader in 0..READERS {
            let cache = &cache;
            let ids = &ids;
            let loads = &loads;
            scope.spawn(move || {
                let mut round = reader;
                loop {
                    let id = ids[round % ids.len()];
                    let Some(entry) = cache.find(EntryKind::Code, id, 4, 0) else {
                        break;
                    };
                    // The gate may close between find and load; that is a
                    // clean miss, never a read of unmapped memory.
                    if let Ok(method) = cache.load_artifact(entry) {
                        assert_eq!(method.id, id);
                        loads.fetch_add(1, Ordering::Relaxed);
                    }
                    round += 1;
                }
            });
        }

        thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.close().expect("close"), None);
    });

    assert_eq!(cache.state(), CacheState::Closed);
    assert!(loads.load(Ordering::Relaxed) > 0);
    assert_eq!(cache.find(EntryKind::Stub, 7, 0, 0), None);
    Ok(())
}

#[test]
fn concurrent_stores_all_land_in_the_container() -> Result<()> {
    let dir = temp_cache_dir();
    let path = container(dir.path(), "app");
    let next = container(dir.path(), "next");
    populate(&path, 1)?;

    let process = Process::new(0x2000_0000);
    let cache = CodeCache::open(
        load_and_store_config(&path, &next),
        ConfigFingerprint::default(),
        process.runtime(),
    );

    thread::scope(|scope| {
        for worker in 0..READERS {
            let cache = &cache;
            let process = &process;
            scope.spawn(move || {
                for i in 0..4 {
                    let method = process.method(&format!("app.Compiled.m{worker}_{i}()V"), 4, 0);
                    cache.store_artifact(&method).expect("store");
                    assert!(cache.find(EntryKind::Stub, 7, 0, 0).is_some());
                }
            });
        }
    });

    assert_eq!(cache.stats().stored_code, (READERS * 4) as u64);
    assert_eq!(cache.close()?, Some(next.clone()));

    let reloaded = CodeCache::open(
        load_config(&next),
        ConfigFingerprint::default(),
        Process::new(0x3000_0000).runtime(),
    );
    let header = reloaded.loaded_header().expect("container should load");
    assert_eq!(header.counts.code as usize, READERS * 4 + 1);
    assert_eq!(header.counts.stubs, 1);
    Ok(())
}
