use class_share::class::CLASS_MAGIC;
use class_share::config::SharedClassSettings;
use class_share::deser::ClassCache;
use class_share::error::LoadError;
use class_share::loader::LoaderHierarchy;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn temp_dir(name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "class_share_cache_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_class(root: &Path, class_name: &str) -> anyhow::Result<()> {
    let path = root.join(format!("{}.class", class_name.replace('.', "/")));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut bytes = CLASS_MAGIC.to_vec();
    bytes.extend_from_slice(class_name.as_bytes());
    std::fs::write(path, bytes)?;
    Ok(())
}

fn hierarchy(app_dir: &Path) -> LoaderHierarchy {
    LoaderHierarchy::builder()
        .app_class_path([app_dir.to_path_buf()])
        .build(&SharedClassSettings::disabled())
}

/// A cache resolving through `load_class` that counts resolutions.
fn counting_cache(h: &LoaderHierarchy, delay: Duration) -> (ClassCache, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let cache = ClassCache::with_resolver(h.system_loader(), move |name, loader| {
        counter.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(delay);
        loader.load_class(name)
    })
    .unwrap();
    (cache, calls)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn system_resolution_is_kept() -> anyhow::Result<()> {
    let dir = temp_dir("system");
    write_class(&dir, "com.example.Point")?;
    let h = hierarchy(&dir);
    let (cache, calls) = counting_cache(&h, Duration::ZERO);

    let first = cache.resolve("com.example.Point", Some(&h.app))?;
    let second = cache.resolve("com.example.Point", Some(&h.app))?;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.loader_id(), h.app.id());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.chained_keys(h.app.id()), 0);

    let _ = std::fs::remove_dir_all(dir);
    Ok(())
}

#[test]
fn concurrent_requests_resolve_once() -> anyhow::Result<()> {
    let dir = temp_dir("concurrent");
    write_class(&dir, "com.example.Point")?;
    let h = hierarchy(&dir);
    let (cache, calls) = counting_cache(&h, Duration::from_millis(50));
    let cache = Arc::new(cache);

    let threads = 8;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let app = Arc::clone(&h.app);
            std::thread::spawn(move || {
                barrier.wait();
                cache.resolve("com.example.Point", Some(&app))
            })
        })
        .collect();

    let mut classes = Vec::new();
    for handle in handles {
        classes.push(handle.join().unwrap()?);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(classes.iter().all(|c| Arc::ptr_eq(c, &classes[0])));

    let _ = std::fs::remove_dir_all(dir);
    Ok(())
}

#[test]
fn concurrent_failures_are_shared_then_forgotten() -> anyhow::Result<()> {
    let dir = temp_dir("concurrent_fail");
    let h = hierarchy(&dir);
    let (cache, calls) = counting_cache(&h, Duration::from_millis(50));
    let cache = Arc::new(cache);

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            let app = Arc::clone(&h.app);
            std::thread::spawn(move || {
                barrier.wait();
                cache.resolve("com.example.Missing", Some(&app))
            })
        })
        .collect();
    for handle in handles {
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, LoadError::ClassNotFound(ref n) if n == "com.example.Missing"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(cache.is_empty());

    write_class(&dir, "com.example.Missing")?;
    let class = cache.resolve("com.example.Missing", Some(&h.app))?;
    assert_eq!(class.name(), "com.example.Missing");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let _ = std::fs::remove_dir_all(dir);
    Ok(())
}

#[test]
fn user_defined_classes_are_resolved_every_time() -> anyhow::Result<()> {
    let app_dir = temp_dir("app");
    let user_dir = temp_dir("user");
    write_class(&user_dir, "plugin.Widget")?;
    let h = hierarchy(&app_dir);
    let user = h.user_loader("plugin", [user_dir.clone()], &SharedClassSettings::disabled());
    let (cache, calls) = counting_cache(&h, Duration::ZERO);

    let first = cache.resolve("plugin.Widget", Some(&user))?;
    let second = cache.resolve("plugin.Widget", Some(&user))?;
    assert_eq!(first.loader_id(), user.id());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(cache.is_empty());
    assert!(cache.is_canonical(user.id()));
    assert!(!cache.is_system(user.id()));

    let _ = std::fs::remove_dir_all(app_dir);
    let _ = std::fs::remove_dir_all(user_dir);
    Ok(())
}

#[test]
fn entries_initiated_by_dropped_loader_are_reaped() -> anyhow::Result<()> {
    let app_dir = temp_dir("reap_app");
    write_class(&app_dir, "com.example.Point")?;
    write_class(&app_dir, "com.example.Line")?;
    let h = hierarchy(&app_dir);
    let cache = ClassCache::new(h.system_loader())?;

    let user = h.user_loader("transient", Vec::new(), &SharedClassSettings::disabled());
    let user_id = user.id();
    let point = cache.resolve("com.example.Point", Some(&user))?;
    cache.resolve("com.example.Line", Some(&user))?;
    cache.resolve("com.example.Point", Some(&h.app))?;
    assert_eq!(point.loader_id(), h.app.id());
    assert_eq!(cache.len(), 3);
    assert_eq!(cache.chained_keys(user_id), 2);
    assert!(cache.is_canonical(user_id));

    drop(user);
    assert!(wait_until(Duration::from_secs(5), || {
        cache.len() == 1 && !cache.is_canonical(user_id)
    }));
    assert_eq!(cache.chained_keys(user_id), 0);
    assert!(cache.is_canonical(h.app.id()));

    let _ = std::fs::remove_dir_all(app_dir);
    Ok(())
}

#[test]
fn absent_loader_means_bootstrap() -> anyhow::Result<()> {
    let app_dir = temp_dir("bootstrap");
    let boot_dir = temp_dir("bootstrap_cp");
    write_class(&boot_dir, "java.lang.Thing")?;
    let h = LoaderHierarchy::builder()
        .boot_class_path([boot_dir.clone()])
        .app_class_path([app_dir.clone()])
        .build(&SharedClassSettings::disabled());
    let cache = ClassCache::new(h.system_loader())?;

    let thing = cache.resolve("java.lang.Thing", None)?;
    assert_eq!(thing.loader_id(), h.boot.id());
    assert!(cache.is_system(h.boot.id()));
    assert_eq!(cache.len(), 1);

    let from_app = cache.resolve("java.lang.Thing", Some(&h.app))?;
    assert!(Arc::ptr_eq(&thing, &from_app));
    assert_eq!(cache.len(), 2);

    let _ = std::fs::remove_dir_all(app_dir);
    let _ = std::fs::remove_dir_all(boot_dir);
    Ok(())
}

#[test]
fn dropped_caches_leave_no_listeners_behind() -> anyhow::Result<()> {
    let app_dir = temp_dir("listeners");
    write_class(&app_dir, "com.example.Point")?;
    let h = hierarchy(&app_dir);
    let user = h.user_loader("long-lived", Vec::new(), &SharedClassSettings::disabled());

    for _ in 0..3 {
        let cache = ClassCache::new(h.system_loader())?;
        cache.resolve("com.example.Point", Some(&user))?;
        cache.resolve("com.example.Point", Some(&user))?;
        assert_eq!(user.unload_listener_count(), 1);
        drop(cache);
        assert_eq!(user.unload_listener_count(), 0);
    }
    assert_eq!(h.app.unload_listener_count(), 0);

    let _ = std::fs::remove_dir_all(app_dir);
    Ok(())
}
