use anyhow::{Context, Result};
use clap::Parser;
use class_share::bridge::BridgeStatsSnapshot;
use class_share::class::{ClassOrigin, ClassRef};
use class_share::cli::{Cli, Commands};
use class_share::config::{SharedClassSettings, clear_db, jimage_path, resolve_db_path};
use class_share::deser::ClassCache;
use class_share::error::LoadError;
use class_share::loader::{ClassLoader, LoaderHierarchy};
use class_share::module::{ModuleLocation, discover_packages};
use class_share::provider::{ClassStore, LmdbStore, ProviderFactory, StoreProviderFactory};
use class_share::resource::parse_path_list;
use rayon::prelude::*;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command.clone() {
        Commands::Clear => {
            let db_path = resolve_db_path(&cli)?;
            clear_db(&db_path)?;
        }
        Commands::Stats => {
            let db_path = resolve_db_path(&cli)?;
            let store = LmdbStore::open(db_path)?;
            let output = StoreStats {
                db_path: store.db_path().to_string_lossy().to_string(),
                classes: store.len().context("Failed to count stored classes")?,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Load {
            cp,
            shared,
            modules,
            classes,
        } => {
            let factory = open_factory(&cli)?;
            let settings = if shared {
                SharedClassSettings::with_factory(factory)
            } else {
                SharedClassSettings::from_env(Some(factory))
            };
            let modules = modules
                .iter()
                .map(|spec| parse_module(spec))
                .collect::<Result<Vec<_>>>()?;
            let output = load_classes(&cp, modules, &classes, &settings);
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Resolve {
            cp,
            threads,
            classes,
        } => {
            let settings = SharedClassSettings::from_env(Some(open_factory(&cli)?));
            let output = resolve_classes(&cp, &classes, threads, &settings)?;
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn open_factory(cli: &Cli) -> Result<Arc<dyn ProviderFactory>> {
    let db_path = resolve_db_path(cli)?;
    let store: Arc<dyn ClassStore> = Arc::new(
        LmdbStore::open(db_path.clone())
            .with_context(|| format!("Failed to open class store: {}", db_path.display()))?,
    );
    Ok(Arc::new(StoreProviderFactory::new(store)))
}

/// `NAME=DIR` into a runtime-image module owning every package under `DIR`.
fn parse_module(spec: &str) -> Result<ModuleLocation> {
    let (name, dir) = spec
        .split_once('=')
        .with_context(|| format!("Module must be NAME=DIR: {spec}"))?;
    let dir = PathBuf::from(dir);
    if !dir.is_dir() {
        anyhow::bail!("Module directory not found: {}", dir.display());
    }
    let packages = discover_packages(&dir);
    Ok(ModuleLocation::runtime_image(
        name,
        dir,
        packages,
        jimage_path().as_deref(),
    ))
}

fn normalize_class_name(raw: &str) -> String {
    let s = raw.trim();
    let s = s.strip_suffix(".class").unwrap_or(s);
    s.replace('/', ".")
}

#[derive(Debug, Serialize)]
struct StoreStats {
    db_path: String,
    classes: u64,
}

#[derive(Debug, Serialize)]
struct ClassReport {
    class_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    loader: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin: Option<ClassOrigin>,
    #[serde(skip_serializing_if = "Option::is_none")]
    code_source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ClassReport {
    fn new(class_name: String, result: &Result<ClassRef, LoadError>) -> Self {
        match result {
            Ok(class) => Self {
                class_name,
                loader: class.loader().map(|l| l.name().to_string()),
                origin: Some(class.origin().clone()),
                code_source: class.code_source().location.clone(),
                error: None,
            },
            Err(err) => Self {
                class_name,
                loader: None,
                origin: None,
                code_source: None,
                error: Some(err.to_string()),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct LoadReport {
    sharing: bool,
    duration_ms: u64,
    classes: Vec<ClassReport>,
    bridge: BridgeStatsSnapshot,
}

#[derive(Debug, Serialize)]
struct ResolveReport {
    threads: usize,
    consistent: bool,
    cache_size: usize,
    duration_ms: u64,
    classes: Vec<ClassReport>,
}

fn build_hierarchy(
    cp: &str,
    modules: Vec<ModuleLocation>,
    settings: &SharedClassSettings,
) -> LoaderHierarchy {
    let mut builder = LoaderHierarchy::builder().app_class_path(parse_path_list(cp));
    for module in modules {
        builder = builder.boot_module(module);
    }
    builder.build(settings)
}

fn bridge_stats(loader: &Arc<ClassLoader>) -> BridgeStatsSnapshot {
    let mut total = BridgeStatsSnapshot::default();
    for l in loader.ancestors() {
        total += l.bridge().stats();
    }
    total
}

fn load_classes(
    cp: &str,
    modules: Vec<ModuleLocation>,
    classes: &[String],
    settings: &SharedClassSettings,
) -> LoadReport {
    let start = Instant::now();
    let hierarchy = build_hierarchy(cp, modules, settings);
    let app = hierarchy.system_loader();

    let reports: Vec<ClassReport> = classes
        .par_iter()
        .map(|raw| {
            let name = normalize_class_name(raw);
            let result = app.load_class(&name);
            ClassReport::new(name, &result)
        })
        .collect();

    let report = LoadReport {
        sharing: app.bridge().is_active(),
        duration_ms: start.elapsed().as_millis() as u64,
        classes: reports,
        bridge: bridge_stats(app),
    };
    info!(
        classes = report.classes.len(),
        hits = report.bridge.hits,
        stores = report.bridge.stores,
        "load finished"
    );
    report
}

fn resolve_classes(
    cp: &str,
    classes: &[String],
    threads: usize,
    settings: &SharedClassSettings,
) -> Result<ResolveReport> {
    let start = Instant::now();
    let hierarchy = build_hierarchy(cp, Vec::new(), settings);
    let app = hierarchy.system_loader();
    let cache = ClassCache::new(app).context("Failed to start class cache")?;
    let names: Vec<String> = classes.iter().map(|c| normalize_class_name(c)).collect();
    let threads = threads.max(1);

    let per_thread: Vec<Vec<Result<ClassRef, LoadError>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                scope.spawn(|| {
                    names
                        .iter()
                        .map(|name| cache.resolve(name, Some(app)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .map_err(|_| anyhow::anyhow!("resolver thread panicked"))
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let consistent = (0..names.len()).all(|i| {
        let first = per_thread[0][i].as_ref().ok();
        per_thread.iter().all(|results| {
            match (first, results[i].as_ref().ok()) {
                (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                (None, None) => true,
                _ => false,
            }
        })
    });

    let reports = names
        .into_iter()
        .zip(&per_thread[0])
        .map(|(name, result)| ClassReport::new(name, result))
        .collect();

    Ok(ResolveReport {
        threads,
        consistent,
        cache_size: cache.len(),
        duration_ms: start.elapsed().as_millis() as u64,
        classes: reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_class_name_accepts_paths_and_suffix() {
        assert_eq!(normalize_class_name(" com/example/Foo.class "), "com.example.Foo");
        assert_eq!(normalize_class_name("com.example.Foo"), "com.example.Foo");
    }

    #[test]
    fn module_spec_requires_name_and_existing_dir() {
        assert!(parse_module("java.base").is_err());
        assert!(parse_module("java.base=/nonexistent/class-share/dir").is_err());
    }

    #[test]
    fn missing_class_is_reported_not_fatal() {
        let report = load_classes(
            "",
            Vec::new(),
            &["com.example.Missing".to_string()],
            &SharedClassSettings::disabled(),
        );
        assert!(!report.sharing);
        assert_eq!(report.classes.len(), 1);
        assert!(report.classes[0].error.is_some());
        assert!(report.classes[0].origin.is_none());
    }

    #[test]
    fn resolve_report_is_consistent_for_missing_classes() -> Result<()> {
        let report = resolve_classes(
            "",
            &["com.example.Missing".to_string()],
            3,
            &SharedClassSettings::disabled(),
        )?;
        assert!(report.consistent);
        assert_eq!(report.cache_size, 0);
        assert_eq!(report.threads, 3);
        Ok(())
    }
}
