use serde_json::Value;
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const CLASS_MAGIC: [u8; 4] = [0xCA, 0xFE, 0xBA, 0xBE];

fn temp_dir(name: &str) -> std::path::PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!(
        "class_share_cli_{}_{}_{}",
        std::process::id(),
        nanos,
        name
    ))
}

fn write_jar(path: &std::path::Path, classes: &[&str]) -> anyhow::Result<()> {
    use std::io::Write;
    use zip::write::FileOptions;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    let mut zip = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for class_name in classes {
        zip.start_file(format!("{}.class", class_name.replace('.', "/")), options)?;
        zip.write_all(&CLASS_MAGIC)?;
        zip.write_all(class_name.as_bytes())?;
    }
    zip.finish()?;
    Ok(())
}

fn run_json(bin: &str, args: &[&str], envs: &[(&str, &str)]) -> anyhow::Result<Value> {
    let mut cmd = Command::new(bin);
    cmd.args(args);
    cmd.env_remove("CLASS_SHARE_ENABLED");
    for (k, v) in envs {
        cmd.env(k, v);
    }
    let out = cmd.output()?;
    if !out.status.success() {
        return Err(anyhow::anyhow!(
            "command failed: status={:?}, stderr={}",
            out.status.code(),
            String::from_utf8_lossy(&out.stderr)
        ));
    }
    Ok(serde_json::from_slice(&out.stdout)?)
}

#[test]
fn load_shares_classes_across_processes() -> anyhow::Result<()> {
    let base = temp_dir("load");
    let jar = base.join("lib/app.jar");
    let db = base.join("classes.lmdb");
    write_jar(&jar, &["com.example.App", "com.example.Util"])?;

    let bin = env!("CARGO_BIN_EXE_class-share");
    let db_arg = db.to_string_lossy().to_string();
    let cp = base.join("lib/*").to_string_lossy().to_string();

    let first = run_json(
        bin,
        &["--db", &db_arg, "load", "--shared", "--cp", &cp, "com.example.App"],
        &[],
    )?;
    assert_eq!(first["sharing"], true);
    assert_eq!(first["classes"][0]["origin"]["kind"], "class_path");
    assert_eq!(first["classes"][0]["loader"], "app");
    assert_eq!(first["bridge"]["stores"], 1);

    // A new process has bytes in the store but no metadata for them yet.
    let second = run_json(
        bin,
        &["--db", &db_arg, "load", "--cp", &cp, "com.example.App", "com/example/Util.class"],
        &[("CLASS_SHARE_ENABLED", "1")],
    )?;
    assert_eq!(second["sharing"], true);
    assert_eq!(second["bridge"]["orphans"], 1);
    assert_eq!(second["classes"][1]["class_name"], "com.example.Util");
    assert!(second["classes"][1]["error"].is_null());

    let stats = run_json(bin, &["--db", &db_arg, "stats"], &[])?;
    assert_eq!(stats["classes"], 2);

    let off = run_json(
        bin,
        &["--db", &db_arg, "load", "--cp", &cp, "com.example.App", "com.example.Nope"],
        &[],
    )?;
    assert_eq!(off["sharing"], false);
    assert_eq!(off["bridge"]["hits"], 0);
    assert!(off["classes"][1]["error"].as_str().unwrap().contains("com.example.Nope"));

    let status = Command::new(bin).args(["--db", &db_arg, "clear"]).status()?;
    assert!(status.success());
    assert!(!db.exists());

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}

#[test]
fn resolve_reports_consistent_results() -> anyhow::Result<()> {
    let base = temp_dir("resolve");
    let jar = base.join("app.jar");
    let db = base.join("classes.lmdb");
    write_jar(&jar, &["com.example.App"])?;

    let bin = env!("CARGO_BIN_EXE_class-share");
    let db_arg = db.to_string_lossy().to_string();
    let jar_arg = jar.to_string_lossy().to_string();
    let out = run_json(
        bin,
        &[
            "--db",
            &db_arg,
            "resolve",
            "--threads",
            "6",
            "--cp",
            &jar_arg,
            "com.example.App",
            "com.example.Missing",
        ],
        &[],
    )?;
    assert_eq!(out["threads"], 6);
    assert_eq!(out["consistent"], true);
    assert_eq!(out["cache_size"], 1);
    assert_eq!(out["classes"][0]["origin"]["kind"], "class_path");
    assert!(out["classes"][1]["error"].is_string());

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}

#[test]
fn runtime_image_module_is_shared_under_jimage_location() -> anyhow::Result<()> {
    let base = temp_dir("module");
    let module_dir = base.join("java.demo");
    let class_file = module_dir.join("demo/lang/Thing.class");
    std::fs::create_dir_all(class_file.parent().unwrap())?;
    let mut bytes = CLASS_MAGIC.to_vec();
    bytes.extend_from_slice(b"demo.lang.Thing");
    std::fs::write(&class_file, bytes)?;
    let jimage = base.join("lib/modules");
    std::fs::create_dir_all(jimage.parent().unwrap())?;
    std::fs::write(&jimage, b"image")?;
    let db = base.join("classes.lmdb");
    let cp_dir = base.join("classes");
    std::fs::create_dir_all(&cp_dir)?;

    let bin = env!("CARGO_BIN_EXE_class-share");
    let db_arg = db.to_string_lossy().to_string();
    let cp_arg = cp_dir.to_string_lossy().to_string();
    let module_arg = format!("java.demo={}", module_dir.to_string_lossy());
    let jimage_arg = jimage.to_string_lossy().to_string();
    let args = [
        "--db",
        db_arg.as_str(),
        "load",
        "--shared",
        "--cp",
        cp_arg.as_str(),
        "--module",
        module_arg.as_str(),
        "demo.lang.Thing",
    ];

    let first = run_json(bin, &args, &[("CLASS_SHARE_JIMAGE", jimage_arg.as_str())])?;
    let class = &first["classes"][0];
    assert_eq!(class["loader"], "bootstrap");
    assert_eq!(class["origin"]["kind"], "module");
    assert_eq!(class["origin"]["patched"], false);
    assert_eq!(class["code_source"], "jrt:/java.demo");

    let second = run_json(bin, &args, &[("CLASS_SHARE_JIMAGE", jimage_arg.as_str())])?;
    assert_eq!(second["classes"][0]["origin"]["kind"], "shared_module");
    assert_eq!(second["classes"][0]["code_source"], "jrt:/java.demo");
    assert_eq!(second["bridge"]["hits"], 1);

    let _ = std::fs::remove_dir_all(base);
    Ok(())
}
