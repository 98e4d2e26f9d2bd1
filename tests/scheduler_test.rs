//! Timer loop behavior, on tokio's paused clock

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::tempdir;
use tokio::sync::watch;

use volume_backup::{Config, Coordinator, MemoryStore, Scheduler};

fn config_from_env_style(backup_dir: &Path, output_dir: &Path, extra: &[(&str, &str)]) -> Config {
    let mut vars = vec![
        ("BACKUP_DIR".to_string(), backup_dir.display().to_string()),
        ("OUTPUT_DIR".to_string(), output_dir.display().to_string()),
        ("S3_BUCKET".to_string(), "backups".to_string()),
        ("S3_PREFIX".to_string(), "volumes".to_string()),
        ("LOCAL_RETENTION".to_string(), "keep".to_string()),
    ];
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    Config::from_vars(vars).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_cycles_repeat_every_interval_until_shutdown() {
    let backup = tempdir().unwrap();
    let output = tempdir().unwrap();
    for name in ["app", "app1"] {
        fs::create_dir(backup.path().join(name)).unwrap();
        fs::write(backup.path().join(name).join("file.txt"), name).unwrap();
    }
    let config = config_from_env_style(backup.path(), output.path(), &[("SECOND_INTERVAL", "60")]);
    assert_eq!(config.interval, Duration::from_secs(60));

    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(Arc::new(config), store.clone());
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Scheduler::new(coordinator, rx).run());

    // Two targets per cycle; wait for at least two cycles' worth.
    for _ in 0..1000 {
        if store.keys().len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    tx.send(true).unwrap();
    let cycles = handle.await.unwrap();

    assert!(cycles >= 2, "ran {cycles} cycles");
    let keys = store.keys();
    assert!(keys.iter().any(|k| k.starts_with("volumes/app/")));
    assert!(keys.iter().any(|k| k.starts_with("volumes/app1/")));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_interrupts_sleep() {
    let backup = tempdir().unwrap();
    let output = tempdir().unwrap();
    fs::create_dir(backup.path().join("app")).unwrap();
    let config = config_from_env_style(backup.path(), output.path(), &[("RUN_ON_START", "false")]);

    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(Arc::new(config), store.clone());
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(Scheduler::new(coordinator, rx).run());

    tokio::time::sleep(Duration::from_secs(5)).await;
    tx.send(true).unwrap();
    let cycles = handle.await.unwrap();

    // Default interval is an hour; nothing ran before shutdown.
    assert_eq!(cycles, 0);
    assert_eq!(store.attempts(), 0);
}

#[tokio::test]
async fn test_shutdown_before_start_runs_nothing() {
    let backup = tempdir().unwrap();
    let output = tempdir().unwrap();
    fs::create_dir(backup.path().join("app")).unwrap();
    let config = config_from_env_style(backup.path(), output.path(), &[]);
    assert!(config.run_on_start);

    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(Arc::new(config), store.clone());
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();

    let cycles = Scheduler::new(coordinator, rx).run().await;

    assert_eq!(cycles, 0);
    assert_eq!(store.attempts(), 0);
}
