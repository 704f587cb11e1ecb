//! Persistence across framework instances sharing one cache directory.

use carrack_core::{BundleState, Framework, FrameworkConfig, PersistentState};
use std::path::Path;

fn tree(manifest: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bundle.toml"), manifest).unwrap();
    dir
}

fn location(dir: &tempfile::TempDir) -> String {
    format!("reference:file:{}", dir.path().display())
}

fn manifest(name: &str, version: &str, extra: &str) -> String {
    format!(
        "manifest_version = 2\n\n[bundle]\nsymbolic_name = \"{name}\"\nversion = \"{version}\"\n{extra}"
    )
}

fn framework_on(store: &Path) -> Framework {
    let mut config = FrameworkConfig::new();
    config.set("cache.profiledir", store.display().to_string());
    config.set("log.level", "2");
    let _ = tracing_subscriber::fmt()
        .with_max_level(config.log_level_filter())
        .with_test_writer()
        .try_init();
    Framework::new(config)
}

#[test]
fn bundles_and_state_survive_restart() {
    let store = tempfile::tempdir().unwrap();
    let running = tree(&manifest("survivor.running", "1.0.0", ""));
    let idle = tree(&manifest("survivor.idle", "1.0.0", ""));

    let (running_id, idle_id) = {
        let framework = framework_on(store.path());
        framework.start().unwrap();
        let a = framework.install(&location(&running)).unwrap();
        let b = framework.install(&location(&idle)).unwrap();
        framework.start_bundle(&a).unwrap();
        assert_eq!(a.state(), BundleState::Active);

        framework.stop().unwrap();
        framework.wait_for_stop(10_000).unwrap();
        (a.id(), b.id())
    };

    let framework = framework_on(store.path());
    framework.start().unwrap();

    let a = framework.get_bundle(running_id).expect("running bundle reloaded");
    let b = framework.get_bundle(idle_id).expect("idle bundle reloaded");

    // Identity and location are stable across restarts.
    assert_eq!(a.location(), location(&running));
    assert_eq!(a.symbolic_name().as_str(), "survivor.running");

    // The persistent intent restarts the previously running bundle only.
    assert_eq!(a.persistent_state(), PersistentState::Active);
    assert_eq!(a.state(), BundleState::Active);
    assert_eq!(b.persistent_state(), PersistentState::Installed);
    assert_ne!(b.state(), BundleState::Active);
}

#[test]
fn bundle_ids_are_never_reused() {
    let store = tempfile::tempdir().unwrap();
    let first = tree(&manifest("ids.first", "1.0.0", ""));
    let second = tree(&manifest("ids.second", "1.0.0", ""));
    let third = tree(&manifest("ids.third", "1.0.0", ""));

    let (first_id, second_id) = {
        let framework = framework_on(store.path());
        framework.start().unwrap();
        let a = framework.install(&location(&first)).unwrap();
        let b = framework.install(&location(&second)).unwrap();
        framework.stop().unwrap();
        framework.wait_for_stop(10_000).unwrap();
        (a.id(), b.id())
    };
    assert!(second_id > first_id);

    let framework = framework_on(store.path());
    framework.start().unwrap();
    let c = framework.install(&location(&third)).unwrap();
    assert!(
        c.id() > second_id,
        "id {} must be above the persisted ceiling {second_id}",
        c.id()
    );
}

#[test]
fn unrefreshed_update_is_purged_on_reload() {
    let store = tempfile::tempdir().unwrap();

    let exporter_v2 = tree(&manifest(
        "purge.exporter",
        "2.0.0",
        "\n[exports]\npackages = [\"purge.api\"]\n",
    ));
    let exporter_v1 = tree(&manifest(
        "purge.exporter",
        "1.0.0",
        &format!(
            "update_location = \"{}\"\n\n[exports]\npackages = [\"purge.api\"]\n",
            location(&exporter_v2)
        ),
    ));
    let importer = tree(&manifest(
        "purge.importer",
        "1.0.0",
        "\n[imports]\npackages = [\"purge.api\"]\n",
    ));

    let exporter_id = {
        let framework = framework_on(store.path());
        framework.start().unwrap();
        let exp = framework.install(&location(&exporter_v1)).unwrap();
        let imp = framework.install(&location(&importer)).unwrap();
        framework.start_bundle(&exp).unwrap();
        framework.start_bundle(&imp).unwrap();

        // The importer pins the old revision: two revisions on disk.
        framework.update_bundle(&exp).unwrap();
        let root = store.path().join(format!("bundle{}", exp.id()));
        assert!(root.join("version0.0").exists());
        assert!(root.join("version0.1").exists());

        // Simulated crash: the framework is dropped without a clean stop,
        // so no shutdown sweep runs.
        exp.id()
    };

    let framework = framework_on(store.path());
    framework.init().unwrap();

    let root = store.path().join(format!("bundle{exporter_id}"));
    assert!(!root.join("version0.0").exists());
    assert!(!root.join("version0.1").exists());
    assert!(
        root.join("version1.0").exists(),
        "reload keeps only the newest revision under a bumped refresh level"
    );
    let reloaded = framework.get_bundle(exporter_id).unwrap();
    assert_eq!(reloaded.version().to_string(), "2.0.0");
}

#[test]
fn persistently_uninstalled_archives_are_removed_at_init() {
    let store = tempfile::tempdir().unwrap();

    let exporter_tree = tree(&manifest(
        "goner.exporter",
        "1.0.0",
        "\n[exports]\npackages = [\"goner.api\"]\n",
    ));
    let importer_tree = tree(&manifest(
        "goner.importer",
        "1.0.0",
        "\n[imports]\npackages = [\"goner.api\"]\n",
    ));

    let exporter_id = {
        let framework = framework_on(store.path());
        framework.start().unwrap();
        let exp = framework.install(&location(&exporter_tree)).unwrap();
        let imp = framework.install(&location(&importer_tree)).unwrap();
        framework.start_bundle(&exp).unwrap();
        framework.start_bundle(&imp).unwrap();

        // The wired importer keeps the uninstalled exporter's archive
        // pending until a refresh that never comes in this session.
        framework.uninstall_bundle(&exp).unwrap();
        assert_eq!(exp.state(), BundleState::Uninstalled);
        assert!(store.path().join(format!("bundle{}", exp.id())).exists());
        exp.id()
        // Simulated crash: drop without stop.
    };

    let framework = framework_on(store.path());
    framework.init().unwrap();
    assert!(
        !store.path().join(format!("bundle{exporter_id}")).exists(),
        "init removes archives whose persistent state is uninstalled"
    );
    assert!(framework.get_bundle(exporter_id).is_none());
}

#[test]
fn storage_clean_on_first_init_flushes_the_cache() {
    let store = tempfile::tempdir().unwrap();
    let content = tree(&manifest("flushed", "1.0.0", ""));

    {
        let framework = framework_on(store.path());
        framework.start().unwrap();
        framework.install(&location(&content)).unwrap();
        framework.stop().unwrap();
        framework.wait_for_stop(10_000).unwrap();
    }

    let mut config = FrameworkConfig::new();
    config.set("cache.profiledir", store.path().display().to_string());
    config.set("framework.storage.clean", "onFirstInit");
    let framework = Framework::new(config);
    framework.start().unwrap();
    assert_eq!(
        framework.get_bundles().len(),
        1,
        "only the system bundle remains after a flush"
    );
}

#[test]
fn start_levels_persist_across_restart() {
    let store = tempfile::tempdir().unwrap();
    let content = tree(&manifest("leveled.survivor", "1.0.0", ""));

    let id = {
        let framework = framework_on(store.path());
        framework.start().unwrap();
        let bundle = framework.install(&location(&content)).unwrap();
        framework.set_bundle_start_level(&bundle, 7).unwrap();
        framework.start_bundle(&bundle).unwrap();
        framework.stop().unwrap();
        framework.wait_for_stop(10_000).unwrap();
        bundle.id()
    };

    let framework = framework_on(store.path());
    framework.start().unwrap();
    let bundle = framework.get_bundle(id).unwrap();
    assert_eq!(framework.bundle_start_level(&bundle).unwrap(), 7);
    // Framework level 1 < bundle level 7: recorded as active, not running.
    assert_eq!(bundle.persistent_state(), PersistentState::Active);
    assert_ne!(bundle.state(), BundleState::Active);

    framework.set_start_level_and_wait(7).unwrap();
    assert_eq!(bundle.state(), BundleState::Active);
}
