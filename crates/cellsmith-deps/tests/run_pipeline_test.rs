//! End-to-end tests of the `run` flow over in-memory collaborators.
//!
//! The root image is packaged into a temporary local repository; the
//! registry, capability probe, and starter are fakes that record what the
//! engine asks of them. Tests cover:
//! - Instance sharing through unanchored links
//! - Conflicting and unused links
//! - At-most-once starts under fan-in
//! - Dependencies ready before their dependents start
//! - Generated instance names
//! - Capability requirements
//! - Confirmation and the dependency-less mode

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cellsmith_common::config::CellsmithConfig;
use cellsmith_common::constants;
use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use cellsmith_deps::engine::{Engine, RunRequest};
use cellsmith_deps::render;
use cellsmith_image::metadata::ImageMetadata;
use cellsmith_image::store::LocalImageStore;
use cellsmith_runtime::capability::{Capability, CapabilityProbe};
use cellsmith_runtime::registry::{InstanceDescriptor, InstanceRegistry};
use cellsmith_runtime::starter::{InstanceStarter, StartRequest};

// ── Fakes ──────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeRegistry {
    live: HashMap<String, InstanceDescriptor>,
}

impl FakeRegistry {
    fn with_ready(instances: &[(&str, ImageRef)]) -> Self {
        let live = instances
            .iter()
            .map(|(name, image)| {
                (
                    (*name).to_string(),
                    InstanceDescriptor {
                        name: (*name).to_string(),
                        image: image.clone(),
                        status: "Ready".into(),
                    },
                )
            })
            .collect();
        Self { live }
    }
}

#[async_trait]
impl InstanceRegistry for FakeRegistry {
    async fn get(&self, name: &str) -> Result<InstanceDescriptor> {
        self.live
            .get(name)
            .cloned()
            .ok_or_else(|| CellsmithError::NotFound {
                kind: "instance",
                id: name.into(),
            })
    }

    async fn apply(&self, _manifests: &[std::path::PathBuf]) -> Result<()> {
        Ok(())
    }

    async fn wait_for_ready(&self, _name: &str, _timeout: Duration) -> Result<()> {
        Ok(())
    }
}

struct FakeProbe {
    zero_scaling: bool,
    autoscaling: bool,
}

#[async_trait]
impl CapabilityProbe for FakeProbe {
    async fn is_enabled(&self, capability: Capability) -> Result<bool> {
        Ok(match capability {
            Capability::ZeroScaling => self.zero_scaling,
            Capability::Autoscaling => self.autoscaling,
        })
    }
}

/// One recorded start: the sequence numbers of its begin and end.
#[derive(Debug, Clone)]
struct StartRecord {
    request: StartRequest,
    begun: usize,
    finished: usize,
}

#[derive(Default)]
struct RecordingStarter {
    clock: AtomicUsize,
    starts: Mutex<Vec<StartRecord>>,
    counts: Mutex<HashMap<String, usize>>,
}

impl RecordingStarter {
    fn records(&self) -> Vec<StartRecord> {
        self.starts.lock().unwrap().clone()
    }

    fn record(&self, instance: &str) -> StartRecord {
        self.records()
            .into_iter()
            .find(|r| r.request.instance == instance)
            .unwrap_or_else(|| panic!("{instance} was not started"))
    }

    fn count(&self, instance: &str) -> usize {
        self.counts.lock().unwrap().get(instance).copied().unwrap_or(0)
    }
}

#[async_trait]
impl InstanceStarter for RecordingStarter {
    async fn start(&self, request: &StartRequest) -> Result<()> {
        *self
            .counts
            .lock()
            .unwrap()
            .entry(request.instance.clone())
            .or_default() += 1;
        let begun = self.clock.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let finished = self.clock.fetch_add(1, Ordering::SeqCst);
        self.starts.lock().unwrap().push(StartRecord {
            request: request.clone(),
            begun,
            finished,
        });
        Ok(())
    }
}

// ── Harness ────────────────────────────────────────────────────────

fn image(name: &str) -> ImageMetadata {
    ImageMetadata::new("myorg", name, "1.0")
}

fn append(builder: &mut tar::Builder<impl std::io::Write>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

fn package(repo: &Path, metadata: &ImageMetadata) {
    let path = repo.join(cellsmith_image::source::archive_relative_path(
        &metadata.image_ref(),
    ));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let file = std::fs::File::create(&path).unwrap();
    let mut builder =
        tar::Builder::new(flate2::write::GzEncoder::new(file, flate2::Compression::default()));
    let json = serde_json::to_string(metadata).unwrap();
    append(&mut builder, constants::METADATA_FILE, json.as_bytes());
    let _ = builder.into_inner().unwrap().finish().unwrap();
}

struct Harness {
    _dir: tempfile::TempDir,
    starter: Arc<RecordingStarter>,
    engine: Engine,
}

fn harness(root: &ImageMetadata, registry: FakeRegistry, probe: FakeProbe) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = CellsmithConfig::with_data_dir(dir.path());
    package(&config.repo_dir, root);

    let starter = Arc::new(RecordingStarter::default());
    let engine = Engine::new(
        Arc::new(LocalImageStore::new(&config)),
        Arc::new(registry),
        Arc::new(probe),
        Arc::clone(&starter) as Arc<dyn InstanceStarter>,
        &config,
    );
    Harness {
        _dir: dir,
        starter,
        engine,
    }
}

fn all_capabilities() -> FakeProbe {
    FakeProbe {
        zero_scaling: true,
        autoscaling: true,
    }
}

fn request(root: &ImageMetadata, instance: &str, links: &[&str]) -> RunRequest {
    RunRequest {
        image: root.image_ref().to_string(),
        instance: Some(instance.into()),
        start_dependencies: true,
        share_instances: false,
        links: links.iter().map(|l| (*l).to_string()).collect(),
        env: vec![],
    }
}

/// `hr` depends on `employee` and `stock`, both of which depend on a
/// `mysql` image under alias `db`.
fn hr_image() -> ImageMetadata {
    image("hr")
        .with_dependency(
            "hr",
            "employee",
            image("employee").with_dependency("employee", "db", image("mysql")),
        )
        .with_dependency(
            "hr",
            "stock",
            image("stock").with_dependency("stock", "db", image("mysql")),
        )
}

// ── Sharing ────────────────────────────────────────────────────────

#[tokio::test]
async fn unanchored_link_shares_one_instance() {
    let root = hr_image();
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let outcome = h
        .engine
        .run(request(&root, "hr-prod", &["db:shared-db"]), |plan| {
            let rows = render::instance_rows(plan.tree);
            let db: Vec<_> = rows.iter().filter(|r| r.instance == "shared-db").collect();
            assert_eq!(db.len(), 1);
            assert!(db[0].shared);
            Ok(true)
        })
        .await
        .expect("run should succeed");

    assert_eq!(h.starter.count("shared-db"), 1);
    assert!(
        outcome
            .warnings
            .iter()
            .any(|w| w.contains("shared instance shared-db for duplicated alias db"))
    );
    let employee = h.starter.records().into_iter().find(|r| {
        r.request.image.name == "employee"
    });
    let employee = employee.expect("employee started");
    assert_eq!(employee.request.dependencies["db"].instance_name, "shared-db");
    assert_eq!(
        h.starter.record("hr-prod").request.dependencies.len(),
        2,
        "root sees both of its aliases"
    );
}

#[tokio::test]
async fn one_name_for_different_images_conflicts() {
    let root = image("hr")
        .with_dependency(
            "hr",
            "employee",
            image("employee").with_dependency("employee", "db", image("mysql")),
        )
        .with_dependency(
            "hr",
            "stock",
            image("stock").with_dependency("stock", "db", image("postgres")),
        );
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let err = h
        .engine
        .run(
            request(
                &root,
                "hr-prod",
                &["employee:emp", "stock:stk", "emp.db:same", "stk.db:same"],
            ),
            |_| Ok(true),
        )
        .await
        .expect_err("conflicting images must fail");

    assert!(matches!(err, CellsmithError::Conflict { .. }), "got {err}");
    assert!(err.to_string().contains("same"));
    assert!(h.starter.records().is_empty());
}

#[tokio::test]
async fn unused_link_is_rejected() {
    let root = hr_image();
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let err = h
        .engine
        .run(request(&root, "hr-prod", &["cache:redis"]), |_| Ok(true))
        .await
        .expect_err("unused link must fail");

    assert!(matches!(err, CellsmithError::InvalidInput { .. }), "got {err}");
    assert!(err.to_string().contains("cache:redis"));
    assert!(h.starter.records().is_empty());
}

// ── Activation ─────────────────────────────────────────────────────

#[tokio::test]
async fn fan_in_dependency_starts_once() {
    let mut root = image("portal");
    for parent in ["billing", "orders", "search", "users"] {
        root = root.with_dependency(
            "portal",
            parent,
            image(parent).with_dependency(parent, "lib", image("common")),
        );
    }
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let outcome = h
        .engine
        .run(request(&root, "portal", &["lib:common-lib"]), |_| Ok(true))
        .await
        .expect("run should succeed");

    assert_eq!(h.starter.count("common-lib"), 1);
    assert_eq!(h.starter.records().len(), 6);
    assert_eq!(outcome.report.started.len(), 6);

    let lib = h.starter.record("common-lib");
    for record in h.starter.records() {
        if record.request.image.name != "common" {
            assert!(
                lib.finished < record.begun,
                "{} started before its dependency was ready",
                record.request.instance
            );
        }
    }
}

#[tokio::test]
async fn dependencies_are_ready_before_dependents_start() {
    let root = image("app").with_dependency(
        "app",
        "api",
        image("api").with_dependency("api", "cache", image("redis")),
    );
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let outcome = h
        .engine
        .run(request(&root, "app", &["api:api", "api.cache:cache"]), |_| {
            Ok(true)
        })
        .await
        .expect("run should succeed");

    let cache = h.starter.record("cache");
    let api = h.starter.record("api");
    let app = h.starter.record("app");
    assert!(cache.finished < api.begun);
    assert!(api.finished < app.begun);

    let report = &outcome.report;
    assert!(report.get("cache").unwrap().ready_at <= report.get("api").unwrap().started_at);
    assert!(report.get("api").unwrap().ready_at <= report.get("app").unwrap().started_at);
    assert_eq!(report.started.last().unwrap().instance, "app");
}

#[tokio::test]
async fn generated_dependency_name_and_order() {
    let root = image("app").with_dependency(
        "app",
        "db",
        ImageMetadata::new("myorg", "mysql", "8.0"),
    );
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let outcome = h
        .engine
        .run(request(&root, "app", &[]), |plan| {
            assert_eq!(plan.tree.len(), 2);
            Ok(true)
        })
        .await
        .expect("run should succeed");

    let records = h.starter.records();
    assert_eq!(records.len(), 2);
    let db = &records[0].request;
    let suffix = db
        .instance
        .strip_prefix("mysql-8-0-")
        .unwrap_or_else(|| panic!("unexpected name {}", db.instance));
    assert_eq!(suffix.len(), 8);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

    assert_eq!(records[1].request.instance, "app");
    assert_eq!(records[1].request.dependencies["db"].instance_name, db.instance);
    assert_eq!(outcome.report.started[0].instance, db.instance);
}

#[tokio::test]
async fn dependencies_are_pulled_from_the_root_registry() {
    let root = image("app").with_dependency(
        "app",
        "db",
        ImageMetadata::new("myorg", "mysql", "8.0"),
    );
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let mut req = request(&root, "app", &[]);
    req.image = "reg.example.com/myorg/app:1.0".into();
    let outcome = h.engine.run(req, |_| Ok(true)).await.expect("run should succeed");

    let records = h.starter.records();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(
            record.request.image.registry.as_deref(),
            Some("reg.example.com"),
            "{} lost the registry of the root image",
            record.request.instance
        );
    }
    assert_eq!(records[0].request.image.name, "mysql");
    assert_eq!(outcome.image.registry.as_deref(), Some("reg.example.com"));
}

#[tokio::test]
async fn generated_root_name_follows_image() {
    let root = image("solo");
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let mut req = request(&root, "unused", &[]);
    req.instance = None;
    let outcome = h.engine.run(req, |_| Ok(true)).await.expect("run should succeed");

    assert!(outcome.instance.starts_with("solo-1-0-"), "{}", outcome.instance);
    assert_eq!(h.starter.count(&outcome.instance), 1);
}

#[tokio::test]
async fn environment_is_routed_to_its_instance() {
    let root = hr_image();
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let mut req = request(&root, "hr-prod", &["employee:emp"]);
    req.env = vec!["emp.MODE=audit".into(), "LOG=debug=1".into()];
    let _ = h.engine.run(req, |_| Ok(true)).await.expect("run should succeed");

    assert_eq!(
        h.starter.record("emp").request.env,
        vec![("MODE".to_string(), "audit".to_string())]
    );
    assert_eq!(
        h.starter.record("hr-prod").request.env,
        vec![("LOG".to_string(), "debug=1".to_string())]
    );
}

// ── Requirements ───────────────────────────────────────────────────

#[tokio::test]
async fn missing_zero_scaling_fails_before_any_start() {
    let mut scaled = image("scaled");
    scaled.zero_scaling_required = true;
    let root = image("app").with_dependency("app", "worker", scaled);
    let h = harness(
        &root,
        FakeRegistry::default(),
        FakeProbe {
            zero_scaling: false,
            autoscaling: true,
        },
    );

    let err = h
        .engine
        .run(request(&root, "app", &[]), |_| Ok(true))
        .await
        .expect_err("zero-scaling is required");

    assert!(matches!(err, CellsmithError::RequirementUnmet { .. }), "got {err}");
    assert!(h.starter.records().is_empty());
}

#[tokio::test]
async fn missing_autoscaling_only_warns() {
    let mut scaled = image("scaled");
    scaled.auto_scaling_required = true;
    let root = image("app").with_dependency("app", "worker", scaled);
    let h = harness(
        &root,
        FakeRegistry::default(),
        FakeProbe {
            zero_scaling: true,
            autoscaling: false,
        },
    );

    let outcome = h
        .engine
        .run(request(&root, "app", &[]), |plan| {
            assert_eq!(plan.warnings.len(), 1);
            Ok(true)
        })
        .await
        .expect("autoscaling is optional");

    assert!(outcome.warnings[0].contains("autoscaling"));
    assert_eq!(h.starter.records().len(), 2);
}

// ── Confirmation and modes ─────────────────────────────────────────

#[tokio::test]
async fn declined_confirmation_starts_nothing() {
    let root = hr_image();
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let err = h
        .engine
        .run(request(&root, "hr-prod", &[]), |_| Ok(false))
        .await
        .expect_err("declined run");

    assert!(err.to_string().contains("run aborted"));
    assert!(h.starter.records().is_empty());
}

#[tokio::test]
async fn existing_root_instance_conflicts() {
    let root = image("solo");
    let registry = FakeRegistry::with_ready(&[("solo", root.image_ref())]);
    let h = harness(&root, registry, all_capabilities());

    let err = h
        .engine
        .run(request(&root, "solo", &[]), |_| Ok(true))
        .await
        .expect_err("root already exists");

    assert!(matches!(err, CellsmithError::Conflict { .. }), "got {err}");
    assert!(err.to_string().contains("already exists"));
}

#[tokio::test]
async fn running_link_targets_are_reused() {
    let root = hr_image();
    let registry = FakeRegistry::with_ready(&[("emp", image("employee").image_ref())]);
    let h = harness(&root, registry, all_capabilities());

    let _ = h
        .engine
        .run(request(&root, "hr-prod", &["employee:emp"]), |plan| {
            let rows = render::instance_rows(plan.tree);
            let emp = rows.iter().find(|r| r.instance == "emp").unwrap();
            assert_eq!(emp.used, render::UsedInstance::Available);
            Ok(true)
        })
        .await
        .expect("run should succeed");

    assert_eq!(h.starter.count("emp"), 0);
    // Only the stock branch and the root are created.
    assert_eq!(h.starter.records().len(), 3);
}

#[tokio::test]
async fn immediate_mode_starts_only_the_root() {
    let root = image("app").with_dependency("app", "db", image("mysql"));
    let registry = FakeRegistry::with_ready(&[("db-prod", image("mysql").image_ref())]);
    let h = harness(&root, registry, all_capabilities());

    let mut req = request(&root, "app", &["db:db-prod"]);
    req.start_dependencies = false;
    let outcome = h.engine.run(req, |_| Ok(true)).await.expect("run should succeed");

    assert_eq!(outcome.report.started.len(), 1);
    let app = h.starter.record("app");
    let deps: BTreeMap<_, _> = app
        .request
        .dependencies
        .iter()
        .map(|(alias, info)| (alias.clone(), info.instance_name.clone()))
        .collect();
    assert_eq!(deps, BTreeMap::from([("db".to_string(), "db-prod".to_string())]));
}

#[tokio::test]
async fn immediate_mode_requires_running_links() {
    let root = image("app").with_dependency("app", "db", image("mysql"));
    let h = harness(&root, FakeRegistry::default(), all_capabilities());

    let mut req = request(&root, "app", &["db:db-prod"]);
    req.start_dependencies = false;
    let err = h
        .engine
        .run(req, |_| Ok(true))
        .await
        .expect_err("link target is not running");

    assert!(matches!(err, CellsmithError::InvalidInput { .. }), "got {err}");
    assert!(h.starter.records().is_empty());
}
