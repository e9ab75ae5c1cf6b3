//! Concurrent activation of a dependency tree.
//!
//! Every child of a node is activated in its own task; the node waits for
//! all of them before it is started itself. A node reachable from several
//! parents is started at most once: its running flag is checked, its guard
//! is taken, and the flag is checked again before anything is started.
//!
//! A failure does not cancel tasks already in flight. They run to
//! completion, the first error is reported, and started instances are left
//! in place.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cellsmith_common::error::{CellsmithError, Result};
use cellsmith_common::types::ImageRef;
use cellsmith_runtime::starter::{DependencyInfo, InstanceStarter, StartRequest};
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinSet;

use crate::env::InstanceEnv;
use crate::tree::{DependencyTree, NodeId};

/// An instance started by this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedInstance {
    /// Instance name.
    pub instance: String,
    /// Image the instance was created from.
    pub image: ImageRef,
    /// When the start side effect was issued.
    pub started_at: DateTime<Utc>,
    /// When the instance was reported ready.
    pub ready_at: DateTime<Utc>,
}

/// Instances started during activation, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Started instances.
    pub started: Vec<StartedInstance>,
}

impl ActivationReport {
    /// Returns the entry for `instance`, if it was started.
    #[must_use]
    pub fn get(&self, instance: &str) -> Option<&StartedInstance> {
        self.started.iter().find(|s| s.instance == instance)
    }
}

type BoxedActivation = Pin<Box<dyn Future<Output = Result<()>> + Send + 'static>>;

/// Shared state of one activation, indexed by node.
struct Plan {
    requests: Vec<StartRequest>,
    children: Vec<Vec<usize>>,
    running: Vec<AtomicBool>,
    failed: Vec<AtomicBool>,
    guards: Vec<Mutex<()>>,
    starter: Arc<dyn InstanceStarter>,
    started: Mutex<Vec<StartedInstance>>,
}

impl Plan {
    fn new(
        tree: &DependencyTree,
        env: &InstanceEnv,
        registry: Option<&str>,
        starter: Arc<dyn InstanceStarter>,
    ) -> Self {
        let mut requests = Vec::with_capacity(tree.len());
        let mut children = Vec::with_capacity(tree.len());
        let mut running = Vec::with_capacity(tree.len());
        for (id, node) in tree.iter() {
            requests.push(start_request(tree, id, env, registry));
            let distinct: BTreeSet<usize> = node.dependencies.values().map(|c| c.index()).collect();
            children.push(distinct.into_iter().collect());
            running.push(AtomicBool::new(node.running));
        }
        Self {
            requests,
            children,
            running,
            failed: (0..tree.len()).map(|_| AtomicBool::new(false)).collect(),
            guards: (0..tree.len()).map(|_| Mutex::new(())).collect(),
            starter,
            started: Mutex::new(Vec::new()),
        }
    }

    async fn start(&self, node: usize) -> Result<()> {
        let request = &self.requests[node];
        tracing::info!(instance = %request.instance, image = %request.image, "starting instance");
        let started_at = Utc::now();
        self.starter
            .start(request)
            .await
            .map_err(|e| match e {
                e @ (CellsmithError::Activation { .. } | CellsmithError::Timeout { .. }) => e,
                other => CellsmithError::Activation {
                    instance: request.instance.clone(),
                    message: other.to_string(),
                },
            })?;
        let ready_at = Utc::now();
        self.started.lock().await.push(StartedInstance {
            instance: request.instance.clone(),
            image: request.image.clone(),
            started_at,
            ready_at,
        });
        Ok(())
    }
}

/// Builds the start request of a node: its image, its direct dependencies,
/// and the environment variables addressed to it.
///
/// Metadata carries no registry, so the image is bound to `registry` when
/// one is given; every image of a run is pulled from the registry of the
/// root image.
#[must_use]
pub fn start_request(
    tree: &DependencyTree,
    id: NodeId,
    env: &InstanceEnv,
    registry: Option<&str>,
) -> StartRequest {
    let node = tree.node(id);
    let image = node.metadata.image_ref();
    let dependencies = node
        .dependencies
        .iter()
        .map(|(alias, child)| {
            let child = tree.node(*child);
            (
                alias.clone(),
                DependencyInfo::new(&child.metadata.image_ref(), &child.instance),
            )
        })
        .collect();
    StartRequest {
        instance: node.instance.clone(),
        image: match registry {
            Some(registry) => image.with_registry(registry),
            None => image,
        },
        dependencies,
        env: env.get(&node.instance).cloned().unwrap_or_default(),
    }
}

/// Starts instances through an [`InstanceStarter`].
#[derive(Clone)]
pub struct Activator {
    starter: Arc<dyn InstanceStarter>,
    registry: Option<String>,
}

impl Activator {
    /// Creates an activator issuing starts through `starter`.
    #[must_use]
    pub fn new(starter: Arc<dyn InstanceStarter>) -> Self {
        Self {
            starter,
            registry: None,
        }
    }

    /// Pulls every started image from `registry` instead of the default one.
    #[must_use]
    pub fn with_registry(mut self, registry: Option<String>) -> Self {
        self.registry = registry;
        self
    }

    fn plan(&self, tree: &DependencyTree, env: &InstanceEnv) -> Plan {
        Plan::new(tree, env, self.registry.as_deref(), Arc::clone(&self.starter))
    }

    /// Starts every non-running node below the root, dependencies first.
    ///
    /// The root itself is never started here. Nodes that were started are
    /// marked running in `tree`, even when the activation as a whole fails.
    ///
    /// # Errors
    ///
    /// Returns the first activation error once all in-flight tasks finished.
    pub async fn activate_dependencies(
        &self,
        tree: &mut DependencyTree,
        env: &InstanceEnv,
    ) -> Result<ActivationReport> {
        let plan = Arc::new(self.plan(tree, env));
        let result = activate_children(Arc::clone(&plan), tree.root().index()).await;

        let now_running: Vec<NodeId> = tree
            .iter()
            .map(|(id, _)| id)
            .filter(|id| plan.running[id.index()].load(Ordering::Acquire))
            .collect();
        for id in now_running {
            tree.mark_running(id);
        }
        let started = std::mem::take(&mut *plan.started.lock().await);
        result?;

        tracing::info!(started = started.len(), "dependencies activated");
        Ok(ActivationReport { started })
    }

    /// Starts the root instance of `tree`. Its dependencies must already be
    /// running.
    ///
    /// # Errors
    ///
    /// Returns an activation error if the root fails to start.
    pub async fn start_root(
        &self,
        tree: &mut DependencyTree,
        env: &InstanceEnv,
    ) -> Result<StartedInstance> {
        let root = tree.root();
        let plan = self.plan(tree, env);
        plan.start(root.index()).await?;
        tree.mark_running(root);
        let mut started = std::mem::take(&mut *plan.started.lock().await);
        started.pop().ok_or_else(|| CellsmithError::Activation {
            instance: tree.node(root).instance.clone(),
            message: "start was not recorded".into(),
        })
    }
}

/// Activates all children of `node` concurrently and waits for every task.
fn activate_children(plan: Arc<Plan>, node: usize) -> BoxedActivation {
    Box::pin(async move {
        let mut tasks = JoinSet::new();
        for &child in &plan.children[node] {
            if plan.running[child].load(Ordering::Acquire) {
                continue;
            }
            let _ = tasks.spawn(activate_node(Arc::clone(&plan), child));
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(CellsmithError::Activation {
                    instance: plan.requests[node].instance.clone(),
                    message: format!("dependency activation task failed: {e}"),
                })
            });
            if let Err(e) = result {
                tracing::warn!(error = %e, "dependency activation failed");
                let _ = first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    })
}

async fn activate_node(plan: Arc<Plan>, node: usize) -> Result<()> {
    if plan.running[node].load(Ordering::Acquire) {
        return Ok(());
    }
    let _guard = plan.guards[node].lock().await;
    if plan.running[node].load(Ordering::Acquire) {
        return Ok(());
    }
    if plan.failed[node].load(Ordering::Acquire) {
        return Err(CellsmithError::Activation {
            instance: plan.requests[node].instance.clone(),
            message: "instance failed to start in another branch of the tree".into(),
        });
    }

    let outcome = match activate_children(Arc::clone(&plan), node).await {
        Ok(()) => plan.start(node).await,
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => {
            plan.running[node].store(true, Ordering::Release);
            Ok(())
        }
        Err(e) => {
            plan.failed[node].store(true, Ordering::Release);
            Err(e)
        }
    }
}
