//! The `AgentSession` controller: leader-elected, event-driven, one
//! reconcile task per session object with per-object serialization
//! provided by the controller runtime's keyed work queue.

use futures::stream::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::jiff::{SignedDuration, Timestamp};
use kube::{
    Api, ResourceExt,
    api::ListParams,
    client::Client,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{sync::Mutex, time::Duration};
use tokio_util::sync::CancellationToken;

use corral_common::annotations;
use corral_types::AgentSession;
use corral_vault::Vault;

use super::{
    actions,
    decide::{self, REASON_APPROVAL_TIMEOUT, REASON_DEADLINE_EXCEEDED, SessionAction},
    monitor::{MonitorKind, MonitorRegistry},
};
use crate::args::ControllerArgs;
use crate::util::{
    self, Error, PROBE_INTERVAL,
    colors::{FG1, FG2},
};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the `AgentSession` controller. Runs standby until
/// leadership is acquired; on leadership loss the controller task is
/// aborted and we return to standby.
pub async fn run(client: Client, args: ControllerArgs) -> Result<(), Error> {
    println!("{}", "⚙️ Starting AgentSession controller...".green());

    let shutdown = CancellationToken::new();
    let context: Arc<ContextData> = Arc::new(ContextData::new(
        client.clone(),
        args,
        shutdown.child_token(),
    )?);

    // Namespace where we run leader election. This keeps the Lease
    // RBAC confined to the control-plane namespace even though the
    // controller itself watches every tenant.
    let lease_namespace = corral_common::control_plane_namespace();
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("corral-session-controller-{}", uuid::Uuid::new_v4()));
    let lease_name = "corral-session-controller-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        corral_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    corral_common::signal_ready();

    let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(task) = controller_task.take() {
                    task.abort();
                    task.await.ok();
                }
                context.monitors.shutdown().await;
                break Ok(())
            },
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update Lease, assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(task) = controller_task.take() {
                    task.abort();
                    eprintln!("aborted controller due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            // We are leader; ensure controller is running
            if controller_task.is_none() {
                println!("{}", "👑 Acquired leadership; starting controller".green());
                let client_for_controller = client.clone();
                let context_for_controller = context.clone();
                let crd_api: Api<AgentSession> = Api::all(client_for_controller.clone());
                controller_task = Some(tokio::spawn(async move {
                    println!("{}", "🚀 AgentSession controller started.".green());
                    Controller::new(crd_api, Default::default())
                        .owns(
                            Api::<Pod>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .owns(
                            Api::<Secret>::all(client_for_controller.clone()),
                            Default::default(),
                        )
                        .owns(
                            Api::<ServiceAccount>::all(client_for_controller),
                            Default::default(),
                        )
                        .run(reconcile, on_error, context_for_controller)
                        .for_each(|_res| async move {})
                        .await;
                }));
            }
        } else if let Some(task) = controller_task.take() {
            // We are NOT leader; ensure controller is stopped
            eprintln!("lost leadership; stopping controller");
            task.abort();
        }
    }
}

/// Context injected with each `reconcile` and `on_error` invocation.
pub struct ContextData {
    client: Client,
    vault: Vault,
    pub monitors: MonitorRegistry,
    worker_image: String,
    gateway_url: String,
    llm_base_url: String,
    approval_timeout: Option<Duration>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,

    last_action: Mutex<HashMap<(String, String), (String, Instant)>>,
}

impl ContextData {
    pub fn new(
        client: Client,
        args: ControllerArgs,
        cancel: CancellationToken,
    ) -> Result<Self, Error> {
        let approval_timeout = match args.approval_timeout.as_deref() {
            Some(raw) => Some(parse_duration::parse(raw)?),
            None => None,
        };
        let vault = Vault::new(
            client.clone(),
            corral_common::control_plane_namespace(),
            args.providers.clone(),
        );
        let llm_base_url = corral_vault::llm::llm_endpoint(&args.providers).to_string();
        Ok(ContextData {
            client: client.clone(),
            vault,
            monitors: MonitorRegistry::new(cancel),
            worker_image: args.worker_image,
            gateway_url: args.gateway_url,
            llm_base_url,
            approval_timeout,
            #[cfg(feature = "metrics")]
            metrics: ControllerMetrics::new("sessions"),
            last_action: Mutex::new(HashMap::new()),
        })
    }
}

async fn get_worker_pod(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<Option<Pod>, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    match api.get(name).await {
        Ok(pod) => Ok(Some(pod)),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Counts non-terminating pods labelled as this session's worker.
/// More than one is an invariant breach the read phase reports.
async fn count_live_workers(
    client: Client,
    namespace: &str,
    name: &str,
) -> Result<usize, Error> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let selector = format!("{}={}", annotations::SESSION, name);
    let pods = api.list(&ListParams::default().labels(&selector)).await?;
    Ok(pods
        .items
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .count())
}

fn running_deadline(session: &AgentSession, now: Timestamp) -> Timestamp {
    let base = session
        .status
        .as_ref()
        .and_then(|s| s.started_at.as_ref())
        .map(|t| t.0)
        .unwrap_or(now);
    base.checked_add(SignedDuration::from_secs(
        session.spec.timeout_seconds as i64,
    ))
    .unwrap_or(base)
}

/// Reconciliation function for the `AgentSession` resource.
async fn reconcile(
    instance: Arc<AgentSession>,
    context: Arc<ContextData>,
) -> Result<Action, Error> {
    let client: Client = context.client.clone();

    let namespace: String = match instance.namespace() {
        None => {
            // Sessions are namespaced by tenant; an unnamespaced one
            // cannot be reconciled.
            return Err(Error::UserInput(
                "Expected AgentSession resource to be namespaced".to_owned(),
            ));
        }
        Some(namespace) => namespace,
    };
    let name = instance.name_any();

    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&name, &namespace])
        .inc();

    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    // Read phase of reconciliation determines goal during the write phase.
    let desired_hash = util::session_spec_hash(&instance.spec);
    let pod = get_worker_pod(client.clone(), &namespace, &name).await?;
    let live_workers = count_live_workers(client.clone(), &namespace, &name).await?;
    let now = Timestamp::now();
    let action = decide::determine_action(&instance, pod.as_ref(), live_workers, &desired_hash, now);

    if action != SessionAction::NoOp {
        let value = {
            let mut la = context.last_action.lock().await;
            la.insert(
                (namespace.clone(), name.clone()),
                (action.to_str().to_string(), Instant::now()),
            )
        };
        let changed = match &value {
            Some((last_action, last_instant)) => {
                last_action != action.to_str() || last_instant.elapsed() > Duration::from_secs(300)
            }
            None => true,
        };
        if changed {
            println!(
                "🔧 {}{}{}{}{}",
                namespace.color(FG2),
                "/".color(FG1),
                name.color(FG2),
                " ACTION: ".color(FG1),
                action.to_str().color(FG2),
            );
        }
    }

    #[cfg(feature = "metrics")]
    context
        .metrics
        .read_histogram
        .with_label_values(&[&name, &namespace, action.to_str()])
        .observe(start.elapsed().as_secs_f64());

    #[cfg(feature = "metrics")]
    context
        .metrics
        .action_counter
        .with_label_values(&[&name, &namespace, action.to_str()])
        .inc();

    #[cfg(feature = "metrics")]
    let timer = match action {
        SessionAction::NoOp => None,
        _ => Some(
            context
                .metrics
                .write_histogram
                .with_label_values(&[&name, &namespace, action.to_str()])
                .start_timer(),
        ),
    };

    // Write phase.
    let result = match action {
        SessionAction::AddFinalizer => {
            actions::add_finalizer(client, &instance).await?;
            Action::await_change()
        }
        SessionAction::Cleanup => {
            // Monitors stop before the finalizer can be released.
            context.monitors.cancel(&namespace, &name).await;
            if actions::cleanup(client, &instance).await? {
                Action::await_change()
            } else {
                Action::requeue(Duration::from_secs(2))
            }
        }
        SessionAction::CreateChildren => {
            actions::create_children(
                client,
                &context.vault,
                &instance,
                &context.worker_image,
                &context.gateway_url,
                &context.llm_base_url,
            )
            .await?;
            Action::await_change()
        }
        SessionAction::Starting { reason } => {
            actions::starting(client, &instance, reason).await?;
            Action::requeue(PROBE_INTERVAL)
        }
        SessionAction::MarkRunning { pod_name } => {
            actions::mark_running(client.clone(), &instance, &pod_name).await?;
            context
                .monitors
                .arm(
                    client,
                    &namespace,
                    &name,
                    MonitorKind::RunningDeadline,
                    running_deadline(&instance, now),
                    REASON_DEADLINE_EXCEEDED,
                    format!(
                        "session exceeded its {}s running budget",
                        instance.spec.timeout_seconds
                    ),
                )
                .await;
            Action::requeue(PROBE_INTERVAL)
        }
        SessionAction::Suspend { request } => {
            actions::suspend(client.clone(), &instance, request).await?;
            if let Some(cap) = context.approval_timeout {
                let deadline = now
                    .checked_add(SignedDuration::from_secs(cap.as_secs() as i64))
                    .unwrap_or(now);
                context
                    .monitors
                    .arm(
                        client,
                        &namespace,
                        &name,
                        MonitorKind::ApprovalDeadline,
                        deadline,
                        REASON_APPROVAL_TIMEOUT,
                        format!("approval not decided within {:?}", cap),
                    )
                    .await;
            }
            Action::await_change()
        }
        SessionAction::Resume { decision } => {
            actions::resume(client.clone(), &instance, &decision).await?;
            context
                .monitors
                .arm(
                    client,
                    &namespace,
                    &name,
                    MonitorKind::RunningDeadline,
                    running_deadline(&instance, now),
                    REASON_DEADLINE_EXCEEDED,
                    format!(
                        "session exceeded its {}s running budget",
                        instance.spec.timeout_seconds
                    ),
                )
                .await;
            Action::requeue(PROBE_INTERVAL)
        }
        SessionAction::Complete { result, cost } => {
            context.monitors.cancel(&namespace, &name).await;
            actions::complete(client, &instance, result, cost).await?;
            Action::await_change()
        }
        SessionAction::Fail { reason, message } => {
            context.monitors.cancel(&namespace, &name).await;
            actions::fail(client, &instance, reason, message).await?;
            Action::await_change()
        }
        SessionAction::Cancel => {
            context.monitors.cancel(&namespace, &name).await;
            actions::cancelled(client, &instance).await?;
            Action::await_change()
        }
        SessionAction::NoOp => {
            // Keep the running watchdog armed across controller
            // restarts.
            if decide::phase_of(&instance) == corral_types::SessionPhase::Running {
                context
                    .monitors
                    .arm(
                        client,
                        &namespace,
                        &name,
                        MonitorKind::RunningDeadline,
                        running_deadline(&instance, now),
                        REASON_DEADLINE_EXCEEDED,
                        format!(
                            "session exceeded its {}s running budget",
                            instance.spec.timeout_seconds
                        ),
                    )
                    .await;
            }
            Action::requeue(PROBE_INTERVAL)
        }
        SessionAction::Requeue(duration) => Action::requeue(duration),
    };

    #[cfg(feature = "metrics")]
    if let Some(timer) = timer {
        timer.observe_duration();
    }

    Ok(result)
}

/// Actions to be taken when a reconciliation fails - for whatever reason.
/// Transient cluster errors do not change phase; the resource is
/// requeued with backoff.
fn on_error(instance: Arc<AgentSession>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!(
            "Reconciliation error for {}/{}: {:?}",
            instance.namespace().unwrap_or_default(),
            instance.name_any(),
            error
        )
        .red()
    );
    Action::requeue(Duration::from_secs(5))
}
