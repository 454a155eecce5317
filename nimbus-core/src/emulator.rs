// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! The emulator: every component wired together, constructed once.
//!
//! Startup is an explicit ordered pipeline:
//!
//! 1. pull backing images
//! 2. start backing containers (s3, sqs, moto) and await readiness
//! 3. seed known runtimes
//! 4. replay the request log against the generic emulator
//! 5. restart the latest version of every deployed function
//! 6. resume enabled event sources
//!
//! Only then may the caller open its listener. Shutdown reverses it.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::Method;
use uuid::Uuid;

use crate::config::Config;
use crate::db::Database;
use crate::docker::{BollardRuntime, ContainerRuntime, ContainerSpec, Orchestrator};
use crate::error::{ContainerError, HardValidationError, NimbusError, NimbusResult};
use crate::invoke::InvocationRouter;
use crate::lambda::model::queue_name_from_arn;
use crate::lambda::{EnvironmentDiff, EventSource, Function, FunctionStore, LambdaLayer, NewFunction};
use crate::poller::{EventSourcePoller, QueueClient, SqsClient};
use crate::ports::PortPool;
use crate::replay::{self, ReplayLog};
use crate::services::{self, BackingService};
use crate::types::{FunctionName, LayerName, Port, Runtime};

/// Port the runtime image serves the invoke API on.
const FUNCTION_CONTAINER_PORT: u16 = 9001;

/// Largest batch a queue receive can return.
const MAX_BATCH_SIZE: u32 = 10;

/// Container definition for a function version bound to `port`.
pub fn function_container_spec(config: &Config, function: &Function, port: Port) -> ContainerSpec {
    let image = format!("{}:{}", config.lambda.runtime_image_prefix, function.runtime);
    let mut spec = ContainerSpec::new(function.name.container_name(), image)
        .command(vec![function.handler.clone()])
        .mount(function.content_path(&config.data_path), "/var/task", true)
        .mount(function.layers_path(&config.data_path), "/opt", true)
        .env("DOCKER_LAMBDA_STAY_OPEN", "1")
        .port(FUNCTION_CONTAINER_PORT, port.value());

    for (key, value) in &function.environment {
        spec = spec.env(key.clone(), value.clone());
    }
    spec
}

/// Every emulator component, shared by reference.
#[derive(Debug)]
pub struct Emulator {
    config: Config,
    store: Arc<FunctionStore>,
    orchestrator: Orchestrator,
    ports: PortPool,
    router: Arc<InvocationRouter>,
    poller: EventSourcePoller,
    replay: ReplayLog,
    http: reqwest::Client,
}

impl Emulator {
    /// Build the emulator from explicit collaborators and apply the schema.
    pub fn new(
        config: Config,
        db: Arc<Database>,
        runtime: Arc<dyn ContainerRuntime>,
        queue: Arc<dyn QueueClient>,
    ) -> NimbusResult<Self> {
        db.migrate(crate::lambda::MIGRATIONS)?;
        db.migrate(replay::MIGRATIONS)?;

        let http = reqwest::Client::builder()
            .timeout(config.timeouts.upstream)
            .build()
            .map_err(|source| NimbusError::Upstream {
                target: "http client".to_string(),
                source,
            })?;

        // Invocations may run as long as the longest function timeout.
        let invoke_http = reqwest::Client::builder()
            .timeout(config.timeouts.invocation())
            .build()
            .map_err(|source| NimbusError::Upstream {
                target: "invocation client".to_string(),
                source,
            })?;

        let (first, last) = config.lambda.port_range();
        let store = Arc::new(FunctionStore::new(db.clone(), config.data_path.clone()));
        let router = Arc::new(InvocationRouter::new(invoke_http));
        let poller = EventSourcePoller::new(
            queue,
            router.clone(),
            config.timeouts.poll_wait,
            config.region.clone(),
        );

        Ok(Self {
            orchestrator: Orchestrator::new(runtime, config.timeouts.stop_grace),
            ports: PortPool::new(first, last),
            replay: ReplayLog::new(db, http.clone(), config.moto.base_url()),
            store,
            router,
            poller,
            http,
            config,
        })
    }

    /// Build the emulator against the local Docker daemon and the database
    /// under the configured data path.
    pub fn connect(config: Config) -> NimbusResult<Self> {
        std::fs::create_dir_all(&config.data_path)
            .map_err(|e| NimbusError::io(format!("creating {}", config.data_path.display()), e))?;

        let db = Arc::new(Database::open(config.database_path())?);
        let runtime = Arc::new(BollardRuntime::connect()?);
        // Long polls must outlive the poll wait.
        let queue_http = reqwest::Client::builder()
            .timeout(config.timeouts.upstream + config.timeouts.poll_wait)
            .build()
            .map_err(|source| NimbusError::Upstream {
                target: "queue client".to_string(),
                source,
            })?;
        let queue = Arc::new(SqsClient::new(queue_http, config.sqs.base_url()));

        Self::new(config, db, runtime, queue)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &FunctionStore {
        &self.store
    }

    pub fn router(&self) -> &InvocationRouter {
        &self.router
    }

    pub fn poller(&self) -> &EventSourcePoller {
        &self.poller
    }

    pub fn replay_log(&self) -> &ReplayLog {
        &self.replay
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// Run the startup pipeline. Any error is fatal.
    pub async fn startup(&self) -> NimbusResult<usize> {
        self.start_backing_services().await?;

        self.store.seed_runtimes(&self.config.lambda.runtimes)?;

        let replayed = self.replay.replay_all().await?;

        let functions = self.store.latest_functions()?;
        tracing::info!(count = functions.len(), "Restarting deployed functions");
        for function in &functions {
            self.start_function(function).await?;
        }

        self.resume_event_sources().await?;

        tracing::info!(
            replayed = replayed,
            functions = functions.len(),
            pollers = self.poller.running_count(),
            "Emulator started"
        );
        Ok(replayed)
    }

    async fn start_backing_services(&self) -> NimbusResult<()> {
        for service in BackingService::STARTUP_ORDER {
            self.orchestrator
                .ensure_image(&service.settings(&self.config).image)
                .await?;
        }

        for service in BackingService::STARTUP_ORDER {
            let spec = service.container_spec(&self.config)?;
            self.orchestrator.start(spec).await?;
            services::await_ready(
                &self.http,
                service.name(),
                &service.readiness_url(&self.config),
                self.config.timeouts.readiness,
            )
            .await?;
        }
        Ok(())
    }

    async fn resume_event_sources(&self) -> NimbusResult<()> {
        for source in self.store.event_sources()? {
            // A missing queue only disables its own poller.
            if let Err(e) = self.poller.start(&source).await {
                tracing::error!(
                    event_source = %source.id,
                    queue_arn = %source.arn,
                    error = %e,
                    "Unable to resume event source"
                );
            }
        }
        Ok(())
    }

    /// Start a container for `function` on a free port and route to it.
    pub async fn start_function(&self, function: &Function) -> NimbusResult<Port> {
        let spec_image = format!("{}:{}", self.config.lambda.runtime_image_prefix, function.runtime);
        self.orchestrator.ensure_image(&spec_image).await?;

        // Dropping the lease on any early return hands the port back.
        let lease = self.ports.lease()?;
        let spec = function_container_spec(&self.config, function, lease.port());
        self.orchestrator.start(spec).await?;
        let port = lease.keep();

        self.router.register_running(function.name.clone(), port);
        tracing::info!(
            function = %function.name,
            version = function.version,
            port = %port,
            handler = %function.handler,
            "Function started"
        );
        Ok(port)
    }

    /// Stop the container serving `name` and free its port.
    ///
    /// The route goes first so no new invocation reaches the container; the
    /// port is freed only once the container is gone. A container left
    /// without a route is stopped too.
    pub async fn stop_function(&self, name: &FunctionName) -> NimbusResult<()> {
        let port = self.router.unregister(name);
        let stopped = self.orchestrator.stop(&name.container_name()).await;
        if let Some(port) = port {
            self.ports.release(port);
        }

        match stopped {
            Ok(()) => Ok(()),
            Err(ContainerError::NotRunning { .. }) if port.is_some() => Ok(()),
            Err(ContainerError::NotRunning { .. }) => Err(NimbusError::FunctionNotRunning {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop `function`'s current container if any, then start its version.
    async fn restart_function(&self, function: &Function) -> NimbusResult<Port> {
        match self.stop_function(&function.name).await {
            Ok(()) | Err(NimbusError::FunctionNotRunning { .. }) => {}
            Err(e) => {
                tracing::warn!(function = %function.name, error = %e, "Stopping previous container failed");
            }
        }
        self.start_function(function).await
    }

    /// Deploy a new version and run it.
    pub async fn deploy_function(&self, new: NewFunction, code: Bytes) -> NimbusResult<Function> {
        let store = Arc::clone(&self.store);
        let function = tokio::task::spawn_blocking(move || store.deploy(new, &code))
            .await
            .map_err(|e| NimbusError::io("deploy task", std::io::Error::other(e)))??;

        self.restart_function(&function).await?;
        Ok(function)
    }

    /// Replace the environment of the latest version of `name`.
    ///
    /// A running function is restarted when anything changed.
    pub async fn update_environment(
        &self,
        name: &FunctionName,
        environment: &BTreeMap<String, String>,
    ) -> NimbusResult<(Function, EnvironmentDiff)> {
        let store = Arc::clone(&self.store);
        let lookup = name.clone();
        let environment = environment.clone();
        let (updated, diff) = tokio::task::spawn_blocking(move || {
            let latest = store.latest_by_name(&lookup)?;
            let diff = store.upsert_environment(&latest, &environment)?;
            let updated = store.version(&lookup, latest.version)?;
            Ok::<_, NimbusError>((updated, diff))
        })
        .await
        .map_err(|e| NimbusError::io("environment update task", std::io::Error::other(e)))??;

        if !diff.is_empty() && self.router.is_running(name) {
            self.restart_function(&updated).await?;
        }
        Ok((updated, diff))
    }

    pub async fn publish_layer(
        &self,
        name: LayerName,
        description: String,
        compatible_runtimes: Vec<Runtime>,
        content: Bytes,
    ) -> NimbusResult<LambdaLayer> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            store.publish_layer(&name, &description, &compatible_runtimes, &content)
        })
        .await
        .map_err(|e| NimbusError::io("publish layer task", std::io::Error::other(e)))?
    }

    /// Persist a queue subscription and start polling it.
    pub async fn subscribe_event_source(
        &self,
        arn: &str,
        function: &FunctionName,
        batch_size: Option<u32>,
    ) -> NimbusResult<EventSource> {
        let batch_size = batch_size.unwrap_or(MAX_BATCH_SIZE);
        if !(1..=MAX_BATCH_SIZE).contains(&batch_size) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "BatchSize",
                value: batch_size.to_string(),
                reason: format!("must be between 1 and {MAX_BATCH_SIZE}"),
            }
            .into());
        }
        queue_name_from_arn(arn)?;

        let source = self.store.create_event_source(arn, function, batch_size)?;
        self.poller.start(&source).await?;
        Ok(source)
    }

    pub fn event_source(&self, id: &Uuid) -> NimbusResult<EventSource> {
        self.store.event_source(id)
    }

    /// Forward an invoke request to the function's container.
    pub async fn invoke(
        &self,
        name: &FunctionName,
        method: Method,
        path: &str,
        body: Bytes,
    ) -> NimbusResult<reqwest::Response> {
        self.router.invoke(name, method, path, body).await
    }

    /// Proxy a call for `service` to the backing emulator handling it.
    pub async fn proxy(
        &self,
        service: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> NimbusResult<reqwest::Response> {
        if replay::is_recorded_service(service) {
            return self.replay.proxy(service, method, path, headers, body).await;
        }
        match service {
            "sqs" => replay::forward(&self.http, &self.config.sqs.base_url(), method, path, headers, body).await,
            _ => Err(NimbusError::ServiceNotSupported {
                service: service.to_string(),
            }),
        }
    }

    /// Stop pollers, function routes and every container, newest first.
    pub async fn shutdown(&self) -> NimbusResult<()> {
        self.poller.stop_all().await;

        let ports: Vec<Port> = self
            .router
            .running()
            .iter()
            .filter_map(|name| self.router.unregister(name))
            .collect();

        let stopped = self.orchestrator.shutdown_all().await;
        for port in ports {
            self.ports.release(port);
        }
        stopped?;
        tracing::info!("Emulator stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use crate::docker::fake::FakeRuntime;
    use crate::lambda::archive::zip_of;
    use crate::poller::fake::FakeQueue;
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        runtime: Arc<FakeRuntime>,
        emulator: Emulator,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_string(&format!(
            "data_path: {}\nlambda:\n  port_base: 9002\n  port_count: 2\n",
            dir.path().display()
        ))
        .unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        let runtime = FakeRuntime::new();
        let queue = FakeQueue::with_messages("orders", &[]);
        let emulator = Emulator::new(config, db, runtime.clone(), queue).unwrap();
        emulator
            .store()
            .seed_runtimes(&[Runtime::new("python3.8").unwrap()])
            .unwrap();
        Fixture {
            _dir: dir,
            runtime,
            emulator,
        }
    }

    fn hello() -> NewFunction {
        let mut new = NewFunction::new(
            FunctionName::new("hello").unwrap(),
            "app.handler",
            Runtime::new("python3.8").unwrap(),
        );
        new.environment.insert("STAGE".to_string(), "dev".to_string());
        new
    }

    fn code() -> Bytes {
        Bytes::from(zip_of(&[("app.py", "def handler(e, c): return e")]))
    }

    #[tokio::test]
    async fn test_deploy_starts_function_container() {
        let f = fixture();
        let function = f.emulator.deploy_function(hello(), code()).await.unwrap();

        let port = f.emulator.router().port_of(&function.name).unwrap();
        assert_eq!(port.value(), 9002);

        let started = f.runtime.started.lock().unwrap();
        let spec = &started[0];
        assert_eq!(spec.name, "lambda-hello");
        assert_eq!(spec.image, "mlupin/docker-lambda:python3.8");
        assert_eq!(spec.command, vec!["app.handler"]);
        assert_eq!(spec.env["DOCKER_LAMBDA_STAY_OPEN"], "1");
        assert_eq!(spec.env["STAGE"], "dev");
        let targets: Vec<&str> = spec.mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(targets, vec!["/var/task", "/opt"]);
        assert!(spec.mounts.iter().all(|m| m.read_only));
        assert_eq!((spec.ports[0].container, spec.ports[0].host), (9001, 9002));
    }

    #[tokio::test]
    async fn test_redeploy_restarts_on_a_single_port() {
        let f = fixture();
        f.emulator.deploy_function(hello(), code()).await.unwrap();
        let second = f.emulator.deploy_function(hello(), code()).await.unwrap();

        assert_eq!(second.version, 2);
        assert_eq!(f.emulator.ports().in_use(), 1);
        assert!(f.runtime.calls().contains(&"stop id-lambda-hello".to_string()));
    }

    #[tokio::test]
    async fn test_port_exhaustion_is_reported() {
        let f = fixture();
        for name in ["a", "b"] {
            let mut new = hello();
            new.name = FunctionName::new(name).unwrap();
            f.emulator.deploy_function(new, code()).await.unwrap();
        }

        let mut third = hello();
        third.name = FunctionName::new("c").unwrap();
        let err = f.emulator.deploy_function(third, code()).await.unwrap_err();
        assert!(matches!(err, NimbusError::PortPoolExhausted { .. }));
        // The version is still recorded; it just is not running.
        assert!(f.emulator.store().latest_by_name(&FunctionName::new("c").unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_failed_start_releases_port() {
        let f = fixture();
        f.runtime.fail_create.lock().unwrap().insert("lambda-hello".to_string());

        assert!(f.emulator.deploy_function(hello(), code()).await.is_err());
        assert_eq!(f.emulator.ports().in_use(), 0);
        assert!(!f.emulator.router().is_running(&FunctionName::new("hello").unwrap()));
    }

    #[tokio::test]
    async fn test_port_held_until_container_stopped() {
        let f = fixture();
        let function = f.emulator.deploy_function(hello(), code()).await.unwrap();
        *f.runtime.stop_delay.lock().unwrap() = Some(Duration::from_millis(100));

        let observe = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            (
                f.emulator.router().is_running(&function.name),
                f.emulator.ports().in_use(),
            )
        };
        let (stopped, (routed, in_use)) =
            tokio::join!(f.emulator.stop_function(&function.name), observe);

        stopped.unwrap();
        assert!(!routed);
        assert_eq!(in_use, 1);
        assert_eq!(f.emulator.ports().in_use(), 0);
        assert!(matches!(
            f.emulator.stop_function(&function.name).await,
            Err(NimbusError::FunctionNotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_abandoned_function_start_frees_port() {
        let f = fixture();
        let function = f.emulator.store().deploy(hello(), &code()).unwrap();
        *f.runtime.create_delay.lock().unwrap() = Some(Duration::from_millis(100));

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            f.emulator.start_function(&function),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(f.emulator.ports().in_use(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        *f.runtime.create_delay.lock().unwrap() = None;
        let port = f.emulator.start_function(&function).await.unwrap();
        assert_eq!(port.value(), 9002);
        assert!(f.emulator.router().is_running(&function.name));
    }

    #[tokio::test]
    async fn test_update_environment_restarts_running_function() {
        let f = fixture();
        let function = f.emulator.deploy_function(hello(), code()).await.unwrap();

        let mut env = function.environment.clone();
        env.insert("STAGE".to_string(), "prod".to_string());
        let (updated, diff) = f.emulator.update_environment(&function.name, &env).await.unwrap();

        assert_eq!(updated.version, 1);
        assert_eq!(diff.changed.len(), 1);
        let started = f.runtime.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[1].env["STAGE"], "prod");
    }

    #[tokio::test]
    async fn test_subscribe_validates_input() {
        let f = fixture();
        let name = FunctionName::new("hello").unwrap();
        f.emulator.deploy_function(hello(), code()).await.unwrap();

        let arn = "arn:aws:sqs:us-west-2:271828182845:orders";
        assert!(matches!(
            f.emulator.subscribe_event_source(arn, &name, Some(11)).await,
            Err(NimbusError::HardValidation(_))
        ));
        assert!(f.emulator.subscribe_event_source("orders", &name, None).await.is_err());

        let source = f.emulator.subscribe_event_source(arn, &name, None).await.unwrap();
        assert_eq!(source.batch_size, 10);
        assert!(f.emulator.poller().is_running(&source.id));
        assert_eq!(f.emulator.event_source(&source.id).unwrap().arn, arn);

        f.emulator.shutdown().await.unwrap();
        assert!(!f.emulator.poller().is_running(&source.id));
    }

    #[tokio::test]
    async fn test_proxy_rejects_unknown_service() {
        let f = fixture();
        let err = f
            .emulator
            .proxy("s3", Method::GET, "/", &HeaderMap::new(), Bytes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, NimbusError::ServiceNotSupported { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let f = fixture();
        f.emulator.deploy_function(hello(), code()).await.unwrap();
        f.emulator.shutdown().await.unwrap();

        assert_eq!(f.emulator.ports().in_use(), 0);
        assert!(f.emulator.router().running().is_empty());
        assert!(f.runtime.calls().contains(&"remove id-lambda-hello".to_string()));
    }
}
