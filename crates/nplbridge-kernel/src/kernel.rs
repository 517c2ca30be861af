//! BridgeKernel: assembles all subsystems and exposes the agent-facing API.
//!
//! The kernel is explicit owned state: two kernels in one process share
//! nothing. It wires the identity provider, credential manager, transport,
//! discovery, compiler, tool cache, instance memory, metrics and health
//! check from one [`BridgeConfig`].

use crate::error::{KernelError, KernelResult};
use dashmap::DashMap;
use futures::future::join_all;
use nplbridge_memory::tools::MemoryTools;
use nplbridge_memory::InstanceMemory;
use nplbridge_runtime::auth::provider_from_config;
use nplbridge_runtime::compiler::{ToolCompiler, INSTANCE_ID_PARAM};
use nplbridge_runtime::credentials::CredentialManager;
use nplbridge_runtime::discovery::PackageDiscovery;
use nplbridge_runtime::health::{HealthCheck, HealthReport};
use nplbridge_runtime::http::{HttpBackend, ReqwestBackend};
use nplbridge_runtime::instances::{page_items, InstanceQuery, InstanceReader};
use nplbridge_runtime::metrics::{BroadcastSink, FanoutSink, MetricsCollector, MetricsSummary};
use nplbridge_runtime::retry::RetryConfig;
use nplbridge_runtime::tool::CompiledTool;
use nplbridge_runtime::tool_cache::{SpecToolSource, ToolCache};
use nplbridge_runtime::transport::ResilientTransport;
use nplbridge_types::config::BridgeConfig;
use nplbridge_types::error::BridgeError;
use nplbridge_types::event::{TelemetryEvent, TelemetrySink};
use nplbridge_types::memory::MemoryRecord;
use nplbridge_types::package::PackageDescriptor;
use nplbridge_types::tool::{ToolCall, ToolDefinition, ToolResult};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the telemetry broadcast channel.
const TELEMETRY_CHANNEL_CAPACITY: usize = 1024;

/// The bridge kernel.
pub struct BridgeKernel {
    config: BridgeConfig,
    credentials: Arc<CredentialManager>,
    discovery: Arc<PackageDiscovery>,
    cache: ToolCache,
    instances: InstanceReader,
    memory: Arc<InstanceMemory>,
    memory_tools: MemoryTools,
    metrics: Arc<MetricsCollector>,
    telemetry: Arc<BroadcastSink>,
    health: HealthCheck,
    /// Tool name → package, filled as packages are compiled.
    tool_index: DashMap<String, String>,
}

impl BridgeKernel {
    /// Boot with the default reqwest backend.
    pub fn boot(config: BridgeConfig) -> KernelResult<Self> {
        let backend = ReqwestBackend::new()
            .map_err(|e| KernelError::BootFailed(format!("HTTP client: {e}")))?;
        Self::boot_with_backend(config, Arc::new(backend))
    }

    /// Boot over a caller-supplied HTTP backend.
    pub fn boot_with_backend(
        config: BridgeConfig,
        backend: Arc<dyn HttpBackend>,
    ) -> KernelResult<Self> {
        let problems = config.validate();
        if !problems.is_empty() {
            return Err(KernelError::BootFailed(problems.join("; ")));
        }

        let provider = provider_from_config(&config, backend.clone())
            .map_err(|e| KernelError::BootFailed(e.to_string()))?;
        let credentials = Arc::new(CredentialManager::new(provider, config.refresh_margin_secs));

        let metrics = Arc::new(MetricsCollector::new());
        let telemetry = Arc::new(BroadcastSink::new(TELEMETRY_CHANNEL_CAPACITY));
        let sink: Arc<dyn TelemetrySink> = Arc::new(FanoutSink::new(vec![
            metrics.clone() as Arc<dyn TelemetrySink>,
            telemetry.clone() as Arc<dyn TelemetrySink>,
        ]));

        let transport = Arc::new(
            ResilientTransport::new(
                backend.clone(),
                credentials.clone(),
                RetryConfig::from(&config.retry),
                Duration::from_secs(config.request_timeout_secs.max(1)),
            )
            .with_sink(sink.clone()),
        );
        let discovery = Arc::new(PackageDiscovery::new(transport.clone(), &config));
        let instances = InstanceReader::new(transport.clone(), config.engine_base());
        let source = Arc::new(SpecToolSource::new(
            discovery.clone(),
            ToolCompiler::new(&config.name_separator),
            transport,
        ));
        let cache = ToolCache::new(
            source,
            credentials.clone(),
            Duration::from_secs(config.cache_ttl_secs),
        );

        let memory = Arc::new(InstanceMemory::new(config.memory_capacity).with_sink(sink));
        let memory_tools = MemoryTools::new(memory.clone());
        let health = HealthCheck::new(backend, credentials.clone(), config.engine_base());

        info!(
            engine = %config.engine_base(),
            auth = config.auth.method(),
            cache_ttl_secs = config.cache_ttl_secs,
            "Bridge kernel booted"
        );

        Ok(Self {
            config,
            credentials,
            discovery,
            cache,
            instances,
            memory,
            memory_tools,
            metrics,
            telemetry,
            health,
            tool_index: DashMap::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn memory(&self) -> &Arc<InstanceMemory> {
        &self.memory
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn credentials(&self) -> &Arc<CredentialManager> {
        &self.credentials
    }

    /// Subscribe to the raw telemetry stream.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.telemetry.subscribe()
    }

    /// Obtain a credential up front instead of on the first call.
    pub async fn authenticate(&self) -> KernelResult<()> {
        let snapshot = self.credentials.authenticate().await?;
        info!(
            provider = self.credentials.provider_name(),
            generation = snapshot.generation,
            "Authenticated"
        );
        Ok(())
    }

    /// Deployed packages, or `filter` when one is given.
    pub async fn list_packages(
        &self,
        filter: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> KernelResult<Vec<String>> {
        Ok(self.discovery.list_packages(filter, cancel).await?)
    }

    /// Descriptors of the deployed packages, or of `filter`.
    pub async fn describe_packages(
        &self,
        filter: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> KernelResult<Vec<PackageDescriptor>> {
        Ok(self.discovery.describe_packages(filter, cancel).await?)
    }

    /// Compiled tools of every package (or of `filter`).
    ///
    /// Packages with an unparseable spec are skipped with a warning; any
    /// other failure is returned.
    pub async fn list_compiled_tools(
        &self,
        filter: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> KernelResult<Vec<CompiledTool>> {
        let packages = self.list_packages(filter, cancel).await?;
        let results = join_all(
            packages
                .iter()
                .map(|package| self.cache.get_tools(package, false, cancel)),
        )
        .await;

        let mut tools = Vec::new();
        for (package, result) in packages.iter().zip(results) {
            match result {
                Ok(compiled) => {
                    for tool in compiled.iter() {
                        self.tool_index
                            .insert(tool.name().to_string(), package.clone());
                    }
                    tools.extend(compiled.iter().cloned());
                }
                Err(e @ BridgeError::SpecUnparseable { .. }) => {
                    warn!(package = %package, error = %e, "Skipping package");
                }
                Err(e) => return Err(e.into()),
            }
        }
        info!(packages = packages.len(), tools = tools.len(), "Listed compiled tools");
        Ok(tools)
    }

    /// Engine tool definitions followed by the memory tools.
    pub async fn tool_definitions(
        &self,
        filter: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> KernelResult<Vec<ToolDefinition>> {
        let mut defs: Vec<ToolDefinition> = self
            .list_compiled_tools(filter, cancel)
            .await?
            .iter()
            .map(CompiledTool::definition)
            .collect();
        defs.extend(MemoryTools::definitions());
        Ok(defs)
    }

    /// Look up a compiled tool by name.
    pub async fn find_tool(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> KernelResult<CompiledTool> {
        let known = self.tool_index.get(name).map(|p| p.value().clone());
        if let Some(package) = known {
            let tools = self.cache.get_tools(&package, false, cancel).await?;
            if let Some(tool) = tools.iter().find(|t| t.name() == name) {
                return Ok(tool.clone());
            }
        }
        self.list_compiled_tools(None, cancel)
            .await?
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| BridgeError::NotFound(format!("unknown tool '{name}'")).into())
    }

    /// Invoke a tool on behalf of `agent`.
    ///
    /// Memory tools run against the agent's ledger. Engine tools are
    /// invoked and their result is tracked in the agent's memory.
    pub async fn invoke_tool(
        &self,
        agent: &str,
        name: &str,
        input: &Value,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        if MemoryTools::is_memory_tool(name) {
            return Ok(self.memory_tools.execute(agent, name, input)?);
        }

        let args: Map<String, Value> = match input {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            _ => {
                return Err(BridgeError::InvalidArgument(format!(
                    "arguments for '{name}' must be a JSON object"
                ))
                .into())
            }
        };

        let tool = self.find_tool(name, cancel).await?;
        let result = tool.invoke(&args, cancel).await?;

        let instance_id = args.get(INSTANCE_ID_PARAM).and_then(Value::as_str);
        let spec = tool.spec();
        self.memory
            .auto_track(agent, &spec.protocol_name, spec.kind, instance_id, &result);
        Ok(result)
    }

    /// Run a tool call and wrap the outcome for the agent runtime.
    pub async fn execute_call(
        &self,
        agent: &str,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> ToolResult {
        match self.invoke_tool(agent, &call.name, &call.input, cancel).await {
            Ok(value) => ToolResult::success(&call.id, &value),
            Err(e) => {
                warn!(agent, tool = %call.name, error = %e, "Tool call failed");
                ToolResult::failure(&call.id, &e.into_bridge())
            }
        }
    }

    /// Read one instance and record what `agent` observed.
    pub async fn get_instance(
        &self,
        agent: &str,
        package: &str,
        protocol: &str,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        let instance = self
            .instances
            .get(package, protocol, instance_id, cancel)
            .await?;
        self.memory.observe(agent, protocol, &instance);
        Ok(instance)
    }

    /// Read one page of a protocol's instances and record each of them.
    pub async fn query_instances(
        &self,
        agent: &str,
        package: &str,
        protocol: &str,
        query: &InstanceQuery,
        cancel: &CancellationToken,
    ) -> KernelResult<Value> {
        let page = self.instances.query(package, protocol, query, cancel).await?;
        let observed = page_items(&page)
            .iter()
            .filter_map(|item| self.memory.observe(agent, protocol, item))
            .count();
        info!(agent, package, protocol, observed, "Queried instances");
        Ok(page)
    }

    /// Pass `from`'s latest `protocol_type` instance to `to`.
    pub fn handoff(
        &self,
        from: &str,
        to: &str,
        protocol_type: &str,
        role: Option<&str>,
    ) -> KernelResult<MemoryRecord> {
        let record = self.memory.handoff(from, to, protocol_type, role)?;
        info!(from, to, protocol = protocol_type, instance_id = %record.instance_id, "Handed off instance");
        Ok(record)
    }

    /// Drop cached tools so the next lookup recompiles.
    pub fn refresh_tools(&self) {
        self.cache.clear();
        self.tool_index.clear();
    }

    pub async fn health(&self) -> HealthReport {
        self.health.report(Some(&self.metrics)).await
    }

    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}
