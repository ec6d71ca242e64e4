use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, info, warn};
use warprpc_common::config::ClientConfig;
use warprpc_common::transport::Codec;
use warprpc_common::{IdGenerator, Request, Result, RpcValue, WarprpcError};
use warprpc_registry::{Registry, RegistryEntry, RoundRobin};

use crate::pool::ConnectionPool;

/// warprpc client for calling remote services by name.
///
/// Providers are discovered through the registry: the first call to a
/// service subscribes to its membership and publishes a consumer entry.
/// Every call then picks a provider round-robin from the local cache and
/// goes out on the shared connection to that provider.
///
/// # Example
///
/// ```no_run
/// use warprpc_client::RpcClient;
/// use warprpc_common::config::ClientConfig;
/// use warprpc_common::RpcValue;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let client = RpcClient::new(ClientConfig::default()).await?;
/// let reply = client
///     .call("Echo", "echo", vec![RpcValue::from("hello")])
///     .await?;
/// assert_eq!(reply, RpcValue::from("hello"));
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    config: ClientConfig,
    registry: Registry,
    owns_registry: bool,
    pool: ConnectionPool,
    selector: RoundRobin,
    ids: IdGenerator,
    consumers: DashMap<String, RegistryEntry>,
}

impl RpcClient {
    /// Connects to the configured registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the registry is
    /// unreachable.
    pub async fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let registry = Registry::start(&config.common).await?;
        let mut client = Self::with_registry(config, registry)?;
        client.owns_registry = true;
        Ok(client)
    }

    /// Creates a client discovering providers through `registry`.
    ///
    /// [`RpcClient::close`] leaves a shared registry open.
    pub fn with_registry(config: ClientConfig, registry: Registry) -> Result<Self> {
        config.validate()?;
        let pool = ConnectionPool::new(Codec::new(config.common.serialize_kind));
        Ok(Self {
            config,
            registry,
            owns_registry: false,
            pool,
            selector: RoundRobin::new(),
            ids: IdGenerator::new(),
            consumers: DashMap::new(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Calls `service.method(args)` with the configured call timeout.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
    ) -> Result<RpcValue> {
        self.call_with_timeout(service, method, args, self.config.call_timeout)
            .await
    }

    /// Calls `service.method(args)`, waiting at most `timeout` for the
    /// response.
    ///
    /// # Errors
    ///
    /// - `NoProvider` right away when no provider is known for `service`
    /// - `Timeout` when the response does not arrive in time
    /// - `ConnectionLost` / `Connection` when the provider is unreachable
    /// - the remote failure, with its kind restored, when the call fails
    pub async fn call_with_timeout(
        &self,
        service: &str,
        method: &str,
        args: Vec<RpcValue>,
        timeout: Duration,
    ) -> Result<RpcValue> {
        self.ensure_subscribed(service).await?;

        let providers = self.registry.cache().providers(service);
        let provider = self
            .selector
            .next(service, &providers)
            .ok_or_else(|| WarprpcError::NoProvider(service.to_string()))?;
        let addr = provider.address();

        let conn = self.pool.get(&addr).await?;
        let id = self.ids.next_id();
        debug!(id, service, method, %addr, "calling");

        let request = Request::new(id, service, method, args);
        let response = conn.call(request, timeout).await?;
        response.into_result()
    }

    async fn ensure_subscribed(&self, service: &str) -> Result<()> {
        if self.registry.is_subscribed(service) {
            return Ok(());
        }

        let event = self.registry.subscribe(service).await?;
        info!(
            service,
            providers = event.providers().count(),
            "discovered service"
        );

        let entry = RegistryEntry::consumer(
            service,
            self.config.advertise_host.clone(),
            0,
            self.config.common.application_name.clone(),
        );
        // A missing consumer entry is only a visibility problem
        match self.registry.register(entry).await {
            Ok(entry) => {
                self.consumers.insert(service.to_string(), entry);
            }
            Err(e) => warn!(service, error = %e, "failed to register consumer"),
        }
        Ok(())
    }

    /// Unregisters this client's consumer entries and closes its
    /// connections.
    pub async fn close(&self) {
        let entries: Vec<RegistryEntry> = self.consumers.iter().map(|e| e.value().clone()).collect();
        self.consumers.clear();
        for entry in entries {
            if let Err(e) = self.registry.unregister(&entry).await {
                warn!(service = %entry.service_name, error = %e, "failed to unregister consumer");
            }
        }

        self.pool.close_all().await;
        if self.owns_registry {
            self.registry.close().await;
        }
    }
}
