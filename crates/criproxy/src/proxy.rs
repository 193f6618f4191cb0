//! The CRI multiplexing dispatcher.
//!
//! [`RuntimeProxy`] serves `RuntimeService` and `ImageService` on one unix
//! socket and fans the calls out to its backends. Targeted calls resolve to
//! exactly one backend by id, image name, or sandbox annotation; list-style
//! calls are broadcast to every connected backend and the results are merged
//! in backend order, with each backend's identifiers re-prefixed on the way
//! out.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::client::{AddressError, ClientState, RuntimeClient, ID_SEPARATOR, IMAGE_SEPARATOR};
use crate::criapi::image_service_server::{ImageService, ImageServiceServer};
use crate::criapi::runtime_service_server::{RuntimeService, RuntimeServiceServer};
use crate::criapi::*;
use crate::grpc_sock;

/// Hook invoked once per inbound RPC before it is dispatched. It runs on the
/// request hot path and must not block materially; embedding processes use it
/// for one-time side effects such as post-startup cleanup.
pub type RequestHook = Arc<dyn Fn() + Send + Sync>;

struct Shared {
    /// Ordered backends; the first one is the primary. Immutable after
    /// construction, only the contents of each client change.
    clients: Vec<Arc<RuntimeClient>>,
    hook: Option<RequestHook>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

/// The CRI multiplexing proxy. Cheap to clone; all clones share the same
/// backend connections and shutdown signal.
#[derive(Clone)]
pub struct RuntimeProxy {
    shared: Arc<Shared>,
}

impl RuntimeProxy {
    /// Builds a proxy from an ordered list of `[id:]path` backend socket
    /// specifications. The first entry must have no id (the primary); every
    /// other entry needs a distinct id free of the `__` and `/` separators.
    pub fn new(
        addrs: &[String],
        connect_timeout: Duration,
        hook: Option<RequestHook>,
    ) -> Result<Self, AddressError> {
        if addrs.is_empty() {
            return Err(AddressError::NoBackends);
        }
        let clients: Vec<Arc<RuntimeClient>> = addrs
            .iter()
            .map(|spec| Arc::new(RuntimeClient::new(spec, connect_timeout)))
            .collect();
        if !clients[0].is_primary() {
            return Err(AddressError::PrimaryHasId);
        }
        let mut seen = HashSet::new();
        for client in &clients[1..] {
            if client.is_primary() {
                return Err(AddressError::MissingId(client.addr().to_string()));
            }
            if client.id().contains(ID_SEPARATOR) || client.id().contains(IMAGE_SEPARATOR) {
                return Err(AddressError::ReservedSeparator(client.id().to_string()));
            }
            if !seen.insert(client.id().to_string()) {
                return Err(AddressError::DuplicateId(client.id().to_string()));
            }
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(RuntimeProxy {
            shared: Arc::new(Shared {
                clients,
                hook,
                shutdown_tx,
                shutdown_rx,
            }),
        })
    }

    /// Binds the proxy's CRI socket and serves until [`RuntimeProxy::stop`]
    /// is called. A stale socket file at `path` is removed first. When
    /// `ready` is given it is signaled right after the socket is bound,
    /// which test harnesses use to avoid startup races.
    pub async fn serve<P: AsRef<Path>>(
        &self,
        path: P,
        ready: Option<oneshot::Sender<()>>,
    ) -> anyhow::Result<()> {
        let path = path.as_ref();
        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }
        let socket = grpc_sock::server::Socket::new(&path)?;

        let runtime =
            RuntimeServiceServer::with_interceptor(self.clone(), self.request_interceptor());
        let image = ImageServiceServer::with_interceptor(self.clone(), self.request_interceptor());

        if let Some(ready) = ready {
            let _ = ready.send(());
        }

        let mut shutdown = self.shared.shutdown_rx.clone();
        info!(socket = %path.display(), "serving the CRI");
        Server::builder()
            .add_service(runtime)
            .add_service(image)
            .serve_with_incoming_shutdown(socket, async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await?;
        Ok(())
    }

    /// Gracefully drains the gRPC server and tears down every backend
    /// connection.
    pub fn stop(&self) {
        info!("stopping the CRI proxy");
        let _ = self.shared.shutdown_tx.send(true);
        for client in &self.shared.clients {
            client.teardown();
        }
    }

    /// The per-request interceptor invoking the optional hook. It runs once
    /// per inbound RPC, before the request is dispatched.
    fn request_interceptor(&self) -> tonic::Interceptor {
        let hook = self.shared.hook.clone();
        tonic::Interceptor::new(move |request: Request<()>| {
            if let Some(hook) = &hook {
                hook();
            }
            Ok(request)
        })
    }

    /// The primary backend, blocking until it is connected.
    async fn primary_client(&self) -> Result<Arc<RuntimeClient>, Status> {
        let primary = &self.shared.clients[0];
        primary.connect().wait().await?;
        Ok(Arc::clone(primary))
    }

    /// Resolves a (possibly prefixed) sandbox/container id to its backend
    /// and the unprefixed id. A matching alternate must already be
    /// connected: the connect attempt is triggered but not waited for, so a
    /// call addressed to a runtime that never came up fails fast instead of
    /// hanging. Ids matching no alternate belong to the primary, which is
    /// waited for.
    async fn client_for_id(&self, id: &str) -> Result<(Arc<RuntimeClient>, String), Status> {
        for client in &self.shared.clients[1..] {
            if let Some(unprefixed) = client.match_id(id) {
                let unprefixed = unprefixed.to_string();
                client.connect();
                if client.current_state() != ClientState::Connected {
                    return Err(Status::unavailable(format!(
                        "target runtime is not available: {:?}",
                        client.addr()
                    )));
                }
                return Ok((Arc::clone(client), unprefixed));
            }
        }
        let primary = self.primary_client().await?;
        Ok((primary, id.to_string()))
    }

    /// Resolves a (possibly prefixed) image name. In lenient mode, used by
    /// read-style image queries, a matching alternate that is not connected
    /// yields `Ok(None)` so the caller can report the image as absent
    /// instead of failing.
    async fn client_for_image(
        &self,
        image: &str,
        lenient: bool,
    ) -> Result<Option<(Arc<RuntimeClient>, String)>, Status> {
        for client in &self.shared.clients[1..] {
            if let Some(unprefixed) = client.match_image(image) {
                let unprefixed = unprefixed.to_string();
                client.connect();
                if client.current_state() != ClientState::Connected {
                    if lenient {
                        return Ok(None);
                    }
                    return Err(Status::unavailable(format!(
                        "target runtime is not available: {:?}",
                        client.addr()
                    )));
                }
                return Ok(Some((Arc::clone(client), unprefixed)));
            }
        }
        let primary = self.primary_client().await?;
        Ok(Some((primary, image.to_string())))
    }

    async fn client_for_image_strict(
        &self,
        image: &str,
    ) -> Result<(Arc<RuntimeClient>, String), Status> {
        match self.client_for_image(image, false).await? {
            Some(resolved) => Ok(resolved),
            // The non-lenient mode never yields the no-client sentinel.
            None => Err(Status::internal("image resolver returned no client")),
        }
    }

    /// Resolves a sandbox's routing annotation to a backend, blocking until
    /// that backend is connected. An annotation naming no known backend is a
    /// hard error.
    async fn client_for_annotations(
        &self,
        annotations: &std::collections::HashMap<String, String>,
    ) -> Result<Arc<RuntimeClient>, Status> {
        for client in &self.shared.clients {
            if client.annotations_match(annotations) {
                client.connect().wait().await?;
                return Ok(Arc::clone(client));
            }
        }
        let target = annotations
            .get(crate::client::TARGET_RUNTIME_ANNOTATION)
            .map(String::as_str)
            .unwrap_or_default();
        Err(Status::invalid_argument(format!(
            "unknown runtime: {:?}",
            target
        )))
    }

    /// The backends a broadcast call should contact right now: connected
    /// ones are returned, offline ones get a connect nudge and are skipped
    /// for this call (they will show up in a later one).
    fn connected_clients(&self, clients: &[Arc<RuntimeClient>]) -> Vec<Arc<RuntimeClient>> {
        let mut connected = Vec::new();
        for client in clients {
            if client.current_state() == ClientState::Connected {
                connected.push(Arc::clone(client));
            } else {
                client.connect();
            }
        }
        connected
    }
}

#[tonic::async_trait]
impl RuntimeService for RuntimeProxy {
    async fn version(
        &self,
        request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        let client = self.primary_client().await?;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .version(Request::new(request.into_inner()))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        let inner = request.into_inner();
        let annotations = match &inner.config {
            Some(config) => config.annotations.clone(),
            None => return Err(Status::invalid_argument("no sandbox config")),
        };
        let client = self.client_for_annotations(&annotations).await?;
        debug!(runtime = client.name(), "RunPodSandbox");
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let mut resp = runtime
            .run_pod_sandbox(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?
            .into_inner();
        resp.pod_sandbox_id = client.augment_id(&resp.pod_sandbox_id);
        Ok(Response::new(resp))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.pod_sandbox_id).await?;
        debug!(runtime = client.name(), sandbox = %unprefixed, "StopPodSandbox");
        inner.pod_sandbox_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .stop_pod_sandbox(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.pod_sandbox_id).await?;
        debug!(runtime = client.name(), sandbox = %unprefixed, "RemovePodSandbox");
        inner.pod_sandbox_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .remove_pod_sandbox(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.pod_sandbox_id).await?;
        inner.pod_sandbox_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let mut resp = runtime
            .pod_sandbox_status(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?
            .into_inner();
        if let Some(status) = resp.status.as_mut() {
            status.id = client.augment_id(&status.id);
        }
        Ok(Response::new(resp))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        let mut inner = request.into_inner();
        let mut clients = self.shared.clients.clone();
        if let Some(filter) = inner.filter.as_mut() {
            if !filter.id.is_empty() {
                let (client, unprefixed) = self.client_for_id(&filter.id).await?;
                filter.id = unprefixed;
                clients = vec![client];
            }
        }

        let mut items = Vec::new();
        for client in self.connected_clients(&clients) {
            let mut runtime = match client.runtime() {
                Some(runtime) => runtime,
                None => continue,
            };
            match runtime.list_pod_sandbox(Request::new(inner.clone())).await {
                Ok(resp) => items.extend(client.prefix_sandboxes(resp.into_inner().items)),
                Err(status) => {
                    if let Some(status) = client.handle_broadcast_error(status) {
                        return Err(status);
                    }
                }
            }
        }
        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed_sandbox) = self.client_for_id(&inner.pod_sandbox_id).await?;
        inner.pod_sandbox_id = unprefixed_sandbox;

        let image_name = match &inner.config {
            Some(config) => config
                .image
                .as_ref()
                .map(|spec| spec.image.clone())
                .unwrap_or_default(),
            None => return Err(Status::invalid_argument("no container config")),
        };
        let (image_client, unprefixed_image) = self.client_for_image_strict(&image_name).await?;
        if !Arc::ptr_eq(&client, &image_client) {
            return Err(Status::invalid_argument(format!(
                "image {:?} is for a wrong runtime",
                image_name
            )));
        }
        if let Some(config) = inner.config.as_mut() {
            if let Some(spec) = config.image.as_mut() {
                spec.image = unprefixed_image;
            }
        }

        debug!(runtime = client.name(), sandbox = %inner.pod_sandbox_id, "CreateContainer");
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let mut resp = runtime
            .create_container(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?
            .into_inner();
        resp.container_id = client.augment_id(&resp.container_id);
        Ok(Response::new(resp))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        debug!(runtime = client.name(), container = %unprefixed, "StartContainer");
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .start_container(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        debug!(runtime = client.name(), container = %unprefixed, "StopContainer");
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .stop_container(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        debug!(runtime = client.name(), container = %unprefixed, "RemoveContainer");
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .remove_container(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let mut inner = request.into_inner();
        let mut clients = self.shared.clients.clone();
        if let Some(filter) = inner.filter.as_mut() {
            let mut single: Option<Arc<RuntimeClient>> = None;
            if !filter.id.is_empty() {
                let (client, unprefixed) = self.client_for_id(&filter.id).await?;
                filter.id = unprefixed;
                single = Some(client);
            }
            if !filter.pod_sandbox_id.is_empty() {
                let (client, unprefixed) = self.client_for_id(&filter.pod_sandbox_id).await?;
                filter.pod_sandbox_id = unprefixed;
                match &single {
                    None => single = Some(client),
                    Some(existing) if !Arc::ptr_eq(existing, &client) => {
                        // The id and the sandbox id belong to different
                        // runtimes; nothing can match.
                        return Ok(Response::new(ListContainersResponse::default()));
                    }
                    Some(_) => {}
                }
            }
            if let Some(client) = single {
                clients = vec![client];
            }
        }

        let mut containers = Vec::new();
        for client in self.connected_clients(&clients) {
            let mut runtime = match client.runtime() {
                Some(runtime) => runtime,
                None => continue,
            };
            match runtime.list_containers(Request::new(inner.clone())).await {
                Ok(resp) => {
                    containers.extend(client.prefix_containers(resp.into_inner().containers))
                }
                Err(status) => {
                    if let Some(status) = client.handle_broadcast_error(status) {
                        return Err(status);
                    }
                }
            }
        }
        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let mut resp = runtime
            .container_status(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?
            .into_inner();
        if let Some(status) = resp.status.as_mut() {
            status.id = client.augment_id(&status.id);
            if let Some(image) = status.image.as_mut() {
                image.image = client.image_name(&image.image);
            }
        }
        Ok(Response::new(resp))
    }

    async fn update_container_resources(
        &self,
        request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .update_container_resources(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn reopen_container_log(
        &self,
        request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .reopen_container_log(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn exec_sync(
        &self,
        request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .exec_sync(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn exec(&self, request: Request<ExecRequest>) -> Result<Response<ExecResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .exec(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn attach(
        &self,
        request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.container_id).await?;
        inner.container_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .attach(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn port_forward(
        &self,
        request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        let mut inner = request.into_inner();
        let (client, unprefixed) = self.client_for_id(&inner.pod_sandbox_id).await?;
        inner.pod_sandbox_id = unprefixed;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .port_forward(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    // Stats are only gathered from the primary runtime for now; merging
    // per-backend stats into one response is an open limitation.
    async fn container_stats(
        &self,
        request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        let client = self.primary_client().await?;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .container_stats(Request::new(request.into_inner()))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn list_container_stats(
        &self,
        request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        let client = self.primary_client().await?;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .list_container_stats(Request::new(request.into_inner()))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn update_runtime_config(
        &self,
        request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        let inner = request.into_inner();
        for client in self.connected_clients(&self.shared.clients) {
            let mut runtime = match client.runtime() {
                Some(runtime) => runtime,
                None => continue,
            };
            if let Err(status) = runtime
                .update_runtime_config(Request::new(inner.clone()))
                .await
            {
                if let Some(status) = client.handle_broadcast_error(status) {
                    return Err(status);
                }
            }
        }
        Ok(Response::new(UpdateRuntimeConfigResponse::default()))
    }

    async fn status(
        &self,
        request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        let client = self.primary_client().await?;
        let mut runtime = client
            .runtime()
            .ok_or_else(|| client.disconnected_status())?;
        let resp = runtime
            .status(Request::new(request.into_inner()))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }
}

#[tonic::async_trait]
impl ImageService for RuntimeProxy {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let mut inner = request.into_inner();
        let mut clients = self.shared.clients.clone();
        if let Some(filter) = inner.filter.as_mut() {
            let name = filter
                .image
                .as_ref()
                .map(|spec| spec.image.clone())
                .unwrap_or_default();
            if !name.is_empty() {
                match self.client_for_image(&name, true).await? {
                    // The owning runtime is not up; the image cannot exist yet.
                    None => return Ok(Response::new(ListImagesResponse::default())),
                    Some((client, unprefixed)) => {
                        if let Some(spec) = filter.image.as_mut() {
                            spec.image = unprefixed;
                        }
                        clients = vec![client];
                    }
                }
            }
        }

        let mut images = Vec::new();
        for client in self.connected_clients(&clients) {
            let mut image = match client.image() {
                Some(image) => image,
                None => continue,
            };
            match image.list_images(Request::new(inner.clone())).await {
                Ok(resp) => images.extend(client.prefix_images(resp.into_inner().images)),
                Err(status) => {
                    if let Some(status) = client.handle_broadcast_error(status) {
                        return Err(status);
                    }
                }
            }
        }
        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        let mut inner = request.into_inner();
        let name = inner
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .unwrap_or_default();
        let (client, unprefixed) = match self.client_for_image(&name, true).await? {
            // The owning runtime is not up; report the image as absent.
            None => return Ok(Response::new(ImageStatusResponse::default())),
            Some(resolved) => resolved,
        };
        if let Some(spec) = inner.image.as_mut() {
            spec.image = unprefixed;
        }
        let mut image = client.image().ok_or_else(|| client.disconnected_status())?;
        let mut resp = image
            .image_status(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?
            .into_inner();
        if let Some(found) = resp.image.take() {
            resp.image = Some(client.prefix_image(found));
        }
        Ok(Response::new(resp))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        let mut inner = request.into_inner();
        let name = inner
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .unwrap_or_default();
        let (client, unprefixed) = self.client_for_image_strict(&name).await?;
        debug!(runtime = client.name(), image = %unprefixed, "PullImage");
        if let Some(spec) = inner.image.as_mut() {
            spec.image = unprefixed;
        }
        let mut image = client.image().ok_or_else(|| client.disconnected_status())?;
        let resp = image
            .pull_image(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        let mut inner = request.into_inner();
        let name = inner
            .image
            .as_ref()
            .map(|spec| spec.image.clone())
            .unwrap_or_default();
        let (client, unprefixed) = self.client_for_image_strict(&name).await?;
        debug!(runtime = client.name(), image = %unprefixed, "RemoveImage");
        if let Some(spec) = inner.image.as_mut() {
            spec.image = unprefixed;
        }
        let mut image = client.image().ok_or_else(|| client.disconnected_status())?;
        let resp = image
            .remove_image(Request::new(inner))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }

    async fn image_fs_info(
        &self,
        request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        let client = self.primary_client().await?;
        let mut image = client.image().ok_or_else(|| client.disconnected_status())?;
        let resp = image
            .image_fs_info(Request::new(request.into_inner()))
            .await
            .map_err(|status| client.handle_error(status))?;
        Ok(Response::new(resp.into_inner()))
    }
}
