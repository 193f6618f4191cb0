//! A fake CRI backend for exercising the proxy over real unix sockets, plus
//! a shared journal that records which backend served which call.

use std::path::Path;
use std::sync::{Arc, Mutex};

use criproxy::criapi::image_service_server::{ImageService, ImageServiceServer};
use criproxy::criapi::runtime_service_server::{RuntimeService, RuntimeServiceServer};
use criproxy::criapi::*;
use criproxy::grpc_sock;
use tonic::{Request, Response, Status};

/// Fixed creation timestamp (nanoseconds) reported by the fake backends.
pub const CURRENT_TIME: i64 = 1_546_300_800_000_000_000;

/// Records `<backend>/<service>/<Method>` entries in the order calls arrive.
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: String) {
        self.0.lock().unwrap().push(entry);
    }

    /// Returns all entries recorded so far and clears the journal.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[derive(Default)]
struct FakeState {
    sandboxes: Vec<PodSandbox>,
    containers: Vec<Container>,
    images: Vec<Image>,
    image_size: u64,
}

/// An in-memory CRI runtime + image service. Sandbox and container ids are
/// derived from their metadata the same way everywhere, so tests can predict
/// them.
#[derive(Clone)]
pub struct FakeCriServer {
    prefix: String,
    journal: Journal,
    state: Arc<Mutex<FakeState>>,
}

impl FakeCriServer {
    pub fn new(prefix: &str, journal: Journal) -> Self {
        FakeCriServer {
            prefix: prefix.to_string(),
            journal,
            state: Arc::new(Mutex::new(FakeState::default())),
        }
    }

    pub fn set_fake_images(&self, names: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let size = state.image_size;
        state.images = names
            .iter()
            .map(|name| Image {
                id: name.to_string(),
                repo_tags: vec![name.to_string()],
                size,
                ..Default::default()
            })
            .collect();
    }

    pub fn set_fake_image_size(&self, size: u64) {
        self.state.lock().unwrap().image_size = size;
    }

    fn record(&self, suffix: &str) {
        self.journal.record(format!("{}{}", self.prefix, suffix));
    }
}

/// Binds the backend's socket and serves it in a background task. The bind
/// happens before the task is spawned, so the socket exists when this
/// returns.
pub fn start_backend(server: &FakeCriServer, path: &Path) -> tokio::task::JoinHandle<()> {
    let socket = grpc_sock::server::Socket::new(&path).expect("failed to bind fake backend socket");
    let server = server.clone();
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RuntimeServiceServer::new(server.clone()))
            .add_service(ImageServiceServer::new(server))
            .serve_with_incoming(socket)
            .await
            .expect("fake backend server failed");
    })
}

#[tonic::async_trait]
impl RuntimeService for FakeCriServer {
    async fn version(
        &self,
        _request: Request<VersionRequest>,
    ) -> Result<Response<VersionResponse>, Status> {
        self.record("runtime/Version");
        Ok(Response::new(VersionResponse {
            version: "0.1.0".to_string(),
            runtime_name: "fakeRuntime".to_string(),
            runtime_version: "0.1.0".to_string(),
            runtime_api_version: "0.1.0".to_string(),
        }))
    }

    async fn run_pod_sandbox(
        &self,
        request: Request<RunPodSandboxRequest>,
    ) -> Result<Response<RunPodSandboxResponse>, Status> {
        self.record("runtime/RunPodSandbox");
        let config = request
            .into_inner()
            .config
            .ok_or_else(|| Status::invalid_argument("no sandbox config"))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| Status::invalid_argument("no sandbox metadata"))?;
        let id = format!(
            "{}_{}_{}_{}",
            metadata.name, metadata.namespace, metadata.uid, metadata.attempt
        );
        self.state.lock().unwrap().sandboxes.push(PodSandbox {
            id: id.clone(),
            metadata: Some(metadata),
            state: PodSandboxState::SandboxReady as i32,
            created_at: CURRENT_TIME,
            labels: config.labels,
            annotations: config.annotations,
        });
        Ok(Response::new(RunPodSandboxResponse { pod_sandbox_id: id }))
    }

    async fn stop_pod_sandbox(
        &self,
        request: Request<StopPodSandboxRequest>,
    ) -> Result<Response<StopPodSandboxResponse>, Status> {
        self.record("runtime/StopPodSandbox");
        let id = request.into_inner().pod_sandbox_id;
        let mut state = self.state.lock().unwrap();
        let sandbox = state
            .sandboxes
            .iter_mut()
            .find(|sandbox| sandbox.id == id)
            .ok_or_else(|| Status::not_found(format!("sandbox {:?} not found", id)))?;
        sandbox.state = PodSandboxState::SandboxNotready as i32;
        Ok(Response::new(StopPodSandboxResponse {}))
    }

    async fn remove_pod_sandbox(
        &self,
        request: Request<RemovePodSandboxRequest>,
    ) -> Result<Response<RemovePodSandboxResponse>, Status> {
        self.record("runtime/RemovePodSandbox");
        let id = request.into_inner().pod_sandbox_id;
        let mut state = self.state.lock().unwrap();
        state.sandboxes.retain(|sandbox| sandbox.id != id);
        state.containers.retain(|container| container.pod_sandbox_id != id);
        Ok(Response::new(RemovePodSandboxResponse {}))
    }

    async fn pod_sandbox_status(
        &self,
        request: Request<PodSandboxStatusRequest>,
    ) -> Result<Response<PodSandboxStatusResponse>, Status> {
        self.record("runtime/PodSandboxStatus");
        let id = request.into_inner().pod_sandbox_id;
        let state = self.state.lock().unwrap();
        let sandbox = state
            .sandboxes
            .iter()
            .find(|sandbox| sandbox.id == id)
            .ok_or_else(|| Status::not_found(format!("sandbox {:?} not found", id)))?;
        Ok(Response::new(PodSandboxStatusResponse {
            status: Some(PodSandboxStatus {
                id: sandbox.id.clone(),
                metadata: sandbox.metadata.clone(),
                state: sandbox.state,
                created_at: sandbox.created_at,
                network: Some(PodSandboxNetworkStatus {
                    ip: "192.168.192.168".to_string(),
                }),
                labels: sandbox.labels.clone(),
                annotations: sandbox.annotations.clone(),
            }),
            ..Default::default()
        }))
    }

    async fn list_pod_sandbox(
        &self,
        request: Request<ListPodSandboxRequest>,
    ) -> Result<Response<ListPodSandboxResponse>, Status> {
        self.record("runtime/ListPodSandbox");
        let filter = request.into_inner().filter;
        let state = self.state.lock().unwrap();
        let items = state
            .sandboxes
            .iter()
            .filter(|sandbox| match &filter {
                None => true,
                Some(filter) => {
                    (filter.id.is_empty() || filter.id == sandbox.id)
                        && filter
                            .state
                            .as_ref()
                            .map_or(true, |state| state.state == sandbox.state)
                }
            })
            .cloned()
            .collect();
        Ok(Response::new(ListPodSandboxResponse { items }))
    }

    async fn create_container(
        &self,
        request: Request<CreateContainerRequest>,
    ) -> Result<Response<CreateContainerResponse>, Status> {
        self.record("runtime/CreateContainer");
        let inner = request.into_inner();
        let config = inner
            .config
            .ok_or_else(|| Status::invalid_argument("no container config"))?;
        let metadata = config
            .metadata
            .clone()
            .ok_or_else(|| Status::invalid_argument("no container metadata"))?;
        let id = format!("{}_{}_{}", inner.pod_sandbox_id, metadata.name, metadata.attempt);
        let image = config.image.clone().unwrap_or_default();
        self.state.lock().unwrap().containers.push(Container {
            id: id.clone(),
            pod_sandbox_id: inner.pod_sandbox_id,
            metadata: Some(metadata),
            image: Some(image.clone()),
            image_ref: image.image,
            state: ContainerState::ContainerCreated as i32,
            created_at: CURRENT_TIME,
            labels: config.labels,
            annotations: config.annotations,
        });
        Ok(Response::new(CreateContainerResponse { container_id: id }))
    }

    async fn start_container(
        &self,
        request: Request<StartContainerRequest>,
    ) -> Result<Response<StartContainerResponse>, Status> {
        self.record("runtime/StartContainer");
        let id = request.into_inner().container_id;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
            .ok_or_else(|| Status::not_found(format!("container {:?} not found", id)))?;
        container.state = ContainerState::ContainerRunning as i32;
        Ok(Response::new(StartContainerResponse {}))
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<StopContainerResponse>, Status> {
        self.record("runtime/StopContainer");
        let id = request.into_inner().container_id;
        let mut state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter_mut()
            .find(|container| container.id == id)
            .ok_or_else(|| Status::not_found(format!("container {:?} not found", id)))?;
        container.state = ContainerState::ContainerExited as i32;
        Ok(Response::new(StopContainerResponse {}))
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<RemoveContainerResponse>, Status> {
        self.record("runtime/RemoveContainer");
        let id = request.into_inner().container_id;
        let mut state = self.state.lock().unwrap();
        state.containers.retain(|container| container.id != id);
        Ok(Response::new(RemoveContainerResponse {}))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        self.record("runtime/ListContainers");
        let filter = request.into_inner().filter;
        let state = self.state.lock().unwrap();
        let containers = state
            .containers
            .iter()
            .filter(|container| match &filter {
                None => true,
                Some(filter) => {
                    (filter.id.is_empty() || filter.id == container.id)
                        && (filter.pod_sandbox_id.is_empty()
                            || filter.pod_sandbox_id == container.pod_sandbox_id)
                        && filter
                            .state
                            .as_ref()
                            .map_or(true, |state| state.state == container.state)
                }
            })
            .cloned()
            .collect();
        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn container_status(
        &self,
        request: Request<ContainerStatusRequest>,
    ) -> Result<Response<ContainerStatusResponse>, Status> {
        self.record("runtime/ContainerStatus");
        let id = request.into_inner().container_id;
        let state = self.state.lock().unwrap();
        let container = state
            .containers
            .iter()
            .find(|container| container.id == id)
            .ok_or_else(|| Status::not_found(format!("container {:?} not found", id)))?;
        Ok(Response::new(ContainerStatusResponse {
            status: Some(ContainerStatus {
                id: container.id.clone(),
                metadata: container.metadata.clone(),
                state: container.state,
                created_at: container.created_at,
                image: container.image.clone(),
                image_ref: container.image_ref.clone(),
                labels: container.labels.clone(),
                annotations: container.annotations.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    async fn update_container_resources(
        &self,
        _request: Request<UpdateContainerResourcesRequest>,
    ) -> Result<Response<UpdateContainerResourcesResponse>, Status> {
        self.record("runtime/UpdateContainerResources");
        Ok(Response::new(UpdateContainerResourcesResponse {}))
    }

    async fn reopen_container_log(
        &self,
        _request: Request<ReopenContainerLogRequest>,
    ) -> Result<Response<ReopenContainerLogResponse>, Status> {
        self.record("runtime/ReopenContainerLog");
        Ok(Response::new(ReopenContainerLogResponse {}))
    }

    async fn exec_sync(
        &self,
        _request: Request<ExecSyncRequest>,
    ) -> Result<Response<ExecSyncResponse>, Status> {
        self.record("runtime/ExecSync");
        Ok(Response::new(ExecSyncResponse {
            exit_code: 0,
            ..Default::default()
        }))
    }

    async fn exec(&self, _request: Request<ExecRequest>) -> Result<Response<ExecResponse>, Status> {
        self.record("runtime/Exec");
        Ok(Response::new(ExecResponse::default()))
    }

    async fn attach(
        &self,
        _request: Request<AttachRequest>,
    ) -> Result<Response<AttachResponse>, Status> {
        self.record("runtime/Attach");
        Ok(Response::new(AttachResponse::default()))
    }

    async fn port_forward(
        &self,
        _request: Request<PortForwardRequest>,
    ) -> Result<Response<PortForwardResponse>, Status> {
        self.record("runtime/PortForward");
        Ok(Response::new(PortForwardResponse::default()))
    }

    async fn container_stats(
        &self,
        _request: Request<ContainerStatsRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        self.record("runtime/ContainerStats");
        Ok(Response::new(ContainerStatsResponse::default()))
    }

    async fn list_container_stats(
        &self,
        _request: Request<ListContainerStatsRequest>,
    ) -> Result<Response<ListContainerStatsResponse>, Status> {
        self.record("runtime/ListContainerStats");
        Ok(Response::new(ListContainerStatsResponse::default()))
    }

    async fn update_runtime_config(
        &self,
        _request: Request<UpdateRuntimeConfigRequest>,
    ) -> Result<Response<UpdateRuntimeConfigResponse>, Status> {
        self.record("runtime/UpdateRuntimeConfig");
        Ok(Response::new(UpdateRuntimeConfigResponse {}))
    }

    async fn status(
        &self,
        _request: Request<StatusRequest>,
    ) -> Result<Response<StatusResponse>, Status> {
        self.record("runtime/Status");
        Ok(Response::new(StatusResponse {
            status: Some(RuntimeStatus {
                conditions: vec![
                    RuntimeCondition {
                        r#type: "RuntimeReady".to_string(),
                        status: true,
                        ..Default::default()
                    },
                    RuntimeCondition {
                        r#type: "NetworkReady".to_string(),
                        status: true,
                        ..Default::default()
                    },
                ],
            }),
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl ImageService for FakeCriServer {
    async fn list_images(
        &self,
        request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        self.record("image/ListImages");
        let filter = request.into_inner().filter;
        let name = filter
            .and_then(|filter| filter.image)
            .map(|spec| spec.image)
            .unwrap_or_default();
        let state = self.state.lock().unwrap();
        let images = state
            .images
            .iter()
            .filter(|image| {
                name.is_empty() || image.id == name || image.repo_tags.contains(&name)
            })
            .cloned()
            .collect();
        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn image_status(
        &self,
        request: Request<ImageStatusRequest>,
    ) -> Result<Response<ImageStatusResponse>, Status> {
        self.record("image/ImageStatus");
        let name = request
            .into_inner()
            .image
            .map(|spec| spec.image)
            .unwrap_or_default();
        let state = self.state.lock().unwrap();
        let image = state
            .images
            .iter()
            .find(|image| image.id == name || image.repo_tags.contains(&name))
            .cloned();
        Ok(Response::new(ImageStatusResponse {
            image,
            ..Default::default()
        }))
    }

    async fn pull_image(
        &self,
        request: Request<PullImageRequest>,
    ) -> Result<Response<PullImageResponse>, Status> {
        self.record("image/PullImage");
        let name = request
            .into_inner()
            .image
            .map(|spec| spec.image)
            .unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        let size = state.image_size;
        if !state.images.iter().any(|image| image.id == name) {
            state.images.push(Image {
                id: name.clone(),
                repo_tags: vec![name.clone()],
                size,
                ..Default::default()
            });
        }
        Ok(Response::new(PullImageResponse { image_ref: name }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<RemoveImageResponse>, Status> {
        self.record("image/RemoveImage");
        let name = request
            .into_inner()
            .image
            .map(|spec| spec.image)
            .unwrap_or_default();
        let mut state = self.state.lock().unwrap();
        state
            .images
            .retain(|image| image.id != name && !image.repo_tags.contains(&name));
        Ok(Response::new(RemoveImageResponse {}))
    }

    async fn image_fs_info(
        &self,
        _request: Request<ImageFsInfoRequest>,
    ) -> Result<Response<ImageFsInfoResponse>, Status> {
        self.record("image/ImageFsInfo");
        Ok(Response::new(ImageFsInfoResponse::default()))
    }
}
