//! Backend CRI connections and the identifier namespacing they own.
//!
//! Every backend runtime the proxy fronts is represented by a
//! [`RuntimeClient`]: the socket address, the namespace id, a small
//! connection state machine, and the prefixing rules that map the backend's
//! flat identifier space into the proxy's. The primary backend (empty id)
//! passes identifiers through untouched; an alternate backend `X` owns the
//! `X__` id prefix and the `X/` image prefix.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tonic::transport::Channel;
use tonic::{Code, Request, Status};
use tracing::{info, warn};

use crate::criapi::image_service_client::ImageServiceClient;
use crate::criapi::runtime_service_client::RuntimeServiceClient;
use crate::criapi::{Container, Image, PodSandbox, VersionRequest};
use crate::grpc_sock;
use crate::wait;

/// Annotation a sandbox creation request carries to select an alternate
/// runtime instead of the primary.
pub const TARGET_RUNTIME_ANNOTATION: &str = "kubernetes.io/target-runtime";

/// Separator between an alternate backend's id and a sandbox/container id.
pub(crate) const ID_SEPARATOR: &str = "__";
/// Separator between an alternate backend's id and an image name.
pub(crate) const IMAGE_SEPARATOR: char = '/';

/// Errors produced while parsing and validating the backend address list.
#[derive(Debug, Error, PartialEq)]
pub enum AddressError {
    /// The address list was empty.
    #[error("no backend sockets specified to connect to")]
    NoBackends,
    /// The first backend carried an id; the primary must be unprefixed.
    #[error("the first backend must be the primary (no id)")]
    PrimaryHasId,
    /// A backend after the first one was missing an id.
    #[error("backend {0:?} must carry an id: only the first backend is the primary")]
    MissingId(String),
    /// Two backends were given the same id.
    #[error("duplicate backend id {0:?}")]
    DuplicateId(String),
    /// A backend id contained one of the namespacing separators.
    #[error("backend id {0:?} contains a reserved separator")]
    ReservedSeparator(String),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ClientState {
    Offline,
    Connecting,
    Connected,
}

#[derive(Default)]
struct ClientInner {
    state: ClientState,
    /// Present iff `state` is `Connected`.
    channel: Option<Channel>,
    /// The shared in-flight connect attempt; present iff `state` is
    /// `Connecting`. The first caller creates it and spawns the single poll
    /// task, later callers just subscribe.
    attempt: Option<watch::Receiver<bool>>,
}

impl Default for ClientState {
    fn default() -> Self {
        ClientState::Offline
    }
}

/// One backend runtime reachable over a unix socket.
pub(crate) struct RuntimeClient {
    addr: String,
    id: String,
    connect_timeout: Duration,
    inner: Mutex<ClientInner>,
}

/// Outcome handle returned by [`RuntimeClient::connect`]. Broadcast callers
/// trigger a connect and drop the handle; targeted callers block on
/// [`ConnectHandle::wait`].
pub(crate) struct ConnectHandle {
    /// `None` means the backend was already connected.
    attempt: Option<watch::Receiver<bool>>,
}

impl ConnectHandle {
    pub(crate) async fn wait(self) -> Result<(), Status> {
        let mut rx = match self.attempt {
            None => return Ok(()),
            Some(rx) => rx,
        };
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            if rx.changed().await.is_err() {
                return Err(Status::unavailable("runtime connection attempt was abandoned"));
            }
        }
    }
}

impl RuntimeClient {
    /// Builds a client from an `[id:]path` address specification. An absent
    /// id denotes the primary backend.
    pub(crate) fn new(spec: &str, connect_timeout: Duration) -> Self {
        let (id, addr) = match spec.split_once(':') {
            Some((id, addr)) => (id.to_string(), addr.to_string()),
            None => (String::new(), spec.to_string()),
        };
        RuntimeClient {
            addr,
            id,
            connect_timeout,
            inner: Mutex::new(ClientInner::default()),
        }
    }

    pub(crate) fn addr(&self) -> &str {
        &self.addr
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn is_primary(&self) -> bool {
        self.id.is_empty()
    }

    /// Name used in logs; the primary has an empty id.
    pub(crate) fn name(&self) -> &str {
        if self.is_primary() {
            "primary"
        } else {
            &self.id
        }
    }

    pub(crate) fn current_state(&self) -> ClientState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn runtime(&self) -> Option<RuntimeServiceClient<Channel>> {
        let inner = self.inner.lock().unwrap();
        inner.channel.clone().map(RuntimeServiceClient::new)
    }

    pub(crate) fn image(&self) -> Option<ImageServiceClient<Channel>> {
        let inner = self.inner.lock().unwrap();
        inner.channel.clone().map(ImageServiceClient::new)
    }

    /// Status returned when a backend that was expected to be connected has
    /// lost its channel in the meantime.
    pub(crate) fn disconnected_status(&self) -> Status {
        Status::unavailable(format!("{:?}: runtime is not connected", self.addr))
    }

    /// Starts (or joins) a connection attempt. Idempotent and non-blocking:
    /// an already connected backend yields a ready handle, a connecting one
    /// yields a handle subscribed to the in-flight attempt, and an offline
    /// one transitions to `Connecting` and spawns the poll task.
    pub(crate) fn connect(self: &Arc<Self>) -> ConnectHandle {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            ClientState::Connected => ConnectHandle { attempt: None },
            ClientState::Connecting => {
                let rx = match &inner.attempt {
                    Some(rx) => rx.clone(),
                    // Connecting implies a stored attempt; restart to recover.
                    None => self.start_attempt(&mut inner),
                };
                ConnectHandle { attempt: Some(rx) }
            }
            ClientState::Offline => {
                let rx = self.start_attempt(&mut inner);
                ConnectHandle { attempt: Some(rx) }
            }
        }
    }

    fn start_attempt(self: &Arc<Self>, inner: &mut ClientInner) -> watch::Receiver<bool> {
        let (done, rx) = watch::channel(false);
        inner.state = ClientState::Connecting;
        inner.attempt = Some(rx.clone());
        let client = Arc::clone(self);
        tokio::spawn(async move { client.run_connect(done).await });
        rx
    }

    /// The single poll task per backend. Retries until the socket answers
    /// and the liveness probe (the CRI `Version` call, bounded by
    /// `connect_timeout`) succeeds; transport or probe failures restart the
    /// loop.
    async fn run_connect(self: Arc<Self>, done: watch::Sender<bool>) {
        info!(address = %self.addr, "connecting to the runtime service");

        let slot: Arc<Mutex<Option<Channel>>> = Arc::new(Mutex::new(None));
        let probe: wait::SocketCheck = {
            let addr = self.addr.clone();
            let connect_timeout = self.connect_timeout;
            let slot = Arc::clone(&slot);
            Box::new(move || {
                let addr = addr.clone();
                let slot = Arc::clone(&slot);
                async move {
                    let channel = grpc_sock::client::socket_channel(&addr).await?;
                    let mut runtime = RuntimeServiceClient::new(channel.clone());
                    tokio::time::timeout(
                        connect_timeout,
                        runtime.version(Request::new(VersionRequest::default())),
                    )
                    .await
                    .map_err(|_| anyhow::anyhow!("timed out waiting for the Version call"))??;
                    *slot.lock().unwrap() = Some(channel);
                    Ok(())
                }
                .boxed()
            })
        };

        // With unlimited attempts this only returns once the probe passed.
        if let Err(error) = wait::wait_for_socket(&self.addr, -1, Some(probe)).await {
            warn!(address = %self.addr, %error, "connection attempt failed");
            let mut inner = self.inner.lock().unwrap();
            inner.state = ClientState::Offline;
            inner.attempt = None;
            return;
        }

        let channel = slot.lock().unwrap().take();
        let mut inner = self.inner.lock().unwrap();
        match channel {
            Some(channel) => {
                inner.channel = Some(channel);
                inner.state = ClientState::Connected;
                inner.attempt = None;
                drop(inner);
                info!(address = %self.addr, "connected to the runtime service");
                let _ = done.send(true);
            }
            None => {
                inner.state = ClientState::Offline;
                inner.attempt = None;
            }
        }
    }

    /// Drops the channel and marks the backend offline. A `Connecting`
    /// backend is left alone: its poll task already owns reconnection.
    pub(crate) fn teardown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == ClientState::Connected {
            inner.channel = None;
            inner.state = ClientState::Offline;
        }
    }

    /// Reacts to a failed backend RPC on a targeted call: an `Unavailable`
    /// transport status tears the connection down and schedules a background
    /// reconnect. The returned status always carries the backend address.
    pub(crate) fn handle_error(self: &Arc<Self>, status: Status) -> Status {
        self.reset_if_unavailable(&status);
        self.wrap_error(status)
    }

    /// Broadcast variant of [`RuntimeClient::handle_error`]: a disconnected
    /// backend yields `None`, telling the caller to drop this backend's
    /// contribution instead of failing the whole call.
    pub(crate) fn handle_broadcast_error(self: &Arc<Self>, status: Status) -> Option<Status> {
        if self.reset_if_unavailable(&status) {
            None
        } else {
            Some(self.wrap_error(status))
        }
    }

    fn reset_if_unavailable(self: &Arc<Self>, status: &Status) -> bool {
        if status.code() != Code::Unavailable {
            return false;
        }
        warn!(address = %self.addr, "runtime became unavailable, scheduling a reconnect");
        self.teardown();
        self.connect();
        true
    }

    fn wrap_error(&self, status: Status) -> Status {
        Status::new(
            status.code(),
            format!("{:?}: {}", self.addr, status.message()),
        )
    }

    pub(crate) fn augment_id(&self, id: &str) -> String {
        if self.is_primary() {
            id.to_string()
        } else {
            format!("{}{}{}", self.id, ID_SEPARATOR, id)
        }
    }

    pub(crate) fn image_name(&self, name: &str) -> String {
        if self.is_primary() {
            name.to_string()
        } else {
            format!("{}{}{}", self.id, IMAGE_SEPARATOR, name)
        }
    }

    /// Strips this backend's id prefix. The primary owns every id that no
    /// alternate claims, so it matches unconditionally.
    pub(crate) fn match_id<'a>(&self, id: &'a str) -> Option<&'a str> {
        if self.is_primary() {
            Some(id)
        } else {
            let prefix = format!("{}{}", self.id, ID_SEPARATOR);
            id.strip_prefix(prefix.as_str())
        }
    }

    /// Strips this backend's image name prefix.
    pub(crate) fn match_image<'a>(&self, image: &'a str) -> Option<&'a str> {
        if self.is_primary() {
            Some(image)
        } else {
            let prefix = format!("{}{}", self.id, IMAGE_SEPARATOR);
            image.strip_prefix(prefix.as_str())
        }
    }

    /// Whether a sandbox's routing annotation targets this backend. The
    /// primary matches only the absence of the annotation.
    pub(crate) fn annotations_match(&self, annotations: &HashMap<String, String>) -> bool {
        match annotations.get(TARGET_RUNTIME_ANNOTATION) {
            None => self.is_primary(),
            Some(target) => !self.is_primary() && target == &self.id,
        }
    }

    pub(crate) fn prefix_sandboxes(&self, sandboxes: Vec<PodSandbox>) -> Vec<PodSandbox> {
        if self.is_primary() {
            return sandboxes;
        }
        sandboxes
            .into_iter()
            .map(|mut sandbox| {
                sandbox.id = self.augment_id(&sandbox.id);
                sandbox
            })
            .collect()
    }

    pub(crate) fn prefix_container(&self, mut container: Container) -> Container {
        if self.is_primary() {
            return container;
        }
        container.id = self.augment_id(&container.id);
        container.pod_sandbox_id = self.augment_id(&container.pod_sandbox_id);
        if let Some(image) = container.image.as_mut() {
            image.image = self.image_name(&image.image);
        }
        container
    }

    pub(crate) fn prefix_containers(&self, containers: Vec<Container>) -> Vec<Container> {
        if self.is_primary() {
            return containers;
        }
        containers
            .into_iter()
            .map(|container| self.prefix_container(container))
            .collect()
    }

    pub(crate) fn prefix_image(&self, mut image: Image) -> Image {
        if self.is_primary() {
            return image;
        }
        image.id = self.image_name(&image.id);
        image.repo_tags = image
            .repo_tags
            .into_iter()
            .map(|tag| self.image_name(&tag))
            .collect();
        image
    }

    pub(crate) fn prefix_images(&self, images: Vec<Image>) -> Vec<Image> {
        if self.is_primary() {
            return images;
        }
        images
            .into_iter()
            .map(|image| self.prefix_image(image))
            .collect()
    }
}
