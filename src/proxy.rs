use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::config::{Config, TargetConfig};
use crate::pipeline::{
    ChannelInitializer, ConnectionContext, Flow, InitializerHolder, Message, Pipeline, Stage,
};
use crate::protocol::{DECODER_STAGE, MinecraftDecoder, Packet, read_frame};
use crate::security::{is_ip_listed, validate_ip_list};

pub const BUFFER_SIZE: usize = 8192;
pub const HANDLER_STAGE: &str = "handler";

/// Chooses a backend for each connection from its handshake hostname.
#[derive(Debug, Default)]
pub struct Router {
    targets: HashMap<String, TargetConfig>,
    fallback: Option<TargetConfig>,
    banned_ips: Option<Vec<String>>,
}

impl Router {
    /// Target keys are matched case-insensitively.
    #[must_use]
    pub fn new(targets: HashMap<String, TargetConfig>) -> Self {
        Self {
            targets: targets
                .into_iter()
                .map(|(host, target)| (routing_key(&host), target))
                .collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_fallback(mut self, fallback: TargetConfig) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_banned_ips(mut self, banned_ips: Vec<String>) -> Result<Self> {
        validate_ip_list(Some(banned_ips.as_slice()))?;
        self.banned_ips = Some(banned_ips);
        Ok(self)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let mut router = Self::new(config.targets.clone());
        if let Some(name) = &config.listen.fallback {
            let fallback = config
                .targets
                .get(name)
                .ok_or_else(|| anyhow!("Fallback target {name:?} is not defined in [targets]"))?;
            router = router.with_fallback(fallback.clone());
        }
        if let Some(banned) = &config.banned_ips {
            router = router.with_banned_ips(banned.clone())?;
        }
        Ok(router)
    }

    /// Legacy pings carry no hostname and always use the fallback.
    #[must_use]
    pub fn route(&self, hostname: Option<&str>) -> Option<&TargetConfig> {
        hostname
            .and_then(|host| self.targets.get(&routing_key(host)))
            .or(self.fallback.as_ref())
    }

    pub fn is_banned(&self, ip: IpAddr) -> Result<bool> {
        Ok(is_ip_listed(ip, self.banned_ips.as_deref())?.unwrap_or(false))
    }
}

/// Lowercased hostname without mod-loader markers or a trailing dot.
fn routing_key(server_address: &str) -> String {
    server_address
        .split('\0')
        .next()
        .unwrap_or_default()
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

/// Application logic of the host: bans and backend selection.
pub struct RoutingHandler {
    router: Arc<Router>,
}

impl RoutingHandler {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

impl Stage for RoutingHandler {
    fn read(&mut self, ctx: &mut ConnectionContext, message: Message) -> Result<Flow> {
        if ctx.target().is_some() {
            return Ok(Flow::Forward(message));
        }
        let host = match &message {
            Message::Packet(Packet::Handshake(handshake)) => Some(handshake.server_address.clone()),
            Message::Packet(Packet::LegacyPing(_)) => None,
            _ => {
                warn!(client_ip = %ctx.remote_addr(), "Expected a handshake as the first packet");
                return Ok(Flow::Close);
            }
        };

        let client_ip = ctx.remote_addr().ip();
        if self.router.is_banned(client_ip)? {
            warn!(client_ip = %client_ip, "Refused banned client");
            return Ok(Flow::Close);
        }

        let Some(target) = self.router.route(host.as_deref()) else {
            warn!(
                client_ip = %client_ip,
                host = ?host.as_deref().map(routing_key),
                "No target configured for host"
            );
            return Ok(Flow::Close);
        };

        info!(
            host = ?host.as_deref().map(routing_key),
            target_host = %target.host,
            target_port = target.port,
            client_ip = %ctx.remote_addr(),
            direct_addr = %ctx.transport_addr(),
            "Routing request"
        );
        ctx.set_target(target.clone());
        Ok(Flow::Forward(message))
    }
}

/// The host's own per-connection setup: decode, then route.
pub struct HostInitializer {
    router: Arc<Router>,
}

impl HostInitializer {
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

impl ChannelInitializer for HostInitializer {
    fn init_channel(&self, pipeline: &mut Pipeline) -> Result<()> {
        pipeline.add_last(DECODER_STAGE, Box::<MinecraftDecoder>::default())?;
        pipeline.add_last(
            HANDLER_STAGE,
            Box::new(RoutingHandler::new(self.router.clone())),
        )?;
        Ok(())
    }
}

/// Shared state of the accept loop.
pub struct Server {
    pub initializer: InitializerHolder,
    pub allowed_relay_ips: Option<Vec<String>>,
}

impl Server {
    pub fn new(
        initializer: InitializerHolder,
        allowed_relay_ips: Option<Vec<String>>,
    ) -> Result<Self> {
        validate_ip_list(allowed_relay_ips.as_deref())?;
        Ok(Self {
            initializer,
            allowed_relay_ips,
        })
    }
}

/// Pause after an accept error that is not tied to a single connection,
/// such as running out of file descriptors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

fn accept_error_backoff(e: &io::Error) -> Option<Duration> {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted => None,
        _ => Some(ACCEPT_ERROR_BACKOFF),
    }
}

/// Accepts connections until the task is dropped. Accept errors are logged
/// and never end the loop.
pub async fn serve(listener: TcpListener, server: Arc<Server>) -> Result<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                if let Some(backoff) = accept_error_backoff(&e) {
                    sleep(backoff).await;
                }
                continue;
            }
        };

        match is_ip_listed(addr.ip(), server.allowed_relay_ips.as_deref()) {
            Ok(Some(false)) => {
                warn!(client_addr = %addr, "Rejected connection from address not in allowed_relay_ips");
                continue;
            }
            Err(e) => {
                error!(client_addr = %addr, error = %e, "Failed to check relay address");
                continue;
            }
            Ok(_) => {}
        }

        let initializer = server.initializer.get();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, addr, initializer).await {
                error!(client_addr = %addr, error = %e, "Connection failed");
            }
        });
    }
}

/// Runs the opening frame through the connection's pipeline, then relays
/// the connection to the selected backend.
#[tracing::instrument(skip_all, fields(client_addr = %transport_addr))]
pub async fn handle_connection(
    mut stream: TcpStream,
    transport_addr: SocketAddr,
    initializer: Arc<dyn ChannelInitializer>,
) -> Result<()> {
    let mut pipeline = Pipeline::new();
    initializer
        .init_channel(&mut pipeline)
        .context("Failed to set up connection pipeline")?;
    let mut ctx = ConnectionContext::new(transport_addr);

    let Some(frame) = read_frame(&mut stream)
        .await
        .context("Failed to read handshake")?
    else {
        debug!("Client disconnected before handshake");
        return Ok(());
    };

    let message = match pipeline.fire_read(&mut ctx, Message::Frame(frame)) {
        Ok(Flow::Forward(message)) => message,
        Ok(Flow::Close) => {
            debug!("Connection closed by pipeline");
            return Ok(());
        }
        Err(e) => {
            warn!(error = %e, "Unable to handle handshake");
            return Ok(());
        }
    };
    let target = ctx
        .target()
        .ok_or_else(|| anyhow!("Pipeline forwarded a message without choosing a target"))?;

    let target_addr = format!("{}:{}", target.host, target.port);
    let client_ip = ctx.remote_addr();
    debug!(target_addr = %target_addr, client_ip = %client_ip, "Attempting to connect to target server");

    let mut backend = TcpStream::connect(&target_addr)
        .await
        .with_context(|| format!("Failed to connect to target {target_addr}"))?;
    backend
        .write_all(&message.encode())
        .await
        .context("Failed to forward handshake to target")?;
    info!(target_addr = %target_addr, client_ip = %client_ip, "Connected to target server");

    let (client_reader, client_writer) = stream.into_split();
    let (backend_reader, backend_writer) = backend.into_split();

    tokio::select! {
        result = pump(client_reader, backend_writer, "client to target") => result?,
        result = pump(backend_reader, client_writer, "target to client") => result?,
    }

    info!(client_ip = %client_ip, "Proxy connection closed");
    Ok(())
}

async fn pump<R, W>(mut reader: R, mut writer: W, direction: &'static str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                debug!(direction, "Connection closed");
                break;
            }
            Ok(n) => {
                if let Err(e) = writer.write_all(&buffer[..n]).await {
                    debug!(direction, error = %e, bytes = n, "Failed to forward data");
                    return Err(e).with_context(|| format!("Failed to forward {direction}"));
                }
            }
            Err(e) => {
                debug!(direction, error = %e, "Failed to read");
                break;
            }
        }
    }
    Ok(())
}
