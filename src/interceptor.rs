//! Handshake authentication stage and its installation into the host
//! pipeline.

use anyhow::{Context, Result};
use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::authenticator::{TrustAnchor, authenticate};
use crate::pipeline::{
    ChannelInitializer, ConnectionContext, Flow, InitializerHolder, Message, Pipeline, Stage,
};
use crate::protocol::{DECODER_STAGE, Packet};

pub const INTERCEPTOR_STAGE: &str = "handshake-auth";

/// Startup failure to hook into the host pipeline.
#[derive(Debug, Error)]
pub enum IntegrationFault {
    #[error("host connection setup failed while probing the pipeline: {0:#}")]
    Setup(anyhow::Error),
    #[error("host pipeline has no \"minecraft-decoder\" stage, found {found:?}")]
    MissingInsertionPoint { found: Vec<String> },
}

type Clock = fn() -> Result<i64>;

fn unix_now() -> Result<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before the Unix epoch")?;
    Ok(elapsed.as_secs() as i64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingHandshake,
    Accepted,
}

/// Authenticates the handshake of one connection and restores the client's
/// real address and hostname.
pub struct HandshakeInterceptor {
    anchor: Arc<TrustAnchor>,
    clock: Clock,
    state: State,
}

impl HandshakeInterceptor {
    #[must_use]
    pub fn new(anchor: Arc<TrustAnchor>) -> Self {
        Self::with_clock(anchor, unix_now)
    }

    #[must_use]
    pub fn with_clock(anchor: Arc<TrustAnchor>, clock: Clock) -> Self {
        Self {
            anchor,
            clock,
            state: State::AwaitingHandshake,
        }
    }
}

impl Stage for HandshakeInterceptor {
    fn read(&mut self, ctx: &mut ConnectionContext, message: Message) -> Result<Flow> {
        if self.state == State::Accepted {
            return Ok(Flow::Forward(message));
        }
        let Message::Packet(Packet::Handshake(mut handshake)) = message else {
            return Ok(Flow::Forward(message));
        };

        let now = match (self.clock)() {
            Ok(now) => now,
            Err(e) => {
                error!(client_addr = %ctx.transport_addr(), error = %e, "Unable to handle handshake");
                return Ok(Flow::Close);
            }
        };

        match authenticate(&handshake.server_address, now, &self.anchor) {
            Ok(identity) => {
                let (client_addr, hostname) = identity.into_parts();
                info!(
                    relay_addr = %ctx.transport_addr(),
                    client_addr = %client_addr,
                    hostname = %hostname.escape_debug(),
                    "Accepted relay handshake"
                );
                ctx.set_remote_addr(client_addr);
                handshake.server_address = hostname;
                self.state = State::Accepted;
                Ok(Flow::Forward(Message::Packet(Packet::Handshake(handshake))))
            }
            Err(reason) if reason.is_relay_fault() => {
                error!(client_addr = %ctx.transport_addr(), reason = %reason, "Relay sent an unusable handshake");
                Ok(Flow::Close)
            }
            Err(reason) => {
                warn!(client_addr = %ctx.transport_addr(), reason = %reason, "Unauthorized client attempted to connect");
                Ok(Flow::Close)
            }
        }
    }
}

/// Wraps the host's initializer: runs it unchanged, then inserts the
/// interceptor after the decoder.
pub struct AuthInitializer {
    original: Arc<dyn ChannelInitializer>,
    anchor: Arc<TrustAnchor>,
}

impl AuthInitializer {
    #[must_use]
    pub fn new(original: Arc<dyn ChannelInitializer>, anchor: Arc<TrustAnchor>) -> Self {
        Self { original, anchor }
    }
}

impl ChannelInitializer for AuthInitializer {
    fn init_channel(&self, pipeline: &mut Pipeline) -> Result<()> {
        self.original.init_channel(pipeline)?;
        pipeline.add_after(
            DECODER_STAGE,
            INTERCEPTOR_STAGE,
            Box::new(HandshakeInterceptor::new(self.anchor.clone())),
        )?;
        Ok(())
    }
}

/// Replaces the server's initializer with one that authenticates handshakes.
pub fn install(holder: &InitializerHolder, anchor: Arc<TrustAnchor>) -> Result<(), IntegrationFault> {
    let original = holder.get();

    let mut trial = Pipeline::new();
    original
        .init_channel(&mut trial)
        .map_err(IntegrationFault::Setup)?;
    if !trial.contains(DECODER_STAGE) {
        return Err(IntegrationFault::MissingInsertionPoint {
            found: trial.names().map(str::to_string).collect(),
        });
    }
    debug!(stages = ?trial.names().collect::<Vec<_>>(), "Checked host pipeline");

    holder.replace(Arc::new(AuthInitializer::new(original, anchor)));
    Ok(())
}
