//! Per-connection processing pipeline and the hooks used to extend it.
//!
//! Every connection gets its own [`Pipeline`], built by the server's current
//! [`ChannelInitializer`]. Inbound messages travel through the stages in
//! order; a stage may transform a message, pass it on, or close the
//! connection.

use anyhow::Result;
use std::{
    net::SocketAddr,
    sync::{Arc, RwLock},
};
use thiserror::Error;

use crate::config::TargetConfig;
use crate::protocol::{Frame, Packet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Frame(Frame),
    Packet(Packet),
}

impl Message {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::Frame(frame) => frame.encode(),
            Self::Packet(packet) => packet.encode(),
        }
    }
}

#[derive(Debug)]
pub enum Flow {
    Forward(Message),
    Close,
}

/// Mutable per-connection state visible to every stage.
#[derive(Debug)]
pub struct ConnectionContext {
    transport_addr: SocketAddr,
    remote_addr: SocketAddr,
    target: Option<TargetConfig>,
}

impl ConnectionContext {
    #[must_use]
    pub const fn new(transport_addr: SocketAddr) -> Self {
        Self {
            transport_addr,
            remote_addr: transport_addr,
            target: None,
        }
    }

    /// Address of the socket peer. Never rewritten.
    #[must_use]
    pub const fn transport_addr(&self) -> SocketAddr {
        self.transport_addr
    }

    /// Address the connection is attributed to. Starts as the socket peer.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn set_remote_addr(&mut self, addr: SocketAddr) {
        self.remote_addr = addr;
    }

    #[must_use]
    pub const fn target(&self) -> Option<&TargetConfig> {
        self.target.as_ref()
    }

    pub fn set_target(&mut self, target: TargetConfig) {
        self.target = Some(target);
    }
}

pub trait Stage: Send {
    fn read(&mut self, ctx: &mut ConnectionContext, message: Message) -> Result<Flow>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no stage named {0:?} in the pipeline")]
    MissingStage(String),
    #[error("a stage named {0:?} already exists")]
    DuplicateStage(String),
}

struct NamedStage {
    name: String,
    stage: Box<dyn Stage>,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<NamedStage>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_first(
        &mut self,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), PipelineError> {
        self.insert(0, name, stage)
    }

    pub fn add_last(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<(), PipelineError> {
        self.insert(self.stages.len(), name, stage)
    }

    /// Inserts `stage` directly after the stage called `base`.
    pub fn add_after(
        &mut self,
        base: &str,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), PipelineError> {
        let index = self
            .position(base)
            .ok_or_else(|| PipelineError::MissingStage(base.to_string()))?;
        self.insert(index + 1, name, stage)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.stages.iter().map(|s| s.name.as_str())
    }

    /// Runs `message` through every stage in order.
    pub fn fire_read(&mut self, ctx: &mut ConnectionContext, message: Message) -> Result<Flow> {
        let mut message = message;
        for named in &mut self.stages {
            match named.stage.read(ctx, message)? {
                Flow::Forward(next) => message = next,
                Flow::Close => return Ok(Flow::Close),
            }
        }
        Ok(Flow::Forward(message))
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    fn insert(
        &mut self,
        index: usize,
        name: &str,
        stage: Box<dyn Stage>,
    ) -> Result<(), PipelineError> {
        if self.contains(name) {
            return Err(PipelineError::DuplicateStage(name.to_string()));
        }
        self.stages.insert(
            index,
            NamedStage {
                name: name.to_string(),
                stage,
            },
        );
        Ok(())
    }
}

/// Sets up the pipeline of a newly accepted connection.
pub trait ChannelInitializer: Send + Sync {
    fn init_channel(&self, pipeline: &mut Pipeline) -> Result<()>;
}

/// The server's current initializer, replaceable at startup so extensions
/// can wrap it.
pub struct InitializerHolder {
    initializer: RwLock<Arc<dyn ChannelInitializer>>,
}

impl InitializerHolder {
    #[must_use]
    pub fn new(initializer: Arc<dyn ChannelInitializer>) -> Self {
        Self {
            initializer: RwLock::new(initializer),
        }
    }

    #[must_use]
    pub fn get(&self) -> Arc<dyn ChannelInitializer> {
        match self.initializer.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn replace(&self, initializer: Arc<dyn ChannelInitializer>) {
        match self.initializer.write() {
            Ok(mut guard) => *guard = initializer,
            Err(poisoned) => *poisoned.into_inner() = initializer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Appends its name to a shared log, then forwards or closes.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        close: bool,
    }

    impl Stage for Recorder {
        fn read(&mut self, _ctx: &mut ConnectionContext, message: Message) -> Result<Flow> {
            self.log.lock().unwrap().push(self.name);
            if self.close {
                Ok(Flow::Close)
            } else {
                Ok(Flow::Forward(message))
            }
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Box<dyn Stage> {
        Box::new(Recorder {
            name,
            log: log.clone(),
            close: false,
        })
    }

    fn ctx() -> ConnectionContext {
        ConnectionContext::new("192.0.2.1:40000".parse().unwrap())
    }

    fn ping() -> Message {
        Message::Packet(Packet::LegacyPing(vec![0xFE]))
    }

    #[test]
    fn add_after_places_stage_next_to_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.add_last("decoder", recorder("decoder", &log)).unwrap();
        pipeline.add_last("handler", recorder("handler", &log)).unwrap();
        pipeline
            .add_after("decoder", "middle", recorder("middle", &log))
            .unwrap();
        pipeline.add_first("head", recorder("head", &log)).unwrap();

        assert_eq!(
            pipeline.names().collect::<Vec<_>>(),
            ["head", "decoder", "middle", "handler"]
        );

        let flow = pipeline.fire_read(&mut ctx(), ping()).unwrap();
        assert!(matches!(flow, Flow::Forward(message) if message == ping()));
        assert_eq!(*log.lock().unwrap(), ["head", "decoder", "middle", "handler"]);
    }

    #[test]
    fn add_after_missing_base() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        assert_eq!(
            pipeline.add_after("decoder", "middle", recorder("middle", &log)),
            Err(PipelineError::MissingStage("decoder".to_string()))
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline.add_last("decoder", recorder("decoder", &log)).unwrap();
        assert_eq!(
            pipeline.add_first("decoder", recorder("decoder", &log)),
            Err(PipelineError::DuplicateStage("decoder".to_string()))
        );
    }

    #[test]
    fn close_stops_later_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipeline = Pipeline::new();
        pipeline
            .add_last(
                "gate",
                Box::new(Recorder {
                    name: "gate",
                    log: log.clone(),
                    close: true,
                }),
            )
            .unwrap();
        pipeline.add_last("handler", recorder("handler", &log)).unwrap();

        let flow = pipeline.fire_read(&mut ctx(), ping()).unwrap();
        assert!(matches!(flow, Flow::Close));
        assert_eq!(*log.lock().unwrap(), ["gate"]);
    }

    #[test]
    fn remote_addr_starts_as_transport_addr() {
        let mut ctx = ctx();
        assert_eq!(ctx.remote_addr(), ctx.transport_addr());

        let restored: SocketAddr = "203.0.113.5:25565".parse().unwrap();
        ctx.set_remote_addr(restored);
        assert_eq!(ctx.remote_addr(), restored);
        assert_eq!(ctx.transport_addr(), "192.0.2.1:40000".parse().unwrap());
    }
}
