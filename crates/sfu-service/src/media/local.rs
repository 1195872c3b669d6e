//! In-process media engine.
//!
//! `LocalEngine` performs the full negotiation bookkeeping of an SFU (routers,
//! WebRTC transports, producers, consumers, capability checks, DTLS state)
//! without forwarding any RTP. Workers are simulated: they have a liveness
//! flag that can be flipped with [`LocalEngine::kill_worker`].
//!
//! Used for development, CI and the test-suite.

use super::{
    DtlsState, MediaConsumer, MediaEngine, MediaError, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker, RtpCodecCapability, TransportOptions, TransportSettings,
    WorkerResourceUsage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// First dynamic payload type assigned to router codecs.
const PAYLOAD_TYPE_BASE: u8 = 100;

/// Fault injection knobs.
#[derive(Debug, Clone, Default)]
struct LocalEngineBehavior {
    router_delay: Option<Duration>,
    fail_routers: bool,
    fail_worker_at: Option<usize>,
}

/// In-process media engine.
#[derive(Default)]
pub struct LocalEngine {
    behavior: LocalEngineBehavior,
    ports: Arc<PortPool>,
    workers: Mutex<Vec<Arc<LocalWorker>>>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every router creation by `delay`.
    #[must_use]
    pub fn with_router_delay(mut self, delay: Duration) -> Self {
        self.behavior.router_delay = Some(delay);
        self
    }

    /// Make every router creation fail.
    #[must_use]
    pub fn with_failing_routers(mut self) -> Self {
        self.behavior.fail_routers = true;
        self
    }

    /// Make the worker at `index` fail to start.
    #[must_use]
    pub fn with_failing_worker(mut self, index: usize) -> Self {
        self.behavior.fail_worker_at = Some(index);
        self
    }

    /// Get a worker created by this engine, by pool index.
    #[must_use]
    pub fn worker(&self, index: usize) -> Option<Arc<LocalWorker>> {
        self.workers
            .lock()
            .iter()
            .find(|w| w.index == index)
            .cloned()
    }

    /// Simulate the worker at `index` exiting unexpectedly.
    ///
    /// Returns `false` if no such worker exists.
    pub fn kill_worker(&self, index: usize) -> bool {
        match self.worker(index) {
            Some(worker) => {
                worker.kill();
                true
            }
            None => false,
        }
    }

    /// Number of RTC ports currently held by open transports.
    #[must_use]
    pub fn ports_in_use(&self) -> usize {
        self.ports.in_use.lock().len()
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create_worker(&self, index: usize) -> Result<Arc<dyn MediaWorker>, MediaError> {
        if self.behavior.fail_worker_at == Some(index) {
            return Err(MediaError::WorkerSpawn(format!(
                "worker {index} failed to start"
            )));
        }

        let worker = Arc::new(LocalWorker::new(
            index,
            self.behavior.clone(),
            Arc::clone(&self.ports),
        ));
        self.workers.lock().push(Arc::clone(&worker));

        debug!(
            target: "sfu.media.local",
            worker_id = %worker.id,
            index = index,
            "Local worker started"
        );

        Ok(worker)
    }
}

/// RTC ports handed out to transports, shared by every worker of an engine.
#[derive(Debug, Default)]
struct PortPool {
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    fn allocate(&self, min: u16, max: u16) -> Result<u16, MediaError> {
        let mut in_use = self.in_use.lock();
        let port = (min..=max)
            .find(|port| !in_use.contains(port))
            .ok_or_else(|| MediaError::Engine(format!("no free RTC port in {min}-{max}")))?;
        in_use.insert(port);
        Ok(port)
    }

    fn release(&self, port: u16) {
        self.in_use.lock().remove(&port);
    }
}

/// Simulated worker process.
pub struct LocalWorker {
    id: String,
    index: usize,
    behavior: LocalEngineBehavior,
    ports: Arc<PortPool>,
    alive: watch::Sender<bool>,
    routers: Mutex<Vec<Weak<RouterShared>>>,
    routers_created: AtomicU64,
}

impl LocalWorker {
    fn new(index: usize, behavior: LocalEngineBehavior, ports: Arc<PortPool>) -> Self {
        let (alive, _) = watch::channel(true);
        Self {
            id: Uuid::new_v4().to_string(),
            index,
            behavior,
            ports,
            alive,
            routers: Mutex::new(Vec::new()),
            routers_created: AtomicU64::new(0),
        }
    }

    /// Simulate an unexpected worker exit. Every router on the worker closes.
    pub fn kill(&self) {
        if !self.alive.send_replace(false) {
            return;
        }

        warn!(
            target: "sfu.media.local",
            worker_id = %self.id,
            index = self.index,
            "Local worker killed"
        );

        let routers: Vec<_> = self.routers.lock().drain(..).collect();
        for router in routers.iter().filter_map(Weak::upgrade) {
            router.close();
        }
    }

    /// Number of routers this worker has created.
    #[must_use]
    pub fn routers_created(&self) -> u64 {
        self.routers_created.load(Ordering::Relaxed)
    }

    fn alive(&self) -> bool {
        *self.alive.borrow()
    }
}

#[async_trait]
impl MediaWorker for LocalWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    async fn resource_usage(&self) -> Result<WorkerResourceUsage, MediaError> {
        if !self.alive() {
            return Err(MediaError::WorkerClosed);
        }
        Ok(WorkerResourceUsage::default())
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError> {
        if !self.alive() {
            return Err(MediaError::WorkerClosed);
        }
        if let Some(delay) = self.behavior.router_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_routers {
            return Err(MediaError::Engine("router creation failed".to_string()));
        }
        if !self.alive() {
            return Err(MediaError::WorkerClosed);
        }

        let shared = Arc::new(RouterShared {
            id: Uuid::new_v4().to_string(),
            capabilities: router_capabilities(codecs),
            codecs: codecs.to_vec(),
            ports: Arc::clone(&self.ports),
            state: Mutex::new(RouterState::default()),
        });

        {
            let mut routers = self.routers.lock();
            routers.retain(|r| r.strong_count() > 0);
            routers.push(Arc::downgrade(&shared));
        }
        self.routers_created.fetch_add(1, Ordering::Relaxed);

        debug!(
            target: "sfu.media.local",
            worker_id = %self.id,
            router_id = %shared.id,
            "Router created"
        );

        Ok(Arc::new(LocalRouter { shared }))
    }
}

/// Case-insensitive codec identity used for capability matching.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CodecKey {
    mime_type: String,
    clock_rate: u32,
}

impl CodecKey {
    fn from_capability(codec: &RtpCodecCapability) -> Self {
        Self {
            mime_type: codec.mime_type.to_ascii_lowercase(),
            clock_rate: codec.clock_rate,
        }
    }

    fn from_value(value: &Value) -> Option<Self> {
        let mime_type = value.get("mimeType")?.as_str()?;
        let clock_rate = value.get("clockRate")?.as_u64()?;
        Some(Self {
            mime_type: mime_type.to_ascii_lowercase(),
            clock_rate: u32::try_from(clock_rate).ok()?,
        })
    }

    fn is_rtx(&self) -> bool {
        self.mime_type.ends_with("/rtx")
    }
}

/// Codec keys listed under `codecs` in a capabilities or parameters blob.
fn codec_keys(blob: &Value) -> Vec<CodecKey> {
    blob.get("codecs")
        .and_then(Value::as_array)
        .map(|codecs| codecs.iter().filter_map(CodecKey::from_value).collect())
        .unwrap_or_default()
}

fn router_capabilities(codecs: &[RtpCodecCapability]) -> Value {
    let codecs: Vec<Value> = codecs
        .iter()
        .zip(PAYLOAD_TYPE_BASE..)
        .map(|(codec, payload_type)| {
            let mut value = json!({
                "kind": codec.kind,
                "mimeType": codec.mime_type,
                "preferredPayloadType": payload_type,
                "clockRate": codec.clock_rate,
                "parameters": codec.parameters,
                "rtcpFeedback": [],
            });
            if let (Some(channels), Some(object)) = (codec.channels, value.as_object_mut()) {
                object.insert("channels".to_string(), json!(channels));
            }
            value
        })
        .collect();

    json!({ "codecs": codecs, "headerExtensions": [] })
}

struct ProducerRecord {
    kind: MediaKind,
    codecs: Vec<CodecKey>,
    consumers: Vec<Weak<LocalConsumer>>,
}

#[derive(Default)]
struct RouterState {
    closed: bool,
    transports: HashMap<String, Weak<LocalTransport>>,
    producers: HashMap<String, ProducerRecord>,
    consumers_created: u64,
}

struct RouterShared {
    id: String,
    capabilities: Value,
    codecs: Vec<RtpCodecCapability>,
    ports: Arc<PortPool>,
    state: Mutex<RouterState>,
}

impl RouterShared {
    fn close(&self) {
        let transports: Vec<_> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.transports.drain().map(|(_, t)| t).collect()
        };

        for transport in transports.iter().filter_map(Weak::upgrade) {
            transport.close();
        }

        debug!(target: "sfu.media.local", router_id = %self.id, "Router closed");
    }

    /// Router codecs (with payload types) that both sides support.
    fn negotiated_codecs(&self, producer: &[CodecKey], receiver: &[CodecKey]) -> Vec<Value> {
        self.codecs
            .iter()
            .zip(PAYLOAD_TYPE_BASE..)
            .filter(|(codec, _)| {
                let key = CodecKey::from_capability(codec);
                producer.contains(&key) && receiver.contains(&key)
            })
            .map(|(codec, payload_type)| {
                let mut value = json!({
                    "mimeType": codec.mime_type,
                    "payloadType": payload_type,
                    "clockRate": codec.clock_rate,
                    "parameters": codec.parameters,
                    "rtcpFeedback": [],
                });
                if let (Some(channels), Some(object)) = (codec.channels, value.as_object_mut()) {
                    object.insert("channels".to_string(), json!(channels));
                }
                value
            })
            .collect()
    }
}

/// Routing context for one room.
pub struct LocalRouter {
    shared: Arc<RouterShared>,
}

#[async_trait]
impl MediaRouter for LocalRouter {
    fn id(&self) -> String {
        self.shared.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.shared.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let state = self.shared.state.lock();
        let Some(record) = state.producers.get(producer_id) else {
            return false;
        };
        let receiver = codec_keys(rtp_capabilities);
        record.codecs.iter().any(|codec| receiver.contains(codec))
    }

    async fn create_webrtc_transport(
        &self,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(MediaError::RouterClosed);
        }

        let port = self
            .shared
            .ports
            .allocate(settings.rtc_min_port, settings.rtc_max_port)?;
        let id = Uuid::new_v4().to_string();
        let address = settings
            .announced_ip
            .clone()
            .unwrap_or_else(|| settings.listen_ip.to_string());

        let options = TransportOptions {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": random_token(16),
                "password": random_token(32),
                "iceLite": true,
            }),
            ice_candidates: json!([
                {
                    "foundation": "udpcandidate",
                    "priority": 1_076_302_079_u32,
                    "address": address,
                    "ip": address,
                    "protocol": "udp",
                    "port": port,
                    "type": "host",
                },
                {
                    "foundation": "tcpcandidate",
                    "priority": 1_076_276_479_u32,
                    "address": address,
                    "ip": address,
                    "protocol": "tcp",
                    "port": port,
                    "type": "host",
                    "tcpType": "passive",
                },
            ]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [
                    { "algorithm": "sha-256", "value": dtls_fingerprint() },
                ],
            }),
        };

        let (dtls, _) = watch::channel(DtlsState::New);
        let transport = Arc::new(LocalTransport {
            id: id.clone(),
            router: Arc::clone(&self.shared),
            options,
            port,
            max_incoming_bitrate: settings.max_incoming_bitrate,
            dtls,
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        state.transports.insert(id, Arc::downgrade(&transport));

        Ok(transport)
    }

    fn close(&self) {
        self.shared.close();
    }
}

/// Simulated WebRTC transport.
pub struct LocalTransport {
    id: String,
    router: Arc<RouterShared>,
    options: TransportOptions,
    port: u16,
    max_incoming_bitrate: Option<u32>,
    dtls: watch::Sender<DtlsState>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
}

impl LocalTransport {
    fn ensure_open(&self) -> Result<(), MediaError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MediaError::TransportClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl MediaTransport for LocalTransport {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn options(&self) -> TransportOptions {
        self.options.clone()
    }

    fn max_incoming_bitrate(&self) -> Option<u32> {
        self.max_incoming_bitrate
    }

    fn dtls_state(&self) -> watch::Receiver<DtlsState> {
        self.dtls.subscribe()
    }

    async fn connect(&self, dtls_parameters: Value) -> Result<(), MediaError> {
        self.ensure_open()?;

        let has_fingerprints = dtls_parameters
            .get("fingerprints")
            .and_then(Value::as_array)
            .is_some_and(|fingerprints| !fingerprints.is_empty());
        if !has_fingerprints {
            return Err(MediaError::InvalidParameters(
                "dtlsParameters.fingerprints is required".to_string(),
            ));
        }

        if *self.dtls.borrow() != DtlsState::New {
            return Err(MediaError::InvalidParameters(
                "transport already connected".to_string(),
            ));
        }

        self.dtls.send_replace(DtlsState::Connecting);
        self.dtls.send_replace(DtlsState::Connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        self.ensure_open()?;

        let codecs = codec_keys(&rtp_parameters);
        if codecs.is_empty() {
            return Err(MediaError::InvalidParameters(
                "rtpParameters.codecs is required".to_string(),
            ));
        }
        let prefix = format!("{}/", kind.as_str());
        if let Some(codec) = codecs.iter().find(|c| !c.mime_type.starts_with(&prefix)) {
            return Err(MediaError::InvalidParameters(format!(
                "codec {} does not match kind {kind}",
                codec.mime_type
            )));
        }

        let supported: Vec<CodecKey> = self
            .router
            .codecs
            .iter()
            .map(CodecKey::from_capability)
            .collect();
        if let Some(codec) = codecs
            .iter()
            .find(|c| !c.is_rtx() && !supported.contains(c))
        {
            return Err(MediaError::Incompatible(format!(
                "router does not support {}",
                codec.mime_type
            )));
        }

        let producer = Arc::new(LocalProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            router: Arc::clone(&self.router),
            closed: AtomicBool::new(false),
        });

        {
            let mut state = self.router.state.lock();
            if state.closed {
                return Err(MediaError::RouterClosed);
            }
            state.producers.insert(
                producer.id.clone(),
                ProducerRecord {
                    kind,
                    codecs: codecs.into_iter().filter(|c| !c.is_rtx()).collect(),
                    consumers: Vec::new(),
                },
            );
        }
        self.producers.lock().push(Arc::clone(&producer));

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        self.ensure_open()?;

        let receiver = codec_keys(&rtp_capabilities);
        let consumer = {
            let mut state = self.router.state.lock();
            if state.closed {
                return Err(MediaError::RouterClosed);
            }
            state.consumers_created += 1;
            let mid = state.consumers_created.to_string();

            let record = state
                .producers
                .get_mut(producer_id)
                .ok_or_else(|| MediaError::UnknownProducer(producer_id.to_string()))?;

            let codecs = self.router.negotiated_codecs(&record.codecs, &receiver);
            if codecs.is_empty() {
                return Err(MediaError::Incompatible(format!(
                    "no common codec for producer {producer_id}"
                )));
            }

            let consumer = Arc::new(LocalConsumer {
                id: Uuid::new_v4().to_string(),
                producer_id: producer_id.to_string(),
                kind: record.kind,
                rtp_parameters: json!({
                    "mid": mid,
                    "codecs": codecs,
                    "headerExtensions": [],
                    "encodings": [{ "ssrc": rand::thread_rng().gen::<u32>() }],
                    "rtcp": { "cname": random_token(8), "reducedSize": true },
                }),
                paused: AtomicBool::new(paused),
                closed: AtomicBool::new(false),
            });
            record.consumers.retain(|c| c.strong_count() > 0);
            record.consumers.push(Arc::downgrade(&consumer));
            consumer
        };
        self.consumers.lock().push(Arc::clone(&consumer));

        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.dtls.send_replace(DtlsState::Closed);

        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close();
        }
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close();
        }

        self.router.ports.release(self.port);
        self.router.state.lock().transports.remove(&self.id);

        debug!(
            target: "sfu.media.local",
            transport_id = %self.id,
            port = self.port,
            "Transport closed"
        );
    }
}

/// Simulated producer.
pub struct LocalProducer {
    id: String,
    kind: MediaKind,
    router: Arc<RouterShared>,
    closed: AtomicBool,
}

impl MediaProducer for LocalProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let record = self.router.state.lock().producers.remove(&self.id);
        if let Some(record) = record {
            for consumer in record.consumers.iter().filter_map(Weak::upgrade) {
                consumer.close();
            }
        }
    }
}

/// Simulated consumer.
pub struct LocalConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    paused: AtomicBool,
    closed: AtomicBool,
}

#[async_trait]
impl MediaConsumer for LocalConsumer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn producer_id(&self) -> String {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> Value {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        if self.is_closed() {
            return Err(MediaError::Engine("consumer closed".to_string()));
        }
        if self.paused.swap(false, Ordering::SeqCst) {
            info!(
                target: "sfu.media.local",
                consumer_id = %self.id,
                producer_id = %self.producer_id,
                "Consumer resumed"
            );
        }
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Colon-separated SHA-256 fingerprint of a random certificate stand-in.
fn dtls_fingerprint() -> String {
    let mut seed = [0u8; 32];
    rand::thread_rng().fill(&mut seed);
    let digest = ring::digest::digest(&ring::digest::SHA256, &seed);
    digest
        .as_ref()
        .iter()
        .map(|byte| hex::encode_upper([*byte]))
        .collect::<Vec<_>>()
        .join(":")
}
