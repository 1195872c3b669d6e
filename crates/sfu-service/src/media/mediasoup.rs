//! mediasoup-backed media engine (feature `mediasoup`).
//!
//! Workers are mediasoup worker threads managed by a single `WorkerManager`.
//! mediasoup objects close when their last handle is dropped, so every
//! wrapper keeps its handle in an `Option` that `close()` takes.

use super::{
    DtlsState, MediaConsumer, MediaEngine, MediaError, MediaKind, MediaProducer, MediaRouter,
    MediaTransport, MediaWorker, RtpCodecCapability, TransportOptions, TransportSettings,
    WorkerResourceUsage,
};
use async_trait::async_trait;
use mediasoup::data_structures::DtlsState as EngineDtlsState;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, error, warn};

/// Media engine backed by mediasoup workers.
pub struct MediasoupEngine {
    manager: WorkerManager,
}

impl MediasoupEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            manager: WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn name(&self) -> &'static str {
        "mediasoup"
    }

    async fn create_worker(&self, index: usize) -> Result<Arc<dyn MediaWorker>, MediaError> {
        let mut settings = WorkerSettings::default();
        settings.log_level = WorkerLogLevel::Warn;
        settings.log_tags = vec![
            WorkerLogTag::Info,
            WorkerLogTag::Ice,
            WorkerLogTag::Dtls,
            WorkerLogTag::Rtp,
            WorkerLogTag::Srtp,
            WorkerLogTag::Rtcp,
        ];

        let worker = self
            .manager
            .create_worker(settings)
            .await
            .map_err(|e| MediaError::WorkerSpawn(format!("worker {index}: {e}")))?;

        let (alive, _) = watch::channel(true);
        let alive = Arc::new(alive);
        let worker_id = worker.id().to_string();

        let dead_handler = worker.on_dead({
            let alive = Arc::clone(&alive);
            let worker_id = worker_id.clone();
            move |reason| {
                error!(
                    target: "sfu.media.mediasoup",
                    worker_id = %worker_id,
                    reason = ?reason,
                    "mediasoup worker died"
                );
                alive.send_replace(false);
            }
        });

        debug!(
            target: "sfu.media.mediasoup",
            worker_id = %worker_id,
            index = index,
            "mediasoup worker started"
        );

        Ok(Arc::new(MediasoupWorker {
            id: worker_id,
            worker,
            alive,
            _handlers: Mutex::new(vec![dead_handler]),
        }))
    }
}

pub struct MediasoupWorker {
    id: String,
    worker: Worker,
    alive: Arc<watch::Sender<bool>>,
    _handlers: Mutex<Vec<HandlerId>>,
}

#[async_trait]
impl MediaWorker for MediasoupWorker {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn liveness(&self) -> watch::Receiver<bool> {
        self.alive.subscribe()
    }

    async fn resource_usage(&self) -> Result<WorkerResourceUsage, MediaError> {
        let usage = self
            .worker
            .get_resource_usage()
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;
        Ok(WorkerResourceUsage {
            user_cpu_ms: usage.ru_utime,
            system_cpu_ms: usage.ru_stime,
            max_rss_kb: usage.ru_maxrss,
        })
    }

    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, MediaError> {
        if self.worker.closed() {
            return Err(MediaError::WorkerClosed);
        }

        let media_codecs = codecs
            .iter()
            .map(|codec| {
                let mut value = to_json(codec);
                if let Some(object) = value.as_object_mut() {
                    object.insert("rtcpFeedback".to_string(), json!([]));
                }
                from_json(value, "media codec")
            })
            .collect::<Result<Vec<mediasoup::rtp_parameters::RtpCodecCapability>, _>>()?;

        let router = self
            .worker
            .create_router(RouterOptions::new(media_codecs))
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        Ok(Arc::new(MediasoupRouter {
            id: router.id().to_string(),
            capabilities: to_json(router.rtp_capabilities()),
            router: Mutex::new(Some(router)),
            transports: Mutex::new(Vec::new()),
        }))
    }
}

pub struct MediasoupRouter {
    id: String,
    capabilities: Value,
    router: Mutex<Option<Router>>,
    transports: Mutex<Vec<Weak<MediasoupTransport>>>,
}

#[async_trait]
impl MediaRouter for MediasoupRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> Value {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Some(router) = self.router.lock().clone() else {
            return false;
        };
        let Ok(producer_id) = from_json::<ProducerId>(json!(producer_id), "producerId") else {
            return false;
        };
        let Ok(capabilities) =
            from_json::<RtpCapabilities>(rtp_capabilities.clone(), "rtpCapabilities")
        else {
            return false;
        };
        router.can_consume(&producer_id, &capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        settings: &TransportSettings,
    ) -> Result<Arc<dyn MediaTransport>, MediaError> {
        let router = self.router.lock().clone().ok_or(MediaError::RouterClosed)?;

        let listen_info = |protocol| ListenInfo {
            protocol,
            ip: settings.listen_ip,
            announced_address: settings.announced_ip.clone(),
            expose_internal_ip: false,
            port: None,
            port_range: Some(settings.rtc_min_port..=settings.rtc_max_port),
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        };
        let listen_infos = WebRtcTransportListenInfos::new(listen_info(Protocol::Udp))
            .insert(listen_info(Protocol::Tcp));
        let mut options = WebRtcTransportOptions::new(listen_infos);
        options.prefer_udp = true;
        options.initial_available_outgoing_bitrate = settings.initial_available_outgoing_bitrate;

        let transport = router
            .create_webrtc_transport(options)
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))?;

        let mut max_incoming_bitrate = None;
        if let Some(bitrate) = settings.max_incoming_bitrate {
            match transport.set_max_incoming_bitrate(bitrate).await {
                Ok(()) => max_incoming_bitrate = Some(bitrate),
                Err(e) => {
                    warn!(
                        target: "sfu.media.mediasoup",
                        transport_id = %transport.id(),
                        error = %e,
                        "Failed to apply max incoming bitrate"
                    );
                }
            }
        }

        let (dtls, _) = watch::channel(map_dtls_state(transport.dtls_state()));
        let dtls = Arc::new(dtls);
        let dtls_handler = transport.on_dtls_state_change({
            let dtls = Arc::clone(&dtls);
            move |state| {
                dtls.send_replace(map_dtls_state(state));
            }
        });

        let wrapper = Arc::new(MediasoupTransport {
            id: transport.id().to_string(),
            options: TransportOptions {
                id: transport.id().to_string(),
                ice_parameters: to_json(transport.ice_parameters()),
                ice_candidates: to_json(transport.ice_candidates()),
                dtls_parameters: to_json(&transport.dtls_parameters()),
            },
            transport: Mutex::new(Some(transport)),
            max_incoming_bitrate,
            dtls,
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            _handlers: Mutex::new(vec![dtls_handler]),
        });

        {
            let mut transports = self.transports.lock();
            transports.retain(|t| t.strong_count() > 0);
            transports.push(Arc::downgrade(&wrapper));
        }

        Ok(wrapper)
    }

    fn close(&self) {
        let transports: Vec<_> = self.transports.lock().drain(..).collect();
        for transport in transports.iter().filter_map(Weak::upgrade) {
            transport.close();
        }
        self.router.lock().take();
    }
}

pub struct MediasoupTransport {
    id: String,
    options: TransportOptions,
    transport: Mutex<Option<WebRtcTransport>>,
    max_incoming_bitrate: Option<u32>,
    dtls: Arc<watch::Sender<DtlsState>>,
    producers: Mutex<Vec<Arc<MediasoupProducer>>>,
    consumers: Mutex<Vec<Arc<MediasoupConsumer>>>,
    _handlers: Mutex<Vec<HandlerId>>,
}

impl MediasoupTransport {
    fn handle(&self) -> Result<WebRtcTransport, MediaError> {
        self.transport
            .lock()
            .clone()
            .ok_or(MediaError::TransportClosed)
    }
}

#[async_trait]
impl MediaTransport for MediasoupTransport {
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
        let transport = self.handle()?;
        let dtls_parameters: DtlsParameters = from_json(dtls_parameters, "dtlsParameters")?;
        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::InvalidParameters(e.to_string()))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> Result<Arc<dyn MediaProducer>, MediaError> {
        let transport = self.handle()?;
        let rtp_parameters: RtpParameters = from_json(rtp_parameters, "rtpParameters")?;
        let producer = transport
            .produce(ProducerOptions::new(engine_kind(kind), rtp_parameters))
            .await
            .map_err(|e| MediaError::Incompatible(e.to_string()))?;

        let wrapper = Arc::new(MediasoupProducer {
            id: producer.id().to_string(),
            kind,
            producer: Mutex::new(Some(producer)),
        });
        self.producers.lock().push(Arc::clone(&wrapper));
        Ok(wrapper)
    }

    async fn consume(
        &self,
        producer_id: &str,
        rtp_capabilities: Value,
        paused: bool,
    ) -> Result<Arc<dyn MediaConsumer>, MediaError> {
        let transport = self.handle()?;
        let engine_producer_id: ProducerId = from_json(json!(producer_id), "producerId")
            .map_err(|_| MediaError::UnknownProducer(producer_id.to_string()))?;
        let rtp_capabilities: RtpCapabilities = from_json(rtp_capabilities, "rtpCapabilities")?;

        let mut options = ConsumerOptions::new(engine_producer_id, rtp_capabilities);
        options.paused = paused;
        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::Incompatible(e.to_string()))?;

        let wrapper = Arc::new(MediasoupConsumer {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: local_kind(consumer.kind()),
            rtp_parameters: to_json(consumer.rtp_parameters()),
            consumer: Mutex::new(Some(consumer)),
        });
        self.consumers.lock().push(Arc::clone(&wrapper));
        Ok(wrapper)
    }

    fn close(&self) {
        let producers: Vec<_> = self.producers.lock().drain(..).collect();
        for producer in producers {
            producer.close();
        }
        let consumers: Vec<_> = self.consumers.lock().drain(..).collect();
        for consumer in consumers {
            consumer.close();
        }
        if self.transport.lock().take().is_some() {
            self.dtls.send_replace(DtlsState::Closed);
        }
    }
}

pub struct MediasoupProducer {
    id: String,
    kind: MediaKind,
    producer: Mutex<Option<Producer>>,
}

impl MediaProducer for MediasoupProducer {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        self.producer.lock().take();
    }
}

pub struct MediasoupConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: Value,
    consumer: Mutex<Option<Consumer>>,
}

#[async_trait]
impl MediaConsumer for MediasoupConsumer {
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
        self.consumer
            .lock()
            .as_ref()
            .is_some_and(Consumer::paused)
    }

    fn is_closed(&self) -> bool {
        self.consumer
            .lock()
            .as_ref()
            .map_or(true, Consumer::closed)
    }

    async fn resume(&self) -> Result<(), MediaError> {
        let consumer = self
            .consumer
            .lock()
            .clone()
            .ok_or_else(|| MediaError::Engine("consumer closed".to_string()))?;
        consumer
            .resume()
            .await
            .map_err(|e| MediaError::Engine(e.to_string()))
    }

    fn close(&self) {
        self.consumer.lock().take();
    }
}

fn engine_kind(kind: MediaKind) -> mediasoup::rtp_parameters::MediaKind {
    match kind {
        MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
        MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
    }
}

fn local_kind(kind: mediasoup::rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
        mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
    }
}

fn map_dtls_state(state: EngineDtlsState) -> DtlsState {
    match state {
        EngineDtlsState::New => DtlsState::New,
        EngineDtlsState::Connecting => DtlsState::Connecting,
        EngineDtlsState::Connected => DtlsState::Connected,
        EngineDtlsState::Failed => DtlsState::Failed,
        EngineDtlsState::Closed => DtlsState::Closed,
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn from_json<T: DeserializeOwned>(value: Value, what: &str) -> Result<T, MediaError> {
    serde_json::from_value(value)
        .map_err(|e| MediaError::InvalidParameters(format!("{what}: {e}")))
}
