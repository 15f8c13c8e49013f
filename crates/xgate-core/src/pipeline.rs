use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use xgate_common::{mask_token, AppConfig};
use xgate_pool::{
    refresh_one, AcquireError, ClassHint, Outcome, TokenId, TokenLease, TokenPool,
};
use xgate_protocol::openai::chat::{
    ChatCompletion, ChatCompletionRequest, ContentPart, MessageContent,
};
use xgate_protocol::openai::images::{
    CompletedImageEvent, ImageData, ImageGenerationRequest, ImagesResponse, PartialImageEvent,
};
use xgate_protocol::sse;
use xgate_protocol::upstream::ConversationPayload;
use xgate_translate::{
    recv_with_idle, ChatOutput, ChatTranslator, ImageHttpTranslator, ImageOutput, MediaKind,
    WsImageEvent, WsImageMachine,
};
use xgate_upstream::{ByteStream, CallError, GrokUsageProbe, TransportKind, UpstreamClient};

use crate::error::GatewayError;
use crate::media::MediaCache;
use crate::models::{self, ModelKind, ModelSpec};

pub enum ChatResponse {
    /// SSE frames ready to write, `data: [DONE]` included.
    Stream(mpsc::Receiver<Bytes>),
    Json(serde_json::Value),
}

pub enum ImageResponse {
    Stream(mpsc::Receiver<Bytes>),
    Json(ImagesResponse),
}

/// Per-request orchestration: pick a token, build and execute the
/// upstream call under the retry budget, translate the stream, report
/// the outcome back to the pool.
///
/// Config is read through the shared `ArcSwap`; each request loads one
/// frozen snapshot up front and never observes a mid-flight reload.
pub struct Pipeline {
    config: Arc<ArcSwap<AppConfig>>,
    pool: Arc<TokenPool>,
    upstream: Arc<UpstreamClient>,
    media: Arc<MediaCache>,
    probe: Arc<GrokUsageProbe>,
}

/// What to do after one failed connection attempt.
enum FailureAction {
    /// Release with this outcome and try another token.
    Retry(Outcome),
    /// Release with this outcome and surface the error.
    Fatal(Outcome, GatewayError),
}

impl Pipeline {
    pub fn new(
        config: Arc<ArcSwap<AppConfig>>,
        pool: Arc<TokenPool>,
        upstream: Arc<UpstreamClient>,
        media: Arc<MediaCache>,
    ) -> Arc<Self> {
        let probe = Arc::new(GrokUsageProbe::new(upstream.clone()));
        Arc::new(Self {
            config,
            pool,
            upstream,
            media,
            probe,
        })
    }

    pub fn pool(&self) -> &Arc<TokenPool> {
        &self.pool
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    pub fn media(&self) -> &Arc<MediaCache> {
        &self.media
    }

    /// Frozen config snapshot for one request or task.
    pub fn config(&self) -> Arc<AppConfig> {
        self.config.load_full()
    }

    pub fn probe(&self) -> &Arc<GrokUsageProbe> {
        &self.probe
    }

    // ---- Chat / video ----

    pub async fn run_chat(
        self: &Arc<Self>,
        request: ChatCompletionRequest,
    ) -> Result<ChatResponse, GatewayError> {
        let config = self.config();
        let spec = models::lookup(&request.model)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown model {}", request.model)))?;
        let is_video = spec.kind == ModelKind::Video || request.video_config.is_some();
        let hint = models::class_hint(&request.model, request.video_config.as_ref());
        let thinking = models::thinking_enabled(
            &request.model,
            request.reasoning_effort.as_deref(),
            config.chat.thinking,
        );
        let (message, attachments) = extract_content(&request.messages)?;

        let request_timeout = Duration::from_secs(if is_video {
            config.video.request_timeout_sec
        } else {
            config.chat.request_timeout_sec
        });
        let (lease, stream) = self
            .open_chat_with_retry(hint, spec, &message, &attachments, is_video, request_timeout)
            .await?;

        let idle = Duration::from_secs(if is_video {
            config.video.stream_timeout_sec
        } else {
            config.chat.stream_timeout_sec
        });
        let translator = ChatTranslator::new(
            &request.model,
            time::OffsetDateTime::now_utc().unix_timestamp(),
            thinking,
            &config.chat.filter_tags,
        );

        if request.stream {
            let (tx, rx) = mpsc::channel::<Bytes>(32);
            let pipeline = self.clone();
            tokio::spawn(async move {
                pipeline
                    .drive_chat(lease, stream, translator, idle, Some(tx), None)
                    .await;
            });
            Ok(ChatResponse::Stream(rx))
        } else {
            let mut collected = Collected::default();
            let error = self
                .drive_chat(lease, stream, translator, idle, None, Some(&mut collected))
                .await;
            if let Some(error) = error {
                return Err(error);
            }
            let completion = ChatCompletion::assistant(
                collected.response_id,
                collected.created,
                &request.model,
                collected.fingerprint,
                collected.content,
                collected.reasoning,
            );
            Ok(ChatResponse::Json(serde_json::to_value(completion).map_err(
                |err| GatewayError::Internal(format!("encode completion: {err}")),
            )?))
        }
    }

    /// Acquire → connect loop implementing the retry policy: a new token
    /// per attempt, exponential backoff under a total budget, 401-twice
    /// escalation, and 429 cool-off without penalty.
    async fn open_chat_with_retry(
        &self,
        hint: ClassHint,
        spec: &ModelSpec,
        message: &str,
        attachments: &[String],
        is_video: bool,
        request_timeout: Duration,
    ) -> Result<(TokenLease, ByteStream), GatewayError> {
        let config = self.config();
        let retry = &config.retry;
        let deadline = Instant::now() + Duration::from_millis(retry.budget_ms);
        let mut tried: Vec<TokenId> = Vec::new();
        let mut previous_auth_failure: Option<TokenId> = None;

        for attempt in 0..retry.max_retry {
            let lease = match self.pool.acquire_excluding(hint, &tried).await {
                Ok(lease) => lease,
                Err(AcquireError::PoolEmpty { .. }) => return Err(GatewayError::PoolEmpty),
            };
            tried.push(lease.id.clone());

            match self
                .connect_chat(&lease, spec, message, attachments, is_video, request_timeout)
                .await
            {
                Ok(stream) => return Ok((lease, stream)),
                Err(err) => {
                    let action = self.classify_open_failure(&lease, &err, &mut previous_auth_failure);
                    match action {
                        FailureAction::Fatal(outcome, error) => {
                            self.pool.release(lease, outcome).await;
                            return Err(error);
                        }
                        FailureAction::Retry(outcome) => {
                            self.pool.release(lease, outcome).await;
                        }
                    }
                    if attempt + 1 >= retry.max_retry {
                        return Err(err.into());
                    }
                    let backoff = backoff_delay(retry, attempt);
                    if Instant::now() + backoff >= deadline {
                        return Err(GatewayError::UpstreamTimeout);
                    }
                    debug!(
                        event = "chat_retry",
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(GatewayError::UpstreamTimeout)
    }

    /// Attachment upload + payload build + connection for one token.
    async fn connect_chat(
        &self,
        lease: &TokenLease,
        spec: &ModelSpec,
        message: &str,
        attachments: &[String],
        is_video: bool,
        request_timeout: Duration,
    ) -> Result<ByteStream, CallError> {
        let mut file_ids = Vec::new();
        let mut file_uris = Vec::new();
        for attachment in attachments.iter().take(5) {
            match self.upload_attachment(&lease.id, attachment).await {
                Ok((id, uri)) => {
                    file_ids.push(id);
                    file_uris.push(uri);
                }
                Err(err) => {
                    warn!(
                        event = "attachment_upload_failed",
                        token = %mask_token(&lease.id),
                        error = %err,
                    );
                }
            }
        }

        let mut post_id = None;
        if is_video && !file_uris.is_empty() {
            match self
                .upstream
                .create_media_post(&lease.id, &file_uris[0])
                .await
            {
                Ok(id) if !id.is_empty() => post_id = Some(id),
                Ok(_) => {}
                Err(err) => {
                    warn!(event = "media_post_failed", error = %err);
                }
            }
        }

        let payload = self.build_payload(spec, message, &file_ids, &file_uris, is_video, post_id.as_deref());
        let referer = if is_video {
            post_id
                .as_deref()
                .or(file_ids.first().map(String::as_str))
                .map(|id| xgate_upstream::imagine_referer(self.upstream.base_url(), id))
        } else {
            None
        };
        self.upstream
            .start_conversation(&lease.id, &payload, referer, request_timeout)
            .await
    }

    fn build_payload(
        &self,
        spec: &ModelSpec,
        message: &str,
        file_ids: &[String],
        file_uris: &[String],
        is_video: bool,
        post_id: Option<&str>,
    ) -> ConversationPayload {
        if is_video {
            let source = match post_id {
                Some(post_id) => {
                    format!("{}/imagine/{post_id}", self.upstream.base_url())
                }
                None => file_uris
                    .first()
                    .map(|uri| format!("https://assets.grok.com/post/{uri}"))
                    .unwrap_or_default(),
            };
            let mut payload = ConversationPayload::new(
                "grok-3",
                "MODEL_MODE_FAST",
                format!("{source}  {message} --mode=custom"),
                true,
            );
            payload.file_attachments = file_ids.to_vec();
            payload
                .tool_overrides
                .insert("videoGen".to_string(), serde_json::Value::Bool(true));
            return payload;
        }

        let mut payload = ConversationPayload::new(
            spec.upstream_model,
            spec.mode,
            message.to_string(),
            self.config().upstream.temporary_conversations,
        );
        payload.file_attachments = file_ids.to_vec();
        payload
    }

    async fn upload_attachment(
        &self,
        token_id: &TokenId,
        attachment: &str,
    ) -> Result<(String, String), CallError> {
        let (mime, content) = if let Some(rest) = attachment.strip_prefix("data:") {
            let mime = rest.split(';').next().unwrap_or("image/jpeg").to_string();
            let content = rest.split_once(',').map(|(_, data)| data).unwrap_or("");
            (mime, content.to_string())
        } else {
            use base64::engine::general_purpose::STANDARD as BASE64;
            use base64::Engine as _;
            let bytes = self.upstream.fetch_public(attachment).await?;
            (guess_mime(attachment).to_string(), BASE64.encode(&bytes))
        };
        let ext = mime.rsplit('/').next().unwrap_or("jpg");
        let name = format!("upload.{ext}");
        let uploaded = self
            .upstream
            .upload_file(token_id, &name, &mime, &content)
            .await?;
        Ok((uploaded.file_id, uploaded.file_uri))
    }

    fn classify_open_failure(
        &self,
        lease: &TokenLease,
        err: &CallError,
        previous_auth_failure: &mut Option<TokenId>,
    ) -> FailureAction {
        match err {
            CallError::Http { status: 401, .. } => {
                if let Some(previous) = previous_auth_failure.take() {
                    // Second 401 from a different token: both credentials
                    // are bad, stop burning the pool.
                    let pool = self.pool.clone();
                    let outcome = Outcome::TerminalFailure {
                        reason: "401 on consecutive tokens".to_string(),
                    };
                    tokio::spawn(async move {
                        pool.apply_refresh_failure(&previous, true, "401 on consecutive tokens".to_string())
                            .await;
                    });
                    return FailureAction::Fatal(outcome, GatewayError::AuthRevoked);
                }
                *previous_auth_failure = Some(lease.id.clone());
                FailureAction::Retry(Outcome::TransientFailure {
                    status: Some(401),
                    reason: "unauthorized".to_string(),
                })
            }
            CallError::Http {
                status: 429,
                retry_after,
                ..
            } => {
                let reset_at = time::OffsetDateTime::now_utc()
                    + Duration::from_secs(retry_after.unwrap_or(60));
                // Quota exhaustion is not the token's fault; cool it off
                // without touching the failure counter.
                FailureAction::Retry(Outcome::QuotaExhausted { reset_at })
            }
            CallError::Http { status, .. } if self.config().retry.status_codes.contains(status) => {
                FailureAction::Retry(Outcome::TransientFailure {
                    status: Some(*status),
                    reason: format!("http {status}"),
                })
            }
            CallError::Http { status, .. } => FailureAction::Fatal(
                Outcome::TransientFailure {
                    status: Some(*status),
                    reason: format!("http {status}"),
                },
                GatewayError::UpstreamHttp { status: *status },
            ),
            CallError::Transport(fault) => FailureAction::Fatal(
                Outcome::TransientFailure {
                    status: None,
                    reason: fault.to_string(),
                },
                match fault.kind {
                    TransportKind::Timeout | TransportKind::ReadTimeout => {
                        GatewayError::UpstreamTimeout
                    }
                    _ => GatewayError::UpstreamHttp { status: 502 },
                },
            ),
            CallError::MissingFingerprint => FailureAction::Fatal(
                Outcome::Success { quota_hint: None },
                GatewayError::Internal(err.to_string()),
            ),
        }
    }

    /// Drive one chat/video stream to completion. Streaming mode sends
    /// SSE frames into `tx`; collect mode accumulates into `collected`.
    /// Returns the terminal error, if any (already logged and released).
    async fn drive_chat(
        self: &Arc<Self>,
        lease: TokenLease,
        mut stream: ByteStream,
        mut translator: ChatTranslator,
        idle: Duration,
        tx: Option<mpsc::Sender<Bytes>>,
        mut collected: Option<&mut Collected>,
    ) -> Option<GatewayError> {
        let mut sink = ChatSink {
            tx,
            collected: collected.as_deref_mut(),
        };

        let result: Result<(), GatewayError> = async {
            loop {
                let item = recv_with_idle(&mut stream, idle).await?;
                match item {
                    None => break,
                    Some(Ok(chunk)) => {
                        let outputs = translator.push_chunk(&chunk)?;
                        self.emit_outputs(&lease, &translator, outputs, &mut sink).await?;
                    }
                    Some(Err(fault)) => {
                        return Err(match fault.kind {
                            TransportKind::Timeout | TransportKind::ReadTimeout => {
                                GatewayError::UpstreamTimeout
                            }
                            _ => GatewayError::UpstreamHttp { status: 502 },
                        });
                    }
                }
            }
            let outputs = translator.finish()?;
            self.emit_outputs(&lease, &translator, outputs, &mut sink).await?;
            Ok(())
        }
        .await;

        let valid = translator.structurally_valid();
        match &result {
            Ok(()) => {
                if valid {
                    self.finish_success(lease).await;
                } else {
                    self.pool
                        .release(
                            lease,
                            Outcome::TransientFailure {
                                status: None,
                                reason: "stream ended without output".to_string(),
                            },
                        )
                        .await;
                }
            }
            Err(GatewayError::ClientCancelled) => {
                debug!(event = "chat_cancelled", token = %mask_token(&lease.id));
                if valid {
                    self.finish_success(lease).await;
                }
            }
            Err(error) => {
                warn!(
                    event = "chat_stream_failed",
                    token = %mask_token(&lease.id),
                    error = %error,
                );
                self.pool
                    .release(
                        lease,
                        Outcome::TransientFailure {
                            status: None,
                            reason: error.to_string(),
                        },
                    )
                    .await;
                // Streamed requests get the error as a final SSE frame.
                if let Some(tx) = &sink.tx {
                    if let Some(frame) = sse::data_frame(&error.body()) {
                        let _ = tx.send(frame).await;
                    }
                }
            }
        }

        match result {
            Ok(()) => None,
            Err(GatewayError::ClientCancelled) => None,
            Err(error) => Some(error),
        }
    }

    async fn emit_outputs(
        &self,
        lease: &TokenLease,
        translator: &ChatTranslator,
        outputs: Vec<ChatOutput>,
        sink: &mut ChatSink<'_>,
    ) -> Result<(), GatewayError> {
        for output in outputs {
            match output {
                ChatOutput::Chunk(chunk) => sink.send_chunk(chunk).await?,
                ChatOutput::ImageReady { path } => {
                    let url = match self
                        .media
                        .store_remote(&self.upstream, &lease.id, &path, MediaKind::Image)
                        .await
                    {
                        Ok(url) => url,
                        Err(err) => {
                            warn!(event = "image_cache_failed", error = %err);
                            format!("https://assets.grok.com{path}")
                        }
                    };
                    let name = path
                        .rsplit('/')
                        .nth(1)
                        .unwrap_or("image")
                        .to_string();
                    sink.send_chunk(translator.content_chunk(format!("![{name}]({url})\n")))
                        .await?;
                }
                ChatOutput::VideoReady {
                    video_path,
                    thumbnail_path,
                } => {
                    let video_url = self
                        .media
                        .store_remote(&self.upstream, &lease.id, &video_path, MediaKind::Video)
                        .await
                        .unwrap_or_else(|_| format!("https://assets.grok.com{video_path}"));
                    let thumbnail_url = match thumbnail_path {
                        Some(path) => self
                            .media
                            .store_remote(&self.upstream, &lease.id, &path, MediaKind::Image)
                            .await
                            .ok(),
                        None => None,
                    };
                    let content = if self.config().video.format == "url" {
                        video_url
                    } else {
                        video_html(&video_url, thumbnail_url.as_deref())
                    };
                    info!(event = "video_generated", token = %mask_token(&lease.id));
                    sink.send_chunk(translator.content_chunk(content)).await?;
                }
                ChatOutput::Done => {
                    sink.send_done(translator).await?;
                }
            }
        }
        Ok(())
    }

    /// Success path: reset failure accounting, then refresh the quota
    /// snapshot in the background (best effort).
    async fn finish_success(self: &Arc<Self>, lease: TokenLease) {
        let id = lease.id.clone();
        let class = lease.class;
        self.pool
            .release(lease, Outcome::Success { quota_hint: None })
            .await;
        let pool = self.pool.clone();
        let probe = self.probe.clone();
        tokio::spawn(async move {
            let _ = refresh_one(&pool, probe.as_ref(), &id, class).await;
        });
    }
}

impl Pipeline {
    // ---- Image generation ----

    /// `attachments` carries image-edit inputs (data URIs); when present
    /// the request always goes over the HTTP chat endpoint, since the
    /// imagine socket has no attachment support.
    pub async fn run_image(
        self: &Arc<Self>,
        request: ImageGenerationRequest,
        attachments: Vec<String>,
    ) -> Result<ImageResponse, GatewayError> {
        let n = request.effective_n();
        let wants_url = request.wants_url();
        let use_ws = self.config().image.ws_enabled && attachments.is_empty();

        if use_ws {
            self.run_image_ws(request, n, wants_url).await
        } else {
            self.run_image_http(request, attachments, n, wants_url).await
        }
    }

    /// The video contract is chat-shaped; `run_chat` routes on
    /// `video_config` / the video model.
    pub async fn run_video(
        self: &Arc<Self>,
        request: ChatCompletionRequest,
    ) -> Result<ChatResponse, GatewayError> {
        self.run_chat(request).await
    }

    async fn run_image_ws(
        self: &Arc<Self>,
        request: ImageGenerationRequest,
        n: u32,
        wants_url: bool,
    ) -> Result<ImageResponse, GatewayError> {
        let aspect_ratio = aspect_ratio_for(request.size.as_deref());
        let config = self.config();
        let retry = &config.retry;
        let deadline = Instant::now() + Duration::from_millis(retry.budget_ms);
        let mut tried: Vec<TokenId> = Vec::new();
        let mut previous_auth_failure: Option<TokenId> = None;

        let mut opened = None;
        for attempt in 0..retry.max_retry {
            let lease = match self.pool.acquire_excluding(ClassHint::Basic, &tried).await {
                Ok(lease) => lease,
                Err(AcquireError::PoolEmpty { .. }) => return Err(GatewayError::PoolEmpty),
            };
            tried.push(lease.id.clone());
            match self
                .upstream
                .connect_imagine(&lease.id, &request.prompt, &aspect_ratio, true)
                .await
            {
                Ok(ws) => {
                    opened = Some((lease, ws));
                    break;
                }
                Err(err) => {
                    match self.classify_open_failure(&lease, &err, &mut previous_auth_failure) {
                        FailureAction::Fatal(outcome, error) => {
                            self.pool.release(lease, outcome).await;
                            return Err(error);
                        }
                        FailureAction::Retry(outcome) => {
                            self.pool.release(lease, outcome).await;
                        }
                    }
                    if attempt + 1 >= retry.max_retry {
                        return Err(err.into());
                    }
                    let backoff = backoff_delay(retry, attempt);
                    if Instant::now() + backoff >= deadline {
                        return Err(GatewayError::UpstreamTimeout);
                    }
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        let (lease, ws) = opened.ok_or(GatewayError::UpstreamTimeout)?;

        if request.stream {
            let (tx, rx) = mpsc::channel::<Bytes>(32);
            let pipeline = self.clone();
            let size = request.size.clone();
            tokio::spawn(async move {
                let _ = pipeline
                    .drive_image_ws(lease, ws, n, wants_url, size, Some(tx))
                    .await;
            });
            Ok(ImageResponse::Stream(rx))
        } else {
            let data = self
                .drive_image_ws(lease, ws, n, wants_url, request.size.clone(), None)
                .await?;
            Ok(ImageResponse::Json(ImagesResponse {
                created: time::OffsetDateTime::now_utc().unix_timestamp(),
                data,
            }))
        }
    }

    /// Pump the imagine socket through the frame state machine. The
    /// 5-second receive tick lets blocked detection and idle accounting
    /// run even while the socket is quiet.
    async fn drive_image_ws(
        self: &Arc<Self>,
        lease: TokenLease,
        mut ws: xgate_upstream::WsStream,
        n: u32,
        wants_url: bool,
        size: Option<String>,
        tx: Option<mpsc::Sender<Bytes>>,
    ) -> Result<Vec<ImageData>, GatewayError> {
        let config = self.config();
        let idle = Duration::from_secs(config.image.stream_timeout_sec);
        let final_timeout = Duration::from_secs(config.image.final_timeout_sec);
        let created_at = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut machine = WsImageMachine::new(
            n,
            config.image.medium_min_bytes,
            config.image.final_min_bytes,
        );

        let result: Result<(), GatewayError> = async {
            let mut last_activity = Instant::now();
            loop {
                match tokio::time::timeout(Duration::from_secs(5), ws.recv()).await {
                    Err(_) => {
                        let now = Instant::now();
                        machine.check_blocked(now, final_timeout)?;
                        if now.duration_since(last_activity) > idle {
                            return Err(GatewayError::UpstreamTimeout);
                        }
                    }
                    Ok(None) => break,
                    Ok(Some(Err(fault))) => {
                        return Err(match fault.kind {
                            TransportKind::Timeout | TransportKind::ReadTimeout => {
                                GatewayError::UpstreamTimeout
                            }
                            _ => GatewayError::UpstreamHttp { status: 502 },
                        });
                    }
                    Ok(Some(Ok(message))) => {
                        let now = Instant::now();
                        last_activity = now;
                        let events = machine.on_message(message, now)?;
                        for event in events {
                            match event {
                                WsImageEvent::Partial {
                                    index,
                                    partial_index,
                                    b64,
                                } => {
                                    if let Some(tx) = &tx {
                                        let mut payload =
                                            PartialImageEvent::new(created_at, index, partial_index);
                                        payload.size = size.clone();
                                        if !wants_url {
                                            payload.b64_json = Some(b64);
                                        }
                                        let frame = sse::event_frame(
                                            xgate_protocol::openai::images::EVENT_PARTIAL,
                                            &payload,
                                        )
                                        .ok_or_else(|| {
                                            GatewayError::Internal("encode image event".to_string())
                                        })?;
                                        tx.send(frame)
                                            .await
                                            .map_err(|_| GatewayError::ClientCancelled)?;
                                    }
                                }
                                WsImageEvent::Completed => {}
                            }
                        }
                        machine.check_blocked(now, final_timeout)?;
                        if machine.is_complete() {
                            break;
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {}
            Err(error @ GatewayError::Blocked) => {
                // Content policy, not a token fault; no outcome either way.
                debug!(event = "image_ws_blocked", token = %mask_token(&lease.id));
                if let Some(tx) = &tx {
                    if let Some(frame) = sse::event_frame("error", &error.body()) {
                        let _ = tx.send(frame).await;
                    }
                }
                return Err(error);
            }
            Err(error @ GatewayError::ClientCancelled) => {
                debug!(event = "image_ws_cancelled", token = %mask_token(&lease.id));
                return Err(error);
            }
            Err(error) => {
                self.pool
                    .release(
                        lease,
                        Outcome::TransientFailure {
                            status: None,
                            reason: error.to_string(),
                        },
                    )
                    .await;
                if let Some(tx) = &tx {
                    if let Some(frame) = sse::event_frame("error", &error.body()) {
                        let _ = tx.send(frame).await;
                    }
                }
                return Err(error);
            }
        }

        let results = machine.take_results();
        if results.is_empty() {
            self.pool
                .release(
                    lease,
                    Outcome::TransientFailure {
                        status: None,
                        reason: "imagine socket produced no images".to_string(),
                    },
                )
                .await;
            return Err(GatewayError::UpstreamHttp { status: 502 });
        }
        self.finish_success(lease).await;

        let mut data = Vec::with_capacity(results.len());
        for (index, image) in results.into_iter().enumerate() {
            let mut item = ImageData::default();
            if wants_url {
                use base64::engine::general_purpose::STANDARD as BASE64;
                use base64::Engine as _;
                let bytes = BASE64.decode(image.b64.as_bytes()).map_err(|err| {
                    GatewayError::Internal(format!("decode image blob: {err}"))
                })?;
                let ext = if image.is_final { "jpg" } else { "png" };
                item.url = Some(self.media.put(&bytes, MediaKind::Image, ext).await?);
            } else {
                item.b64_json = Some(image.b64);
            }

            if let Some(tx) = &tx {
                let mut payload = CompletedImageEvent::new(created_at, index as u32);
                payload.size = size.clone();
                payload.b64_json = item.b64_json.clone();
                payload.url = item.url.clone();
                let frame = sse::event_frame(
                    xgate_protocol::openai::images::EVENT_COMPLETED,
                    &payload,
                )
                .ok_or_else(|| GatewayError::Internal("encode image event".to_string()))?;
                tx.send(frame)
                    .await
                    .map_err(|_| GatewayError::ClientCancelled)?;
            }
            data.push(item);
        }
        if let Some(tx) = &tx {
            let _ = tx.send(sse::done_frame()).await;
        }
        Ok(data)
    }

    /// Image generation over the HTTP chat endpoint: used for image
    /// edits (attachments) and when the socket is disabled.
    async fn run_image_http(
        self: &Arc<Self>,
        request: ImageGenerationRequest,
        attachments: Vec<String>,
        n: u32,
        wants_url: bool,
    ) -> Result<ImageResponse, GatewayError> {
        let spec = models::lookup("grok-imagine")
            .ok_or_else(|| GatewayError::Internal("image model missing from catalog".to_string()))?;
        let timeout = Duration::from_secs(self.config().image.request_timeout_sec);
        let (lease, stream) = self
            .open_chat_with_retry(
                ClassHint::Basic,
                spec,
                &request.prompt,
                &attachments,
                false,
                timeout,
            )
            .await?;

        if request.stream {
            let (tx, rx) = mpsc::channel::<Bytes>(32);
            let pipeline = self.clone();
            let size = request.size.clone();
            tokio::spawn(async move {
                let _ = pipeline
                    .drive_image_http(lease, stream, n, wants_url, size, Some(tx))
                    .await;
            });
            Ok(ImageResponse::Stream(rx))
        } else {
            let data = self
                .drive_image_http(lease, stream, n, wants_url, request.size.clone(), None)
                .await?;
            Ok(ImageResponse::Json(ImagesResponse {
                created: time::OffsetDateTime::now_utc().unix_timestamp(),
                data,
            }))
        }
    }

    async fn drive_image_http(
        self: &Arc<Self>,
        lease: TokenLease,
        mut stream: ByteStream,
        n: u32,
        wants_url: bool,
        size: Option<String>,
        tx: Option<mpsc::Sender<Bytes>>,
    ) -> Result<Vec<ImageData>, GatewayError> {
        let idle = Duration::from_secs(self.config().image.stream_timeout_sec);
        let created_at = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut translator = ImageHttpTranslator::new();
        let mut final_paths: Vec<String> = Vec::new();

        let result: Result<(), GatewayError> = async {
            loop {
                let item = recv_with_idle(&mut stream, idle).await?;
                let outputs = match item {
                    None => {
                        let outputs = translator.finish()?;
                        self.emit_image_http_outputs(
                            outputs,
                            created_at,
                            size.as_deref(),
                            &tx,
                            &mut final_paths,
                        )
                        .await?;
                        break;
                    }
                    Some(Ok(chunk)) => translator.push_chunk(&chunk)?,
                    Some(Err(fault)) => {
                        return Err(match fault.kind {
                            TransportKind::Timeout | TransportKind::ReadTimeout => {
                                GatewayError::UpstreamTimeout
                            }
                            _ => GatewayError::UpstreamHttp { status: 502 },
                        });
                    }
                };
                self.emit_image_http_outputs(
                    outputs,
                    created_at,
                    size.as_deref(),
                    &tx,
                    &mut final_paths,
                )
                .await?;
            }
            Ok(())
        }
        .await;

        if let Err(error) = result {
            if !matches!(error, GatewayError::ClientCancelled) {
                self.pool
                    .release(
                        lease,
                        Outcome::TransientFailure {
                            status: None,
                            reason: error.to_string(),
                        },
                    )
                    .await;
                if let Some(tx) = &tx {
                    if let Some(frame) = sse::event_frame("error", &error.body()) {
                        let _ = tx.send(frame).await;
                    }
                }
                return Err(error);
            }
            return Err(error);
        }

        if final_paths.is_empty() {
            self.pool
                .release(
                    lease,
                    Outcome::TransientFailure {
                        status: None,
                        reason: "no generated images in response".to_string(),
                    },
                )
                .await;
            return Err(GatewayError::UpstreamHttp { status: 502 });
        }

        let token_id = lease.id.clone();
        self.finish_success(lease).await;

        let mut data = Vec::new();
        for (index, path) in final_paths.into_iter().take(n as usize).enumerate() {
            let mut item = ImageData::default();
            if wants_url {
                item.url = Some(
                    self.media
                        .store_remote(&self.upstream, &token_id, &path, MediaKind::Image)
                        .await?,
                );
            } else {
                item.b64_json =
                    Some(self.media.fetch_base64(&self.upstream, &token_id, &path).await?);
            }
            if let Some(tx) = &tx {
                let mut payload = CompletedImageEvent::new(created_at, index as u32);
                payload.size = size.clone();
                payload.b64_json = item.b64_json.clone();
                payload.url = item.url.clone();
                let frame = sse::event_frame(
                    xgate_protocol::openai::images::EVENT_COMPLETED,
                    &payload,
                )
                .ok_or_else(|| GatewayError::Internal("encode image event".to_string()))?;
                tx.send(frame)
                    .await
                    .map_err(|_| GatewayError::ClientCancelled)?;
            }
            data.push(item);
        }
        if let Some(tx) = &tx {
            let _ = tx.send(sse::done_frame()).await;
        }
        Ok(data)
    }

    async fn emit_image_http_outputs(
        &self,
        outputs: Vec<ImageOutput>,
        created_at: i64,
        size: Option<&str>,
        tx: &Option<mpsc::Sender<Bytes>>,
        final_paths: &mut Vec<String>,
    ) -> Result<(), GatewayError> {
        for output in outputs {
            match output {
                ImageOutput::Progress { index, progress } => {
                    if let Some(tx) = tx {
                        let mut payload = PartialImageEvent::new(created_at, index, 0);
                        payload.size = size.map(ToOwned::to_owned);
                        payload.progress = Some(progress);
                        let frame = sse::event_frame(
                            xgate_protocol::openai::images::EVENT_PARTIAL,
                            &payload,
                        )
                        .ok_or_else(|| GatewayError::Internal("encode image event".to_string()))?;
                        tx.send(frame)
                            .await
                            .map_err(|_| GatewayError::ClientCancelled)?;
                    }
                }
                ImageOutput::FinalPaths(paths) => final_paths.extend(paths),
            }
        }
        Ok(())
    }
}

/// Map an OpenAI `size` to the upstream aspect ratio vocabulary.
fn aspect_ratio_for(size: Option<&str>) -> String {
    let Some(size) = size else {
        return "2:3".to_string();
    };
    let Some((w, h)) = size.split_once('x') else {
        return "2:3".to_string();
    };
    match (w.trim().parse::<u32>(), h.trim().parse::<u32>()) {
        (Ok(w), Ok(h)) if w == h => "1:1".to_string(),
        (Ok(w), Ok(h)) if w > h => "3:2".to_string(),
        _ => "2:3".to_string(),
    }
}

fn backoff_delay(retry: &xgate_common::RetryConfig, attempt: u32) -> Duration {
    let factor = retry.backoff_factor.max(1.0).powi(attempt as i32);
    let millis = (retry.backoff_base_ms as f64 * factor) as u64;
    Duration::from_millis(millis.min(retry.backoff_max_ms))
}

#[derive(Default)]
struct Collected {
    response_id: String,
    created: i64,
    fingerprint: Option<String>,
    content: String,
    reasoning: Option<String>,
}

struct ChatSink<'a> {
    tx: Option<mpsc::Sender<Bytes>>,
    collected: Option<&'a mut Collected>,
}

impl ChatSink<'_> {
    async fn send_chunk(
        &mut self,
        chunk: xgate_protocol::openai::chat::ChatCompletionChunk,
    ) -> Result<(), GatewayError> {
        if let Some(collected) = self.collected.as_deref_mut() {
            collected.response_id = chunk.id.clone();
            collected.created = chunk.created;
            if chunk.system_fingerprint.is_some() {
                collected.fingerprint = chunk.system_fingerprint.clone();
            }
            if let Some(choice) = chunk.choices.first() {
                if let Some(content) = &choice.delta.content {
                    collected.content.push_str(content);
                }
                if let Some(reasoning) = &choice.delta.reasoning_content {
                    collected
                        .reasoning
                        .get_or_insert_with(String::new)
                        .push_str(reasoning);
                }
            }
        }
        if let Some(tx) = &self.tx {
            let frame = sse::data_frame(&chunk)
                .ok_or_else(|| GatewayError::Internal("encode chunk".to_string()))?;
            tx.send(frame)
                .await
                .map_err(|_| GatewayError::ClientCancelled)?;
        }
        Ok(())
    }

    async fn send_done(&mut self, translator: &ChatTranslator) -> Result<(), GatewayError> {
        if let Some(tx) = &self.tx {
            let frame = sse::data_frame(&translator.finish_chunk())
                .ok_or_else(|| GatewayError::Internal("encode chunk".to_string()))?;
            tx.send(frame)
                .await
                .map_err(|_| GatewayError::ClientCancelled)?;
            tx.send(sse::done_frame())
                .await
                .map_err(|_| GatewayError::ClientCancelled)?;
        }
        Ok(())
    }
}

fn video_html(video_url: &str, thumbnail_url: Option<&str>) -> String {
    let poster = thumbnail_url
        .map(|url| format!(" poster=\"{url}\""))
        .unwrap_or_default();
    format!(
        "<video id=\"video\" controls=\"\" preload=\"none\"{poster}>\n  \
         <source id=\"mp4\" src=\"{video_url}\" type=\"video/mp4\">\n</video>"
    )
}

/// Flatten OpenAI message content into the upstream's single prompt
/// string plus attachment inputs (data URIs or absolute URLs).
fn extract_content(
    messages: &[xgate_protocol::openai::chat::ChatMessage],
) -> Result<(String, Vec<String>), GatewayError> {
    let mut text = String::new();
    let mut attachments = Vec::new();
    for message in messages {
        match &message.content {
            MessageContent::Text(content) => text.push_str(content),
            MessageContent::Parts(parts) => {
                for part in parts {
                    match part {
                        ContentPart::Text { text: part_text } => text.push_str(part_text),
                        ContentPart::ImageUrl { image_url } => {
                            let url = image_url.url.as_str();
                            if !(url.starts_with("http://")
                                || url.starts_with("https://")
                                || url.starts_with("data:"))
                            {
                                return Err(GatewayError::InvalidRequest(
                                    "image_url must be absolute or a data: URI".to_string(),
                                ));
                            }
                            attachments.push(image_url.url.clone());
                        }
                        ContentPart::File { file } => {
                            attachments.push(format!("data:application/octet-stream;base64,{}", file.file_data));
                        }
                        // Audio input has no upstream equivalent here.
                        ContentPart::InputAudio { .. } | ContentPart::Unknown => {}
                    }
                }
            }
        }
    }
    Ok((text, attachments))
}

fn guess_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("bmp") => "image/bmp",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xgate_protocol::openai::chat::{ChatMessage, ImageUrlPart};

    #[test]
    fn backoff_grows_and_caps() {
        let retry = xgate_common::RetryConfig::default();
        assert_eq!(backoff_delay(&retry, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(&retry, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&retry, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&retry, 20), Duration::from_millis(30_000));
    }

    #[test]
    fn content_extraction_joins_text_and_collects_images() {
        let messages = vec![
            ChatMessage {
                role: "system".to_string(),
                content: MessageContent::Text("be brief. ".to_string()),
            },
            ChatMessage {
                role: "user".to_string(),
                content: MessageContent::Parts(vec![
                    ContentPart::Text {
                        text: "what is this?".to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrlPart {
                            url: "data:image/png;base64,AA==".to_string(),
                        },
                    },
                ]),
            },
        ];
        let (text, attachments) = extract_content(&messages).unwrap();
        assert_eq!(text, "be brief. what is this?");
        assert_eq!(attachments.len(), 1);
    }

    #[test]
    fn relative_image_urls_are_rejected() {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                image_url: ImageUrlPart {
                    url: "/local/path.png".to_string(),
                },
            }]),
        }];
        assert!(matches!(
            extract_content(&messages),
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
