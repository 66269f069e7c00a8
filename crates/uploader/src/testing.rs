//! In-memory S3 backend and signing service for tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::DateTime;
use mule_protocol::{
    InitGrant, ResumeHint, Signature, SignatureBundle, SignatureKind, xml,
};
use mule_transfer::{ByteSource, ChunkLayout, MemorySource};

use crate::config::UploaderConfig;
use crate::session::Shared;
use crate::signing::{SignFuture, SigningError, SigningParams, SigningService};
use crate::transport::{
    HttpRequest, HttpResponse, Method, ProgressSender, SendFuture, Transport, TransportError,
};

pub(crate) const ACCESS_KEY: &str = "AKIATEST";

/// Four-byte chunks so a 10-byte file has three parts (4, 4, 2).
pub(crate) fn test_config() -> UploaderConfig {
    UploaderConfig {
        chunk_size: 4,
        num_workers: 2,
        auto_start: false,
        bucket: "bucket".into(),
        host: Some("http://s3.test".into()),
        access_key: ACCESS_KEY.into(),
        key: Some("uploads/file.bin".into()),
        ..Default::default()
    }
}

/// `file.bin` holding the bytes `0, 1, 2, ...`.
pub(crate) fn memory_source(size: u64) -> Arc<dyn ByteSource> {
    let data = (0..size).map(|i| i as u8).collect();
    let modified = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
    Arc::new(MemorySource::new("file.bin", data, modified))
}

pub(crate) fn error_body(code: &str) -> String {
    format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{code}</Code><Message>{code}</Message></Error>")
}

fn etag(part: u32) -> String {
    format!("\"etag-{part}\"")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// MockS3
// ---------------------------------------------------------------------------

struct StoredPart {
    etag: String,
    data: Vec<u8>,
}

struct Upload {
    key: String,
    parts: BTreeMap<u32, StoredPart>,
}

#[derive(Default)]
struct Backend {
    uploads: HashMap<String, Upload>,
    objects: HashMap<String, Vec<u8>>,
    next_id: u64,
    latest: Option<String>,
}

#[derive(Default)]
struct Faults {
    hang: HashSet<u32>,
    stall_once: HashSet<u32>,
    fail: HashMap<u32, usize>,
    drop_once: HashSet<u32>,
    list_failures: usize,
    complete_responses: VecDeque<HttpResponse>,
    put_delay: Option<Duration>,
    page_size: Option<usize>,
}

enum PutAction {
    Store,
    /// Answer 200 without recording the part.
    Drop,
    Fail,
    Stall,
    Hang,
}

/// An S3 bucket in memory, with fault injection on part uploads, listings
/// and completion.
#[derive(Default)]
pub(crate) struct MockS3 {
    backend: Mutex<Backend>,
    faults: Mutex<Faults>,
    pub puts: AtomicUsize,
    pub completes: AtomicUsize,
    pub initiates: AtomicUsize,
    pub lists: AtomicUsize,
    pub heads: AtomicUsize,
    /// Part uploads currently being served.
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    /// Part uploads dropped by the client before they finished.
    pub aborted: AtomicUsize,
}

/// Counts a part upload as in flight until it answers or is dropped.
struct InFlight<'a> {
    s3: &'a MockS3,
    answered: bool,
}

impl<'a> InFlight<'a> {
    fn enter(s3: &'a MockS3) -> Self {
        let now = s3.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        s3.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self { s3, answered: false }
    }

    fn answer(mut self) {
        self.answered = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.s3.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.answered {
            self.s3.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MockS3 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a multipart upload directly on the backend.
    pub fn create_upload(&self, key: &str) -> String {
        self.initiates.fetch_add(1, Ordering::SeqCst);
        let mut backend = lock(&self.backend);
        backend.next_id += 1;
        let id = format!("upload-{}", backend.next_id);
        backend.uploads.insert(
            id.clone(),
            Upload {
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        backend.latest = Some(id.clone());
        id
    }

    /// Records a part of `size` zero bytes as if it had been uploaded.
    pub fn seed_part(&self, upload_id: &str, part: u32, size: usize) {
        if let Some(upload) = lock(&self.backend).uploads.get_mut(upload_id) {
            upload.parts.insert(
                part,
                StoredPart {
                    etag: etag(part),
                    data: vec![0; size],
                },
            );
        }
    }

    pub fn put_object(&self, key: &str) {
        lock(&self.backend).objects.insert(key.to_string(), Vec::new());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.backend).objects.get(key).cloned()
    }

    pub fn object_exists(&self, key: &str) -> bool {
        lock(&self.backend).objects.contains_key(key)
    }

    /// Part numbers recorded on the most recently created upload.
    pub fn part_numbers(&self) -> Vec<u32> {
        let backend = lock(&self.backend);
        backend
            .latest
            .as_ref()
            .and_then(|id| backend.uploads.get(id))
            .map(|upload| upload.parts.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Uploads of these parts never answer.
    pub fn hang_parts(&self, parts: &[u32]) {
        lock(&self.faults).hang.extend(parts.iter().copied());
    }

    /// The next upload of `part` reports half its bytes, then goes silent.
    pub fn stall_part_once(&self, part: u32) {
        lock(&self.faults).stall_once.insert(part);
    }

    /// The next `times` uploads of `part` answer 500.
    pub fn fail_part(&self, part: u32, times: usize) {
        lock(&self.faults).fail.insert(part, times);
    }

    /// The next upload of `part` answers 200 but is not recorded.
    pub fn drop_part_once(&self, part: u32) {
        lock(&self.faults).drop_once.insert(part);
    }

    pub fn fail_lists(&self, times: usize) {
        lock(&self.faults).list_failures = times;
    }

    /// Answers the next completion request with `response`.
    pub fn push_complete_response(&self, response: HttpResponse) {
        lock(&self.faults).complete_responses.push_back(response);
    }

    pub fn set_put_delay(&self, delay: Duration) {
        lock(&self.faults).put_delay = Some(delay);
    }

    pub fn set_page_size(&self, size: usize) {
        lock(&self.faults).page_size = Some(size.max(1));
    }

    pub fn clear_faults(&self) {
        *lock(&self.faults) = Faults::default();
    }

    async fn handle(
        &self,
        request: HttpRequest,
        progress: Option<ProgressSender>,
    ) -> Result<HttpResponse, TransportError> {
        tokio::task::yield_now().await;
        let Some(key) = object_key(&request.url) else {
            return Ok(HttpResponse::new(400, error_body("InvalidURI")));
        };

        if request.method == Method::Head {
            self.heads.fetch_add(1, Ordering::SeqCst);
            let status = if self.object_exists(&key) { 200 } else { 404 };
            return Ok(HttpResponse::new(status, ""));
        }

        let signed = request
            .header_value("Authorization")
            .is_some_and(|auth| auth.starts_with(&format!("AWS {ACCESS_KEY}:")));
        if !signed || request.header_value("x-amz-date").is_none() {
            return Ok(HttpResponse::new(403, error_body("AccessDenied")));
        }

        let upload_id = request.query_value("uploadId").map(str::to_string);
        match (request.method, upload_id.as_deref()) {
            (Method::Post, None) if request.query_value("uploads").is_some() => {
                let id = self.create_upload(&key);
                Ok(HttpResponse::new(
                    200,
                    format!(
                        "<InitiateMultipartUploadResult><Bucket>bucket</Bucket><Key>{key}</Key><UploadId>{id}</UploadId></InitiateMultipartUploadResult>"
                    ),
                ))
            }
            (Method::Put, Some(id)) => self.upload_part(id, request, progress).await,
            (Method::Get, Some(id)) => Ok(self.list(id, &request)),
            (Method::Post, Some(id)) => Ok(self.complete(id, &request)),
            _ => Ok(HttpResponse::new(400, error_body("InvalidRequest"))),
        }
    }

    async fn upload_part(
        &self,
        upload_id: &str,
        request: HttpRequest,
        progress: Option<ProgressSender>,
    ) -> Result<HttpResponse, TransportError> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::enter(self);

        let Some(part) = request
            .query_value("partNumber")
            .and_then(|n| n.parse::<u32>().ok())
        else {
            guard.answer();
            return Ok(HttpResponse::new(400, error_body("InvalidArgument")));
        };
        let data = request.body.unwrap_or_default();
        let len = data.len() as u64;

        let (action, delay) = {
            let mut faults = lock(&self.faults);
            let action = if faults.hang.contains(&part) {
                PutAction::Hang
            } else if faults.stall_once.remove(&part) {
                PutAction::Stall
            } else if let Some(left) = faults.fail.get_mut(&part)
                && *left > 0
            {
                *left -= 1;
                PutAction::Fail
            } else if faults.drop_once.remove(&part) {
                PutAction::Drop
            } else {
                PutAction::Store
            };
            (action, faults.put_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let report = |sent: u64| {
            if let Some(tx) = &progress {
                let _ = tx.send(sent);
            }
        };

        match action {
            PutAction::Hang => return std::future::pending().await,
            PutAction::Stall => {
                report(len / 2);
                return std::future::pending().await;
            }
            PutAction::Fail => {
                guard.answer();
                return Ok(HttpResponse::new(500, error_body("InternalError")));
            }
            PutAction::Drop | PutAction::Store => {}
        }

        report(len / 2);
        tokio::task::yield_now().await;
        report(len);
        tokio::task::yield_now().await;

        if matches!(action, PutAction::Store) {
            let mut backend = lock(&self.backend);
            let Some(upload) = backend.uploads.get_mut(upload_id) else {
                guard.answer();
                return Ok(HttpResponse::new(404, error_body("NoSuchUpload")));
            };
            upload.parts.insert(
                part,
                StoredPart {
                    etag: etag(part),
                    data,
                },
            );
        }

        guard.answer();
        Ok(HttpResponse::new(200, "").with_header("ETag", etag(part)))
    }

    fn list(&self, upload_id: &str, request: &HttpRequest) -> HttpResponse {
        self.lists.fetch_add(1, Ordering::SeqCst);
        let page_size = {
            let mut faults = lock(&self.faults);
            if faults.list_failures > 0 {
                faults.list_failures -= 1;
                return HttpResponse::new(500, error_body("InternalError"));
            }
            faults.page_size.unwrap_or(1000)
        };

        let backend = lock(&self.backend);
        let Some(upload) = backend.uploads.get(upload_id) else {
            return HttpResponse::new(404, error_body("NoSuchUpload"));
        };
        let marker: u32 = request
            .query_value("part-number-marker")
            .and_then(|m| m.parse().ok())
            .unwrap_or(0);

        let remaining: Vec<(&u32, &StoredPart)> = upload.parts.range(marker + 1..).collect();
        let page = &remaining[..remaining.len().min(page_size)];
        let truncated = remaining.len() > page.len();

        let mut body = format!("<ListPartsResult><UploadId>{upload_id}</UploadId>");
        if let Some((last, _)) = page.last() {
            body.push_str(&format!("<NextPartNumberMarker>{last}</NextPartNumberMarker>"));
        }
        body.push_str(&format!("<IsTruncated>{truncated}</IsTruncated>"));
        for (number, part) in page {
            body.push_str(&format!(
                "<Part><PartNumber>{number}</PartNumber><ETag>{}</ETag><Size>{}</Size></Part>",
                part.etag.replace('"', "&quot;"),
                part.data.len()
            ));
        }
        body.push_str("</ListPartsResult>");
        HttpResponse::new(200, body)
    }

    fn complete(&self, upload_id: &str, request: &HttpRequest) -> HttpResponse {
        self.completes.fetch_add(1, Ordering::SeqCst);
        if let Some(response) = lock(&self.faults).complete_responses.pop_front() {
            return response;
        }

        let manifest = String::from_utf8_lossy(request.body.as_deref().unwrap_or_default());
        let mut entries = Vec::new();
        for segment in manifest.split("<Part>").skip(1) {
            let number = xml::extract(segment, "PartNumber").and_then(|n| n.parse::<u32>().ok());
            let tag = xml::extract(segment, "ETag").map(xml::unescape);
            match (number, tag) {
                (Some(number), Some(tag)) => entries.push((number, tag)),
                _ => return HttpResponse::new(400, error_body("MalformedXML")),
            }
        }

        let mut backend = lock(&self.backend);
        let Some(upload) = backend.uploads.get(upload_id) else {
            return HttpResponse::new(404, error_body("NoSuchUpload"));
        };
        if entries.is_empty() || !entries.windows(2).all(|w| w[0].0 < w[1].0) {
            return HttpResponse::new(400, error_body("InvalidPartOrder"));
        }
        let mut object = Vec::new();
        for (number, tag) in &entries {
            match upload.parts.get(number) {
                Some(part) if &part.etag == tag => object.extend_from_slice(&part.data),
                _ => return HttpResponse::new(400, error_body("InvalidPart")),
            }
        }

        let key = upload.key.clone();
        backend.uploads.remove(upload_id);
        backend.objects.insert(key.clone(), object);
        HttpResponse::new(
            200,
            format!("<CompleteMultipartUploadResult><Key>{key}</Key></CompleteMultipartUploadResult>"),
        )
    }
}

/// Path of `url` after the host, without the leading slash.
fn object_key(url: &str) -> Option<String> {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let (_, key) = rest.split_once('/')?;
    Some(key.to_string())
}

impl Transport for MockS3 {
    fn send(&self, request: HttpRequest, progress: Option<ProgressSender>) -> SendFuture<'_> {
        Box::pin(self.handle(request, progress))
    }
}

// ---------------------------------------------------------------------------
// MockSigner
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SignerState {
    resume: Option<ResumeHint>,
    failures: usize,
    forced: usize,
    chunk_notifications: Vec<u32>,
    finished: usize,
}

/// A signing service that signs everything and remembers what it was told.
#[derive(Default)]
pub(crate) struct MockSigner {
    state: Mutex<SignerState>,
}

impl MockSigner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported by every unforced initiate call.
    pub fn set_resume_hint(&self, hint: ResumeHint) {
        lock(&self.state).resume = Some(hint);
    }

    /// The next `times` signature requests answer 503.
    pub fn fail_next(&self, times: usize) {
        lock(&self.state).failures = times;
    }

    pub fn forced_initiates(&self) -> usize {
        lock(&self.state).forced
    }

    pub fn chunk_notifications(&self) -> Vec<u32> {
        lock(&self.state).chunk_notifications.clone()
    }

    pub fn finished_notifications(&self) -> usize {
        lock(&self.state).finished
    }

    fn check(&self) -> Result<(), SigningError> {
        let mut state = lock(&self.state);
        if state.failures > 0 {
            state.failures -= 1;
            return Err(SigningError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        Ok(())
    }
}

fn signature(label: &str) -> Signature {
    Signature {
        signature: format!("{label}-sig"),
        date: "Tue, 14 Nov 2023 22:13:20 GMT".into(),
    }
}

impl SigningService for MockSigner {
    fn initiate(&self, _params: SigningParams, force: bool) -> SignFuture<'_, InitGrant> {
        Box::pin(async move {
            self.check()?;
            let mut state = lock(&self.state);
            if force {
                state.forced += 1;
            }
            Ok(InitGrant {
                signature: signature("init"),
                resume: if force { None } else { state.resume.clone() },
            })
        })
    }

    fn sign(&self, kind: SignatureKind, _params: SigningParams) -> SignFuture<'_, Signature> {
        Box::pin(async move {
            self.check()?;
            Ok(signature(&format!("{kind:?}")))
        })
    }

    fn sign_all(&self, params: SigningParams) -> SignFuture<'_, SignatureBundle> {
        Box::pin(async move {
            self.check()?;
            let mut bundle = SignatureBundle {
                list: Some(signature("list")),
                finish: Some(signature("finish")),
                ..Default::default()
            };
            for part in 1..=params.num_chunks {
                bundle.chunks.insert(part, signature(&format!("chunk-{part}")));
            }
            Ok(bundle)
        })
    }

    fn notify_chunk_uploaded(&self, _params: SigningParams, part_number: u32) -> SignFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.state).chunk_notifications.push(part_number);
            Ok(())
        })
    }

    fn notify_upload_finished(&self, _params: SigningParams) -> SignFuture<'_, ()> {
        Box::pin(async move {
            lock(&self.state).finished += 1;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A session with `file.bin` selected, wired to the in-memory doubles.
pub(crate) struct Harness {
    pub shared: Arc<Shared>,
    pub s3: Arc<MockS3>,
    pub signer: Arc<MockSigner>,
}

impl Harness {
    pub fn new(config: UploaderConfig, size: u64) -> Self {
        let s3 = Arc::new(MockS3::new());
        let signer = Arc::new(MockSigner::new());
        let shared = Arc::new(Shared::new(config, s3.clone(), signer.clone()));

        let layout = ChunkLayout::new(size, shared.config.chunk_size).unwrap();
        let key = shared
            .config
            .key
            .clone()
            .unwrap_or_else(|| "file.bin".into());
        {
            let mut core = shared.core();
            shared.load_file(&mut core, memory_source(size), layout, key);
        }
        Self { shared, s3, signer }
    }

    /// Creates the multipart upload on the backend and records its id,
    /// leaving the session state alone.
    pub async fn select_and_initiate(&self) {
        tokio::task::yield_now().await;
        let key = self.shared.core().key.clone();
        let upload_id = self.s3.create_upload(&key);
        self.shared.core().upload_id = Some(upload_id);
    }
}
