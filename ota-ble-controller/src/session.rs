//! Upload session: discover, connect, stream every frame, close.
//!
//! Frames go out strictly one at a time. Each write is awaited before the next
//! frame is built, the protocol has no sequence numbers so ordering rests on
//! the transport delivering writes in order.

use std::future::Future;
use std::num::NonZeroUsize;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::firmware::FirmwareImage;
use crate::plan::{FramePlan, Phase};
use crate::signature::SignatureBundle;
use crate::transport::{Link, Transport};

/// Inputs of one upload, loaded before the radio is touched
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub image: FirmwareImage,
    pub bundle: SignatureBundle,
}

impl UploadJob {
    pub fn new(image: FirmwareImage, bundle: SignatureBundle) -> Self {
        Self { image, bundle }
    }

    pub fn load(firmware: impl AsRef<Path>, signature: impl AsRef<Path>) -> Result<Self, UploadError> {
        let image = FirmwareImage::load(firmware)?;
        let bundle = SignatureBundle::load(signature)?;
        Ok(Self { image, bundle })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingDevice,
    Connected,
    InitSent,
    SendingSignature,
    SendingFirmware,
    Completed,
    Failed,
}

/// Reported after every acknowledged write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub phase: Phase,
    pub frames_sent: usize,
    pub total_frames: usize,
    pub bytes_sent: usize,
    pub total_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub frames_sent: usize,
    pub signature_chunks: usize,
    pub firmware_chunks: usize,
    pub bytes_sent: usize,
    pub attempts: u32,
    pub elapsed: Duration,
}

type ProgressFn = Box<dyn FnMut(&Progress) + Send>;

pub struct Uploader<T: Transport> {
    transport: T,
    config: UploadConfig,
    state: SessionState,
    on_progress: Option<ProgressFn>,
}

impl<T: Transport> Uploader<T> {
    pub fn new(transport: T, config: UploadConfig) -> Self {
        Self {
            transport,
            config,
            state: SessionState::Idle,
            on_progress: None,
        }
    }

    pub fn on_progress(mut self, f: impl FnMut(&Progress) + Send + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Load the firmware and signature files, then upload them
    pub async fn upload_files(
        &mut self,
        firmware: impl AsRef<Path>,
        signature: impl AsRef<Path>,
    ) -> Result<UploadReport, UploadError> {
        self.state = SessionState::Idle;
        let job = UploadJob::load(firmware, signature).inspect_err(|_| {
            self.state = SessionState::Failed;
        })?;
        self.upload(&job).await
    }

    pub async fn upload(&mut self, job: &UploadJob) -> Result<UploadReport, UploadError> {
        self.upload_until(job, std::future::pending::<()>()).await
    }

    /// Upload, giving up as soon as `cancel` completes.
    ///
    /// On cancellation no further frame is written and the link is closed.
    pub async fn upload_until<C>(&mut self, job: &UploadJob, cancel: C) -> Result<UploadReport, UploadError>
    where
        C: Future<Output = ()>,
    {
        self.state = SessionState::Idle;
        let result = self.run(job, cancel).await;
        match &result {
            Ok(report) => log::info!(
                "upload complete: {} frames, {} bytes in {:.1?}",
                report.frames_sent,
                report.bytes_sent,
                report.elapsed
            ),
            Err(e) => {
                self.transition(SessionState::Failed);
                log::error!("upload failed: {e}");
            }
        }
        result
    }

    async fn run<C>(&mut self, job: &UploadJob, cancel: C) -> Result<UploadReport, UploadError>
    where
        C: Future<Output = ()>,
    {
        self.config.validate()?;
        let chunk_size = self.config.chunk_size()?;
        // length fields must fit before the radio is touched
        FramePlan::new(&job.image, &job.bundle, chunk_size)?;

        let started = Instant::now();
        tokio::pin!(cancel);

        let mut attempt = 1;
        loop {
            match self.attempt(job, chunk_size, cancel.as_mut()).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    report.elapsed = started.elapsed();
                    return Ok(report);
                }
                Err(e) if e.is_retryable() && attempt < self.config.attempts => {
                    log::warn!("attempt {attempt}/{} failed: {e}, restarting", self.config.attempts);
                    self.transition(SessionState::Idle);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt<C>(
        &mut self,
        job: &UploadJob,
        chunk_size: NonZeroUsize,
        mut cancel: Pin<&mut C>,
    ) -> Result<UploadReport, UploadError>
    where
        C: Future<Output = ()>,
    {
        self.transition(SessionState::AwaitingDevice);
        let name = self.config.device_name.clone();
        let scan_timeout = self.config.scan_timeout();
        log::info!("scanning for a device named like {name:?} ({scan_timeout:?})");

        let found = tokio::select! {
            biased;
            _ = cancel.as_mut() => None,
            found = self.transport.discover_device(&name, scan_timeout) => Some(found),
        };
        let device = found
            .ok_or(UploadError::Cancelled { phase: Phase::Discovery })?
            .map_err(UploadError::DiscoveryFailed)?
            .ok_or_else(|| UploadError::DeviceNotFound { name: name.clone() })?;

        let opened = {
            let open = self.transport.open_session(device);
            tokio::pin!(open);
            tokio::select! {
                biased;
                _ = cancel.as_mut() => {
                    // the peripheral may already be connected, let it settle and close it
                    log::warn!("cancelled while connecting");
                    if let Ok(mut link) = open.as_mut().await {
                        if let Err(e) = link.close().await {
                            log::warn!("closing link failed: {e}");
                        }
                    }
                    None
                }
                link = open.as_mut() => Some(link),
            }
        };
        let mut link = opened
            .ok_or(UploadError::Cancelled { phase: Phase::Connect })?
            .map_err(UploadError::ConnectionFailed)?;
        self.transition(SessionState::Connected);

        let result = self.send_all(&mut link, job, chunk_size, cancel).await;
        if let Err(e) = link.close().await {
            log::warn!("closing link failed: {e}");
        }
        result
    }

    async fn send_all<C>(
        &mut self,
        link: &mut T::Link,
        job: &UploadJob,
        chunk_size: NonZeroUsize,
        mut cancel: Pin<&mut C>,
    ) -> Result<UploadReport, UploadError>
    where
        C: Future<Output = ()>,
    {
        let plan = FramePlan::new(&job.image, &job.bundle, chunk_size)?;
        let total_frames = plan.len();
        let total_bytes = plan.total_bytes();
        let signature_chunks = plan.signature_chunks();
        let firmware_chunks = plan.firmware_chunks();
        log::info!(
            "sending {} byte firmware and {} byte eMj as {total_frames} frames",
            job.image.len(),
            job.bundle.emj.len()
        );

        let write_timeout = self.config.write_timeout();
        let mut frames_sent = 0;
        let mut bytes_sent = 0;

        for (phase, frame) in plan {
            match phase {
                Phase::SignatureChunk(_) => self.transition(SessionState::SendingSignature),
                Phase::FirmwareChunk(_) => self.transition(SessionState::SendingFirmware),
                _ => {}
            }

            write_frame(link, phase, &frame, write_timeout, cancel.as_mut()).await?;
            frames_sent += 1;
            bytes_sent += frame.len();
            log::debug!("[{phase}] sent {} bytes", frame.len());

            match phase {
                Phase::Init => self.transition(SessionState::InitSent),
                Phase::End => self.transition(SessionState::Completed),
                _ => {}
            }

            if let Some(f) = self.on_progress.as_mut() {
                f(&Progress {
                    phase,
                    frames_sent,
                    total_frames,
                    bytes_sent,
                    total_bytes,
                });
            }
        }

        Ok(UploadReport {
            frames_sent,
            signature_chunks,
            firmware_chunks,
            bytes_sent,
            attempts: 1,
            elapsed: Duration::ZERO,
        })
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            log::debug!("session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

async fn write_frame<L, C>(
    link: &mut L,
    phase: Phase,
    frame: &[u8],
    write_timeout: Option<Duration>,
    cancel: Pin<&mut C>,
) -> Result<(), UploadError>
where
    L: Link,
    C: Future<Output = ()>,
{
    let write = async {
        match write_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, link.write(frame)).await {
                Ok(result) => result.map_err(|source| UploadError::WriteFailed { phase, source }),
                Err(_) => Err(UploadError::WriteTimeout { phase, timeout }),
            },
            None => link
                .write(frame)
                .await
                .map_err(|source| UploadError::WriteFailed { phase, source }),
        }
    };

    tokio::select! {
        biased;
        _ = cancel => Err(UploadError::Cancelled { phase }),
        result = write => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use ota_proto::{Frame, Init, MSG_CHUNK, MSG_END, MSG_INIT};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    const ADVERTISED_NAME: &str = "nimble-ota";

    #[derive(Default)]
    struct Record {
        frames: Vec<Vec<u8>>,
        scans: usize,
        opened: usize,
        closed: usize,
    }

    #[derive(Default)]
    struct MockTransport {
        record: Arc<Mutex<Record>>,
        absent: bool,
        connect_failures: usize,
        open_delay: Option<Duration>,
        fail_write_at: Option<usize>,
        write_delay: Option<Duration>,
        cancel_after: Option<(usize, oneshot::Sender<()>)>,
    }

    struct MockLink {
        record: Arc<Mutex<Record>>,
        fail_write_at: Option<usize>,
        write_delay: Option<Duration>,
        cancel_after: Option<(usize, oneshot::Sender<()>)>,
    }

    impl Transport for MockTransport {
        type Device = ();
        type Link = MockLink;

        async fn discover_device(
            &mut self,
            name: &str,
            _timeout: Duration,
        ) -> Result<Option<()>, TransportError> {
            self.record.lock().unwrap().scans += 1;
            Ok((!self.absent && ADVERTISED_NAME.contains(name)).then_some(()))
        }

        async fn open_session(&mut self, _device: ()) -> Result<MockLink, TransportError> {
            if self.connect_failures > 0 {
                self.connect_failures -= 1;
                return Err(TransportError::Other("connection refused".to_string()));
            }
            self.record.lock().unwrap().opened += 1;
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(MockLink {
                record: self.record.clone(),
                fail_write_at: self.fail_write_at,
                write_delay: self.write_delay,
                cancel_after: self.cancel_after.take(),
            })
        }
    }

    impl Link for MockLink {
        async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
            let sent = self.record.lock().unwrap().frames.len();
            if self.fail_write_at == Some(sent) {
                return Err(TransportError::Other("gatt write rejected".to_string()));
            }
            if let Some(delay) = self.write_delay {
                tokio::time::sleep(delay).await;
            }
            self.record.lock().unwrap().frames.push(frame.to_vec());

            if self.cancel_after.as_ref().is_some_and(|(n, _)| *n == sent + 1) {
                if let Some((_, tx)) = self.cancel_after.take() {
                    let _ = tx.send(());
                }
            }
            Ok(())
        }

        async fn close(&mut self) -> Result<(), TransportError> {
            self.record.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    fn job(firmware_len: usize, emj_len: usize) -> UploadJob {
        UploadJob::new(
            FirmwareImage::from_bytes((0..firmware_len).map(|i| (i % 251) as u8).collect()),
            SignatureBundle {
                index: 9,
                sj: vec![0xAB, 0x01],
                cj: vec![0xFF],
                emj: (0..emj_len).map(|i| (i % 13) as u8).collect(),
            },
        )
    }

    fn uploader(transport: MockTransport) -> (Uploader<MockTransport>, Arc<Mutex<Record>>) {
        let record = transport.record.clone();
        (Uploader::new(transport, UploadConfig::default()), record)
    }

    #[tokio::test]
    async fn frames_in_protocol_order() {
        let (mut uploader, record) = uploader(MockTransport::default());
        let job = job(370, 200);

        let report = uploader.upload(&job).await.unwrap();
        assert_eq!(uploader.state(), SessionState::Completed);
        assert_eq!(report.frames_sent, 1 + 2 + 3 + 1);
        assert_eq!(report.signature_chunks, 2);
        assert_eq!(report.firmware_chunks, 3);
        assert_eq!(report.attempts, 1);

        let record = record.lock().unwrap();
        assert_eq!(record.closed, 1);
        let frames: Vec<Frame> = record.frames.iter().map(|f| Frame::from_bytes(f).unwrap()).collect();
        let types: Vec<u8> = frames.iter().map(|f| f.msg_type).collect();
        assert_eq!(
            types,
            vec![MSG_INIT, MSG_CHUNK, MSG_CHUNK, MSG_CHUNK, MSG_CHUNK, MSG_CHUNK, MSG_END]
        );

        let init = Init::from_bytes(&frames[0].payload, 2, 1).unwrap();
        assert_eq!(init.total_size, 370);
        assert_eq!(init.index, 9);
        assert_eq!(init.sj, vec![0xAB, 0x01]);
        assert_eq!(init.cj, vec![0xFF]);
        assert_eq!(init.emj_len, 200);

        let emj: Vec<u8> = frames[1..3].iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(emj, job.bundle.emj);
        let lens: Vec<usize> = frames[3..6].iter().map(|f| f.payload.len()).collect();
        assert_eq!(lens, vec![180, 180, 10]);
        let firmware: Vec<u8> = frames[3..6].iter().flat_map(|f| f.payload.clone()).collect();
        assert_eq!(firmware, job.image.as_bytes());
        assert_eq!(report.bytes_sent, record.frames.iter().map(Vec::len).sum::<usize>());
    }

    #[tokio::test]
    async fn empty_firmware_is_accepted() {
        let (mut uploader, record) = uploader(MockTransport::default());
        let report = uploader.upload(&job(0, 5)).await.unwrap();
        assert_eq!(report.firmware_chunks, 0);

        let record = record.lock().unwrap();
        assert_eq!(record.frames.len(), 3);
        assert_eq!(&record.frames[0][1..5], &[0, 0, 0, 0]);
        assert_eq!(record.frames[2], vec![MSG_END]);
    }

    #[tokio::test]
    async fn device_not_found_sends_nothing() {
        let (mut uploader, record) = uploader(MockTransport { absent: true, ..Default::default() });
        let err = uploader.upload(&job(10, 10)).await.unwrap_err();
        assert!(matches!(err, UploadError::DeviceNotFound { .. }));
        assert_eq!(uploader.state(), SessionState::Failed);

        let record = record.lock().unwrap();
        assert!(record.frames.is_empty());
        assert_eq!(record.opened, 0);
    }

    #[tokio::test]
    async fn name_is_matched_as_substring() {
        let config = UploadConfig { device_name: "other".to_string(), ..Default::default() };
        let mut uploader = Uploader::new(MockTransport::default(), config);
        let err = uploader.upload(&job(10, 10)).await.unwrap_err();
        assert!(matches!(err, UploadError::DeviceNotFound { name } if name == "other"));

        let config = UploadConfig { device_name: "ota".to_string(), ..Default::default() };
        let mut uploader = Uploader::new(MockTransport::default(), config);
        uploader.upload(&job(10, 10)).await.unwrap();
    }

    #[tokio::test]
    async fn zero_chunk_size_fails_before_discovery() {
        let transport = MockTransport::default();
        let record = transport.record.clone();
        let config = UploadConfig { chunk_size: 0, ..Default::default() };
        let mut uploader = Uploader::new(transport, config);

        let err = uploader.upload(&job(10, 10)).await.unwrap_err();
        assert!(matches!(err, UploadError::InvalidConfiguration(_)));
        let record = record.lock().unwrap();
        assert_eq!(record.scans, 0);
        assert!(record.frames.is_empty());
    }

    #[tokio::test]
    async fn malformed_signature_sends_nothing() {
        let dir = std::env::temp_dir();
        let firmware = dir.join(format!("ota-session-{}.bin", std::process::id()));
        let signature = dir.join(format!("ota-session-{}.sig.json", std::process::id()));
        std::fs::write(&firmware, [0u8; 16]).unwrap();
        std::fs::write(&signature, r#"{"index": 1, "sj": "0xAB01", "cj": "ff", "eMj": "abc"}"#).unwrap();

        let (mut uploader, record) = uploader(MockTransport::default());
        let err = uploader.upload_files(&firmware, &signature).await.unwrap_err();
        std::fs::remove_file(&firmware).unwrap();
        std::fs::remove_file(&signature).unwrap();

        assert!(matches!(err, UploadError::MalformedSignature(_)));
        assert_eq!(uploader.state(), SessionState::Failed);
        let record = record.lock().unwrap();
        assert_eq!(record.scans, 0);
        assert!(record.frames.is_empty());
    }

    #[tokio::test]
    async fn write_failure_names_phase_and_closes() {
        // INIT, eMj 0, eMj 1, then the first firmware chunk fails
        let (mut uploader, record) =
            uploader(MockTransport { fail_write_at: Some(3), ..Default::default() });
        let err = uploader.upload(&job(370, 200)).await.unwrap_err();

        assert!(matches!(err, UploadError::WriteFailed { phase: Phase::FirmwareChunk(0), .. }));
        assert_eq!(uploader.state(), SessionState::Failed);
        let record = record.lock().unwrap();
        assert_eq!(record.frames.len(), 3);
        assert_eq!(record.closed, 1);
    }

    #[tokio::test]
    async fn write_timeout() {
        let transport = MockTransport {
            write_delay: Some(Duration::from_millis(500)),
            ..Default::default()
        };
        let record = transport.record.clone();
        let config = UploadConfig { write_timeout_ms: Some(20), ..Default::default() };
        let mut uploader = Uploader::new(transport, config);

        let err = uploader.upload(&job(10, 10)).await.unwrap_err();
        assert!(matches!(err, UploadError::WriteTimeout { phase: Phase::Init, .. }));
        let record = record.lock().unwrap();
        assert!(record.frames.is_empty());
        assert_eq!(record.closed, 1);
    }

    #[tokio::test]
    async fn cancel_stops_writes_and_closes() {
        let (tx, rx) = oneshot::channel();
        let (mut uploader, record) =
            uploader(MockTransport { cancel_after: Some((2, tx)), ..Default::default() });

        let cancel = async {
            let _ = rx.await;
        };
        let err = uploader.upload_until(&job(370, 200), cancel).await.unwrap_err();

        assert!(matches!(err, UploadError::Cancelled { phase: Phase::SignatureChunk(1) }));
        assert!(!err.is_retryable());
        let record = record.lock().unwrap();
        assert_eq!(record.frames.len(), 2);
        assert_eq!(record.closed, 1);
    }

    #[tokio::test]
    async fn cancel_before_discovery() {
        let (mut uploader, record) = uploader(MockTransport::default());
        let err = uploader
            .upload_until(&job(10, 10), std::future::ready(()))
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Cancelled { phase: Phase::Discovery }));
        let record = record.lock().unwrap();
        assert_eq!(record.scans, 0);
        assert_eq!(record.opened, 0);
    }

    #[tokio::test]
    async fn cancel_while_connecting_closes_link() {
        let (mut uploader, record) = uploader(MockTransport {
            open_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let cancel = tokio::time::sleep(Duration::from_millis(50));

        let err = uploader.upload_until(&job(10, 10), cancel).await.unwrap_err();
        assert!(matches!(err, UploadError::Cancelled { phase: Phase::Connect }));
        assert_eq!(uploader.state(), SessionState::Failed);
        let record = record.lock().unwrap();
        assert_eq!(record.opened, 1);
        assert_eq!(record.closed, 1);
        assert!(record.frames.is_empty());
    }

    #[tokio::test]
    async fn whole_session_retry() {
        let transport = MockTransport { connect_failures: 1, ..Default::default() };
        let record = transport.record.clone();
        let config = UploadConfig { attempts: 2, ..Default::default() };
        let mut uploader = Uploader::new(transport, config);

        let report = uploader.upload(&job(370, 200)).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.frames_sent, 7);
        let record = record.lock().unwrap();
        assert_eq!(record.scans, 2);
        assert_eq!(record.frames.len(), 7);
    }

    #[tokio::test]
    async fn single_attempt_by_default() {
        let (mut uploader, record) =
            uploader(MockTransport { connect_failures: 1, ..Default::default() });
        let err = uploader.upload(&job(10, 10)).await.unwrap_err();
        assert!(matches!(err, UploadError::ConnectionFailed(_)));
        assert_eq!(record.lock().unwrap().scans, 1);
    }

    #[tokio::test]
    async fn progress_reports_every_frame() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let transport = MockTransport::default();
        let mut uploader = Uploader::new(transport, UploadConfig::default())
            .on_progress(move |p| sink.lock().unwrap().push(*p));

        let report = uploader.upload(&job(370, 200)).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), report.frames_sent);
        assert_eq!(seen[0].phase, Phase::Init);
        let last = seen.last().unwrap();
        assert_eq!(last.phase, Phase::End);
        assert_eq!(last.frames_sent, last.total_frames);
        assert_eq!(last.bytes_sent, last.total_bytes);
        assert_eq!(last.bytes_sent, report.bytes_sent);
    }
}
