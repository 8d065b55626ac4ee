use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::chunk::{build_chunks, part_path, part_prefix, Chunk};
use crate::config::{CHUNK_RETRIES, CHUNK_RETRY_DELAY, MAX_ARTIFACT_BYTES, PROGRESS_TICK};
use crate::error::{CoreError, CoreResult};
use crate::net::{FetchResponse, HttpClient};

const STREAM_BUF_BYTES: usize = 64 * 1024;

/// Single cancellation source shared by the probe, every chunk stream, the
/// fallback stream and the ticker. Carries the per-task deadline so the
/// global timeout fires through the same observation points as an abort.
pub struct CancelToken {
    aborted: AtomicBool,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            deadline: None,
        }
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            aborted: AtomicBool::new(false),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancel(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.aborted_explicitly() || self.deadline_expired()
    }

    /// True only for `cancel()` calls, i.e. operator pause or delete.
    pub fn aborted_explicitly(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn deadline_expired(&self) -> bool {
        match self.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    pub downloaded: u64,
    pub total: u64,
    pub speed: String,
}

pub type ProgressFn = dyn Fn(ProgressUpdate) + Send + Sync;

pub fn format_speed(bytes_per_sec: f64) -> String {
    let bytes_per_sec = if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
        bytes_per_sec
    } else {
        0.0
    };
    if bytes_per_sec < 1024.0 {
        format!("{} B/s", bytes_per_sec.round() as u64)
    } else if bytes_per_sec < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    }
}

/// Parallel range-request downloader with single-stream fallback.
pub struct ChunkedDownloader {
    url: String,
    dest: PathBuf,
    threads: u32,
    client: Arc<dyn HttpClient>,
    cancel: Arc<CancelToken>,
    on_progress: Arc<ProgressFn>,
}

impl ChunkedDownloader {
    pub fn new(
        url: String,
        dest: PathBuf,
        threads: u32,
        client: Arc<dyn HttpClient>,
        cancel: Arc<CancelToken>,
        on_progress: Arc<ProgressFn>,
    ) -> Self {
        Self {
            url,
            dest,
            threads,
            client,
            cancel,
            on_progress,
        }
    }

    pub fn download(&self) -> CoreResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Aborted);
        }

        // A failed probe is not fatal on its own; it just rules out ranges.
        let probe = match self.client.head(&self.url) {
            Ok(probe) => Some(probe),
            Err(err) => {
                tracing::debug!("probe failed for {}: {}", self.url, err);
                None
            }
        };

        match probe {
            Some(probe) if probe.supports_ranges() => {
                let total = probe.total_bytes.unwrap_or(0);
                if total > MAX_ARTIFACT_BYTES {
                    return Err(CoreError::SizeLimit);
                }
                self.download_chunked(total)
            }
            _ => self.download_single(),
        }
    }

    /// Set the abort flag and sweep part files left by a torn-down run.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.remove_parts();
    }

    fn download_chunked(&self, total: u64) -> CoreResult<()> {
        let chunks = build_chunks(total, self.threads);
        let counters: Arc<Vec<AtomicU64>> =
            Arc::new((0..chunks.len()).map(|_| AtomicU64::new(0)).collect());
        let ticker = Ticker::spawn(
            total,
            Arc::clone(&counters),
            Arc::clone(&self.on_progress),
            Arc::clone(&self.cancel),
        );

        let errors: Arc<Mutex<Vec<CoreError>>> = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let chunk = *chunk;
            let url = self.url.clone();
            let part = part_path(&self.dest, chunk.index);
            let client = Arc::clone(&self.client);
            let cancel = Arc::clone(&self.cancel);
            let counters = Arc::clone(&counters);
            let errors = Arc::clone(&errors);
            handles.push(thread::spawn(move || {
                let counter = &counters[chunk.index as usize];
                if let Err(err) = fetch_chunk(&url, &part, chunk, client, &cancel, counter) {
                    // First failure aborts the sibling chunks.
                    if !matches!(err, CoreError::Aborted) {
                        cancel.cancel();
                    }
                    if let Ok(mut errors) = errors.lock() {
                        errors.push(err);
                    }
                }
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }
        ticker.stop();

        // A failing chunk cancels its siblings, so their Aborted results are
        // secondary; surface the originating error when one exists.
        let first_error = errors.lock().ok().and_then(|mut errors| {
            match errors
                .iter()
                .position(|err| !matches!(err, CoreError::Aborted))
            {
                Some(index) => Some(errors.remove(index)),
                None => None,
            }
        });
        if let Some(err) = first_error {
            return Err(err);
        }
        if self.cancel.is_cancelled() {
            return Err(CoreError::Aborted);
        }

        self.merge_parts(&chunks)?;
        (self.on_progress)(ProgressUpdate {
            downloaded: total,
            total,
            speed: "0 B/s".to_string(),
        });
        Ok(())
    }

    fn merge_parts(&self, chunks: &[Chunk]) -> CoreResult<()> {
        let mut out =
            File::create(&self.dest).map_err(|err| CoreError::Io(err.to_string()))?;
        for chunk in chunks {
            let path = part_path(&self.dest, chunk.index);
            let mut part = File::open(&path).map_err(|err| CoreError::Io(err.to_string()))?;
            io::copy(&mut part, &mut out).map_err(|err| CoreError::Io(err.to_string()))?;
        }
        out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        drop(out);
        for chunk in chunks {
            let _ = fs::remove_file(part_path(&self.dest, chunk.index));
        }
        Ok(())
    }

    fn download_single(&self) -> CoreResult<()> {
        let resp = self.client.fetch(&self.url, None)?;
        if !(200..300).contains(&resp.status) {
            return Err(CoreError::Network(format!(
                "download failed with status {}",
                resp.status
            )));
        }
        if let Some(len) = resp.content_length {
            if len > MAX_ARTIFACT_BYTES {
                return Err(CoreError::SizeLimit);
            }
        }
        let total = resp.content_length.unwrap_or(0);

        let counters: Arc<Vec<AtomicU64>> = Arc::new(vec![AtomicU64::new(0)]);
        let ticker = Ticker::spawn(
            total,
            Arc::clone(&counters),
            Arc::clone(&self.on_progress),
            Arc::clone(&self.cancel),
        );
        let result = self.stream_single(resp, &counters[0]);
        ticker.stop();
        let written = counters[0].load(Ordering::Relaxed);
        result?;

        let total = if total > 0 { total } else { written };
        (self.on_progress)(ProgressUpdate {
            downloaded: total,
            total,
            speed: "0 B/s".to_string(),
        });
        Ok(())
    }

    fn stream_single(&self, mut resp: FetchResponse, counter: &AtomicU64) -> CoreResult<()> {
        let mut out =
            File::create(&self.dest).map_err(|err| CoreError::Io(err.to_string()))?;
        let mut buf = vec![0u8; STREAM_BUF_BYTES];
        let mut written = 0u64;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Aborted);
            }
            let read = resp
                .body
                .read(&mut buf)
                .map_err(|err| CoreError::Network(err.to_string()))?;
            if read == 0 {
                break;
            }
            written += read as u64;
            if written > MAX_ARTIFACT_BYTES {
                return Err(CoreError::SizeLimit);
            }
            out.write_all(&buf[..read])
                .map_err(|err| CoreError::Io(err.to_string()))?;
            counter.store(written, Ordering::Relaxed);
        }
        out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
        Ok(())
    }

    fn remove_parts(&self) {
        let Some(prefix) = part_prefix(&self.dest) else {
            return;
        };
        let Some(parent) = self.dest.parent() else {
            return;
        };
        let Ok(entries) = fs::read_dir(parent) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&prefix) {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

fn fetch_chunk(
    url: &str,
    part: &std::path::Path,
    chunk: Chunk,
    client: Arc<dyn HttpClient>,
    cancel: &CancelToken,
    counter: &AtomicU64,
) -> CoreResult<()> {
    let mut last_error: Option<CoreError> = None;
    for attempt in 0..CHUNK_RETRIES {
        if cancel.is_cancelled() {
            return Err(CoreError::Aborted);
        }
        if attempt > 0 {
            sleep_cancellable(CHUNK_RETRY_DELAY, cancel)?;
        }
        match fetch_chunk_once(url, part, chunk, client.as_ref(), cancel, counter) {
            Ok(()) => return Ok(()),
            Err(CoreError::Aborted) => return Err(CoreError::Aborted),
            Err(err) => {
                tracing::debug!("chunk {} attempt {} failed: {}", chunk.index, attempt + 1, err);
                last_error = Some(err);
            }
        }
    }
    Err(last_error
        .unwrap_or_else(|| CoreError::Network(format!("failed to download chunk {}", chunk.index))))
}

fn fetch_chunk_once(
    url: &str,
    part: &std::path::Path,
    chunk: Chunk,
    client: &dyn HttpClient,
    cancel: &CancelToken,
    counter: &AtomicU64,
) -> CoreResult<()> {
    let mut resp = client.fetch(url, Some((chunk.start, chunk.end)))?;
    // 200 means the origin ignored the range; the bytes are still usable.
    if resp.status != 206 && resp.status != 200 {
        return Err(CoreError::Network(format!(
            "chunk {} got status {}",
            chunk.index, resp.status
        )));
    }

    let mut out = File::create(part).map_err(|err| CoreError::Io(err.to_string()))?;
    counter.store(0, Ordering::Relaxed);
    let expected = chunk.len();
    let mut written = 0u64;
    let mut buf = vec![0u8; STREAM_BUF_BYTES];
    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Aborted);
        }
        let read = resp
            .body
            .read(&mut buf)
            .map_err(|err| CoreError::Network(err.to_string()))?;
        if read == 0 {
            break;
        }
        written += read as u64;
        if written > expected.saturating_mul(2) {
            return Err(CoreError::Network(format!(
                "chunk {} exceeded expected size",
                chunk.index
            )));
        }
        out.write_all(&buf[..read])
            .map_err(|err| CoreError::Io(err.to_string()))?;
        counter.store(written, Ordering::Relaxed);
    }
    out.flush().map_err(|err| CoreError::Io(err.to_string()))?;
    Ok(())
}

fn sleep_cancellable(duration: Duration, cancel: &CancelToken) -> CoreResult<()> {
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if cancel.is_cancelled() {
            return Err(CoreError::Aborted);
        }
        thread::sleep(Duration::from_millis(50));
    }
    Ok(())
}

/// Sums the per-chunk byte counters every tick and reports bytes-per-second
/// over the elapsed interval.
struct Ticker {
    run: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    fn spawn(
        total: u64,
        counters: Arc<Vec<AtomicU64>>,
        on_progress: Arc<ProgressFn>,
        cancel: Arc<CancelToken>,
    ) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let run_flag = Arc::clone(&run);
        let handle = thread::spawn(move || {
            let mut last_downloaded = 0u64;
            let mut last_tick = Instant::now();
            while run_flag.load(Ordering::Relaxed) {
                thread::sleep(PROGRESS_TICK);
                if !run_flag.load(Ordering::Relaxed) || cancel.is_cancelled() {
                    break;
                }
                let downloaded: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
                let now = Instant::now();
                let elapsed = now.duration_since(last_tick).as_secs_f64();
                let delta = downloaded.saturating_sub(last_downloaded);
                let speed = format_speed(delta as f64 / elapsed);
                (on_progress)(ProgressUpdate {
                    downloaded,
                    total,
                    speed,
                });
                last_downloaded = downloaded;
                last_tick = now;
            }
        });
        Self {
            run,
            handle: Some(handle),
        }
    }

    fn stop(mut self) {
        self.run.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_formatting_matches_units() {
        assert_eq!(format_speed(0.0), "0 B/s");
        assert_eq!(format_speed(500.0), "500 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(1_572_864.0), "1.5 MB/s");
        assert_eq!(format_speed(f64::NAN), "0 B/s");
        assert_eq!(format_speed(f64::INFINITY), "0 B/s");
    }

    #[test]
    fn cancel_token_observes_abort_and_deadline() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());

        let expired = CancelToken::with_deadline(Duration::from_millis(0));
        assert!(expired.is_cancelled());
        let live = CancelToken::with_deadline(Duration::from_secs(3600));
        assert!(!live.is_cancelled());
    }
}
