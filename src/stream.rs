use smol::io::AsyncWriteExt;
use smol::net::TcpStream;
use smol::Timer;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::MetaCache;
use crate::format::{flv, http_head, mp4_splice, ClipPlan, ClipRequest, MediaSource};
use crate::format::{MIME_FLV, MIME_MP4};
use crate::worker::WorkerStats;

/// minimum clipped length worth throttling (1 MiB)
pub const STREAM_THROTTLE_FROM: u64 = 1_048_576;
/// send-inactivity timeout while playing
pub const STREAM_SEND_TIMEOUT: Duration = Duration::from_secs(60);

const SEND_CHUNK: usize = 64 * 1024;

/// One client connection. Built by the HTTP front end, dispatched by the
/// engine, and owned by exactly one worker from enqueue to teardown; the
/// socket and file close with it on every exit path.
pub struct Stream {
    pub socket: TcpStream,
    pub http: String,
    pub path: String,
    pub mime: String,
    pub spatial: bool,
    pub start: f64,
    pub stop: f64,
    /// offsets-index window length in seconds
    pub period: f64,
    /// play-ahead budget in seconds, 0 = unthrottled
    pub throttle: f64,
}

struct LoadGuard(Arc<WorkerStats>);

impl LoadGuard {
    fn new(stats: &Arc<WorkerStats>) -> Self {
        stats.load.fetch_add(1, Ordering::Relaxed);
        LoadGuard(stats.clone())
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.load.fetch_sub(1, Ordering::Relaxed);
    }
}

fn any_parse(http: &str, mime: &str, file_length: u64) -> ClipPlan {
    ClipPlan {
        head: http_head(http, mime, file_length).into_bytes(),
        file_offset: 0,
        file_finish: file_length,
        periods: 0,
        offsets: Arc::new(Vec::new()),
        start: 0.0,
        stop: 0.0,
    }
}

impl Stream {
    pub fn new(
        socket: TcpStream,
        http: &str,
        path: &str,
        mime: &str,
        spatial: bool,
        start: f64,
        stop: f64,
    ) -> Stream {
        Stream {
            socket,
            http: http.to_owned(),
            path: path.to_owned(),
            mime: mime.to_owned(),
            spatial,
            start,
            stop,
            period: 1.0,
            throttle: 0.0,
        }
    }

    /// Runs the whole connection: parse, head, throttled body. A parse
    /// failure turns into a bare 500 status line; transport errors tear
    /// the stream down quietly. Consumes the stream, which closes the
    /// socket and file on return.
    pub async fn run(mut self, cache: Option<Arc<MetaCache>>, stats: Arc<WorkerStats>) {
        let _load = LoadGuard::new(&stats);
        match self.open_and_parse(cache.as_deref(), &stats) {
            Ok((file, plan)) => {
                if let Err(e) = self.serve(file, plan, &stats).await {
                    log::debug!("[stream] {} closed: {}", self.path, e);
                }
            }
            Err(e) => {
                log::warn!("File \"{}\" could not be served ({})!", self.path, e);
                let _ = self.serve_error("500 Internal Server Error", &stats).await;
            }
        }
        let _ = self.socket.set_nodelay(true);
    }

    fn open_and_parse(
        &mut self,
        cache: Option<&MetaCache>,
        stats: &WorkerStats,
    ) -> anyhow::Result<(File, ClipPlan)> {
        let file = File::open(&self.path)?;
        let file_length = file.metadata()?.len();
        let source = MediaSource {
            file: &file,
            file_length,
            path: &self.path,
            cache,
            stats,
        };
        let request = ClipRequest {
            http: &self.http,
            start: self.start,
            stop: self.stop,
            spatial: self.spatial,
            period: self.period,
        };
        let plan = match self.mime.as_str() {
            MIME_MP4 => mp4_splice::parse(&source, &request)?,
            MIME_FLV => flv::parse(&source, &request)?,
            _ => {
                self.throttle = 0.0;
                any_parse(&self.http, &self.mime, file_length)
            }
        };
        Ok((file, plan))
    }

    async fn serve(
        &mut self,
        file: File,
        plan: ClipPlan,
        stats: &WorkerStats,
    ) -> anyhow::Result<()> {
        let ClipPlan {
            head,
            mut file_offset,
            file_finish,
            periods,
            offsets,
            start,
            ..
        } = plan;

        // short payloads are not worth pacing
        let mut throttle = self.throttle;
        if file_finish - file_offset <= STREAM_THROTTLE_FROM {
            throttle = 0.0;
        }

        // cork while the head and the first window go out
        let _ = self.socket.set_nodelay(false);
        let mut nagle = true;
        let tzero = Instant::now();

        self.send_all(&head, stats).await?;
        drop(head);

        let mut file_target = 0u64;
        let mut load_head = 0.0f64;
        let mut buf = vec![0u8; SEND_CHUNK];
        loop {
            let old_target = file_target;
            let old_load_head = load_head;

            if throttle > 0.0 {
                let play_head = tzero.elapsed().as_secs_f64();
                load_head = start + play_head + throttle;
                let target = (load_head / self.period).ceil() as usize;
                file_target = if target >= periods {
                    file_finish
                } else {
                    offsets.get(target).copied().unwrap_or(file_finish)
                };
            } else {
                file_target = file_finish;
            }

            // the head advanced while we were still behind the old target
            stats.delay_point(file_offset < old_target, load_head - old_load_head);

            if file_target > file_offset {
                let want = ((file_target - file_offset) as usize).min(buf.len());
                let got = file.read_at(&mut buf[..want], file_offset)?;
                if got == 0 {
                    anyhow::bail!("file ended before the send target");
                }
                self.send_all(&buf[..got], stats).await?;
                file_offset += got as u64;
                if file_offset < file_target {
                    continue;
                }
            }

            if file_offset >= file_finish {
                break;
            }

            // pop the cork once the first full window is out
            if nagle {
                nagle = false;
                self.socket.set_nodelay(true)?;
            }
            Timer::after(Duration::from_secs_f64(self.period)).await;
        }
        Ok(())
    }

    async fn serve_error(&mut self, code: &str, stats: &WorkerStats) -> anyhow::Result<()> {
        let head = format!("HTTP/{} {}\r\n\r\n", self.http, code);
        self.send_all(head.as_bytes(), stats).await
    }

    /// Pushes a buffer fully onto the socket; each write races the send
    /// timeout, so a stalled client destroys the stream.
    async fn send_all(&mut self, mut data: &[u8], stats: &WorkerStats) -> anyhow::Result<()> {
        while !data.is_empty() {
            let socket = &mut self.socket;
            let write = async move { socket.write(data).await.map_err(anyhow::Error::from) };
            let expire = async {
                Timer::after(STREAM_SEND_TIMEOUT).await;
                Err(anyhow::anyhow!("send timed out"))
            };
            let sent = smol::future::or(write, expire).await?;
            if sent == 0 {
                anyhow::bail!("connection closed");
            }
            stats.add_data(sent as u64);
            data = &data[sent..];
        }
        Ok(())
    }
}
