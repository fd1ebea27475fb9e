use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cache::MetaCache;
use crate::stream::Stream;
use crate::worker::Worker;

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub workers: u32,
    /// admission cap on concurrent streams, 0 = unlimited
    pub clients: u32,
    /// play-ahead budget copied onto every dispatched stream
    pub throttle: f64,
    /// metadata cache budget in bytes, 0 = no cache
    pub cache: u64,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            workers: 2,
            clients: 1000,
            throttle: 20.0,
            cache: 256 * 1_048_576,
        }
    }
}

/// The streaming engine: a pool of workers sharing one metadata cache.
/// Streams go to the least-loaded worker; the pool tears down in order
/// when the engine drops.
pub struct Engine {
    options: EngineOptions,
    cache: Option<Arc<MetaCache>>,
    pool: Vec<Worker>,
}

impl Engine {
    pub fn new(options: EngineOptions) -> Engine {
        let cache = if options.cache > 0 {
            Some(Arc::new(MetaCache::new(options.cache as usize)))
        } else {
            None
        };
        let pool: Vec<Worker> = (0..options.workers.max(1))
            .map(|i| Worker::new(i as usize + 1, cache.clone()))
            .collect();
        log::info!("engine up with {} workers", pool.len());
        Engine {
            options,
            cache,
            pool,
        }
    }

    /// Routes a stream to the least-loaded worker. The stream comes back
    /// when the engine is at its admission cap; the caller translates
    /// that into a 503.
    pub fn dispatch(&self, mut stream: Box<Stream>) -> Result<(), Box<Stream>> {
        if self.options.clients > 0 && self.monitor("load") >= self.options.clients as f64 {
            return Err(stream);
        }
        stream.throttle = self.options.throttle;
        match self
            .pool
            .iter()
            .min_by_key(|worker| worker.stats.load.load(Ordering::Relaxed))
        {
            Some(worker) => worker.enqueue(stream),
            None => Err(stream),
        }
    }

    /// The monitoring surface. `data:total` pivots each worker's byte
    /// counter into a rate once a second; `data:delay` returns the mean
    /// delay across workers and resets it as a side effect.
    pub fn monitor(&self, indicator: &str) -> f64 {
        match indicator {
            "load" => self
                .pool
                .iter()
                .map(|w| w.stats.load.load(Ordering::Relaxed) as f64)
                .sum(),
            "cache:used" => self.cache.as_ref().map_or(0.0, |c| c.used() as f64),
            "cache:items" => self.cache.as_ref().map_or(0.0, |c| c.items() as f64),
            "cache:hits" => self
                .pool
                .iter()
                .map(|w| w.stats.cache_hits.load(Ordering::Relaxed) as f64)
                .sum(),
            "cache:misses" => self
                .pool
                .iter()
                .map(|w| w.stats.cache_misses.load(Ordering::Relaxed) as f64)
                .sum(),
            "data:total" => {
                let mut result = 0.0;
                for worker in &self.pool {
                    let delta = worker.stats.data_pivot.load().elapsed().as_secs_f64();
                    let total = worker.stats.data_total.load(Ordering::Relaxed);
                    result += total as f64 / if delta > 0.0 { delta } else { 1.0 };
                    if delta > 1.0 && total > 0 {
                        worker.stats.data_total.store(0, Ordering::Relaxed);
                        worker.stats.data_pivot.store(std::time::Instant::now());
                    }
                }
                result
            }
            "data:delay" => {
                let mut result = 0.0;
                for worker in &self.pool {
                    result += worker.stats.delay_average.load();
                    worker.zero();
                }
                result / self.pool.len() as f64
            }
            _ => 0.0,
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::testkit;
    use smol::io::AsyncReadExt;
    use smol::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            smol::future::zip(TcpStream::connect(addr), listener.accept()).await;
        (client.unwrap(), accepted.unwrap().0)
    }

    #[test]
    fn defaults_match_the_documented_configuration() {
        let options = EngineOptions::default();
        assert_eq!(options.workers, 2);
        assert_eq!(options.clients, 1000);
        assert!((options.throttle - 20.0).abs() < f64::EPSILON);
        assert_eq!(options.cache, 256 * 1_048_576);
    }

    #[test]
    fn idle_engine_reports_zeroes() {
        let engine = Engine::new(EngineOptions {
            workers: 2,
            clients: 10,
            throttle: 0.0,
            cache: 1_048_576,
        });
        assert_eq!(engine.monitor("load"), 0.0);
        assert_eq!(engine.monitor("cache:items"), 0.0);
        assert_eq!(engine.monitor("cache:hits"), 0.0);
        assert_eq!(engine.monitor("data:delay"), 0.0);
        assert_eq!(engine.monitor("no-such-indicator"), 0.0);
    }

    #[test]
    fn admission_cap_bounces_streams_back() {
        smol::block_on(async {
            let engine = Engine::new(EngineOptions {
                workers: 2,
                clients: 2,
                throttle: 0.0,
                cache: 0,
            });
            // saturate the pool from the outside
            engine.pool[0].stats.load.fetch_add(1, Ordering::Relaxed);
            engine.pool[1].stats.load.fetch_add(1, Ordering::Relaxed);

            let (_client, server) = socket_pair().await;
            let stream = Box::new(Stream::new(
                server,
                "1.1",
                "/tmp/x.mp4",
                "video/mp4",
                false,
                0.0,
                0.0,
            ));
            assert!(engine.dispatch(stream).is_err());
            assert_eq!(engine.monitor("load"), 2.0);

            engine.pool[0].stats.load.fetch_sub(1, Ordering::Relaxed);
            engine.pool[1].stats.load.fetch_sub(1, Ordering::Relaxed);
        });
    }

    #[test]
    fn dispatched_stream_is_served_by_a_worker() {
        smol::block_on(async {
            let (file, _) = testkit::MovieSpec::basic().build();
            let path = testkit::write_temp("engine-mp4", &file);

            let engine = Engine::new(EngineOptions {
                workers: 2,
                clients: 10,
                throttle: 20.0,
                cache: 1_048_576,
            });
            let (mut client, server) = socket_pair().await;
            let stream = Box::new(Stream::new(
                server,
                "1.1",
                path.to_str().unwrap(),
                "video/mp4",
                false,
                0.0,
                0.0,
            ));
            engine.dispatch(stream).map_err(|_| "overload").unwrap();

            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            std::fs::remove_file(&path).unwrap();

            assert!(response.starts_with(b"HTTP/1.1 200 OK\n"));
            assert_eq!(engine.monitor("cache:misses"), 1.0);
            assert!(engine.monitor("cache:items") > 0.0);
        });
    }

    #[test]
    fn parse_failure_turns_into_a_500_response() {
        smol::block_on(async {
            let engine = Engine::new(EngineOptions {
                workers: 1,
                clients: 10,
                throttle: 0.0,
                cache: 0,
            });
            let (mut client, server) = socket_pair().await;
            let stream = Box::new(Stream::new(
                server,
                "1.1",
                "/nowhere/missing.mp4",
                "video/mp4",
                false,
                0.0,
                0.0,
            ));
            engine.dispatch(stream).map_err(|_| "overload").unwrap();

            let mut response = Vec::new();
            client.read_to_end(&mut response).await.unwrap();
            assert_eq!(
                response,
                b"HTTP/1.1 500 Internal Server Error\r\n\r\n".to_vec()
            );
        });
    }
}
