use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::cache::MetaCache;
use crate::worker::WorkerStats;

pub mod flv;
pub mod flv_meta;
pub mod mp4;
pub mod mp4_seek;
pub mod mp4_splice;

pub const MIME_MP4: &str = "video/mp4";
pub const MIME_FLV: &str = "video/x-flv";

/// Everything a parser may touch: the open file, its length, the cache
/// and the owning worker's counters.
pub struct MediaSource<'a> {
    pub file: &'a File,
    pub file_length: u64,
    pub path: &'a str,
    pub cache: Option<&'a MetaCache>,
    pub stats: &'a WorkerStats,
}

#[derive(Clone, Debug)]
pub struct ClipRequest<'a> {
    pub http: &'a str,
    pub start: f64,
    pub stop: f64,
    /// start/stop are byte offsets instead of seconds
    pub spatial: bool,
    /// offsets-index window length in seconds
    pub period: f64,
}

/// Parser output: the response head plus the byte range of the source
/// file that follows it on the wire.
#[derive(Debug)]
pub struct ClipPlan {
    pub head: Vec<u8>,
    pub file_offset: u64,
    pub file_finish: u64,
    pub periods: usize,
    pub offsets: Arc<Vec<u64>>,
    pub start: f64,
    pub stop: f64,
}

pub fn http_head(http: &str, mime: &str, content_length: u64) -> String {
    format!(
        "HTTP/{} 200 OK\n\
         Content-Type: {}\n\
         Content-Length: {}\n\
         Cache-Control: no-store, no-cache, must-revalidate, post-check=0, pre-check=0\n\
         Expires: Mon, 29 Mar 1982 12:00:00 GMT\n\
         Server: {} {}\n\n",
        http,
        mime,
        content_length,
        crate::SERVER_NAME,
        crate::SERVER_VERSION
    )
}

pub(crate) fn pread_exact(file: &File, buf: &mut [u8], offset: u64) -> anyhow::Result<()> {
    file.read_exact_at(buf, offset)
        .map_err(|e| anyhow::anyhow!("short read at {}: {}", offset, e))
}

/// Offset tables are cached as packed u64 values; the cache is
/// process-local so the native encoding is fine.
pub(crate) fn encode_offsets(offsets: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(offsets.len() * 8);
    for offset in offsets {
        bytes.extend_from_slice(&offset.to_ne_bytes());
    }
    bytes
}

pub(crate) fn decode_offsets(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            u64::from_ne_bytes(raw)
        })
        .collect()
}

/// Synthetic media files for the format tests, assembled the same way the
/// server emits boxes: size-prefixed payload fragments.
#[cfg(test)]
pub(crate) mod testkit {
    pub fn mp4_box(box_type: &[u8; 4], payloads: Vec<&[u8]>) -> Vec<u8> {
        let size: u32 = 8 + payloads.iter().map(|x| x.len() as u32).sum::<u32>();
        let mut buffer = Vec::with_capacity(size as usize);
        buffer.extend_from_slice(&size.to_be_bytes());
        buffer.extend_from_slice(box_type);
        for p in payloads {
            buffer.extend_from_slice(p);
        }
        buffer
    }

    pub fn full_box(box_type: &[u8; 4], version: u8, body: &[u8]) -> Vec<u8> {
        let mut payload = vec![version, 0x00, 0x00, 0x00];
        payload.extend_from_slice(body);
        mp4_box(box_type, vec![&payload])
    }

    fn be32(values: &[u32]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes
    }

    pub fn stts(entries: &[(u32, u32)]) -> Vec<u8> {
        let mut body = be32(&[entries.len() as u32]);
        for (count, duration) in entries {
            body.extend_from_slice(&be32(&[*count, *duration]));
        }
        full_box(b"stts", 0, &body)
    }

    pub fn stss(samples: &[u32]) -> Vec<u8> {
        let mut body = be32(&[samples.len() as u32]);
        body.extend_from_slice(&be32(samples));
        full_box(b"stss", 0, &body)
    }

    pub fn stsc(entries: &[(u32, u32, u32)]) -> Vec<u8> {
        let mut body = be32(&[entries.len() as u32]);
        for (first, samples, id) in entries {
            body.extend_from_slice(&be32(&[*first, *samples, *id]));
        }
        full_box(b"stsc", 0, &body)
    }

    pub fn stsz(size: u32, sizes: &[u32]) -> Vec<u8> {
        let mut body = be32(&[size, sizes.len() as u32]);
        body.extend_from_slice(&be32(sizes));
        full_box(b"stsz", 0, &body)
    }

    pub fn stco(offsets: &[u32]) -> Vec<u8> {
        let mut body = be32(&[offsets.len() as u32]);
        body.extend_from_slice(&be32(offsets));
        full_box(b"stco", 0, &body)
    }

    pub fn co64(offsets: &[u64]) -> Vec<u8> {
        let mut body = be32(&[offsets.len() as u32]);
        for o in offsets {
            body.extend_from_slice(&o.to_be_bytes());
        }
        full_box(b"co64", 0, &body)
    }

    pub fn mvhd(scale: u32, duration: u32) -> Vec<u8> {
        // version/flags + ctime/mtime + scale + duration, then rate,
        // volume, reserved, matrix, predefined and next_track_id
        let mut body = be32(&[0, 0, scale, duration]);
        body.extend_from_slice(&be32(&[0x0001_0000]));
        body.extend_from_slice(&[0x01, 0x00, 0x00, 0x00]);
        body.extend_from_slice(&[0u8; 8]);
        body.extend_from_slice(&be32(&[
            0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000,
        ]));
        body.extend_from_slice(&[0u8; 24]);
        body.extend_from_slice(&be32(&[2]));
        full_box(b"mvhd", 0, &body)
    }

    pub fn tkhd(duration: u32) -> Vec<u8> {
        let mut payload = vec![0x00, 0x00, 0x00, 0x01]; // version, enabled flag
        payload.extend_from_slice(&be32(&[0, 0, 1, 0, duration]));
        payload.extend_from_slice(&[0u8; 60]);
        mp4_box(b"tkhd", vec![&payload])
    }

    pub fn mdhd(scale: u32, duration: u32) -> Vec<u8> {
        let mut body = be32(&[0, 0, scale, duration]);
        body.extend_from_slice(&[0x55, 0xc4, 0x00, 0x00]);
        full_box(b"mdhd", 0, &body)
    }

    pub fn hdlr(handler: &[u8; 4]) -> Vec<u8> {
        let mut body = be32(&[0]);
        body.extend_from_slice(handler);
        body.extend_from_slice(&[0u8; 12]);
        body.push(0x00);
        full_box(b"hdlr", 0, &body)
    }

    pub fn stsd_stub() -> Vec<u8> {
        full_box(b"stsd", 0, &be32(&[0]))
    }

    pub fn vmhd() -> Vec<u8> {
        full_box(b"vmhd", 0, &[0u8; 8])
    }

    pub fn smhd() -> Vec<u8> {
        full_box(b"smhd", 0, &[0u8; 4])
    }

    pub fn ftyp() -> Vec<u8> {
        mp4_box(b"ftyp", vec![b"isom", &[0, 0, 0, 1], b"isom", b"avc1"])
    }

    pub struct MovieSpec {
        pub scale: u32,
        pub duration: u32,
        pub sample_durations: Vec<(u32, u32)>,
        pub keyframes: Vec<u32>,
        pub chunk_runs: Vec<(u32, u32, u32)>,
        pub sample_size: u32,
        pub sample_sizes: Vec<u32>,
        pub wide_offsets: bool,
        /// add a sound track sharing the same sample layout
        pub with_sound: bool,
    }

    impl MovieSpec {
        /// 10 one-second samples in 5 two-sample chunks, keyframes at
        /// samples 1, 5 and 9, sizes 10..19.
        pub fn basic() -> Self {
            Self {
                scale: 1000,
                duration: 10_000,
                sample_durations: vec![(10, 1000)],
                keyframes: vec![1, 5, 9],
                chunk_runs: vec![(1, 2, 1)],
                sample_size: 0,
                sample_sizes: (0..10).map(|i| 10 + i).collect(),
                wide_offsets: false,
                with_sound: false,
            }
        }

        pub fn sample_count(&self) -> u32 {
            self.sample_durations.iter().map(|(c, _)| c).sum()
        }

        fn sample_byte(&self, index: u32) -> u32 {
            if self.sample_size != 0 {
                self.sample_size
            } else {
                self.sample_sizes[index as usize]
            }
        }

        /// Assemble a complete file; returns (bytes, chunk offsets).
        pub fn build(&self) -> (Vec<u8>, Vec<u64>) {
            let samples = self.sample_count();
            let total_chunks = {
                // samples divided over chunk runs, last run open-ended
                let mut chunks = 0u32;
                let mut accounted = 0u32;
                for (i, (first, per_chunk, _)) in self.chunk_runs.iter().enumerate() {
                    if i + 1 < self.chunk_runs.len() {
                        let span = self.chunk_runs[i + 1].0 - first;
                        chunks += span;
                        accounted += span * per_chunk;
                    } else {
                        chunks += (samples - accounted + per_chunk - 1) / per_chunk;
                    }
                }
                chunks
            };

            let ftyp = ftyp();

            // moov layout first so mdat offsets can be computed
            let mut moov = Vec::new();
            let stbl_boxes = |chunk_offsets: &[u64], sync: bool| -> Vec<u8> {
                let mut stbl = Vec::new();
                stbl.extend_from_slice(&stsd_stub());
                stbl.extend_from_slice(&stts(&self.sample_durations));
                if sync && !self.keyframes.is_empty() {
                    stbl.extend_from_slice(&stss(&self.keyframes));
                }
                stbl.extend_from_slice(&stsc(&self.chunk_runs));
                stbl.extend_from_slice(&stsz(self.sample_size, &self.sample_sizes));
                if self.wide_offsets {
                    stbl.extend_from_slice(&co64(chunk_offsets));
                } else {
                    let narrow: Vec<u32> = chunk_offsets.iter().map(|o| *o as u32).collect();
                    stbl.extend_from_slice(&stco(&narrow));
                }
                mp4_box(b"stbl", vec![&stbl])
            };

            let trak_box = |chunk_offsets: &[u64], video: bool| -> Vec<u8> {
                let stbl = stbl_boxes(chunk_offsets, video);
                let minf = {
                    let xmhd = if video { vmhd() } else { smhd() };
                    mp4_box(b"minf", vec![&xmhd, &stbl])
                };
                let mdia = {
                    let mdhd = mdhd(self.scale, self.duration);
                    let hdlr = hdlr(if video { b"vide" } else { b"soun" });
                    mp4_box(b"mdia", vec![&mdhd, &hdlr, &minf])
                };
                let tkhd = tkhd(self.duration);
                mp4_box(b"trak", vec![&tkhd, &mdia])
            };

            // probe pass with zero offsets to learn the header length
            let build_moov = |chunk_offsets: &[u64]| -> Vec<u8> {
                let mvhd = mvhd(self.scale, self.duration);
                let video = trak_box(chunk_offsets, true);
                if self.with_sound {
                    let sound = trak_box(chunk_offsets, false);
                    mp4_box(b"moov", vec![&mvhd, &video, &sound])
                } else {
                    mp4_box(b"moov", vec![&mvhd, &video])
                }
            };

            let probe = build_moov(&vec![0u64; total_chunks as usize]);
            let data_start = (ftyp.len() + probe.len() + 8) as u64;

            let mut chunk_offsets = Vec::with_capacity(total_chunks as usize);
            {
                let mut cursor = data_start;
                let mut sample = 0u32;
                let mut run = 0usize;
                for chunk in 0..total_chunks {
                    chunk_offsets.push(cursor);
                    while run + 1 < self.chunk_runs.len()
                        && chunk >= self.chunk_runs[run + 1].0 - 1
                    {
                        run += 1;
                    }
                    let per_chunk = self.chunk_runs[run].1;
                    for _ in 0..per_chunk {
                        if sample < samples {
                            cursor += self.sample_byte(sample) as u64;
                            sample += 1;
                        }
                    }
                }
            }

            moov.extend_from_slice(&build_moov(&chunk_offsets));
            assert_eq!(moov.len(), probe.len());

            let mut file = Vec::new();
            file.extend_from_slice(&ftyp);
            file.extend_from_slice(&moov);
            let mdat_payload: Vec<u8> = (0..samples)
                .flat_map(|i| {
                    let size = self.sample_byte(i) as usize;
                    std::iter::repeat((i % 251) as u8).take(size)
                })
                .collect();
            file.extend_from_slice(&mp4_box(b"mdat", vec![&mdat_payload]));
            assert_eq!(data_start as usize, file.len() - mdat_payload.len());
            (file, chunk_offsets)
        }
    }

    pub fn write_temp(prefix: &str, bytes: &[u8]) -> std::path::PathBuf {
        use std::sync::atomic::{AtomicUsize, Ordering};
        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = std::env::temp_dir().join(format!(
            "sluice-test-{}-{}-{}",
            prefix,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_round_trip() {
        let offsets = vec![13u64, 4096, u64::max_value()];
        assert_eq!(decode_offsets(&encode_offsets(&offsets)), offsets);
    }

    #[test]
    fn head_carries_length_and_server() {
        let head = http_head("1.1", MIME_MP4, 1234);
        assert!(head.starts_with("HTTP/1.1 200 OK\n"));
        assert!(head.contains("Content-Length: 1234\n"));
        assert!(head.contains(crate::SERVER_NAME));
        assert!(head.ends_with("\n\n"));
    }
}
