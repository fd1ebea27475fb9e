use byteorder::{BigEndian, ByteOrder};
use num::FromPrimitive;
use std::sync::Arc;

use crate::format::flv_meta::{self, FLV_HEAD_BYTES};
use crate::format::{
    decode_offsets, encode_offsets, http_head, pread_exact, ClipPlan, ClipRequest, MediaSource,
    MIME_FLV,
};

pub const FLV_HEADER_WITH_TAG0: [u8; 13] = [
    0x46, 0x4c, 0x56, // signature
    0x01, // version
    0x05, // audio and video flag
    0x00, 0x00, 0x00, 0x09, // header length
    0x00, 0x00, 0x00, 0x00, // tag0 length
];

/// 0x08=audio, 0x09=video, 0x12=script
#[derive(Debug, PartialEq, FromPrimitive, Clone, Copy)]
pub enum TagType {
    Audio = 0x08,
    Video = 0x09,
    Script = 0x12,
}

const ON_META_DATA: &[u8; 13] = b"\x02\x00\x0AonMetaData";

/// Scans the leading script tags for the `onMetaData` payload (the AMF
/// value after the 13-byte name preamble). Media tags before the
/// metadata make the file unservable.
fn find_meta(src: &MediaSource) -> anyhow::Result<Vec<u8>> {
    let mut buffer = [0u8; 24];
    pread_exact(src.file, &mut buffer[..13], 0)?;
    if &buffer[..4] != b"FLV\x01" {
        anyhow::bail!("not an FLV file");
    }

    let mut offset = 13u64;
    loop {
        pread_exact(src.file, &mut buffer, offset)?;
        let tag: Option<TagType> = FromPrimitive::from_u8(buffer[0]);
        if tag != Some(TagType::Script) {
            anyhow::bail!("no onMetaData before the first media tag");
        }
        let data_size = BigEndian::read_u24(&buffer[1..4]) as u64;
        offset += 11;

        if &buffer[11..24] == ON_META_DATA {
            let meta_size = data_size
                .checked_sub(ON_META_DATA.len() as u64)
                .ok_or_else(|| anyhow::anyhow!("runt onMetaData tag"))?;
            offset += ON_META_DATA.len() as u64;
            let mut meta = vec![0u8; meta_size as usize];
            pread_exact(src.file, &mut meta, offset)?;
            return Ok(meta);
        }

        // skip the payload and the trailing previous-tag-size word
        offset += data_size + 4;
    }
}

fn head_with_flv_header(http: &str, content_length: u64) -> Vec<u8> {
    let mut head = http_head(http, MIME_FLV, content_length).into_bytes();
    head.extend_from_slice(&FLV_HEADER_WITH_TAG0);
    head
}

/// The FLV request flow: locate (or recall) the metadata blob, compile
/// it into the period index and play window, and synthesize the head —
/// HTTP headers followed by a fresh 13-byte FLV file header.
pub fn parse(src: &MediaSource, req: &ClipRequest) -> anyhow::Result<ClipPlan> {
    let mkey = format!("{}:meta", src.path);
    let okey = format!("{}:offsets", src.path);

    let cached_offsets: Option<Arc<Vec<u64>>> = src
        .cache
        .and_then(|cache| cache.get(&okey))
        .map(|blob| Arc::new(decode_offsets(&blob)));

    // whole-file requests skip metadata compilation entirely
    if let Some(offsets) = &cached_offsets {
        if req.start == 0.0 && req.stop == 0.0 {
            src.stats.cache_hit();
            let file_offset = FLV_HEAD_BYTES;
            let file_finish = src.file_length;
            return Ok(ClipPlan {
                head: head_with_flv_header(
                    req.http,
                    file_finish - file_offset + FLV_HEAD_BYTES,
                ),
                file_offset,
                file_finish,
                periods: offsets.len(),
                offsets: offsets.clone(),
                start: 0.0,
                stop: 0.0,
            });
        }
    }

    let meta: Arc<Vec<u8>> = match src.cache.and_then(|cache| cache.get(&mkey)) {
        Some(meta) => {
            src.stats.cache_hit();
            meta
        }
        None => {
            src.stats.cache_miss();
            let meta = find_meta(src)?;
            if let Some(cache) = src.cache {
                cache.put(&mkey, meta.clone());
            }
            Arc::new(meta)
        }
    };

    let compiled = flv_meta::compile(
        &meta,
        req.period,
        req.start,
        req.stop,
        req.spatial,
        src.file_length,
    )?;
    let mut file_offset = compiled.file_offset;
    let mut file_finish = compiled.file_finish;
    if compiled.start == 0.0 {
        file_offset = FLV_HEAD_BYTES;
    }
    if compiled.stop == 0.0 {
        file_finish = src.file_length;
    }

    let offsets = match cached_offsets {
        Some(offsets) => offsets,
        None => {
            if let Some(cache) = src.cache {
                cache.put(&okey, encode_offsets(&compiled.offsets));
            }
            Arc::new(compiled.offsets)
        }
    };

    Ok(ClipPlan {
        head: head_with_flv_header(req.http, file_finish - file_offset + FLV_HEAD_BYTES),
        file_offset,
        file_finish,
        periods: compiled.periods,
        offsets,
        start: compiled.start,
        stop: compiled.stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MetaCache;
    use crate::format::flv_meta::amf_testkit;
    use crate::format::testkit;
    use crate::worker::WorkerStats;
    use std::sync::atomic::Ordering;

    fn script_tag(payload: &[u8]) -> Vec<u8> {
        let mut tag = vec![0x12];
        tag.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..4]);
        tag.extend_from_slice(&[0, 0, 0, 0]); // timestamp + extension
        tag.extend_from_slice(&[0, 0, 0]); // stream id
        tag.extend_from_slice(payload);
        tag.extend_from_slice(&(11 + payload.len() as u32).to_be_bytes());
        tag
    }

    fn sample_flv() -> Vec<u8> {
        let mut file = FLV_HEADER_WITH_TAG0.to_vec();
        let mut payload = ON_META_DATA.to_vec();
        payload.extend_from_slice(&amf_testkit::sample_meta(6013));
        file.extend_from_slice(&script_tag(&payload));
        // one video tag so the scan has something to refuse to cross
        let mut video = vec![0x09, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0];
        video.extend_from_slice(&[0x17, 0x00, 0x00, 0x00]);
        file.extend_from_slice(&video);
        file.resize(6013, 0x00);
        file
    }

    struct Fixture {
        file_length: u64,
        path: std::path::PathBuf,
        handle: std::fs::File,
        cache: MetaCache,
        stats: WorkerStats,
    }

    impl Fixture {
        fn new(bytes: &[u8]) -> Self {
            let path = testkit::write_temp("flv", bytes);
            let handle = std::fs::File::open(&path).unwrap();
            Fixture {
                file_length: bytes.len() as u64,
                path,
                handle,
                cache: MetaCache::new(1024 * 1024),
                stats: WorkerStats::new(),
            }
        }

        fn clip(&self, start: f64, stop: f64) -> anyhow::Result<ClipPlan> {
            let source = MediaSource {
                file: &self.handle,
                file_length: self.file_length,
                path: self.path.to_str().unwrap(),
                cache: Some(&self.cache),
                stats: &self.stats,
            };
            let request = ClipRequest {
                http: "1.1",
                start,
                stop,
                spatial: false,
                period: 1.0,
            };
            parse(&source, &request)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    #[test]
    fn head_ends_with_the_flv_header() {
        let fixture = Fixture::new(&sample_flv());
        let plan = fixture.clip(0.0, 0.0).unwrap();

        let head = String::from_utf8_lossy(&plan.head);
        assert!(head.starts_with("HTTP/1.1 200 OK\n"));
        assert!(head.contains("Content-Type: video/x-flv\n"));
        assert_eq!(&plan.head[plan.head.len() - 13..], &FLV_HEADER_WITH_TAG0);
        assert_eq!(plan.file_offset, 13);
        assert_eq!(plan.file_finish, fixture.file_length);

        // advertised length covers the body plus the synthetic header
        let advertised: u64 = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(advertised, fixture.file_length - 13 + 13);
    }

    #[test]
    fn window_requests_use_keyframe_offsets() {
        let fixture = Fixture::new(&sample_flv());
        let plan = fixture.clip(25.0, 47.0).unwrap();
        assert_eq!(plan.file_offset, 13 + 2000);
        assert_eq!(plan.file_finish, 13 + 5000);
        assert!((plan.start - 20.0).abs() < 1e-9);
        assert!((plan.stop - 50.0).abs() < 1e-9);
        assert_eq!(plan.periods, 60);
    }

    #[test]
    fn second_request_hits_the_meta_cache() {
        let fixture = Fixture::new(&sample_flv());
        fixture.clip(5.0, 0.0).unwrap();
        assert_eq!(fixture.stats.cache_misses.load(Ordering::Relaxed), 1);
        fixture.clip(7.0, 0.0).unwrap();
        assert_eq!(fixture.stats.cache_misses.load(Ordering::Relaxed), 1);
        assert_eq!(fixture.stats.cache_hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn zero_seek_skips_compilation_once_offsets_exist() {
        let fixture = Fixture::new(&sample_flv());
        fixture.clip(0.0, 0.0).unwrap();
        let hits = fixture.stats.cache_hits.load(Ordering::Relaxed);
        let plan = fixture.clip(0.0, 0.0).unwrap();
        assert_eq!(fixture.stats.cache_hits.load(Ordering::Relaxed), hits + 1);
        assert_eq!(plan.file_offset, 13);
    }

    #[test]
    fn rejects_non_flv_files() {
        let fixture = Fixture::new(b"MOOVnot an flv file at all............");
        let err = fixture.clip(0.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("not an FLV"));
    }

    #[test]
    fn rejects_media_before_metadata() {
        let mut file = FLV_HEADER_WITH_TAG0.to_vec();
        file.extend_from_slice(&[0x09, 0x00, 0x00, 0x04, 0, 0, 0, 0, 0, 0, 0]);
        file.extend_from_slice(&[0u8; 32]);
        let fixture = Fixture::new(&file);
        let err = fixture.clip(0.0, 0.0).unwrap_err();
        assert!(err.to_string().contains("media tag"));
    }
}
