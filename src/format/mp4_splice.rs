use byteorder::{BigEndian, ByteOrder};
use std::sync::Arc;

use crate::format::mp4::{
    self, Atom, HeaderBox, Movie, SampleTables, Table, Track, MDAT, MDIA, MINF, STBL, TRAK,
};
use crate::format::mp4_seek::{compile_offsets, compile_seek, Cursor, Seek};
use crate::format::{
    decode_offsets, encode_offsets, http_head, ClipPlan, ClipRequest, MediaSource, MIME_MP4,
};

/// Retained entry range of one sample table after clipping.
#[derive(Clone, Copy, Default)]
struct Window {
    first: u32,
    count: u32,
}

/// The retained range runs from the start entry to the end entry, plus
/// the end entry itself when a cut lands inside it (`end.offset`, or for
/// stsc a partial final chunk).
fn window(start: Cursor, end: Cursor, also: Option<Cursor>) -> Window {
    let extra = (end.offset > 0 || also.map_or(false, |c| c.offset > 0)) as u32;
    let first = start.index;
    Window {
        first,
        count: end.index.max(first) - first + extra,
    }
}

struct TrackClip {
    start: Seek,
    end: Seek,
    mdhd_duration: u64,
    tkhd_duration: u64,
    stts: Window,
    ctts: Window,
    stss: Window,
    stsz: Window,
    stsc: Vec<(u32, u32, u32)>,
    coxx: Window,
}

/// Byte range of the source file that survives the clip, plus the
/// corrected start/stop seconds. Shared by both tracks: the smaller
/// start offset and the larger end offset win.
struct ClipBounds {
    start: f64,
    stop: f64,
    file_offset: u64,
    file_finish: u64,
}

fn clip_track(bounds: &mut ClipBounds, mvhd: &HeaderBox, track: &Track) -> TrackClip {
    let stbl = &track.stbl;
    let scale = track.mdhd.scale as f64;

    let mut start = Seek::default();
    let mut end = Seek::default();
    start.time = (bounds.start * scale) as u64;
    end.time = (bounds.stop * scale) as u64;

    let mut media_duration = track.mdhd.duration.min(stbl.max_time);
    if start.time > media_duration {
        start.time = media_duration;
    }
    if end.time == 0 || end.time > media_duration {
        end.time = media_duration;
        end.offset = stbl.max_offset;
    }

    compile_seek(stbl, &mut start);
    compile_seek(stbl, &mut end);

    media_duration = end.time.saturating_sub(start.time);
    let tkhd_duration =
        (mvhd.scale as f64 * (media_duration as f64 / track.mdhd.scale as f64) + 0.5) as u64;

    if bounds.file_offset == 0 || bounds.file_offset > start.offset {
        bounds.start = start.time as f64 / scale;
        bounds.file_offset = start.offset;
    }
    if bounds.file_finish == 0 || bounds.file_finish < end.offset {
        bounds.stop = end.time as f64 / scale;
        bounds.file_finish = end.offset;
    }

    let coxx = window(start.coxx, end.coxx, None);
    let stsc_window = window(start.stsc, end.stsc, Some(end.coxx));
    let stsc = clip_stsc(stbl, &start, &end, stsc_window, coxx.count);

    TrackClip {
        mdhd_duration: media_duration,
        tkhd_duration,
        stts: window(start.stts, end.stts, None),
        ctts: if stbl.ctts.is_some() {
            window(start.ctts, end.ctts, None)
        } else {
            Window::default()
        },
        stss: if stbl.stss.is_some() {
            window(start.stss, end.stss, None)
        } else {
            Window::default()
        },
        stsz: if stbl.stsz.size == 0 {
            window(start.stsz, end.stsz, None)
        } else {
            Window::default()
        },
        stsc,
        coxx,
        start,
        end,
    }
}

/// Rebuilds the sample-to-chunk table for the clipped chunk range. Cuts
/// inside a chunk get a compensation entry: a prefix entry covering the
/// partial first chunk and a suffix entry covering the partial last one.
/// Every other first-chunk id shifts down by the number of removed
/// leading chunks.
fn clip_stsc(
    stbl: &SampleTables,
    start: &Seek,
    end: &Seek,
    range: Window,
    new_chunks: u32,
) -> Vec<(u32, u32, u32)> {
    if range.count == 0 {
        return Vec::new();
    }
    let table = &stbl.stsc;
    let (first_chunk, per_chunk, description) = table.triple(range.first);
    let first = first_chunk - 1;
    let next = if range.count == 1 {
        stbl.max_chunks
    } else {
        table.triple(range.first + 1).0 as u64 - 1
    };
    let left = next - (first as u64 + start.stsc.offset as u64);

    let mut entries = Vec::with_capacity(range.count as usize + 2);
    if start.coxx.offset > 0 {
        entries.push((1, per_chunk - start.coxx.offset, description));
        if left > 1 {
            entries.push((2, per_chunk, description));
        }
    } else {
        entries.push((1, per_chunk, description));
    }

    let shift = first + start.stsc.offset;
    let mut last_description = description;
    for i in 1..range.count {
        let (chunk, samples, id) = table.triple(range.first + i);
        entries.push((chunk - shift, samples, id));
        last_description = id;
    }

    if end.coxx.offset > 0 {
        entries.push((new_chunks, end.coxx.offset, last_description));
    }
    entries
}

struct TrackSizes {
    stbl: u64,
    minf: u64,
    mdia: u64,
    trak: u64,
}

fn track_sizes(track: &Track, clip: &TrackClip) -> TrackSizes {
    let stbl = &track.stbl;
    let table_size = |table: &Table, count: u32, preamble: u64| {
        table.atom.header_size() + preamble + count as u64 * table.entry_bytes as u64
    };

    let stts = table_size(&stbl.stts, clip.stts.count, 8);
    let ctts = stbl
        .ctts
        .as_ref()
        .map_or(0, |t| table_size(t, clip.ctts.count, 8));
    let stss = stbl
        .stss
        .as_ref()
        .map_or(0, |t| table_size(t, clip.stss.count, 8));
    let stsz = if stbl.stsz.size != 0 {
        stbl.stsz.atom.size
    } else {
        table_size(&stbl.stsz, clip.stsz.count, 12)
    };
    let stsc = stbl.stsc.atom.header_size() + 8 + clip.stsc.len() as u64 * 12;
    let coxx = table_size(&stbl.coxx, clip.coxx.count, 8);
    let stsd = stbl.stsd.map_or(0, |a| a.size);

    let stbl_size = stbl.atom.header_size() + stsd + stts + ctts + stss + stsz + stsc + coxx;
    let minf = track.minf.header_size() + track.xmhd.size + stbl_size;
    let mdia = track.mdia.header_size() + track.mdhd.atom.size + track.hdlr.map_or(0, |a| a.size)
        + minf;
    let trak = track.atom.header_size() + track.tkhd.atom.size + mdia;
    TrackSizes {
        stbl: stbl_size,
        minf,
        mdia,
        trak,
    }
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_header(out: &mut Vec<u8>, kind: u32, size: u64, extended: bool) {
    if extended {
        push_u32(out, 1);
        push_u32(out, kind);
        out.extend_from_slice(&size.to_be_bytes());
    } else {
        push_u32(out, size as u32);
        push_u32(out, kind);
    }
}

fn push_atom(out: &mut Vec<u8>, atom: &Atom) {
    push_header(out, atom.kind, atom.size, atom.extended);
    out.extend_from_slice(atom.data);
}

fn push_preamble(out: &mut Vec<u8>, table: &Table, count: u32) {
    push_u32(out, (table.version as u32) << 24 | table.flags);
    push_u32(out, count);
}

/// stts/ctts: copy the retained entries and trim the edge counts so the
/// cumulative sample count matches the clipped range exactly.
fn push_xtts(out: &mut Vec<u8>, table: &Table, range: Window, start_clip: u32, end_clip: u32) {
    let size = table.atom.header_size() + 8 + range.count as u64 * 8;
    push_header(out, table.atom.kind, size, table.atom.extended);
    push_preamble(out, table, range.count);
    let mark = out.len();
    out.extend_from_slice(table.entry_range(range.first, range.count));
    if range.count == 0 {
        return;
    }
    if start_clip > 0 {
        let first = BigEndian::read_u32(&out[mark..]);
        BigEndian::write_u32(&mut out[mark..], first - start_clip);
    }
    if end_clip > 0 {
        let last = mark + (range.count as usize - 1) * 8;
        let original = table.pair(range.first + range.count - 1).0;
        let current = BigEndian::read_u32(&out[last..]);
        BigEndian::write_u32(&mut out[last..], current - (original - end_clip));
    }
}

/// Sync samples renumber against the first retained one.
fn push_stss(out: &mut Vec<u8>, table: &Table, range: Window) {
    let size = table.atom.header_size() + 8 + range.count as u64 * 4;
    push_header(out, table.atom.kind, size, table.atom.extended);
    push_preamble(out, table, range.count);
    if range.count == 0 {
        return;
    }
    let base = table.u32_entry(range.first) - 1;
    for i in 0..range.count {
        push_u32(out, table.u32_entry(range.first + i) - base);
    }
}

fn push_stsc(out: &mut Vec<u8>, table: &Table, entries: &[(u32, u32, u32)]) {
    let size = table.atom.header_size() + 8 + entries.len() as u64 * 12;
    push_header(out, table.atom.kind, size, table.atom.extended);
    push_preamble(out, table, entries.len() as u32);
    for (chunk, samples, description) in entries {
        push_u32(out, *chunk);
        push_u32(out, *samples);
        push_u32(out, *description);
    }
}

fn push_stsz(out: &mut Vec<u8>, table: &Table, range: Window) {
    if table.size != 0 {
        push_atom(out, &table.atom);
        return;
    }
    let size = table.atom.header_size() + 12 + range.count as u64 * 4;
    push_header(out, table.atom.kind, size, table.atom.extended);
    push_u32(out, (table.version as u32) << 24 | table.flags);
    push_u32(out, 0);
    push_u32(out, range.count);
    out.extend_from_slice(table.entry_range(range.first, range.count));
}

/// Chunk offsets move to their position in the emitted file: the first
/// retained chunk starts at the exact cut byte, and every offset shifts
/// by the distance between the old and new mdat payload locations.
fn push_coxx(out: &mut Vec<u8>, table: &Table, range: Window, cut_offset: u64, delta: i64) {
    let bytes = table.entry_bytes;
    let size = table.atom.header_size() + 8 + range.count as u64 * bytes as u64;
    push_header(out, table.atom.kind, size, table.atom.extended);
    push_preamble(out, table, range.count);
    let mask = if bytes == 4 {
        0xFFFF_FFFFu64
    } else {
        u64::max_value()
    };
    let mut entry = [0u8; 8];
    for i in 0..range.count {
        let original = if i == 0 {
            cut_offset
        } else {
            table.chunk_offset(range.first + i)
        };
        let relocated = (original as i64 - delta) as u64 & mask;
        BigEndian::write_uint(&mut entry, relocated, bytes);
        out.extend_from_slice(&entry[..bytes]);
    }
}

/// mvhd/tkhd/mdhd: copy the payload and patch the duration in place,
/// honouring the version byte. mvhd also drops the preview/poster and
/// selection times.
fn push_patched_header(
    out: &mut Vec<u8>,
    header: &HeaderBox,
    duration: u64,
    pos32: usize,
    pos64: usize,
    clear_previews: bool,
) {
    push_header(out, header.atom.kind, header.atom.size, header.atom.extended);
    let mark = out.len();
    out.extend_from_slice(header.atom.data);
    let data = &mut out[mark..];
    if header.version != 0 {
        BigEndian::write_u64(&mut data[pos64..], duration);
    } else {
        BigEndian::write_u32(&mut data[pos32..], duration as u32);
    }
    if clear_previews {
        let at = if header.version != 0 { 20 + 52 + 12 } else { 12 + 52 + 8 };
        if data.len() >= at + 24 {
            for byte in &mut data[at..at + 24] {
                *byte = 0;
            }
        }
    }
}

fn emit_track(out: &mut Vec<u8>, track: &Track, clip: &TrackClip, delta: i64) {
    let sizes = track_sizes(track, clip);
    let stbl = &track.stbl;

    push_header(out, TRAK, sizes.trak, track.atom.extended);
    push_patched_header(out, &track.tkhd, clip.tkhd_duration, 20, 28, false);
    push_header(out, MDIA, sizes.mdia, track.mdia.extended);
    push_patched_header(out, &track.mdhd, clip.mdhd_duration, 16, 24, false);
    if let Some(hdlr) = &track.hdlr {
        push_atom(out, hdlr);
    }
    push_header(out, MINF, sizes.minf, track.minf.extended);
    push_atom(out, &track.xmhd);
    push_header(out, STBL, sizes.stbl, stbl.atom.extended);
    if let Some(stsd) = &stbl.stsd {
        push_atom(out, stsd);
    }
    push_xtts(
        out,
        &stbl.stts,
        clip.stts,
        clip.start.stts.offset,
        clip.end.stts.offset,
    );
    if let Some(stss) = &stbl.stss {
        push_stss(out, stss, clip.stss);
    }
    push_stsc(out, &stbl.stsc, &clip.stsc);
    if let Some(ctts) = &stbl.ctts {
        push_xtts(
            out,
            ctts,
            clip.ctts,
            clip.start.ctts.offset,
            clip.end.ctts.offset,
        );
    }
    push_stsz(out, &stbl.stsz, clip.stsz);
    push_coxx(out, &stbl.coxx, clip.coxx, clip.start.offset, delta);
}

/// Normalize a byte target to the start of the nearest period below it.
fn snap_spatial(offsets: &[u64], target: f64, period: f64) -> f64 {
    for i in (0..offsets.len()).rev() {
        if (offsets[i] as f64) < target {
            return i as f64 * period;
        }
    }
    0.0
}

/// The MP4 request flow: resolve cached artifacts (or scan the file),
/// seek both tracks, clip the sample tables and emit the response head
/// (HTTP headers plus the rewritten boxes). A `start == stop == 0`
/// request is served from, and feeds, the dedicated zero-seek cache.
pub fn parse(src: &MediaSource, req: &ClipRequest) -> anyhow::Result<ClipPlan> {
    let zero_seek = req.start == 0.0 && req.stop == 0.0;
    let okey = format!("{}:offsets", src.path);
    let hkey = format!("{}:zero:head", src.path);
    let lkey = format!("{}:zero:limits", src.path);

    let cached_offsets: Option<Arc<Vec<u64>>> = src
        .cache
        .and_then(|cache| cache.get(&okey))
        .map(|blob| Arc::new(decode_offsets(&blob)));

    if zero_seek {
        if let (Some(cache), Some(offsets)) = (src.cache, &cached_offsets) {
            if let (Some(head), Some(limits_blob)) = (cache.get(&hkey), cache.get(&lkey)) {
                let limits = decode_offsets(&limits_blob);
                if limits.len() == 2 {
                    src.stats.cache_hit();
                    return Ok(ClipPlan {
                        head: head.to_vec(),
                        file_offset: limits[0],
                        file_finish: limits[1],
                        periods: offsets.len(),
                        offsets: offsets.clone(),
                        start: 0.0,
                        stop: 0.0,
                    });
                }
            }
        }
    }

    // main atoms, from the cache or a fresh scan
    let fkey = format!("{}:atom:ftyp", src.path);
    let mkey = format!("{}:atom:moov", src.path);
    let dkey = format!("{}:atom:mdat", src.path);
    let ftyp_blob: Option<Arc<Vec<u8>>>;
    let moov_blob: Arc<Vec<u8>>;
    let mdat_blob: Arc<Vec<u8>>;
    match src
        .cache
        .map(|cache| (cache.get(&fkey), cache.get(&mkey), cache.get(&dkey)))
    {
        Some((ftyp, Some(moov), Some(mdat))) => {
            src.stats.cache_hit();
            ftyp_blob = ftyp;
            moov_blob = moov;
            mdat_blob = mdat;
        }
        _ => {
            src.stats.cache_miss();
            let top = mp4::scan_file(src.file, src.file_length)?;
            if let Some(cache) = src.cache {
                if let Some(ftyp) = &top.ftyp {
                    cache.put(&fkey, ftyp.clone());
                }
                cache.put(&mkey, top.moov.clone());
                cache.put(&dkey, top.mdat.clone());
            }
            ftyp_blob = top.ftyp.map(Arc::new);
            moov_blob = Arc::new(top.moov);
            mdat_blob = Arc::new(top.mdat);
        }
    }

    let movie: Movie = mp4::parse_moov(&moov_blob)?;
    let mdat_extended = mp4::mdat_extended(&mdat_blob);
    let ftyp_atom = ftyp_blob.as_deref().and_then(|blob| mp4::first_atom(blob));

    if movie.mvhd.scale == 0 {
        anyhow::bail!("mvhd scale is zero");
    }
    let periods = (movie.mvhd.duration as f64 / movie.mvhd.scale as f64).ceil() as usize;
    if periods == 0 {
        anyhow::bail!("movie has no duration");
    }

    let offsets: Arc<Vec<u64>> = match cached_offsets {
        Some(offsets) => offsets,
        None => {
            let track = movie
                .video
                .as_ref()
                .or_else(|| movie.sound.as_ref())
                .ok_or_else(|| anyhow::anyhow!("no usable track"))?;
            let period = (req.period * track.mdhd.scale as f64) as u64;
            let computed = compile_offsets(&track.stbl, period, periods);
            if let Some(cache) = src.cache {
                cache.put(&okey, encode_offsets(&computed));
            }
            Arc::new(computed)
        }
    };

    let mut start = req.start;
    let mut stop = req.stop;
    if req.spatial {
        if start > 0.0 {
            start = snap_spatial(&offsets, start, req.period);
        }
        if stop > 0.0 {
            stop = snap_spatial(&offsets, stop, req.period);
        }
    }

    let mut bounds = ClipBounds {
        start,
        stop,
        file_offset: 0,
        file_finish: 0,
    };
    let video_clip = movie
        .video
        .as_ref()
        .map(|track| clip_track(&mut bounds, &movie.mvhd, track));
    let sound_clip = movie
        .sound
        .as_ref()
        .map(|track| clip_track(&mut bounds, &movie.mvhd, track));

    // longest track sets the movie timeline
    let mvhd_duration = video_clip
        .as_ref()
        .map_or(0, |clip| clip.tkhd_duration)
        .max(sound_clip.as_ref().map_or(0, |clip| clip.tkhd_duration));

    let mdat_header = if mdat_extended { 16u64 } else { 8u64 };
    let tracks: Vec<(&Track, &TrackClip)> = movie
        .video
        .as_ref()
        .zip(video_clip.as_ref())
        .into_iter()
        .chain(movie.sound.as_ref().zip(sound_clip.as_ref()))
        .collect();

    let moov_size = movie.atom.header_size()
        + movie.mvhd.atom.size
        + tracks
            .iter()
            .map(|&(track, clip)| track_sizes(track, clip).trak)
            .sum::<u64>();
    let head_total =
        ftyp_atom.map_or(0, |atom| atom.size) + moov_size + mdat_header;
    let delta = bounds.file_offset as i64 - head_total as i64;

    let body_length = bounds.file_finish - bounds.file_offset;
    let http = http_head(req.http, MIME_MP4, body_length + head_total);
    let mut head = Vec::with_capacity(http.len() + head_total as usize);
    head.extend_from_slice(http.as_bytes());

    if let Some(ftyp) = &ftyp_atom {
        push_atom(&mut head, ftyp);
    }
    push_header(&mut head, mp4::MOOV, moov_size, movie.atom.extended);
    push_patched_header(&mut head, &movie.mvhd, mvhd_duration, 16, 24, true);
    for &(track, clip) in &tracks {
        emit_track(&mut head, track, clip, delta);
    }
    push_header(&mut head, MDAT, body_length + mdat_header, mdat_extended);
    debug_assert_eq!(head.len(), http.len() + head_total as usize);

    if zero_seek {
        if let Some(cache) = src.cache {
            cache.put(
                &lkey,
                encode_offsets(&[bounds.file_offset, bounds.file_finish]),
            );
            cache.put(&hkey, head.clone());
        }
    }

    Ok(ClipPlan {
        head,
        file_offset: bounds.file_offset,
        file_finish: bounds.file_finish,
        periods,
        offsets,
        start: bounds.start,
        stop: bounds.stop,
    })
}
