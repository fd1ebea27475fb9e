use crate::format::mp4::SampleTables;

/// Position inside one sample table: entry index plus intra-entry offset.
#[derive(Clone, Copy, Default, Debug, PartialEq)]
pub struct Cursor {
    pub index: u32,
    pub offset: u32,
}

/// One resolved seek point: the corrected media time, the byte offset of
/// the sample, and the cursor into every table that the splicer clips.
#[derive(Clone, Copy, Default, Debug)]
pub struct Seek {
    pub time: u64,
    pub offset: u64,
    pub stts: Cursor,
    pub ctts: Cursor,
    pub stss: Cursor,
    pub stsc: Cursor,
    pub stsz: Cursor,
    pub coxx: Cursor,
}

/// Resolves `seek.time` (media-scale units) into sample, chunk and byte
/// positions. The walk order is fixed: stts finds the sample, stss snaps
/// it back to a sync sample (rewinding stts), ctts and stsc locate the
/// composition entry and the chunk, stco/co64 and stsz produce the byte
/// offset. Out-of-range times clamp to the table limits.
pub fn compile_seek(stbl: &SampleTables, seek: &mut Seek) {
    // stts: decoding time to sample number
    let mut time_base = 0u64;
    let mut samples = 0u64;
    let mut duration = 1u64;
    seek.stts.index = 0;
    while seek.stts.index < stbl.stts.count {
        let (count, entry_duration) = stbl.stts.pair(seek.stts.index);
        duration = entry_duration as u64;
        let span = count as u64 * duration;
        if time_base + span > seek.time {
            break;
        }
        samples += count as u64;
        time_base += span;
        duration = 1;
        seek.stts.index += 1;
    }
    seek.stts.offset = ((seek.time - time_base) / duration.max(1)) as u32;
    seek.time = (time_base + seek.stts.offset as u64 * duration).min(stbl.max_time);
    seek.stsz.index = (samples + seek.stts.offset as u64).min(stbl.max_samples) as u32;

    // stss: snap to the nearest preceding sync sample
    seek.stss.index = 0;
    if let Some(stss) = &stbl.stss {
        let target = seek.stsz.index;
        if (target as u64) < stbl.max_samples {
            seek.stsz.index = 0;
            seek.stss.index = 1;
            while seek.stss.index < stss.count {
                let sample = stss.u32_entry(seek.stss.index) - 1;
                if sample > target {
                    seek.stss.index -= 1;
                    break;
                }
                seek.stsz.index = sample;
                seek.stss.index += 1;
            }

            // rewind stts to the snapped sample so seek.time stays exact
            let mut back = target - seek.stsz.index;
            let mut step = if seek.stts.offset > 0 {
                stbl.stts.pair(seek.stts.index).1 as u64
            } else {
                0
            };
            while back > 0 {
                if seek.stts.offset > 0 {
                    seek.stts.offset -= 1;
                } else {
                    seek.stts.index -= 1;
                    let (count, entry_duration) = stbl.stts.pair(seek.stts.index);
                    seek.stts.offset = count - 1;
                    step = entry_duration as u64;
                }
                seek.time = seek.time.saturating_sub(step);
                back -= 1;
            }
        } else {
            seek.stss.index = stss.count;
        }
    }

    // ctts: composition offset entry covering the sample
    if let Some(ctts) = &stbl.ctts {
        seek.ctts.index = 0;
        let mut covered = 0u64;
        while seek.ctts.index < ctts.count {
            let (count, _) = ctts.pair(seek.ctts.index);
            if covered + count as u64 > seek.stsz.index as u64 {
                break;
            }
            covered += count as u64;
            seek.ctts.index += 1;
        }
        seek.ctts.offset = (seek.stsz.index as u64 - covered) as u32;
    }

    // stsc: sample to chunk
    seek.stsc.index = 0;
    seek.coxx.index = 0;
    let mut accounted = 0u64;
    let mut per_chunk = 1u64;
    while seek.stsc.index < stbl.stsc.count {
        let (_, samples_per_chunk, _) = stbl.stsc.triple(seek.stsc.index);
        per_chunk = samples_per_chunk as u64;
        let next_chunk = if seek.stsc.index == stbl.stsc.count - 1 {
            stbl.max_chunks
        } else {
            stbl.stsc.triple(seek.stsc.index + 1).0 as u64 - 1
        };
        let chunks = next_chunk - seek.coxx.index as u64;
        let span = chunks * per_chunk;
        if accounted + span > seek.stsz.index as u64 {
            break;
        }
        accounted += span;
        seek.coxx.index += chunks as u32;
        per_chunk = 1;
        seek.stsc.index += 1;
    }
    let within = seek.stsz.index as u64 - accounted;
    let per_chunk = per_chunk.max(1);
    seek.stsc.offset = (within / per_chunk) as u32;
    seek.coxx.index += seek.stsc.offset;
    seek.coxx.offset = (within % per_chunk) as u32;

    // stco/co64: chunk byte offset, or end-of-data one past the table
    seek.offset = if (seek.coxx.index as u64) < stbl.max_chunks {
        stbl.coxx.chunk_offset(seek.coxx.index)
    } else {
        stbl.max_offset
    };

    // stsz: advance to the sample inside the chunk
    if stbl.stsz.size != 0 {
        seek.offset += seek.coxx.offset as u64 * stbl.stsz.size as u64;
    } else {
        for back in (1..=seek.coxx.offset).rev() {
            seek.offset += stbl.stsz.u32_entry(seek.stsz.index - back) as u64;
        }
    }
}

/// Builds the per-period byte offset index used by the throttle: entry i
/// is the file offset where period i begins. One incremental sweep over
/// the tables; the cursors carry over from period to period.
pub fn compile_offsets(stbl: &SampleTables, period: u64, periods: usize) -> Vec<u64> {
    let mut offsets = Vec::with_capacity(periods);

    let mut time = 0u64;
    let mut sample = Cursor::default();
    let mut time_base = 0u64;
    let mut samples = 0u64;
    let mut chunk = Cursor::default();
    let mut chunks_done = 0u64;
    let mut accounted = 0u64;

    for _ in 0..periods {
        // sample number at this period boundary
        let mut duration = 0u64;
        while sample.index < stbl.stts.count {
            let (count, entry_duration) = stbl.stts.pair(sample.index);
            duration = entry_duration as u64;
            let span = count as u64 * duration;
            if time_base + span > time {
                break;
            }
            samples += count as u64;
            time_base += span;
            duration = 1;
            sample.index += 1;
        }
        let sample_id = if duration == 0 {
            stbl.max_samples
        } else {
            sample.offset = ((time - time_base) / duration) as u32;
            (samples + sample.offset as u64).min(stbl.max_samples)
        };

        // chunk holding that sample
        let mut per_chunk = 0u64;
        while chunk.index < stbl.stsc.count {
            let (_, samples_per_chunk, _) = stbl.stsc.triple(chunk.index);
            per_chunk = samples_per_chunk as u64;
            let next_chunk = if chunk.index == stbl.stsc.count - 1 {
                stbl.max_chunks
            } else {
                stbl.stsc.triple(chunk.index + 1).0 as u64 - 1
            };
            let span = (next_chunk - chunks_done) * per_chunk;
            if accounted + span > sample_id {
                break;
            }
            accounted += span;
            chunks_done += next_chunk - chunks_done;
            per_chunk = 1;
            chunk.index += 1;
        }
        let (chunk_id, chunk_sample) = if per_chunk == 0 {
            (stbl.max_chunks, 0u64)
        } else {
            let within = sample_id - accounted;
            chunk.offset = (within / per_chunk) as u32;
            (chunks_done + chunk.offset as u64, within % per_chunk)
        };

        let mut offset = if chunk_id < stbl.max_chunks {
            stbl.coxx.chunk_offset(chunk_id as u32)
        } else {
            stbl.max_offset
        };
        if stbl.stsz.size != 0 {
            offset += chunk_sample * stbl.stsz.size as u64;
        } else {
            for back in (1..=chunk_sample).rev() {
                offset += stbl.stsz.u32_entry((sample_id - back) as u32) as u64;
            }
        }

        offsets.push(offset);
        time += period;
    }

    offsets
}
