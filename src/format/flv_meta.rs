use amf::amf0::Value;

/// Compiled view of an `onMetaData` blob against one request: the
/// per-period byte index plus the resolved play window. This is the
/// native replacement for the embedded scripting compiler the original
/// design delegated to; the six-in/six-out interface is unchanged.
pub struct MetaSeek {
    pub periods: usize,
    pub file_offset: u64,
    pub file_finish: u64,
    pub start: f64,
    pub stop: f64,
    pub offsets: Vec<u64>,
}

/// Size of the synthesized FLV file header (9 bytes plus tag0 size).
pub const FLV_HEAD_BYTES: u64 = 13;

struct Keyframes {
    times: Vec<f64>,
    positions: Vec<u64>,
}

fn entries_of(value: &Value) -> Option<&[amf::Pair<String, Value>]> {
    match value {
        Value::EcmaArray { entries } => Some(entries),
        Value::Object { entries, .. } => Some(entries),
        _ => None,
    }
}

fn number_list(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array { entries } => Some(entries),
        _ => None,
    }
}

fn parse_keyframes(value: &Value) -> Option<Keyframes> {
    let entries = entries_of(value)?;
    let mut times = Vec::new();
    let mut positions = Vec::new();
    for pair in entries {
        match pair.key.as_str() {
            "times" => {
                times = number_list(&pair.value)?
                    .iter()
                    .filter_map(|v| match v {
                        Value::Number(n) => Some(*n),
                        _ => None,
                    })
                    .collect();
            }
            "filepositions" => {
                positions = number_list(&pair.value)?
                    .iter()
                    .filter_map(|v| match v {
                        Value::Number(n) => Some(*n as u64),
                        _ => None,
                    })
                    .collect();
            }
            _ => {}
        }
    }
    if times.is_empty() || times.len() != positions.len() {
        return None;
    }
    Some(Keyframes { times, positions })
}

/// (blob, period, start, stop, spatial, file_length) →
/// (periods, file_offset, file_finish, start, stop, offsets).
///
/// Offsets snap to the last keyframe at or before each period boundary;
/// without a keyframe index the file interpolates linearly over its
/// duration. Spatial targets are first mapped down to period starts.
pub fn compile(
    meta: &[u8],
    period: f64,
    start: f64,
    stop: f64,
    spatial: bool,
    file_length: u64,
) -> anyhow::Result<MetaSeek> {
    let value = Value::read_from(&mut &meta[..])
        .map_err(|e| anyhow::anyhow!("undecodable metadata: {:?}", e))?;
    let entries = entries_of(&value).ok_or_else(|| anyhow::anyhow!("metadata is not a map"))?;

    let mut duration = 0.0f64;
    let mut keyframes = None;
    for pair in entries {
        match pair.key.as_str() {
            "duration" => {
                if let Value::Number(n) = &pair.value {
                    duration = *n;
                }
            }
            "keyframes" => {
                keyframes = parse_keyframes(&pair.value);
            }
            _ => {}
        }
    }
    if duration <= 0.0 {
        anyhow::bail!("metadata missing duration");
    }

    let periods = (duration / period).ceil().max(1.0) as usize;
    let offsets: Vec<u64> = (0..periods)
        .map(|i| {
            let time = i as f64 * period;
            match &keyframes {
                Some(kf) => {
                    let mut offset = FLV_HEAD_BYTES;
                    for (t, p) in kf.times.iter().zip(&kf.positions) {
                        if *t > time {
                            break;
                        }
                        offset = *p;
                    }
                    offset
                }
                None => {
                    FLV_HEAD_BYTES
                        + ((file_length - FLV_HEAD_BYTES) as f64 * (time / duration)) as u64
                }
            }
        })
        .collect();

    let mut start = start;
    let mut stop = stop;
    if spatial {
        if start > 0.0 {
            start = snap_spatial(&offsets, start, period);
        }
        if stop > 0.0 {
            stop = snap_spatial(&offsets, stop, period);
        }
    }

    let (file_offset, start) = if start > 0.0 {
        match &keyframes {
            Some(kf) => {
                let mut snapped = (FLV_HEAD_BYTES, 0.0);
                for (t, p) in kf.times.iter().zip(&kf.positions) {
                    if *t > start {
                        break;
                    }
                    snapped = (*p, *t);
                }
                snapped
            }
            None => {
                let index = ((start / period) as usize).min(periods - 1);
                (offsets[index], index as f64 * period)
            }
        }
    } else {
        (FLV_HEAD_BYTES, 0.0)
    };

    let (file_finish, stop) = if stop > 0.0 {
        match &keyframes {
            Some(kf) => kf
                .times
                .iter()
                .zip(&kf.positions)
                .find(|(t, _)| **t >= stop)
                .map(|(t, p)| (*p, *t))
                .unwrap_or((file_length, duration)),
            None => {
                let index = (stop / period).ceil() as usize;
                if index < periods {
                    (offsets[index], index as f64 * period)
                } else {
                    (file_length, duration)
                }
            }
        }
    } else {
        (file_length, stop)
    };

    Ok(MetaSeek {
        periods,
        file_offset,
        file_finish,
        start,
        stop,
        offsets,
    })
}

fn snap_spatial(offsets: &[u64], target: f64, period: f64) -> f64 {
    for i in (0..offsets.len()).rev() {
        if (offsets[i] as f64) < target {
            return i as f64 * period;
        }
    }
    0.0
}

/// Hand-rolled AMF0 fragments for the format tests; the decoder side is
/// the real `amf` crate.
#[cfg(test)]
pub(crate) mod amf_testkit {
    pub fn number(value: f64) -> Vec<u8> {
        let mut out = vec![0x00];
        out.extend_from_slice(&value.to_bits().to_be_bytes());
        out
    }

    pub fn strict_array(values: &[f64]) -> Vec<u8> {
        let mut out = vec![0x0A];
        out.extend_from_slice(&(values.len() as u32).to_be_bytes());
        for v in values {
            out.extend_from_slice(&number(*v));
        }
        out
    }

    fn keyed(key: &str, value: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key.as_bytes());
        out.extend_from_slice(value);
        out
    }

    pub fn ecma_array(pairs: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![0x08];
        out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
        for (key, value) in pairs {
            out.extend_from_slice(&keyed(key, value));
        }
        out.extend_from_slice(&[0x00, 0x00, 0x09]);
        out
    }

    pub fn object(pairs: &[(&str, Vec<u8>)]) -> Vec<u8> {
        let mut out = vec![0x03];
        for (key, value) in pairs {
            out.extend_from_slice(&keyed(key, value));
        }
        out.extend_from_slice(&[0x00, 0x00, 0x09]);
        out
    }

    /// onMetaData with a 60s duration and keyframes every 10s.
    pub fn sample_meta(file_length: u64) -> Vec<u8> {
        let times: Vec<f64> = (0..6).map(|i| i as f64 * 10.0).collect();
        let positions: Vec<f64> = (0..6)
            .map(|i| 13.0 + i as f64 * ((file_length - 13) as f64 / 6.0))
            .collect();
        ecma_array(&[
            ("duration", number(60.0)),
            ("filesize", number(file_length as f64)),
            (
                "keyframes",
                object(&[
                    ("times", strict_array(&times)),
                    ("filepositions", strict_array(&positions)),
                ]),
            ),
        ])
    }
}
