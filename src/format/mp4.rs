use byteorder::{BigEndian, ByteOrder};
use std::fs::File;

use crate::format::pread_exact;

pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    (tag[0] as u32) << 24 | (tag[1] as u32) << 16 | (tag[2] as u32) << 8 | (tag[3] as u32)
}

pub const FTYP: u32 = fourcc(b"ftyp");
pub const MOOV: u32 = fourcc(b"moov");
pub const CMOV: u32 = fourcc(b"cmov");
pub const MVHD: u32 = fourcc(b"mvhd");
pub const TRAK: u32 = fourcc(b"trak");
pub const TKHD: u32 = fourcc(b"tkhd");
pub const MDIA: u32 = fourcc(b"mdia");
pub const MDHD: u32 = fourcc(b"mdhd");
pub const HDLR: u32 = fourcc(b"hdlr");
pub const MINF: u32 = fourcc(b"minf");
pub const VMHD: u32 = fourcc(b"vmhd");
pub const SMHD: u32 = fourcc(b"smhd");
pub const STBL: u32 = fourcc(b"stbl");
pub const STSD: u32 = fourcc(b"stsd");
pub const STTS: u32 = fourcc(b"stts");
pub const CTTS: u32 = fourcc(b"ctts");
pub const STSS: u32 = fourcc(b"stss");
pub const STSC: u32 = fourcc(b"stsc");
pub const STSZ: u32 = fourcc(b"stsz");
pub const STCO: u32 = fourcc(b"stco");
pub const CO64: u32 = fourcc(b"co64");
pub const MDAT: u32 = fourcc(b"mdat");

/// A box view into an immutable cached blob. Wire layout: 32-bit size and
/// type, with `size == 1` meaning a 64-bit extended size follows. All
/// rewrites happen at emission time; the view itself never changes.
#[derive(Clone, Copy, Debug)]
pub struct Atom<'a> {
    pub kind: u32,
    pub size: u64,
    pub extended: bool,
    pub data: &'a [u8],
}

impl<'a> Atom<'a> {
    pub fn header_size(&self) -> u64 {
        if self.extended {
            16
        } else {
            8
        }
    }
}

/// Walks sibling boxes inside a payload slice. Stops at the first
/// malformed header; the parsers treat whatever is missing as absent.
pub struct AtomWalker<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> AtomWalker<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }
}

impl<'a> Iterator for AtomWalker<'a> {
    type Item = Atom<'a>;

    fn next(&mut self) -> Option<Atom<'a>> {
        let rest = &self.data[self.position..];
        if rest.len() < 8 {
            return None;
        }
        let size32 = BigEndian::read_u32(&rest[0..4]);
        let kind = BigEndian::read_u32(&rest[4..8]);
        let (size, header) = if size32 == 1 {
            if rest.len() < 16 {
                return None;
            }
            (BigEndian::read_u64(&rest[8..16]), 16usize)
        } else {
            (size32 as u64, 8usize)
        };
        if size < header as u64 || size > rest.len() as u64 {
            return None;
        }
        self.position += size as usize;
        Some(Atom {
            kind,
            size,
            extended: header == 16,
            data: &rest[header..size as usize],
        })
    }
}

pub fn first_atom(blob: &[u8]) -> Option<Atom> {
    AtomWalker::new(blob).next()
}

/// mvhd/tkhd/mdhd common view; field offsets depend on the version byte
/// (32-bit fields in v0, 64-bit in v1).
#[derive(Clone, Copy, Debug)]
pub struct HeaderBox<'a> {
    pub atom: Atom<'a>,
    pub version: u8,
    pub flags: u32,
    pub scale: u32,
    pub duration: u64,
}

fn parse_xxhd(atom: Atom) -> anyhow::Result<HeaderBox> {
    let data = atom.data;
    if data.len() < 4 {
        anyhow::bail!("truncated header box");
    }
    let version = data[0];
    let flags = BigEndian::read_u24(&data[1..4]);
    let offset = if version != 0 { 20 } else { 12 };
    let need = offset + 4 + if version != 0 { 8 } else { 4 };
    if data.len() < need {
        anyhow::bail!("truncated header box");
    }
    let scale = BigEndian::read_u32(&data[offset..]);
    let duration = if version != 0 {
        BigEndian::read_u64(&data[offset + 4..])
    } else {
        BigEndian::read_u32(&data[offset + 4..]) as u64
    };
    Ok(HeaderBox {
        atom,
        version,
        flags,
        scale,
        duration,
    })
}

fn parse_tkhd(atom: Atom) -> anyhow::Result<HeaderBox> {
    let data = atom.data;
    if data.len() < 4 {
        anyhow::bail!("truncated tkhd");
    }
    let version = data[0];
    let flags = BigEndian::read_u24(&data[1..4]);
    let offset = if version != 0 { 28 } else { 20 };
    let need = offset + if version != 0 { 8 } else { 4 };
    if data.len() < need {
        anyhow::bail!("truncated tkhd");
    }
    let duration = if version != 0 {
        BigEndian::read_u64(&data[offset..])
    } else {
        BigEndian::read_u32(&data[offset..]) as u64
    };
    Ok(HeaderBox {
        atom,
        version,
        flags,
        scale: 0,
        duration,
    })
}

/// A sample table (stts/ctts/stss/stsc/stsz/stco/co64) with its entries
/// still sitting in the cached blob.
#[derive(Clone, Copy, Debug)]
pub struct Table<'a> {
    pub atom: Atom<'a>,
    pub version: u8,
    pub flags: u32,
    pub entry_bytes: usize,
    pub count: u32,
    /// stsz only: non-zero means constant sample size, no entry table
    pub size: u32,
    pub entries: &'a [u8],
}

impl<'a> Table<'a> {
    fn new(atom: Atom<'a>, entry_bytes: usize) -> anyhow::Result<Table<'a>> {
        let data = atom.data;
        if data.len() < 8 {
            anyhow::bail!("truncated sample table");
        }
        let count = BigEndian::read_u32(&data[4..8]);
        let entries = &data[8..];
        if (count as usize) * entry_bytes > entries.len() {
            anyhow::bail!("sample table shorter than its entry count");
        }
        Ok(Table {
            atom,
            version: data[0],
            flags: BigEndian::read_u24(&data[1..4]),
            entry_bytes,
            count,
            size: 0,
            entries,
        })
    }

    fn new_stsz(atom: Atom<'a>) -> anyhow::Result<Table<'a>> {
        let data = atom.data;
        if data.len() < 12 {
            anyhow::bail!("truncated stsz");
        }
        let size = BigEndian::read_u32(&data[4..8]);
        let count = if size != 0 {
            0
        } else {
            BigEndian::read_u32(&data[8..12])
        };
        let entries = if size != 0 { &data[..0] } else { &data[12..] };
        if (count as usize) * 4 > entries.len() {
            anyhow::bail!("stsz shorter than its entry count");
        }
        Ok(Table {
            atom,
            version: data[0],
            flags: BigEndian::read_u24(&data[1..4]),
            entry_bytes: 4,
            count,
            size,
            entries,
        })
    }

    pub fn u32_entry(&self, index: u32) -> u32 {
        BigEndian::read_u32(&self.entries[index as usize * self.entry_bytes..])
    }

    /// stts/ctts: (sample count, duration or composition offset)
    pub fn pair(&self, index: u32) -> (u32, u32) {
        let at = index as usize * 8;
        (
            BigEndian::read_u32(&self.entries[at..]),
            BigEndian::read_u32(&self.entries[at + 4..]),
        )
    }

    /// stsc: (first chunk, samples per chunk, sample description id)
    pub fn triple(&self, index: u32) -> (u32, u32, u32) {
        let at = index as usize * 12;
        (
            BigEndian::read_u32(&self.entries[at..]),
            BigEndian::read_u32(&self.entries[at + 4..]),
            BigEndian::read_u32(&self.entries[at + 8..]),
        )
    }

    /// stco/co64 entry, 32 or 64 bits wide
    pub fn chunk_offset(&self, index: u32) -> u64 {
        BigEndian::read_uint(
            &self.entries[index as usize * self.entry_bytes..],
            self.entry_bytes,
        )
    }

    pub fn entry_range(&self, first: u32, count: u32) -> &'a [u8] {
        let from = first as usize * self.entry_bytes;
        let to = (first + count) as usize * self.entry_bytes;
        &self.entries[from..to]
    }
}

#[derive(Debug)]
pub struct SampleTables<'a> {
    pub atom: Atom<'a>,
    pub stsd: Option<Atom<'a>>,
    pub stts: Table<'a>,
    pub ctts: Option<Table<'a>>,
    pub stss: Option<Table<'a>>,
    pub stsc: Table<'a>,
    pub stsz: Table<'a>,
    pub coxx: Table<'a>,

    pub max_offset: u64,
    pub max_chunks: u64,
    pub max_samples: u64,
    pub max_time: u64,
}

fn parse_stbl(stbl: Atom) -> anyhow::Result<SampleTables> {
    let mut stsd = None;
    let mut stts = None;
    let mut ctts = None;
    let mut stss = None;
    let mut stsc = None;
    let mut stsz = None;
    let mut coxx = None;

    let mut left = 7;
    for atom in AtomWalker::new(stbl.data) {
        if left == 0 {
            break;
        }
        match atom.kind {
            STSD if stsd.is_none() => {
                stsd = Some(atom);
                left -= 1;
            }
            STTS if stts.is_none() => {
                stts = Some(Table::new(atom, 8)?);
                left -= 1;
            }
            CTTS if ctts.is_none() => {
                ctts = Some(Table::new(atom, 8)?);
                left -= 1;
            }
            STSS if stss.is_none() => {
                stss = Some(Table::new(atom, 4)?);
                left -= 1;
            }
            STSC if stsc.is_none() => {
                stsc = Some(Table::new(atom, 12)?);
                left -= 1;
            }
            STSZ if stsz.is_none() => {
                stsz = Some(Table::new_stsz(atom)?);
                left -= 1;
            }
            STCO if coxx.is_none() => {
                coxx = Some(Table::new(atom, 4)?);
                left -= 1;
            }
            CO64 if coxx.is_none() => {
                coxx = Some(Table::new(atom, 8)?);
                left -= 1;
            }
            _ => {}
        }
    }

    let stts = stts.ok_or_else(|| anyhow::anyhow!("missing stts"))?;
    // an empty sync table means every sample is a sync sample
    let stss = stss.filter(|table| table.count > 0);
    let stsc = stsc.ok_or_else(|| anyhow::anyhow!("missing stsc"))?;
    let stsz = stsz.ok_or_else(|| anyhow::anyhow!("missing stsz"))?;
    let coxx = coxx.ok_or_else(|| anyhow::anyhow!("missing stco/co64"))?;
    if stsc.count == 0 || coxx.count == 0 {
        anyhow::bail!("empty sample-to-chunk mapping");
    }

    // per-table limits, computed once per stbl
    let mut max_samples = 0u64;
    let mut max_time = 0u64;
    for index in 0..stts.count {
        let (count, duration) = stts.pair(index);
        max_samples += count as u64;
        max_time += count as u64 * duration as u64;
    }
    let max_chunks = coxx.count as u64;
    let last_run = stsc.triple(stsc.count - 1).1;
    let mut max_offset = coxx.chunk_offset(coxx.count - 1);
    for i in 0..last_run {
        max_offset += if stsz.size != 0 {
            stsz.size as u64
        } else {
            let index = stsz
                .count
                .checked_sub(i + 1)
                .ok_or_else(|| anyhow::anyhow!("stsz shorter than last chunk run"))?;
            stsz.u32_entry(index) as u64
        };
    }

    Ok(SampleTables {
        atom: stbl,
        stsd,
        stts,
        ctts,
        stss,
        stsc,
        stsz,
        coxx,
        max_offset,
        max_chunks,
        max_samples,
        max_time,
    })
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TrackKind {
    Video,
    Sound,
}

#[derive(Debug)]
pub struct Track<'a> {
    pub atom: Atom<'a>,
    pub kind: TrackKind,
    pub tkhd: HeaderBox<'a>,
    pub mdia: Atom<'a>,
    pub mdhd: HeaderBox<'a>,
    pub hdlr: Option<Atom<'a>>,
    pub minf: Atom<'a>,
    pub xmhd: Atom<'a>,
    pub stbl: SampleTables<'a>,
}

/// Parses one trak box. Returns `None` for tracks the server does not
/// serve: disabled tracks and tracks that are neither audio nor video.
fn parse_trak(trak: Atom) -> anyhow::Result<Option<Track>> {
    let mut tkhd = None;
    let mut mdia = None;
    let mut left = 2;
    for atom in AtomWalker::new(trak.data) {
        if left == 0 {
            break;
        }
        match atom.kind {
            TKHD if tkhd.is_none() => {
                tkhd = Some(parse_tkhd(atom)?);
                left -= 1;
            }
            MDIA if mdia.is_none() => {
                mdia = Some(atom);
                left -= 1;
            }
            _ => {}
        }
    }
    let tkhd = tkhd.ok_or_else(|| anyhow::anyhow!("missing tkhd"))?;
    let mdia = mdia.ok_or_else(|| anyhow::anyhow!("missing mdia"))?;

    let mut mdhd = None;
    let mut hdlr = None;
    let mut minf = None;
    let mut left = 3;
    for atom in AtomWalker::new(mdia.data) {
        if left == 0 {
            break;
        }
        match atom.kind {
            MDHD if mdhd.is_none() => {
                mdhd = Some(parse_xxhd(atom)?);
                left -= 1;
            }
            HDLR if hdlr.is_none() => {
                hdlr = Some(atom);
                left -= 1;
            }
            MINF if minf.is_none() => {
                minf = Some(atom);
                left -= 1;
            }
            _ => {}
        }
    }
    let mdhd = mdhd.ok_or_else(|| anyhow::anyhow!("missing mdhd"))?;
    let minf = match minf {
        Some(minf) => minf,
        None => return Ok(None),
    };

    let mut xmhd = None;
    let mut stbl = None;
    let mut left = 2;
    for atom in AtomWalker::new(minf.data) {
        if left == 0 {
            break;
        }
        match atom.kind {
            VMHD | SMHD if xmhd.is_none() => {
                xmhd = Some(atom);
                left -= 1;
            }
            STBL if stbl.is_none() => {
                stbl = Some(atom);
                left -= 1;
            }
            _ => {}
        }
    }
    let xmhd = match xmhd {
        Some(xmhd) => xmhd,
        None => return Ok(None),
    };
    // an audio/video track must carry sample tables
    let stbl = parse_stbl(stbl.ok_or_else(|| anyhow::anyhow!("missing stbl"))?)?;

    // only enabled tracks participate in output
    if tkhd.flags & 0x0000_0001 == 0 {
        return Ok(None);
    }

    let kind = if xmhd.kind == VMHD {
        TrackKind::Video
    } else {
        TrackKind::Sound
    };
    Ok(Some(Track {
        atom: trak,
        kind,
        tkhd,
        mdia,
        mdhd,
        hdlr,
        minf,
        xmhd,
        stbl,
    }))
}

#[derive(Debug)]
pub struct Movie<'a> {
    pub atom: Atom<'a>,
    pub mvhd: HeaderBox<'a>,
    pub video: Option<Track<'a>>,
    pub sound: Option<Track<'a>>,
}

/// Parses a cached moov blob (the full box, header included). The first
/// enabled track of each kind wins; compressed metadata is rejected.
pub fn parse_moov(blob: &[u8]) -> anyhow::Result<Movie> {
    let moov = first_atom(blob)
        .filter(|atom| atom.kind == MOOV)
        .ok_or_else(|| anyhow::anyhow!("bad moov blob"))?;

    let mut mvhd = None;
    let mut video = None;
    let mut sound = None;
    let mut left = 3;
    for atom in AtomWalker::new(moov.data) {
        if left == 0 {
            break;
        }
        match atom.kind {
            MVHD if mvhd.is_none() => {
                mvhd = Some(parse_xxhd(atom)?);
                left -= 1;
            }
            TRAK => {
                if let Some(track) = parse_trak(atom)? {
                    match track.kind {
                        TrackKind::Video if video.is_none() => {
                            video = Some(track);
                            left -= 1;
                        }
                        TrackKind::Sound if sound.is_none() => {
                            sound = Some(track);
                            left -= 1;
                        }
                        _ => {}
                    }
                }
            }
            CMOV => anyhow::bail!("compressed moov is not supported"),
            _ => {}
        }
    }

    let mvhd = mvhd.ok_or_else(|| anyhow::anyhow!("missing mvhd"))?;
    if video.is_none() && sound.is_none() {
        anyhow::bail!("no enabled audio or video track");
    }
    Ok(Movie {
        atom: moov,
        mvhd,
        video,
        sound,
    })
}

#[derive(Debug)]
pub struct TopLevel {
    pub ftyp: Option<Vec<u8>>,
    pub moov: Vec<u8>,
    /// header bytes only; the payload stays on disk
    pub mdat: Vec<u8>,
}

/// Top-level scan: captures ftyp and moov whole, mdat by header only.
pub fn scan_file(file: &File, file_length: u64) -> anyhow::Result<TopLevel> {
    let mut ftyp = None;
    let mut moov = None;
    let mut mdat = None;

    let mut offset = 0u64;
    let mut header = [0u8; 16];
    while offset < file_length {
        pread_exact(file, &mut header, offset)?;
        let size32 = BigEndian::read_u32(&header[0..4]);
        let kind = BigEndian::read_u32(&header[4..8]);
        let (size, header_size) = if size32 == 1 {
            (BigEndian::read_u64(&header[8..16]), 16u64)
        } else {
            (size32 as u64, 8u64)
        };
        if size < header_size {
            anyhow::bail!("malformed box at {}", offset);
        }
        match kind {
            FTYP | MOOV => {
                if offset + size > file_length {
                    anyhow::bail!("box at {} runs past end of file", offset);
                }
                let mut blob = vec![0u8; size as usize];
                pread_exact(file, &mut blob, offset)?;
                if kind == FTYP {
                    ftyp = Some(blob);
                } else {
                    moov = Some(blob);
                }
            }
            MDAT => {
                mdat = Some(header[..header_size as usize].to_vec());
            }
            _ => {}
        }
        offset = offset
            .checked_add(size)
            .ok_or_else(|| anyhow::anyhow!("box size overflow at {}", offset))?;
    }

    let moov = moov.ok_or_else(|| anyhow::anyhow!("missing moov"))?;
    let mdat = mdat.ok_or_else(|| anyhow::anyhow!("missing mdat"))?;
    Ok(TopLevel { ftyp, moov, mdat })
}

/// Whether a cached mdat header blob used the 64-bit size form.
pub fn mdat_extended(header: &[u8]) -> bool {
    header.len() >= 16
}
